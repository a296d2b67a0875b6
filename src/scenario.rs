//! Simulation scenarios.
//!
//! A scenario describes an initial cluster along with a timed sequence of membership events,
//! and is loaded from YAML:
//!
//! ```yaml
//! moveLatencyMs: 200
//! nodes:
//!   - id: 1
//!   - id: 2
//!     capacity: 4
//! partitions:
//!   - topic: events
//!     partition: 0
//!     replicas: [1, 2]
//! events:
//!   - afterMs: 100
//!     node: 1
//!     kind: decommissioned
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;

use crate::memory::InMemoryCluster;
use crate::model::{NodeId, NodeUpdate, NodeUpdateKind, Ntp, ReplicaSet};

/// A simulation scenario.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    /// The time in milliseconds which a requested move takes to complete.
    #[serde(default)]
    pub move_latency_ms: u64,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub partitions: Vec<PartitionSpec>,
    #[serde(default)]
    pub events: Vec<EventSpec>,
}

/// A node present in the cluster when the scenario starts.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    /// The maximum number of replicas the node may host, unlimited if absent.
    #[serde(default)]
    pub capacity: Option<usize>,
}

/// A partition present in the cluster when the scenario starts.
#[derive(Clone, Debug, Deserialize)]
pub struct PartitionSpec {
    #[serde(default = "PartitionSpec::default_namespace")]
    pub namespace: String,
    pub topic: String,
    pub partition: u32,
    pub replicas: ReplicaSet,
}

impl PartitionSpec {
    fn default_namespace() -> String {
        "kafka".into()
    }

    pub fn ntp(&self) -> Ntp {
        Ntp::new(self.namespace.clone(), self.topic.clone(), self.partition)
    }
}

/// A membership event emitted during the scenario.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSpec {
    /// The delay in milliseconds after the previous event before this event is emitted.
    #[serde(default)]
    pub after_ms: u64,
    pub node: NodeId,
    pub kind: NodeUpdateKind,
}

impl Scenario {
    /// Load a scenario from the file at the given path.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("error reading scenario file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("error loading scenario file {}", path.display()))
    }

    /// Parse & validate a scenario from the given YAML.
    pub fn parse(raw: &str) -> Result<Self> {
        let scenario: Self = serde_yaml::from_str(raw).context("error deserializing scenario")?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Validate this scenario.
    pub fn validate(&self) -> Result<()> {
        let mut nodes = BTreeSet::new();
        for node in self.nodes.iter() {
            ensure!(nodes.insert(node.id), "node {} is declared more than once", node.id);
        }
        let mut ntps = BTreeSet::new();
        for spec in self.partitions.iter() {
            let ntp = spec.ntp();
            ensure!(!spec.replicas.is_empty(), "partition {} has no replicas", ntp);
            let replicas: BTreeSet<_> = spec.replicas.iter().collect();
            ensure!(replicas.len() == spec.replicas.len(), "partition {} lists a replica more than once", ntp);
            if let Some(unknown) = spec.replicas.iter().find(|id| !nodes.contains(*id)) {
                bail!("partition {} is assigned to unknown node {}", ntp, unknown);
            }
            ensure!(ntps.insert(ntp.clone()), "partition {} is declared more than once", ntp);
        }
        for event in self.events.iter() {
            match event.kind {
                NodeUpdateKind::Joined => {
                    nodes.insert(event.node);
                }
                _ => ensure!(nodes.contains(&event.node), "{} event refers to unknown node {}", event.kind, event.node),
            }
        }
        Ok(())
    }

    /// Build the in-memory cluster described by this scenario.
    pub fn build_cluster(&self) -> InMemoryCluster {
        let cluster = InMemoryCluster::new(Duration::from_millis(self.move_latency_ms));
        for node in self.nodes.iter() {
            cluster.add_node_with_capacity(node.id, node.capacity);
        }
        for spec in self.partitions.iter() {
            cluster.add_partition(spec.ntp(), spec.replicas.clone());
        }
        cluster
    }

    /// The membership events of this scenario along with the delay before each, where each
    /// event's revision is its position in the scenario.
    pub fn updates(&self) -> impl Iterator<Item = (Duration, NodeUpdate)> + '_ {
        self.events
            .iter()
            .enumerate()
            .map(|(idx, event)| (Duration::from_millis(event.after_ms), NodeUpdate::new(event.node, event.kind, idx as u64 + 1)))
    }
}

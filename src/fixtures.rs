use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, watch};

use crate::backend::{BackendHandle, BacklogStatus, MembersBackend};
use crate::cluster::{Collaborators, LeaderState};
use crate::config::Config;
use crate::memory::InMemoryCluster;
use crate::model::{NodeId, NodeUpdate, NodeUpdateKind, Ntp, ReallocationState};

/// The maximum amount of time a test will wait for the backend to reach an expected state.
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn ntp(topic: &str, partition: u32) -> Ntp {
    Ntp::new("kafka", topic, partition)
}

/// Create a cluster with the given unlimited nodes, where moves complete after `latency`.
pub fn cluster(nodes: &[NodeId], latency: Duration) -> Arc<InMemoryCluster> {
    let cluster = InMemoryCluster::new(latency);
    for id in nodes {
        cluster.add_node(*id);
    }
    Arc::new(cluster)
}

/// Emit a membership event against the given cluster & backend, as the membership manager would.
pub async fn emit(cluster: &InMemoryCluster, handle: &BackendHandle, node: NodeId, kind: NodeUpdateKind, revision: u64) -> Result<()> {
    let update = NodeUpdate::new(node, kind, revision);
    cluster.apply_update(&update);
    handle.notify(update).await.context("error notifying backend")
}

/// A members backend wired up to an in-memory cluster.
pub struct TestBackend {
    pub backend: MembersBackend,
    pub handle: BackendHandle,
    pub cluster: Arc<InMemoryCluster>,
    pub leader_tx: watch::Sender<LeaderState>,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Setup a members backend against the given cluster, with this node as the leader.
pub fn setup_backend(config: Arc<Config>, cluster: Arc<InMemoryCluster>) -> TestBackend {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (leader_tx, leader_rx) = watch::channel(LeaderState::Leading);
    let (backend, handle) = MembersBackend::new(config, Collaborators::from_cluster(cluster.clone()), leader_rx, shutdown_tx.clone());
    TestBackend {
        backend,
        handle,
        cluster,
        leader_tx,
        shutdown_tx,
    }
}

/// Poll the backend status until the given check passes, returning the matching status.
pub async fn wait_for<F>(handle: &BackendHandle, mut check: F) -> Result<BacklogStatus>
where
    F: FnMut(&BacklogStatus) -> bool,
{
    let poll = async {
        loop {
            let status = handle.status().await?;
            if check(&status) {
                return Ok::<_, anyhow::Error>(status);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(WAIT_TIMEOUT, poll)
        .await
        .context("timeout waiting for expected backend status")?
}

/// Wait for the backend to apply every event & for the cluster to settle.
pub async fn wait_for_convergence(handle: &BackendHandle, cluster: &InMemoryCluster) -> Result<BacklogStatus> {
    wait_for(handle, |status| status.is_converged() && !cluster.has_pending_moves()).await
}

/// Check if the live update of the given node has a reallocation of `ntp` in the given state.
pub fn has_reallocation(status: &BacklogStatus, node: NodeId, ntp: &Ntp, state: ReallocationState) -> bool {
    status
        .update_for(node)
        .map(|update| update.reallocations.iter().any(|(other, other_state)| other == ntp && *other_state == state))
        .unwrap_or(false)
}

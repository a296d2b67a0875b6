use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use hadron_members::cluster::TopicTable;
use hadron_members::model::NodeUpdate;
use hadron_members::scenario::Scenario;
use hadron_members::{BackendHandle, Collaborators, Config, InMemoryCluster, LeaderState, MembersBackend};

/// The interval at which the simulator checks for convergence once all events are emitted.
const CONVERGENCE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The application object for when the simulator is running.
pub struct App {
    /// The scenario being simulated.
    scenario: Scenario,
    /// The in-memory cluster driven by the members backend.
    cluster: Arc<InMemoryCluster>,
    /// The handle used to notify the members backend of membership events.
    handle: BackendHandle,
    /// The leadership state of this node, which is always leading in the simulator.
    _leader_tx: watch::Sender<LeaderState>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the members backend supervisor.
    backend: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        let scenario = Scenario::load(&config.scenario_path).await.context("error loading simulation scenario")?;
        let cluster = Arc::new(scenario.build_cluster());
        tracing::info!(
            nodes = scenario.nodes.len(),
            partitions = scenario.partitions.len(),
            events = scenario.events.len(),
            "scenario loaded"
        );

        // The simulator is the only member of its consensus group, so it leads from the start.
        let (leader_tx, leader_rx) = watch::channel(LeaderState::Leading);
        let (backend, handle) = MembersBackend::new(config, Collaborators::from_cluster(cluster.clone()), leader_rx, shutdown_tx.clone());

        Ok(Self {
            scenario,
            cluster,
            handle,
            _leader_tx: leader_tx,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            backend: backend.supervise(),
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        let mut updates: VecDeque<(Duration, NodeUpdate)> = self.scenario.updates().collect();
        let first_delay = updates.front().map(|(delay, _)| *delay).unwrap_or_default();
        let next_event = tokio::time::sleep(first_delay);
        tokio::pin!(next_event);
        let mut poll = tokio::time::interval(CONVERGENCE_POLL_INTERVAL);

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
                _ = &mut next_event, if !updates.is_empty() => {
                    if let Some((_, update)) = updates.pop_front() {
                        self.emit(update).await?;
                    }
                    if let Some((delay, _)) = updates.front() {
                        next_event.as_mut().reset(Instant::now() + *delay);
                    }
                }
                _ = poll.tick(), if updates.is_empty() => {
                    if self.is_converged().await? {
                        self.log_assignments().await;
                        let _ = self.shutdown_tx.send(());
                        break;
                    }
                }
            }
        }

        // Begin shutdown routine.
        tracing::debug!("simulator is shutting down");
        if let Err(err) = self.backend.await.context("error joining members backend handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down members backend");
        }

        tracing::debug!("simulator shutdown complete");
        Ok(())
    }

    /// Apply a membership event to the cluster & notify the members backend of it.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn emit(&self, update: NodeUpdate) -> Result<()> {
        tracing::info!(node = update.node, kind = %update.kind, revision = update.revision, "emitting membership event");
        self.cluster.apply_update(&update);
        self.handle.notify(update).await.context("error notifying members backend")
    }

    /// Check if the members backend has applied every event & the cluster has settled.
    async fn is_converged(&self) -> Result<bool> {
        let status = self.handle.status().await.context("error fetching members backend status")?;
        tracing::debug!(updates = status.updates.len(), pending_finalize = status.pending_finalize.len(), "members backend status");
        Ok(status.is_converged() && !self.cluster.has_pending_moves())
    }

    async fn log_assignments(&self) {
        match self.cluster.assignments().await {
            Ok(assignments) => {
                for (ntp, replicas) in assignments.iter() {
                    tracing::info!(%ntp, ?replicas, "final assignment");
                }
            }
            Err(err) => tracing::error!(error = ?err, "error reading final assignments"),
        }
        tracing::info!(moves = self.cluster.move_log().len(), finalized = ?self.cluster.finalized(), "cluster converged");
    }
}

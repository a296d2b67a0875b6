//! The members backend.
//!
//! The members backend reacts to cluster membership changes by moving partition replicas. Node
//! events are sent to a single reconciler task which exclusively owns the update backlog; every
//! mutation of the backlog, including direct reconcile requests, is a message to that task, so
//! at most one planning & driving pass ever executes at a time.
//!
//! Each pass walks the backlog in arrival order. Updates which still need planning are handed to
//! the planner, every pending reallocation is driven forward, and updates whose work is done are
//! retired. The reconciler then waits for either a new message or the retry interval.

mod driver;
mod intake;
mod lifecycle;
mod planner;

#[cfg(test)]
mod driver_test;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::prelude::*;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::cluster::{Collaborators, LeaderState, MembershipTable};
use crate::config::Config;
use crate::error::BackendError;
use crate::model::{NodeId, NodeUpdate, NodeUpdateKind, Ntp, ReallocationState};
pub use intake::{Backlog, Intake};
pub use lifecycle::MembersBackend;
use lifecycle::Gate;

const METRIC_BACKLOG_LENGTH: &str = "hadron_members_backlog_length";
const METRIC_PENDING_REALLOCATIONS: &str = "hadron_members_pending_reallocations";
const METRIC_MOVES_REQUESTED: &str = "hadron_members_moves_requested";
const METRIC_REALLOCATIONS_FINISHED: &str = "hadron_members_reallocations_finished";
const METRIC_UPDATES_FINISHED: &str = "hadron_members_updates_finished";

/// A message sent to the members backend reconciler.
#[derive(Debug)]
pub enum BackendMsg {
    /// A membership event from the event source.
    NodeUpdate(NodeUpdate),
    /// A request to run a reconciliation pass immediately.
    Reconcile { tx: oneshot::Sender<Result<(), BackendError>> },
    /// A request for the current status of the backlog.
    Status { tx: oneshot::Sender<BacklogStatus> },
}

/// A handle used to send requests to the members backend.
///
/// Requests are queued while the backend is stopped, and are served once it is running.
#[derive(Clone)]
pub struct BackendHandle {
    tx: mpsc::Sender<BackendMsg>,
}

impl BackendHandle {
    /// Notify the backend of a membership event.
    pub async fn notify(&self, update: NodeUpdate) -> Result<(), BackendError> {
        self.tx.send(BackendMsg::NodeUpdate(update)).await.map_err(|_| BackendError::Shutdown)
    }

    /// Run a reconciliation pass immediately, waiting for it to complete.
    pub async fn reconcile_now(&self) -> Result<(), BackendError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(BackendMsg::Reconcile { tx }).await.map_err(|_| BackendError::Shutdown)?;
        rx.await.map_err(|_| BackendError::Shutdown)?
    }

    /// Fetch the current status of the backlog.
    pub async fn status(&self) -> Result<BacklogStatus, BackendError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(BackendMsg::Status { tx }).await.map_err(|_| BackendError::Shutdown)?;
        rx.await.map_err(|_| BackendError::Shutdown)
    }
}

/// A summary of a live update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateStatus {
    pub update: NodeUpdate,
    pub planned: bool,
    pub finished: bool,
    /// Every reallocation of the update along with its current state.
    pub reallocations: Vec<(Ntp, ReallocationState)>,
    /// Partitions waiting on another update before they can be planned.
    pub deferred: Vec<Ntp>,
}

/// A summary of the backlog of the members backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BacklogStatus {
    /// All live updates, in backlog order.
    pub updates: Vec<UpdateStatus>,
    /// Decommissioned nodes whose removal has not yet been finalized.
    pub pending_finalize: Vec<NodeId>,
}

impl BacklogStatus {
    /// Check if all membership events have been fully applied.
    pub fn is_converged(&self) -> bool {
        self.updates.is_empty() && self.pending_finalize.is_empty()
    }

    /// The status of the live update for the given node, if any.
    pub fn update_for(&self, node: NodeId) -> Option<&UpdateStatus> {
        self.updates.iter().find(|status| status.update.node == node)
    }
}

impl From<&Backlog> for BacklogStatus {
    fn from(backlog: &Backlog) -> Self {
        Self {
            updates: backlog
                .updates()
                .map(|meta| UpdateStatus {
                    update: *meta.update(),
                    planned: meta.is_planned(),
                    finished: meta.is_finished(),
                    reallocations: meta.reallocations().iter().map(|r| (r.ntp().clone(), r.state())).collect(),
                    deferred: meta.deferred().iter().cloned().collect(),
                })
                .collect(),
            pending_finalize: backlog.pending_finalize().iter().copied().collect(),
        }
    }
}

/// Everything handed back to the lifecycle owner when the reconciler exits.
pub(crate) struct ReconcilerExit {
    pub backlog: Backlog,
    pub requests_rx: mpsc::Receiver<BackendMsg>,
    pub outcome: Result<(), BackendError>,
}

/// Control flow of the reconciler after a pass.
enum Flow {
    Continue,
    Stop,
}

/// The task which owns the backlog & drives all reallocations.
pub(crate) struct Reconciler {
    config: Arc<Config>,
    collab: Arc<Collaborators>,
    backlog: Backlog,

    /// The channel of requests to this task.
    requests_rx: ReceiverStream<BackendMsg>,
    /// Set to false once all request senders have been dropped.
    intake_open: bool,
    /// The leadership state of this node.
    leader_rx: watch::Receiver<LeaderState>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// A channel used to stop this reconciler instance.
    stop_rx: watch::Receiver<bool>,

    /// The deadline of the next retry pass, pushed back only when a pass completes.
    next_retry: Instant,
    /// Background tasks finalizing the removal of decommissioned nodes.
    gate: Gate<(NodeId, bool)>,
    /// Nodes for which a finalize task is currently running, along with the channel used to
    /// cancel it. The sender is taken once cancellation has been requested.
    finalizing: BTreeMap<NodeId, Option<oneshot::Sender<()>>>,
}

impl Reconciler {
    /// Create a new instance.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>, collab: Arc<Collaborators>, backlog: Backlog, requests_rx: mpsc::Receiver<BackendMsg>,
        leader_rx: watch::Receiver<LeaderState>, shutdown_tx: broadcast::Sender<()>, stop_rx: watch::Receiver<bool>,
    ) -> Self {
        metrics::register_gauge!(METRIC_BACKLOG_LENGTH, metrics::Unit::Count, "the number of live node updates in the members backlog");
        metrics::register_gauge!(
            METRIC_PENDING_REALLOCATIONS,
            metrics::Unit::Count,
            "the number of partition reallocations whose move has not yet been requested"
        );
        metrics::register_counter!(METRIC_MOVES_REQUESTED, metrics::Unit::Count, "partition moves accepted by the topics frontend");
        metrics::register_counter!(METRIC_REALLOCATIONS_FINISHED, metrics::Unit::Count, "partition reallocations which have finished");
        metrics::register_counter!(METRIC_UPDATES_FINISHED, metrics::Unit::Count, "node updates which have been fully applied");
        let shutdown_rx = BroadcastStream::new(shutdown_tx.subscribe());
        Self {
            config,
            collab,
            backlog,
            requests_rx: ReceiverStream::new(requests_rx),
            intake_open: true,
            leader_rx,
            shutdown_tx,
            shutdown_rx,
            stop_rx,
            next_retry: Instant::now(),
            gate: Gate::new(),
            finalizing: BTreeMap::new(),
        }
    }

    pub fn spawn(self) -> JoinHandle<ReconcilerExit> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> ReconcilerExit {
        tracing::debug!(backlog = self.backlog.len(), "members backend reconciler started");
        let outcome = self.run_loop().await;

        // Settle all background work before handing the backlog back.
        if !self.gate.is_empty() {
            tracing::debug!(tasks = self.gate.len(), "waiting for background tasks to settle");
        }
        for res in self.gate.close().await {
            self.handle_finalize_result(res);
        }
        let authorized = matches!(*self.leader_rx.borrow(), LeaderState::Leading);
        if matches!(outcome, Err(BackendError::AuthorizationLost)) || !authorized {
            tracing::error!("authorization lost, discarding reallocation progress");
            if !self.backlog.is_empty() {
                self.backlog.reset();
            }
        }

        tracing::debug!(backlog = self.backlog.len(), "members backend reconciler stopped");
        ReconcilerExit {
            backlog: self.backlog,
            requests_rx: self.requests_rx.into_inner(),
            outcome,
        }
    }

    async fn run_loop(&mut self) -> Result<(), BackendError> {
        let auth_lost = authorization_lost(self.leader_rx.clone());
        tokio::pin!(auth_lost);

        // Pick up any work carried over from a previous run.
        if let Flow::Stop = self.reconcile().await? {
            return Ok(());
        }

        loop {
            let delay = tokio::time::sleep_until(self.next_retry);
            tokio::pin!(delay);
            tokio::select! {
                biased;
                _ = self.shutdown_rx.next() => return Err(BackendError::Shutdown),
                _ = self.stop_rx.changed() => return Ok(()),
                _ = &mut auth_lost => return Err(BackendError::AuthorizationLost),
                Some(res) = self.gate.next(), if !self.gate.is_empty() => self.handle_finalize_result(res),
                msg_opt = self.requests_rx.next(), if self.intake_open => {
                    let msg = match msg_opt {
                        Some(msg) => msg,
                        None => {
                            tracing::debug!("all backend handles dropped, intake closed");
                            self.intake_open = false;
                            continue;
                        }
                    };
                    if let Flow::Stop = self.handle_requests(msg).await? {
                        return Ok(());
                    }
                }
                _ = &mut delay => {
                    if let Flow::Stop = self.reconcile().await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Handle the given request along with any others already queued, running a single pass
    /// for the whole batch if needed.
    ///
    /// Status requests are answered after the pass, so that they reflect every event sent before them.
    async fn handle_requests(&mut self, msg: BackendMsg) -> Result<Flow, BackendError> {
        let mut needs_pass = false;
        let mut reconcile_replies = vec![];
        let mut status_replies = vec![];
        let mut next = Some(msg);
        while let Some(msg) = next.take() {
            match msg {
                BackendMsg::NodeUpdate(update) => {
                    self.backlog.push(update);
                    needs_pass = true;
                }
                BackendMsg::Reconcile { tx } => {
                    reconcile_replies.push(tx);
                    needs_pass = true;
                }
                BackendMsg::Status { tx } => status_replies.push(tx),
            }
            next = self.requests_rx.next().now_or_never().flatten();
        }
        metrics::gauge!(METRIC_BACKLOG_LENGTH, self.backlog.len() as f64);
        self.cancel_finalizers();

        let res = if needs_pass { self.reconcile().await } else { Ok(Flow::Continue) };
        for tx in reconcile_replies {
            let reply = match &res {
                Ok(Flow::Continue) => Ok(()),
                Err(BackendError::AuthorizationLost) => Err(BackendError::AuthorizationLost),
                Ok(Flow::Stop) | Err(_) => Err(BackendError::Shutdown),
            };
            let _ = tx.send(reply);
        }
        if !status_replies.is_empty() {
            let status = BacklogStatus::from(&self.backlog);
            for tx in status_replies {
                let _ = tx.send(status.clone());
            }
        }
        res
    }

    /// Run a single reconciliation pass over the backlog.
    ///
    /// The pass is abandoned as soon as shutdown, stop or loss of leadership is observed.
    async fn reconcile(&mut self) -> Result<Flow, BackendError> {
        let mut shutdown = BroadcastStream::new(self.shutdown_tx.subscribe());
        let mut stop_rx = self.stop_rx.clone();
        let auth_lost = authorization_lost(self.leader_rx.clone());
        tokio::pin!(auth_lost);
        let pass = reconcile_pass(&self.config, &self.collab, &mut self.backlog);

        tokio::select! {
            biased;
            _ = shutdown.next() => return Err(BackendError::Shutdown),
            _ = stop_rx.changed() => return Ok(Flow::Stop),
            _ = &mut auth_lost => return Err(BackendError::AuthorizationLost),
            _ = pass => (),
        }
        self.next_retry = Instant::now() + self.config.retry_delay();
        self.spawn_finalizers();
        Ok(Flow::Continue)
    }

    /// Spawn a background task to finalize the removal of every decommissioned node which
    /// needs it.
    fn spawn_finalizers(&mut self) {
        let nodes: Vec<NodeId> = self
            .backlog
            .pending_finalize()
            .iter()
            .copied()
            .filter(|node| !self.finalizing.contains_key(node))
            .collect();
        for node in nodes {
            let (cancel_tx, cancel_rx) = oneshot::channel();
            self.finalizing.insert(node, Some(cancel_tx));
            self.gate.spawn(finalize_removal(
                self.collab.members.clone(),
                self.config.clone(),
                node,
                cancel_rx,
                self.shutdown_tx.subscribe(),
                self.stop_rx.clone(),
            ));
        }
    }

    /// Cancel every finalize task whose node no longer needs finalizing, as it has been returned
    /// to service since its decommission finished.
    fn cancel_finalizers(&mut self) {
        let pending = self.backlog.pending_finalize();
        for (node, cancel) in self.finalizing.iter_mut().filter(|(node, _)| !pending.contains(node)) {
            if let Some(tx) = cancel.take() {
                tracing::info!(node = *node, "node returned to service, cancelling finalize removal");
                let _ = tx.send(());
            }
        }
    }

    fn handle_finalize_result(&mut self, res: Result<(NodeId, bool), JoinError>) {
        match res {
            Ok((node, true)) => {
                self.finalizing.remove(&node);
                self.backlog.finalized(node);
            }
            Ok((node, false)) => {
                self.finalizing.remove(&node);
            }
            Err(err) => tracing::error!(error = ?err, "error joining finalize removal task"),
        }
    }
}

/// Run a single pass over every live update of the backlog, in order.
async fn reconcile_pass(config: &Config, collab: &Collaborators, backlog: &mut Backlog) {
    let mut reserved = backlog.reservations();
    for idx in 0..backlog.len() {
        let busy = backlog.busy_ntps(idx);
        let meta = match backlog.get_mut(idx) {
            Some(meta) => meta,
            None => break,
        };
        if meta.is_finished() {
            continue;
        }
        if meta.needs_planning() {
            planner::calculate_reallocations(collab, config, meta, &busy, &mut reserved).await;
        }
        driver::reallocate_replica_sets(collab, config, meta, &mut reserved).await;
        if !driver::try_to_finish_update(collab, config, meta).await {
            tracing::debug!(node = meta.node(), kind = %meta.update().kind, "update not yet finished, will retry");
        }
    }

    let retired = backlog.retire_finished();
    for meta in retired.iter() {
        let update = meta.update();
        tracing::info!(node = update.node, kind = %update.kind, revision = update.revision, "node update finished");
        if update.kind == NodeUpdateKind::Decommissioned {
            backlog.schedule_finalize(update.node);
        }
    }
    if !retired.is_empty() {
        metrics::counter!(METRIC_UPDATES_FINISHED, retired.len() as u64);
    }
    let pending = backlog.updates().flat_map(|meta| meta.reallocations()).filter(|r| r.is_pending()).count();
    metrics::gauge!(METRIC_BACKLOG_LENGTH, backlog.len() as f64);
    metrics::gauge!(METRIC_PENDING_REALLOCATIONS, pending as f64);
}

/// Resolves once this node is no longer the leader.
async fn authorization_lost(mut leader_rx: watch::Receiver<LeaderState>) {
    loop {
        if !matches!(*leader_rx.borrow_and_update(), LeaderState::Leading) {
            return;
        }
        if leader_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Finalize the removal of the given node, retrying until success, cancellation, shutdown or stop.
///
/// Returns the node along with `true` if the removal was finalized.
async fn finalize_removal(
    members: Arc<dyn MembershipTable>, config: Arc<Config>, node: NodeId, mut cancel_rx: oneshot::Receiver<()>,
    shutdown_rx: broadcast::Receiver<()>, mut stop_rx: watch::Receiver<bool>,
) -> (NodeId, bool) {
    let mut shutdown = BroadcastStream::new(shutdown_rx);
    loop {
        // A dropped sender means the reconciler is gone, which is handled by shutdown & stop.
        if let Ok(()) = cancel_rx.try_recv() {
            return (node, false);
        }
        match members.finalize_removal(node).await {
            Ok(()) => {
                tracing::info!(node, "removal of decommissioned node finalized");
                return (node, true);
            }
            Err(err) => tracing::warn!(error = ?err, node, "error finalizing node removal, will retry"),
        }
        tokio::select! {
            _ = tokio::time::sleep(config.retry_delay()) => continue,
            Ok(()) = &mut cancel_rx => return (node, false),
            _ = shutdown.next() => return (node, false),
            _ = stop_rx.changed() => return (node, false),
        }
    }
}

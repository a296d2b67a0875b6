//! Membership event intake & the update backlog.

use std::collections::{BTreeSet, VecDeque};

use crate::cluster::Reservations;
use crate::model::{NodeId, NodeUpdate, NodeUpdateKind, Ntp, ReallocationState, UpdateMeta};

/// The outcome of accepting a membership event into the backlog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intake {
    /// A new update was appended to the backlog.
    Queued,
    /// The event is a redelivery of an update which is already live.
    Duplicate,
    /// The event was a recommission folded into the node's outstanding decommission.
    Folded { dropped: usize },
    /// The event replaced the node's live update in place.
    Superseded { dropped: usize },
}

/// The ordered backlog of live updates.
///
/// Updates are kept in arrival order. At most one unfinished update exists per node.
#[derive(Debug, Default)]
pub struct Backlog {
    updates: VecDeque<UpdateMeta>,
    /// Decommissioned nodes whose removal still needs to be finalized.
    finalize: BTreeSet<NodeId>,
}

impl Backlog {
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn updates(&self) -> impl Iterator<Item = &UpdateMeta> {
        self.updates.iter()
    }

    pub(super) fn get_mut(&mut self, idx: usize) -> Option<&mut UpdateMeta> {
        self.updates.get_mut(idx)
    }

    /// Accept a membership event.
    ///
    /// A node returning to service (joined or recommissioned) is no longer pending finalization.
    ///
    /// A recommission of a node with an outstanding decommission is folded into that update.
    /// Any other event for a node which already has an unfinished update is either dropped as a
    /// duplicate (same kind) or supersedes the live update in place (different kind), so that the
    /// backlog is never reordered.
    #[tracing::instrument(level = "debug", skip(self, update), fields(node = update.node, kind = %update.kind, revision = update.revision))]
    pub fn push(&mut self, update: NodeUpdate) -> Intake {
        if !update.is_departure() && self.finalize.remove(&update.node) {
            tracing::info!("node returned to service, its removal will not be finalized");
        }
        if update.kind == NodeUpdateKind::Recommissioned {
            if let Some(dropped) = self.handle_recommissioned(&update) {
                return Intake::Folded { dropped };
            }
        }
        let meta = match self.updates.iter_mut().find(|meta| meta.node() == update.node && !meta.is_finished()) {
            Some(meta) => meta,
            None => {
                tracing::debug!("queueing new update");
                self.updates.push_back(UpdateMeta::new(update));
                return Intake::Queued;
            }
        };
        if meta.update().kind == update.kind {
            tracing::debug!("dropping duplicate update");
            return Intake::Duplicate;
        }
        let dropped = meta.supersede(update);
        tracing::debug!(dropped, "update superseded live update for node");
        Intake::Superseded { dropped }
    }

    /// Fold a recommission into the node's outstanding decommission, if any.
    ///
    /// Reallocations whose moves have not yet been requested are removed, as the replica never
    /// needs to move if the node is staying. Requested moves are allowed to complete. Returns the
    /// number of reallocations removed, or `None` if there is no outstanding decommission.
    pub fn handle_recommissioned(&mut self, update: &NodeUpdate) -> Option<usize> {
        let meta = self
            .updates
            .iter_mut()
            .find(|meta| meta.node() == update.node && meta.update().kind == NodeUpdateKind::Decommissioned && !meta.is_finished())?;
        let dropped = meta.fold_recommission(*update);
        tracing::info!(
            node = update.node,
            dropped,
            finished = meta.is_finished(),
            "recommission folded into outstanding decommission"
        );
        Some(dropped)
    }

    /// All partitions with an unfinished reallocation in any update other than the one at `idx`.
    pub fn busy_ntps(&self, idx: usize) -> BTreeSet<Ntp> {
        self.updates
            .iter()
            .enumerate()
            .filter(|(other, _)| *other != idx)
            .flat_map(|(_, meta)| meta.active_ntps().cloned())
            .collect()
    }

    /// Placement reservations held by every reallocation which is reassigned but not yet requested.
    pub fn reservations(&self) -> Reservations {
        let mut reserved = Reservations::default();
        for realloc in self.updates.iter().flat_map(|meta| meta.reallocations()) {
            if let (ReallocationState::Reassigned, Some(proposed)) = (realloc.state(), realloc.new_assignment()) {
                reserved.reserve(realloc.previous(), proposed);
            }
        }
        reserved
    }

    /// Remove all finished updates from the backlog, preserving the order of the rest.
    pub fn retire_finished(&mut self) -> Vec<UpdateMeta> {
        let (finished, live): (Vec<_>, Vec<_>) = self.updates.drain(..).partition(|meta| meta.is_finished());
        self.updates = live.into();
        finished
    }

    /// Discard all reallocation progress, keeping every node event.
    pub fn reset(&mut self) {
        self.updates.iter_mut().for_each(UpdateMeta::reset);
    }

    /// Record that the removal of the given node must be finalized.
    pub fn schedule_finalize(&mut self, node: NodeId) {
        self.finalize.insert(node);
    }

    /// Record that the removal of the given node has been finalized.
    pub fn finalized(&mut self, node: NodeId) {
        self.finalize.remove(&node);
    }

    pub fn pending_finalize(&self) -> &BTreeSet<NodeId> {
        &self.finalize
    }
}

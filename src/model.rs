//! Members backend data model.
//!
//! ## Reallocation State
//! Every partition reallocation moves strictly forward through its states:
//!
//! ```text
//! initial -> reassigned -> requested -> finished
//! ```
//!
//! A reallocation only carries a proposed replica set once it has been reassigned, which is
//! encoded by the `Placement` type rather than by an optional field. There is no way to rewind
//! a reallocation; superseded reallocations are removed from their update instead.

use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;

/// The ID of a cluster node.
pub type NodeId = u32;

/// The ordered set of nodes holding copies of a partition's data.
pub type ReplicaSet = Vec<NodeId>;

/// The composite identifier of a single partition: namespace, topic & partition index.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
pub struct Ntp {
    pub namespace: String,
    pub topic: String,
    pub partition: u32,
}

impl Ntp {
    /// Create a new instance.
    pub fn new(namespace: impl Into<String>, topic: impl Into<String>, partition: u32) -> Self {
        Self {
            namespace: namespace.into(),
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for Ntp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.topic, self.partition)
    }
}

/// The kind of a node membership event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeUpdateKind {
    /// The node has joined the cluster.
    Joined,
    /// The node has left the cluster without being decommissioned.
    Left,
    /// The node has been requested to be decommissioned.
    Decommissioned,
    /// A decommission of the node has been reversed.
    Recommissioned,
}

impl fmt::Display for NodeUpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joined => f.write_str("joined"),
            Self::Left => f.write_str("left"),
            Self::Decommissioned => f.write_str("decommissioned"),
            Self::Recommissioned => f.write_str("recommissioned"),
        }
    }
}

/// A node membership event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeUpdate {
    /// The node to which this event applies.
    pub node: NodeId,
    /// The kind of this event.
    pub kind: NodeUpdateKind,
    /// The membership log revision at which this event was emitted.
    pub revision: u64,
}

impl NodeUpdate {
    /// Create a new instance.
    pub fn new(node: NodeId, kind: NodeUpdateKind, revision: u64) -> Self {
        Self { node, kind, revision }
    }

    /// Check if this event requires the node's replicas to be moved elsewhere.
    pub fn is_departure(&self) -> bool {
        matches!(self.kind, NodeUpdateKind::Left | NodeUpdateKind::Decommissioned)
    }
}

/// The proposed placement of a partition reallocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    /// No feasible replica set has been found yet.
    Unplanned,
    /// A replacement replica set has been proposed.
    Planned(ReplicaSet),
}

/// The state of a partition reallocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReallocationState {
    /// The reallocation exists, but no replacement replica set has been found.
    Initial,
    /// A replacement replica set has been proposed.
    Reassigned,
    /// The move has been accepted by the topics frontend.
    Requested,
    /// The move has completed.
    Finished,
}

/// A partition whose replica set must change because of a membership event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionReallocation {
    ntp: Ntp,
    /// The node which this reallocation moves a replica away from.
    source: NodeId,
    /// The replica set of the partition when the reallocation was last planned.
    previous: ReplicaSet,
    placement: Placement,
    state: ReallocationState,
}

impl PartitionReallocation {
    /// Create a new reallocation for which no placement has been found.
    pub fn new(ntp: Ntp, source: NodeId, previous: ReplicaSet) -> Self {
        Self {
            ntp,
            source,
            previous,
            placement: Placement::Unplanned,
            state: ReallocationState::Initial,
        }
    }

    /// Create a new reallocation which has already been assigned a replacement replica set.
    pub fn reassigned(ntp: Ntp, source: NodeId, previous: ReplicaSet, replicas: ReplicaSet) -> Self {
        Self {
            ntp,
            source,
            previous,
            placement: Placement::Planned(replicas),
            state: ReallocationState::Reassigned,
        }
    }

    pub fn ntp(&self) -> &Ntp {
        &self.ntp
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn previous(&self) -> &ReplicaSet {
        &self.previous
    }

    pub fn state(&self) -> ReallocationState {
        self.state
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// The proposed replica set, present from `Reassigned` onward.
    pub fn new_assignment(&self) -> Option<&ReplicaSet> {
        match &self.placement {
            Placement::Planned(replicas) => Some(replicas),
            Placement::Unplanned => None,
        }
    }

    /// Check if the move for this reallocation has not yet been requested.
    pub fn is_pending(&self) -> bool {
        matches!(self.state, ReallocationState::Initial | ReallocationState::Reassigned)
    }

    pub fn is_finished(&self) -> bool {
        self.state == ReallocationState::Finished
    }

    /// Assign a replacement for the given current replica set, transitioning `Initial -> Reassigned`.
    ///
    /// Returns `false` without making changes if the reallocation is not `Initial`.
    pub fn assign(&mut self, previous: ReplicaSet, replicas: ReplicaSet) -> bool {
        if self.state != ReallocationState::Initial {
            return false;
        }
        self.previous = previous;
        self.placement = Placement::Planned(replicas);
        self.state = ReallocationState::Reassigned;
        true
    }

    /// Record that the move has been accepted, transitioning `Reassigned -> Requested`.
    pub fn mark_requested(&mut self) -> bool {
        if self.state != ReallocationState::Reassigned {
            return false;
        }
        self.state = ReallocationState::Requested;
        true
    }

    /// Record that the move has completed, transitioning `Requested -> Finished`.
    pub fn mark_finished(&mut self) -> bool {
        if self.state != ReallocationState::Requested {
            return false;
        }
        self.state = ReallocationState::Finished;
        true
    }
}

/// A node membership event along with all of the partition reallocations it has spawned.
#[derive(Clone, Debug)]
pub struct UpdateMeta {
    update: NodeUpdate,
    reallocations: Vec<PartitionReallocation>,
    /// Partitions affected by this update which are currently being reallocated by a
    /// different update, and which must be planned once that work is done.
    deferred: BTreeSet<Ntp>,
    /// Whether the planner has run for this update.
    planned: bool,
    finished: bool,
}

impl UpdateMeta {
    /// Create a new instance.
    pub fn new(update: NodeUpdate) -> Self {
        Self {
            update,
            reallocations: Vec::new(),
            deferred: BTreeSet::new(),
            planned: false,
            finished: false,
        }
    }

    pub fn update(&self) -> &NodeUpdate {
        &self.update
    }

    pub fn node(&self) -> NodeId {
        self.update.node
    }

    pub fn reallocations(&self) -> &[PartitionReallocation] {
        &self.reallocations
    }

    pub(crate) fn reallocations_mut(&mut self) -> &mut Vec<PartitionReallocation> {
        &mut self.reallocations
    }

    pub fn deferred(&self) -> &BTreeSet<Ntp> {
        &self.deferred
    }

    pub fn is_planned(&self) -> bool {
        self.planned
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Check if the planner needs to run for this update.
    pub fn needs_planning(&self) -> bool {
        !self.finished && (!self.planned || !self.deferred.is_empty())
    }

    /// Check if this update is already tracking a reallocation of the given partition.
    pub fn tracks(&self, ntp: &Ntp) -> bool {
        self.reallocations.iter().any(|r| &r.ntp == ntp)
    }

    /// All partitions which this update is actively reallocating.
    pub fn active_ntps(&self) -> impl Iterator<Item = &Ntp> {
        self.reallocations.iter().filter(|r| !r.is_finished()).map(|r| &r.ntp)
    }

    /// Record the output of a planning pass.
    pub fn record_plan(&mut self, reallocations: Vec<PartitionReallocation>, deferred: BTreeSet<Ntp>) {
        self.reallocations.extend(reallocations);
        self.deferred = deferred;
        self.planned = true;
    }

    /// Remove all reallocations whose move has not yet been requested, returning the number removed.
    ///
    /// Any deferred partitions are forgotten as well.
    pub fn drop_pending(&mut self) -> usize {
        let before = self.reallocations.len();
        self.reallocations.retain(|r| !r.is_pending());
        self.deferred.clear();
        before - self.reallocations.len()
    }

    /// Replace the event of this update in place, returning the number of pending reallocations dropped.
    ///
    /// Requested moves are retained, as they can not be interrupted. The update will be planned
    /// again for the new event.
    pub fn supersede(&mut self, update: NodeUpdate) -> usize {
        let dropped = self.drop_pending();
        self.update = update;
        self.planned = false;
        dropped
    }

    /// Fold a recommission of this update's node into this update.
    ///
    /// Pending reallocations are dropped and no further planning takes place. If no requested
    /// moves remain, the update is finished immediately. Returns the number of reallocations dropped.
    pub fn fold_recommission(&mut self, update: NodeUpdate) -> usize {
        let dropped = self.drop_pending();
        self.update = update;
        self.planned = true;
        self.try_finish();
        dropped
    }

    /// Mark this update as finished if it has been planned, has nothing deferred and every
    /// reallocation has finished. Returns the finished status of the update.
    pub fn try_finish(&mut self) -> bool {
        if !self.finished && self.planned && self.deferred.is_empty() && self.reallocations.iter().all(|r| r.is_finished()) {
            self.finished = true;
        }
        self.finished
    }

    /// Discard all reallocation progress, keeping only the node event itself.
    pub fn reset(&mut self) {
        self.reallocations.clear();
        self.deferred.clear();
        self.planned = false;
        self.finished = false;
    }
}

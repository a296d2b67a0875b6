//! Cluster collaborators consumed by the members backend.
//!
//! The members backend owns no cluster state of its own. Membership, partition assignments,
//! placement decisions, partition moves and move progress are all provided by the traits in this
//! module, and every call made through them is a suspension point of the reconciler.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CollaboratorError, MoveError, SolverError};
use crate::model::{NodeId, Ntp, ReplicaSet};

/// Different states which a leader elector may be in.
#[derive(Clone, Debug, PartialEq)]
pub enum LeaderState {
    /// This node is the leader, and is authorized to drive reallocations.
    Leading,
    /// A different node is currently the leader, identified by the encapsulated string.
    Following(String),
    /// The leadership state is unknown, or the leader elector is starting or stopping.
    Standby,
}

/// The membership state of a cluster node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipState {
    /// The node is active and may host replicas.
    Active,
    /// The node is being decommissioned and must not receive new replicas.
    Draining,
    /// The node has been removed from the cluster.
    Removed,
}

/// A member of the cluster as seen by the membership table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Member {
    pub id: NodeId,
    pub state: MembershipState,
}

/// The status of a previously requested partition move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconfigurationStatus {
    /// The move is still in progress.
    InProgress,
    /// The move has completed.
    Complete,
    /// The status of the move can not currently be determined.
    Unknown,
}

/// The authoritative cluster membership table.
#[async_trait]
pub trait MembershipTable: Send + Sync {
    /// All currently known cluster members.
    async fn members(&self) -> Result<Vec<Member>, CollaboratorError>;

    /// Finalize the removal of a decommissioned node. This call is idempotent.
    async fn finalize_removal(&self, node: NodeId) -> Result<(), CollaboratorError>;
}

/// The authoritative mapping of partitions to replica sets.
#[async_trait]
pub trait TopicTable: Send + Sync {
    async fn assignments(&self) -> Result<BTreeMap<Ntp, ReplicaSet>, CollaboratorError>;
}

/// Replicas which have been proposed for placement but whose moves have not yet been requested.
///
/// Proposals are not visible in the topic table until their move is requested, so the solver is
/// handed these counts in order to avoid stacking several proposals onto the same node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reservations(BTreeMap<NodeId, usize>);

impl Reservations {
    /// The number of replicas reserved on the given node.
    pub fn get(&self, node: NodeId) -> usize {
        self.0.get(&node).copied().unwrap_or(0)
    }

    /// Reserve a slot on every node of `proposed` which is not already a member of `previous`.
    pub fn reserve(&mut self, previous: &ReplicaSet, proposed: &ReplicaSet) {
        for node in proposed.iter().filter(|node| !previous.contains(node)) {
            *self.0.entry(*node).or_insert(0) += 1;
        }
    }

    /// Release the slots taken by a previous call to `reserve` with the same arguments.
    pub fn release(&mut self, previous: &ReplicaSet, proposed: &ReplicaSet) {
        for node in proposed.iter().filter(|node| !previous.contains(node)) {
            if let Some(count) = self.0.get_mut(node) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.0.remove(node);
                }
            }
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The placement solver used to propose replacement replica sets.
///
/// Implementations must not mutate any global state; every call is a pure proposal.
#[async_trait]
pub trait PlacementSolver: Send + Sync {
    /// Propose a replacement for the given replica set of a partition which excludes the given node.
    ///
    /// Slots held in `reserved` must be treated as already occupied.
    async fn reallocate(&self, ntp: &Ntp, current: &ReplicaSet, exclude: NodeId, reserved: &Reservations) -> Result<ReplicaSet, SolverError>;
}

/// The topic management service which executes partition moves.
#[async_trait]
pub trait TopicsFrontend: Send + Sync {
    /// Request that the replicas of the given partition be moved to the given replica set.
    ///
    /// Acceptance is asynchronous, completion is observed through the `ProgressService`.
    async fn move_partition_replicas(&self, ntp: &Ntp, replicas: &ReplicaSet) -> Result<(), MoveError>;
}

/// The service which reports the progress of requested partition moves.
#[async_trait]
pub trait ProgressService: Send + Sync {
    async fn reconfiguration_status(&self, ntp: &Ntp) -> Result<ReconfigurationStatus, CollaboratorError>;
}

/// The full set of collaborators used by the members backend.
#[derive(Clone)]
pub struct Collaborators {
    pub members: Arc<dyn MembershipTable>,
    pub topics: Arc<dyn TopicTable>,
    pub solver: Arc<dyn PlacementSolver>,
    pub frontend: Arc<dyn TopicsFrontend>,
    pub progress: Arc<dyn ProgressService>,
}

impl Collaborators {
    /// Build a collaborators set where every collaborator is backed by the same cluster object.
    pub fn from_cluster<C>(cluster: Arc<C>) -> Self
    where
        C: MembershipTable + TopicTable + PlacementSolver + TopicsFrontend + ProgressService + 'static,
    {
        Self {
            members: cluster.clone(),
            topics: cluster.clone(),
            solver: cluster.clone(),
            frontend: cluster.clone(),
            progress: cluster,
        }
    }
}

//! An in-memory cluster implementing every collaborator of the members backend.
//!
//! This is used by the simulator binary and throughout the test suite. Moves are accepted
//! immediately and complete once the configured move latency has elapsed, which is observed
//! lazily by the progress service.
//!
//! ## Placement
//! The solver only places replicas on `Active` nodes which are below their replica capacity,
//! counting both in-flight move targets and reserved proposals against that capacity.
//! Among the candidates, the node hosting the fewest replicas is chosen, with ties broken by the
//! smallest node ID. The replacement takes the slot of the excluded node so that the order of the
//! surviving replicas is preserved.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cluster::{
    Member, MembershipState, MembershipTable, PlacementSolver, ProgressService, ReconfigurationStatus, Reservations, TopicTable, TopicsFrontend,
};
use crate::error::{CollaboratorError, MoveError, SolverError};
use crate::model::{NodeId, NodeUpdate, NodeUpdateKind, Ntp, ReplicaSet};

/// An in-memory cluster.
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<NodeId, NodeEntry>,
    partitions: BTreeMap<Ntp, ReplicaSet>,
    moves: BTreeMap<Ntp, PendingMove>,
    move_latency: Duration,
    /// The number of upcoming move requests which will be rejected as unavailable.
    reject_moves: usize,
    /// While set, progress queries return `Unknown`.
    progress_unknown: bool,
    /// While set, finalizing the removal of a node fails as unavailable.
    finalize_unavailable: bool,
    move_log: Vec<(Ntp, ReplicaSet)>,
    finalized: BTreeSet<NodeId>,
}

struct NodeEntry {
    state: MembershipState,
    capacity: Option<usize>,
}

struct PendingMove {
    target: ReplicaSet,
    requested_at: Instant,
}

impl InMemoryCluster {
    /// Create a new empty cluster where moves complete after the given latency.
    pub fn new(move_latency: Duration) -> Self {
        let cluster = Self::default();
        cluster.state.lock().move_latency = move_latency;
        cluster
    }

    /// Add an active node with no replica capacity limit.
    pub fn add_node(&self, id: NodeId) {
        self.add_node_with_capacity(id, None);
    }

    /// Add an active node which may host at most `capacity` replicas, if given.
    pub fn add_node_with_capacity(&self, id: NodeId, capacity: Option<usize>) {
        self.state.lock().nodes.insert(
            id,
            NodeEntry {
                state: MembershipState::Active,
                capacity,
            },
        );
    }

    /// Add a partition with the given replica set.
    pub fn add_partition(&self, ntp: Ntp, replicas: ReplicaSet) {
        self.state.lock().partitions.insert(ntp, replicas);
    }

    /// Set the membership state of a node, if it is known.
    pub fn set_node_state(&self, id: NodeId, state: MembershipState) {
        if let Some(node) = self.state.lock().nodes.get_mut(&id) {
            node.state = state;
        }
    }

    /// Apply a membership event to the membership table, as the membership manager would.
    pub fn apply_update(&self, update: &NodeUpdate) {
        match update.kind {
            NodeUpdateKind::Joined => {
                let mut state = self.state.lock();
                let node = state.nodes.entry(update.node).or_insert(NodeEntry {
                    state: MembershipState::Active,
                    capacity: None,
                });
                node.state = MembershipState::Active;
            }
            NodeUpdateKind::Left => self.set_node_state(update.node, MembershipState::Removed),
            NodeUpdateKind::Decommissioned => self.set_node_state(update.node, MembershipState::Draining),
            NodeUpdateKind::Recommissioned => self.set_node_state(update.node, MembershipState::Active),
        }
    }

    pub fn set_move_latency(&self, latency: Duration) {
        self.state.lock().move_latency = latency;
    }

    /// Reject the next `count` move requests as unavailable.
    pub fn reject_next_moves(&self, count: usize) {
        self.state.lock().reject_moves = count;
    }

    pub fn set_progress_unknown(&self, unknown: bool) {
        self.state.lock().progress_unknown = unknown;
    }

    pub fn set_finalize_unavailable(&self, unavailable: bool) {
        self.state.lock().finalize_unavailable = unavailable;
    }

    /// The membership state of the given node, if it is known.
    pub fn member_state(&self, id: NodeId) -> Option<MembershipState> {
        self.state.lock().nodes.get(&id).map(|node| node.state)
    }

    /// The current replica set of the given partition.
    pub fn replicas(&self, ntp: &Ntp) -> Option<ReplicaSet> {
        self.state.lock().partitions.get(ntp).cloned()
    }

    /// Every move request accepted so far, in order.
    pub fn move_log(&self) -> Vec<(Ntp, ReplicaSet)> {
        self.state.lock().move_log.clone()
    }

    /// Every node whose removal has been finalized.
    pub fn finalized(&self) -> BTreeSet<NodeId> {
        self.state.lock().finalized.clone()
    }

    /// The number of replicas hosted by the given node.
    pub fn replica_count(&self, id: NodeId) -> usize {
        self.state.lock().replica_counts().get(&id).copied().unwrap_or(0)
    }

    /// Check if any move is still in flight.
    pub fn has_pending_moves(&self) -> bool {
        let mut state = self.state.lock();
        state.complete_elapsed_moves();
        !state.moves.is_empty()
    }
}

impl ClusterState {
    /// Replica counts per node, counting in-flight move targets as already placed.
    fn replica_counts(&self) -> BTreeMap<NodeId, usize> {
        let mut counts = BTreeMap::new();
        for (ntp, replicas) in self.partitions.iter() {
            let replicas = self.moves.get(ntp).map(|pending| &pending.target).unwrap_or(replicas);
            for id in replicas {
                *counts.entry(*id).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Apply every pending move whose latency has elapsed.
    fn complete_elapsed_moves(&mut self) {
        let latency = self.move_latency;
        let done: Vec<Ntp> = self
            .moves
            .iter()
            .filter(|(_, pending)| pending.requested_at.elapsed() >= latency)
            .map(|(ntp, _)| ntp.clone())
            .collect();
        for ntp in done {
            if let Some(pending) = self.moves.remove(&ntp) {
                self.partitions.insert(ntp, pending.target);
            }
        }
    }
}

#[async_trait]
impl MembershipTable for InMemoryCluster {
    async fn members(&self) -> Result<Vec<Member>, CollaboratorError> {
        let state = self.state.lock();
        Ok(state.nodes.iter().map(|(id, node)| Member { id: *id, state: node.state }).collect())
    }

    async fn finalize_removal(&self, node: NodeId) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock();
        if state.finalize_unavailable {
            return Err(CollaboratorError::Unavailable("membership table is not accepting removals".into()));
        }
        if let Some(entry) = state.nodes.get_mut(&node) {
            entry.state = MembershipState::Removed;
        }
        state.finalized.insert(node);
        Ok(())
    }
}

#[async_trait]
impl TopicTable for InMemoryCluster {
    async fn assignments(&self) -> Result<BTreeMap<Ntp, ReplicaSet>, CollaboratorError> {
        let mut state = self.state.lock();
        state.complete_elapsed_moves();
        Ok(state.partitions.clone())
    }
}

#[async_trait]
impl PlacementSolver for InMemoryCluster {
    async fn reallocate(&self, ntp: &Ntp, current: &ReplicaSet, exclude: NodeId, reserved: &Reservations) -> Result<ReplicaSet, SolverError> {
        let state = self.state.lock();
        let slot = match current.iter().position(|id| *id == exclude) {
            Some(slot) => slot,
            None => {
                return Err(SolverError::Infeasible {
                    ntp: ntp.clone(),
                    excluded: exclude,
                })
            }
        };
        let counts = state.replica_counts();
        let candidate = state
            .nodes
            .iter()
            .filter(|(id, node)| node.state == MembershipState::Active && **id != exclude && !current.contains(*id))
            .map(|(id, node)| (counts.get(id).copied().unwrap_or(0) + reserved.get(*id), *id, node.capacity))
            .filter(|(count, _, capacity)| capacity.map(|cap| *count < cap).unwrap_or(true))
            .min_by_key(|(count, id, _)| (*count, *id))
            .map(|(_, id, _)| id);
        match candidate {
            Some(id) => {
                let mut replicas = current.clone();
                replicas[slot] = id;
                Ok(replicas)
            }
            None => Err(SolverError::Infeasible {
                ntp: ntp.clone(),
                excluded: exclude,
            }),
        }
    }
}

#[async_trait]
impl TopicsFrontend for InMemoryCluster {
    async fn move_partition_replicas(&self, ntp: &Ntp, replicas: &ReplicaSet) -> Result<(), MoveError> {
        let mut state = self.state.lock();
        if state.reject_moves > 0 {
            state.reject_moves -= 1;
            return Err(CollaboratorError::Unavailable("topics frontend is not accepting moves".into()).into());
        }
        if !state.partitions.contains_key(ntp) {
            return Err(MoveError::UnknownPartition(ntp.clone()));
        }
        if state.moves.contains_key(ntp) {
            return Err(MoveError::Conflict(ntp.clone()));
        }
        state.moves.insert(
            ntp.clone(),
            PendingMove {
                target: replicas.clone(),
                requested_at: Instant::now(),
            },
        );
        state.move_log.push((ntp.clone(), replicas.clone()));
        Ok(())
    }
}

#[async_trait]
impl ProgressService for InMemoryCluster {
    async fn reconfiguration_status(&self, ntp: &Ntp) -> Result<ReconfigurationStatus, CollaboratorError> {
        let mut state = self.state.lock();
        if state.progress_unknown {
            return Ok(ReconfigurationStatus::Unknown);
        }
        state.complete_elapsed_moves();
        if state.moves.contains_key(ntp) {
            Ok(ReconfigurationStatus::InProgress)
        } else if state.partitions.contains_key(ntp) {
            Ok(ReconfigurationStatus::Complete)
        } else {
            Ok(ReconfigurationStatus::Unknown)
        }
    }
}

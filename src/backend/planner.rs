//! Reallocation planning.
//!
//! Planning turns a node update into the set of partition reallocations needed to satisfy it.
//! Departures (`left` & `decommissioned`) must move every replica hosted on the departing node.
//! Joins optionally pull replicas from overloaded nodes onto the new node. Recommissions never
//! plan anything, their work is done at intake.

use std::collections::{BTreeMap, BTreeSet};

use crate::cluster::{Collaborators, MembershipState, Reservations};
use crate::config::Config;
use crate::error::{CollaboratorError, SolverError};
use crate::model::{NodeId, NodeUpdateKind, Ntp, PartitionReallocation, ReplicaSet, UpdateMeta};

/// Calculate the reallocations needed by the given update & record them on the update.
///
/// Partitions in `busy` are being reallocated by another update; departures defer them until
/// that work completes, joins simply skip them. If the cluster state can not be read, the update
/// is left as is and will be planned again on the next pass.
#[tracing::instrument(level = "debug", skip(collab, config, meta, busy, reserved), fields(node = meta.node(), kind = %meta.update().kind))]
pub(super) async fn calculate_reallocations(
    collab: &Collaborators, config: &Config, meta: &mut UpdateMeta, busy: &BTreeSet<Ntp>, reserved: &mut Reservations,
) {
    match meta.update().kind {
        NodeUpdateKind::Recommissioned => meta.record_plan(vec![], BTreeSet::new()),
        NodeUpdateKind::Joined if !config.rebalance_on_join => meta.record_plan(vec![], BTreeSet::new()),
        NodeUpdateKind::Joined => match plan_join(collab, meta, busy, reserved).await {
            Ok(reallocations) => {
                tracing::debug!(count = reallocations.len(), "planned join rebalance");
                meta.record_plan(reallocations, BTreeSet::new());
            }
            Err(err) => tracing::warn!(error = ?err, "error reading cluster state for join rebalance, will retry"),
        },
        NodeUpdateKind::Left | NodeUpdateKind::Decommissioned => match plan_departure(collab, meta, busy, reserved).await {
            Ok((reallocations, deferred)) => {
                tracing::debug!(count = reallocations.len(), deferred = deferred.len(), "planned departure");
                meta.record_plan(reallocations, deferred);
            }
            Err(err) => tracing::warn!(error = ?err, "error reading partition assignments, will retry"),
        },
    }
}

/// Ask the solver for a replacement of `source` in the given replica set.
///
/// A successful proposal is reserved in `reserved`. Returns `None` when no feasible placement
/// currently exists or the solver is unavailable; the caller keeps the reallocation as `initial`.
pub(super) async fn plan_partition(
    collab: &Collaborators, ntp: &Ntp, current: &ReplicaSet, source: NodeId, reserved: &mut Reservations,
) -> Option<ReplicaSet> {
    match collab.solver.reallocate(ntp, current, source, reserved).await {
        Ok(proposed) => {
            reserved.reserve(current, &proposed);
            Some(proposed)
        }
        Err(SolverError::Infeasible { .. }) => {
            tracing::debug!(%ntp, source, "no feasible placement for partition, will retry");
            None
        }
        Err(err) => {
            tracing::warn!(error = ?err, %ntp, source, "error from placement solver, will retry");
            None
        }
    }
}

/// Plan the reallocation of every replica hosted on the departing node.
async fn plan_departure(
    collab: &Collaborators, meta: &UpdateMeta, busy: &BTreeSet<Ntp>, reserved: &mut Reservations,
) -> Result<(Vec<PartitionReallocation>, BTreeSet<Ntp>), CollaboratorError> {
    let node = meta.node();
    let assignments = collab.topics.assignments().await?;

    let mut reallocations = vec![];
    let mut deferred = BTreeSet::new();
    for (ntp, replicas) in assignments {
        if !replicas.contains(&node) || meta.tracks(&ntp) {
            continue;
        }
        if busy.contains(&ntp) {
            tracing::debug!(%ntp, "partition is being reallocated by another update, deferring");
            deferred.insert(ntp);
            continue;
        }
        let realloc = match plan_partition(collab, &ntp, &replicas, node, reserved).await {
            Some(proposed) => PartitionReallocation::reassigned(ntp, node, replicas, proposed),
            None => PartitionReallocation::new(ntp, node, replicas),
        };
        reallocations.push(realloc);
    }
    Ok((reallocations, deferred))
}

/// Plan moves of replicas from overloaded nodes onto a newly joined node.
///
/// The target load is the total replica count divided evenly over the active nodes, rounded up.
/// Replicas are pulled from every node above the target, in node ID order, until the joined
/// node reaches the target. Proposals which would not land on the joined node are skipped.
async fn plan_join(
    collab: &Collaborators, meta: &UpdateMeta, busy: &BTreeSet<Ntp>, reserved: &mut Reservations,
) -> Result<Vec<PartitionReallocation>, CollaboratorError> {
    let joined = meta.node();
    let active: BTreeSet<NodeId> = collab
        .members
        .members()
        .await?
        .into_iter()
        .filter(|member| member.state == MembershipState::Active)
        .map(|member| member.id)
        .collect();
    if !active.contains(&joined) || active.len() < 2 {
        return Ok(vec![]);
    }

    let assignments = collab.topics.assignments().await?;
    let total: usize = assignments.values().map(|replicas| replicas.len()).sum();
    let target = (total + active.len() - 1) / active.len();
    let mut load: BTreeMap<NodeId, usize> = active.iter().map(|id| (*id, 0)).collect();
    for id in assignments.values().flatten() {
        if let Some(count) = load.get_mut(id) {
            *count += 1;
        }
    }
    let mut joined_load = load.get(&joined).copied().unwrap_or(0) + reserved.get(joined);

    let mut reallocations = vec![];
    let mut taken = BTreeSet::new();
    for (node, count) in load {
        if node == joined || count <= target {
            continue;
        }
        let mut excess = count - target;
        for (ntp, replicas) in assignments.iter() {
            if excess == 0 || joined_load >= target {
                break;
            }
            if !replicas.contains(&node) || replicas.contains(&joined) || busy.contains(ntp) || meta.tracks(ntp) || taken.contains(ntp) {
                continue;
            }
            let proposed = match collab.solver.reallocate(ntp, replicas, node, reserved).await {
                Ok(proposed) if proposed.contains(&joined) => proposed,
                Ok(_) => continue,
                Err(err) => {
                    tracing::debug!(error = ?err, %ntp, "skipping partition for join rebalance");
                    continue;
                }
            };
            reserved.reserve(replicas, &proposed);
            taken.insert(ntp.clone());
            reallocations.push(PartitionReallocation::reassigned(ntp.clone(), node, replicas.clone(), proposed));
            excess -= 1;
            joined_load += 1;
        }
        if joined_load >= target {
            break;
        }
    }
    Ok(reallocations)
}

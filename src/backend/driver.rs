//! Reallocation driver.
//!
//! Drives the reallocations of a single update forward: placing `initial` reallocations,
//! requesting moves for `reassigned` ones & observing completion of `requested` ones. Every
//! failure leaves the reallocation in its current state to be retried on a later pass.

use std::collections::BTreeSet;

use futures::prelude::*;

use crate::backend::{planner, METRIC_MOVES_REQUESTED, METRIC_REALLOCATIONS_FINISHED};
use crate::cluster::{Collaborators, ReconfigurationStatus, Reservations};
use crate::config::Config;
use crate::error::MoveError;
use crate::model::{Ntp, ReallocationState, ReplicaSet, UpdateMeta};

/// Drive every pending reallocation of the given update forward.
#[tracing::instrument(level = "debug", skip(collab, config, meta, reserved), fields(node = meta.node(), kind = %meta.update().kind))]
pub(super) async fn reallocate_replica_sets(collab: &Collaborators, config: &Config, meta: &mut UpdateMeta, reserved: &mut Reservations) {
    if meta.reallocations().iter().any(|r| r.state() == ReallocationState::Initial) {
        place_initial(collab, meta, reserved).await;
    }
    if !meta.reallocations().iter().any(|r| r.state() == ReallocationState::Reassigned) {
        return;
    }

    // Futures only own their inputs, outcomes are applied to the update once all have settled.
    let requests: Vec<(usize, Ntp, ReplicaSet)> = meta
        .reallocations()
        .iter()
        .enumerate()
        .filter(|(_, r)| r.state() == ReallocationState::Reassigned)
        .filter_map(|(idx, r)| r.new_assignment().map(|proposed| (idx, r.ntp().clone(), proposed.clone())))
        .collect();
    let outcomes: Vec<(usize, MoveOutcome)> = stream::iter(requests)
        .map(|(idx, ntp, proposed)| {
            let frontend = collab.frontend.clone();
            async move {
                match frontend.move_partition_replicas(&ntp, &proposed).await {
                    Ok(()) => (idx, MoveOutcome::Requested),
                    Err(MoveError::UnknownPartition(_)) => {
                        tracing::debug!(%ntp, "partition no longer exists, dropping reallocation");
                        (idx, MoveOutcome::Gone)
                    }
                    Err(err) => {
                        tracing::warn!(error = ?err, %ntp, "error requesting partition move, will retry");
                        (idx, MoveOutcome::Retry)
                    }
                }
            }
        })
        .buffer_unordered(config.max_concurrent_moves)
        .collect()
        .await;

    let mut unknown = BTreeSet::new();
    let mut requested = 0u64;
    let reallocations = meta.reallocations_mut();
    for (idx, outcome) in outcomes {
        let realloc = match reallocations.get_mut(idx) {
            Some(realloc) => realloc,
            None => continue,
        };
        let proposed = match realloc.new_assignment() {
            Some(proposed) => proposed.clone(),
            None => continue,
        };
        match outcome {
            MoveOutcome::Requested => {
                tracing::info!(ntp = %realloc.ntp(), from = ?realloc.previous(), to = ?proposed, "partition move requested");
                realloc.mark_requested();
                reserved.release(realloc.previous(), &proposed);
                requested += 1;
            }
            MoveOutcome::Gone => {
                reserved.release(realloc.previous(), &proposed);
                unknown.insert(idx);
            }
            MoveOutcome::Retry => (),
        }
    }
    if requested > 0 {
        metrics::counter!(METRIC_MOVES_REQUESTED, requested);
    }
    if !unknown.is_empty() {
        let mut idx = 0;
        reallocations.retain(|_| {
            let keep = !unknown.contains(&idx);
            idx += 1;
            keep
        });
    }
}

/// The outcome of a single move request.
enum MoveOutcome {
    /// The move was accepted.
    Requested,
    /// The partition no longer exists.
    Gone,
    Retry,
}

/// Find placements for reallocations which do not yet have one.
///
/// Placement is always computed against the partition's current replica set. Reallocations of
/// partitions which no longer exist, or which no longer include the source node, are obsolete
/// and are removed from the update.
async fn place_initial(collab: &Collaborators, meta: &mut UpdateMeta, reserved: &mut Reservations) {
    let assignments = match collab.topics.assignments().await {
        Ok(assignments) => assignments,
        Err(err) => {
            tracing::warn!(error = ?err, "error reading partition assignments, will retry");
            return;
        }
    };

    let mut obsolete = BTreeSet::new();
    for idx in 0..meta.reallocations().len() {
        let (ntp, source) = match meta.reallocations().get(idx) {
            Some(realloc) if realloc.state() == ReallocationState::Initial => (realloc.ntp().clone(), realloc.source()),
            _ => continue,
        };
        let current = match assignments.get(&ntp) {
            Some(current) if current.contains(&source) => current,
            _ => {
                obsolete.insert(ntp);
                continue;
            }
        };
        if let Some(proposed) = planner::plan_partition(collab, &ntp, current, source, reserved).await {
            tracing::debug!(%ntp, ?proposed, "placement found for partition");
            if let Some(realloc) = meta.reallocations_mut().get_mut(idx) {
                realloc.assign(current.clone(), proposed);
            }
        }
    }
    if !obsolete.is_empty() {
        tracing::debug!(count = obsolete.len(), "dropping obsolete reallocations");
        meta.reallocations_mut()
            .retain(|r| !(r.state() == ReallocationState::Initial && obsolete.contains(r.ntp())));
    }
}

/// Observe the progress of every requested move of the given update, and finish the update if
/// all of its work is done. Returns the finished status of the update.
///
/// A move is only considered finished once the progress service reports it as complete.
#[tracing::instrument(level = "debug", skip(collab, config, meta), fields(node = meta.node(), kind = %meta.update().kind))]
pub(super) async fn try_to_finish_update(collab: &Collaborators, config: &Config, meta: &mut UpdateMeta) -> bool {
    let queries: Vec<(usize, Ntp)> = meta
        .reallocations()
        .iter()
        .enumerate()
        .filter(|(_, r)| r.state() == ReallocationState::Requested)
        .map(|(idx, r)| (idx, r.ntp().clone()))
        .collect();
    let complete: Vec<usize> = stream::iter(queries)
        .map(|(idx, ntp)| {
            let progress = collab.progress.clone();
            async move {
                match progress.reconfiguration_status(&ntp).await {
                    Ok(ReconfigurationStatus::Complete) => {
                        tracing::info!(%ntp, "partition move finished");
                        Some(idx)
                    }
                    Ok(status) => {
                        tracing::trace!(%ntp, ?status, "partition move not yet finished");
                        None
                    }
                    Err(err) => {
                        tracing::warn!(error = ?err, %ntp, "error querying move progress, will retry");
                        None
                    }
                }
            }
        })
        .buffer_unordered(config.max_concurrent_moves)
        .filter_map(future::ready)
        .collect()
        .await;

    let mut finished = 0u64;
    let reallocations = meta.reallocations_mut();
    for idx in complete {
        if reallocations.get_mut(idx).map(|realloc| realloc.mark_finished()).unwrap_or(false) {
            finished += 1;
        }
    }
    if finished > 0 {
        metrics::counter!(METRIC_REALLOCATIONS_FINISHED, finished);
    }
    meta.try_finish()
}

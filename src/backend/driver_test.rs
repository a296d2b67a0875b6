use std::time::Duration;

use anyhow::Result;

use crate::backend::driver::{reallocate_replica_sets, try_to_finish_update};
use crate::cluster::{Collaborators, Reservations};
use crate::config::Config;
use crate::fixtures::{self, ntp};
use crate::model::{NodeUpdate, NodeUpdateKind, PartitionReallocation, ReallocationState, UpdateMeta};

fn decommission(node: u32, reallocations: Vec<PartitionReallocation>) -> UpdateMeta {
    let mut meta = UpdateMeta::new(NodeUpdate::new(node, NodeUpdateKind::Decommissioned, 1));
    meta.record_plan(reallocations, Default::default());
    meta
}

fn states(meta: &UpdateMeta) -> Vec<ReallocationState> {
    meta.reallocations().iter().map(|r| r.state()).collect()
}

#[tokio::test]
async fn moves_are_requested_and_finished() -> Result<()> {
    let config = Config::new_test();
    let cluster = fixtures::cluster(&[1, 2, 3, 4], Duration::ZERO);
    cluster.add_partition(ntp("events", 0), vec![1, 2, 3]);
    let collab = Collaborators::from_cluster(cluster.clone());
    let mut meta = decommission(1, vec![PartitionReallocation::reassigned(ntp("events", 0), 1, vec![1, 2, 3], vec![4, 2, 3])]);

    let mut reserved = Reservations::default();
    reserved.reserve(&vec![1, 2, 3], &vec![4, 2, 3]);
    reallocate_replica_sets(&collab, &config, &mut meta, &mut reserved).await;

    assert!(states(&meta) == vec![ReallocationState::Requested], "expected move to be requested, got {:?}", states(&meta));
    assert!(reserved.is_empty(), "expected reservation to be released once requested");
    let log = cluster.move_log();
    assert!(log == vec![(ntp("events", 0), vec![4, 2, 3])], "unexpected move log {:?}", log);

    let finished = try_to_finish_update(&collab, &config, &mut meta).await;
    assert!(finished, "expected update to finish once its move completes");
    assert!(states(&meta) == vec![ReallocationState::Finished], "expected reallocation to be finished, got {:?}", states(&meta));

    Ok(())
}

#[tokio::test]
async fn rejected_moves_are_retried() -> Result<()> {
    let config = Config::new_test();
    let cluster = fixtures::cluster(&[1, 2, 3, 4], Duration::ZERO);
    cluster.add_partition(ntp("events", 0), vec![1, 2, 3]);
    let collab = Collaborators::from_cluster(cluster.clone());
    let mut meta = decommission(1, vec![PartitionReallocation::reassigned(ntp("events", 0), 1, vec![1, 2, 3], vec![4, 2, 3])]);
    cluster.reject_next_moves(1);

    reallocate_replica_sets(&collab, &config, &mut meta, &mut Reservations::default()).await;
    assert!(states(&meta) == vec![ReallocationState::Reassigned], "expected rejected move to stay reassigned, got {:?}", states(&meta));
    assert!(!try_to_finish_update(&collab, &config, &mut meta).await, "expected update to not finish");

    reallocate_replica_sets(&collab, &config, &mut meta, &mut Reservations::default()).await;
    assert!(states(&meta) == vec![ReallocationState::Requested], "expected retried move to be requested, got {:?}", states(&meta));

    Ok(())
}

#[tokio::test]
async fn unknown_progress_is_not_finished() -> Result<()> {
    let config = Config::new_test();
    let cluster = fixtures::cluster(&[1, 2, 3, 4], Duration::ZERO);
    cluster.add_partition(ntp("events", 0), vec![1, 2, 3]);
    let collab = Collaborators::from_cluster(cluster.clone());
    let mut meta = decommission(1, vec![PartitionReallocation::reassigned(ntp("events", 0), 1, vec![1, 2, 3], vec![4, 2, 3])]);
    reallocate_replica_sets(&collab, &config, &mut meta, &mut Reservations::default()).await;
    cluster.set_progress_unknown(true);

    assert!(!try_to_finish_update(&collab, &config, &mut meta).await, "expected unknown progress to not finish the update");
    assert!(states(&meta) == vec![ReallocationState::Requested], "expected move to remain requested, got {:?}", states(&meta));

    cluster.set_progress_unknown(false);
    assert!(try_to_finish_update(&collab, &config, &mut meta).await, "expected update to finish once progress is known");

    Ok(())
}

#[tokio::test]
async fn initial_reallocations_are_placed_when_capacity_appears() -> Result<()> {
    let config = Config::new_test();
    let cluster = fixtures::cluster(&[1, 2, 3], Duration::ZERO);
    cluster.add_partition(ntp("events", 0), vec![1, 2, 3]);
    let collab = Collaborators::from_cluster(cluster.clone());
    let mut meta = decommission(1, vec![PartitionReallocation::new(ntp("events", 0), 1, vec![1, 2, 3])]);

    reallocate_replica_sets(&collab, &config, &mut meta, &mut Reservations::default()).await;
    assert!(states(&meta) == vec![ReallocationState::Initial], "expected no placement without capacity, got {:?}", states(&meta));

    cluster.add_node(5);
    reallocate_replica_sets(&collab, &config, &mut meta, &mut Reservations::default()).await;
    assert!(states(&meta) == vec![ReallocationState::Requested], "expected placement & request, got {:?}", states(&meta));
    let assignment = meta.reallocations()[0].new_assignment().cloned();
    assert!(assignment == Some(vec![5, 2, 3]), "expected node 5 in place of node 1, got {:?}", assignment);

    Ok(())
}

#[tokio::test]
async fn obsolete_reallocations_are_dropped() -> Result<()> {
    let config = Config::new_test();
    let cluster = fixtures::cluster(&[1, 2, 3, 4], Duration::ZERO);
    // The partition no longer includes the source node, and the other one no longer exists.
    cluster.add_partition(ntp("events", 0), vec![4, 2, 3]);
    let collab = Collaborators::from_cluster(cluster.clone());
    let mut meta = decommission(
        1,
        vec![
            PartitionReallocation::new(ntp("events", 0), 1, vec![1, 2, 3]),
            PartitionReallocation::reassigned(ntp("events", 7), 1, vec![1, 2, 3], vec![4, 2, 3]),
        ],
    );

    reallocate_replica_sets(&collab, &config, &mut meta, &mut Reservations::default()).await;

    assert!(meta.reallocations().is_empty(), "expected obsolete reallocations to be dropped, got {:?}", states(&meta));
    assert!(try_to_finish_update(&collab, &config, &mut meta).await, "expected update with no remaining work to finish");
    assert!(cluster.move_log().is_empty(), "expected no moves to be requested");

    Ok(())
}

use crate::model::{NodeUpdate, NodeUpdateKind, Ntp, PartitionReallocation, Placement, ReallocationState, UpdateMeta};

fn ntp(partition: u32) -> Ntp {
    Ntp::new("kafka", "events", partition)
}

#[test]
fn reallocation_moves_forward_only() {
    let mut realloc = PartitionReallocation::new(ntp(0), 1, vec![1, 2, 3]);
    assert_eq!(realloc.state(), ReallocationState::Initial);
    assert!(realloc.new_assignment().is_none(), "expected no assignment for initial reallocation");

    assert!(!realloc.mark_requested(), "expected initial -> requested to be rejected");
    assert!(!realloc.mark_finished(), "expected initial -> finished to be rejected");

    assert!(realloc.assign(vec![1, 2, 3], vec![2, 3, 4]), "expected initial -> reassigned to be accepted");
    assert_eq!(realloc.state(), ReallocationState::Reassigned);
    assert_eq!(realloc.placement(), &Placement::Planned(vec![2, 3, 4]));
    assert!(!realloc.assign(vec![1, 2, 3], vec![5, 6, 7]), "expected a second assignment to be rejected");
    assert_eq!(realloc.new_assignment(), Some(&vec![2, 3, 4]));

    assert!(!realloc.mark_finished(), "expected reassigned -> finished to be rejected");
    assert!(realloc.mark_requested(), "expected reassigned -> requested to be accepted");
    assert!(!realloc.is_pending(), "expected requested reallocation to not be pending");
    assert!(realloc.mark_finished(), "expected requested -> finished to be accepted");
    assert!(realloc.is_finished());
    assert!(!realloc.mark_requested(), "expected finished -> requested to be rejected");
    assert_eq!(realloc.new_assignment(), Some(&vec![2, 3, 4]), "expected assignment to survive completion");
}

#[test]
fn update_finishes_only_when_all_children_finish() {
    let mut meta = UpdateMeta::new(NodeUpdate::new(1, NodeUpdateKind::Decommissioned, 10));
    assert!(!meta.try_finish(), "expected unplanned update to not finish");

    let mut done = PartitionReallocation::reassigned(ntp(0), 1, vec![1, 2, 3], vec![2, 3, 4]);
    done.mark_requested();
    done.mark_finished();
    let stuck = PartitionReallocation::new(ntp(1), 1, vec![1, 2, 3]);
    meta.record_plan(vec![done, stuck], Default::default());
    assert!(!meta.try_finish(), "expected update with an initial child to not finish");

    let dropped = meta.drop_pending();
    assert_eq!(dropped, 1, "expected one pending reallocation to be dropped");
    assert!(meta.try_finish(), "expected update with only finished children to finish");
    assert!(meta.reallocations().iter().all(|r| r.is_finished()));
}

#[test]
fn update_with_deferred_partitions_does_not_finish() {
    let mut meta = UpdateMeta::new(NodeUpdate::new(1, NodeUpdateKind::Left, 3));
    meta.record_plan(vec![], vec![ntp(7)].into_iter().collect());
    assert!(meta.needs_planning(), "expected deferred partitions to require planning");
    assert!(!meta.try_finish(), "expected update with deferred partitions to not finish");

    meta.record_plan(vec![], Default::default());
    assert!(!meta.needs_planning());
    assert!(meta.try_finish());
}

#[test]
fn recommission_fold_keeps_requested_moves() {
    let mut meta = UpdateMeta::new(NodeUpdate::new(4, NodeUpdateKind::Decommissioned, 1));
    let mut requested = PartitionReallocation::reassigned(ntp(0), 4, vec![4, 2, 3], vec![1, 2, 3]);
    requested.mark_requested();
    let reassigned = PartitionReallocation::reassigned(ntp(1), 4, vec![4, 2, 3], vec![1, 2, 3]);
    meta.record_plan(vec![requested, reassigned], Default::default());

    let dropped = meta.fold_recommission(NodeUpdate::new(4, NodeUpdateKind::Recommissioned, 2));

    assert_eq!(dropped, 1, "expected only the reassigned child to be dropped");
    assert_eq!(meta.reallocations().len(), 1);
    assert_eq!(meta.reallocations()[0].state(), ReallocationState::Requested);
    assert_eq!(meta.update().kind, NodeUpdateKind::Recommissioned);
    assert!(!meta.is_finished(), "expected update to wait for the requested move");
    assert!(!meta.needs_planning(), "expected no further planning after a recommission");
}

#[test]
fn reset_discards_progress() {
    let mut meta = UpdateMeta::new(NodeUpdate::new(2, NodeUpdateKind::Decommissioned, 1));
    meta.record_plan(vec![PartitionReallocation::reassigned(ntp(0), 2, vec![1, 2, 3], vec![1, 4, 3])], Default::default());
    meta.reset();
    assert!(meta.reallocations().is_empty());
    assert!(!meta.is_planned());
    assert!(meta.needs_planning());
}

//! Membership scenarios: joins, leader redirect, mid-epoch crashes with
//! ragged-edge agreement, and partition detection.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{payload_strings, pick_free_port, send_text, spawn_member, wait_until, DeliveryLog, NodeSpec, TestNet};
use tessera_group::{GroupError, Mode, SubgroupRegistry, SubgroupTypeEntry, UniformAllocator};

const DEADLINE: Duration = Duration::from_secs(60);

fn registry() -> SubgroupRegistry {
    let mut registry = SubgroupRegistry::new();
    registry.register(SubgroupTypeEntry::volatile("data"));
    registry
}

fn uniform() -> Arc<UniformAllocator> {
    Arc::new(UniformAllocator::new(1, 16, Mode::Ordered))
}

#[test]
fn simple_join_installs_the_next_view() {
    let net = TestNet::new();
    let dir = tempfile::tempdir().expect("create temp dir");
    let leader_port = pick_free_port();
    let spec_a = NodeSpec::leader(1, leader_port, dir.path());
    let spec_b = NodeSpec::new(2, leader_port, dir.path());
    let log_a = DeliveryLog::new();
    let log_b = DeliveryLog::new();

    let a = spawn_member(&net, &spec_a, registry(), uniform(), log_a.callbacks())
        .join()
        .expect("builder thread")
        .expect("leader starts alone");
    assert_eq!(a.current_view().expect("view").vid, 0);
    assert_eq!(a.members().expect("members"), vec![1]);

    let b = spawn_member(&net, &spec_b, registry(), uniform(), log_b.callbacks())
        .join()
        .expect("builder thread")
        .expect("joiner is admitted");

    for group in [&a, &b] {
        assert!(wait_until(DEADLINE, || {
            group
                .current_view()
                .map(|v| v.vid == 1 && v.members == vec![1, 2])
                .unwrap_or(false)
        }));
    }
    // The joiner is recorded in the view's membership delta.
    assert_eq!(b.current_view().expect("view").joined, vec![2]);

    // The widened shard carries ordered traffic.
    send_text(&a, 0, "after-join");
    for log in [&log_a, &log_b] {
        assert!(wait_until(DEADLINE, || log.len() >= 1));
        assert_eq!(payload_strings(log), vec!["after-join"]);
    }

    a.leave();
    b.leave();
}

#[test]
fn join_against_a_follower_is_redirected_to_the_leader() {
    let net = TestNet::new();
    let dir = tempfile::tempdir().expect("create temp dir");
    let leader_port = pick_free_port();
    let spec_a = NodeSpec::leader(1, leader_port, dir.path());
    let spec_b = NodeSpec::new(2, leader_port, dir.path());
    let log_a = DeliveryLog::new();
    let log_b = DeliveryLog::new();
    let log_c = DeliveryLog::new();

    let a = spawn_member(&net, &spec_a, registry(), uniform(), log_a.callbacks())
        .join()
        .expect("builder thread")
        .expect("leader starts");
    let b = spawn_member(&net, &spec_b, registry(), uniform(), log_b.callbacks())
        .join()
        .expect("builder thread")
        .expect("first joiner admitted");
    assert!(wait_until(DEADLINE, || {
        a.current_view().map(|v| v.vid == 1).unwrap_or(false)
    }));

    // Node 3 dials the follower; the follower answers LEADER_REDIRECT and
    // the joiner re-dials the real leader.
    let mut spec_c = NodeSpec::new(3, spec_b.gms_port, dir.path());
    spec_c.leader_gms_port = spec_b.gms_port;
    let c = spawn_member(&net, &spec_c, registry(), uniform(), log_c.callbacks())
        .join()
        .expect("builder thread")
        .expect("redirected joiner admitted");

    for group in [&a, &b, &c] {
        assert!(wait_until(DEADLINE, || {
            group
                .current_view()
                .map(|v| v.members == vec![1, 2, 3])
                .unwrap_or(false)
        }));
    }

    a.leave();
    b.leave();
    c.leave();
}

#[test]
fn crash_mid_epoch_trims_identically_at_survivors() {
    let net = TestNet::new();
    let dir = tempfile::tempdir().expect("create temp dir");
    let leader_port = pick_free_port();
    let specs: Vec<NodeSpec> = vec![
        NodeSpec::leader(1, leader_port, dir.path()),
        NodeSpec::new(2, leader_port, dir.path()),
        NodeSpec::new(3, leader_port, dir.path()),
    ];
    let logs: Vec<DeliveryLog> = (0..3).map(|_| DeliveryLog::new()).collect();

    let a = spawn_member(&net, &specs[0], registry(), uniform(), logs[0].callbacks())
        .join()
        .expect("builder thread")
        .expect("leader starts");
    let b = spawn_member(&net, &specs[1], registry(), uniform(), logs[1].callbacks())
        .join()
        .expect("builder thread")
        .expect("node 2 admitted");
    let c = spawn_member(&net, &specs[2], registry(), uniform(), logs[2].callbacks())
        .join()
        .expect("builder thread")
        .expect("node 3 admitted");
    for group in [&a, &b, &c] {
        assert!(wait_until(DEADLINE, || {
            group
                .current_view()
                .map(|v| v.members == vec![1, 2, 3])
                .unwrap_or(false)
        }));
    }

    send_text(&a, 0, "pre-crash-1");
    send_text(&c, 0, "pre-crash-2");
    for log in &logs {
        assert!(wait_until(DEADLINE, || log.len() >= 2));
    }

    // Node 3 is suspected by both survivors; the view change must run the
    // ragged-edge cleanup and install without it.
    let epoch = a.install_epoch();
    a.report_failure(3);
    b.report_failure(3);

    for group in [&a, &b] {
        assert!(wait_until(DEADLINE, || {
            group
                .current_view()
                .map(|v| v.members == vec![1, 2])
                .unwrap_or(false)
        }));
        assert!(group.install_epoch() > epoch);
        assert!(group.fatal_error().is_none());
    }

    // The delivered prefix is identical at both survivors.
    assert_eq!(payload_strings(&logs[0]), payload_strings(&logs[1]));

    // The shrunken shard keeps delivering.
    send_text(&b, 0, "post-crash");
    for log in &logs[..2] {
        assert!(wait_until(DEADLINE, || {
            payload_strings(log).contains(&"post-crash".to_string())
        }));
    }
    assert_eq!(payload_strings(&logs[0]), payload_strings(&logs[1]));

    a.leave();
    b.leave();
    c.leave();
}

#[test]
fn losing_the_majority_is_fatal() {
    let net = TestNet::new();
    let dir = tempfile::tempdir().expect("create temp dir");
    let leader_port = pick_free_port();
    let specs: Vec<NodeSpec> = vec![
        NodeSpec::leader(1, leader_port, dir.path()),
        NodeSpec::new(2, leader_port, dir.path()),
        NodeSpec::new(3, leader_port, dir.path()),
    ];
    let logs: Vec<DeliveryLog> = (0..3).map(|_| DeliveryLog::new()).collect();

    let a = spawn_member(&net, &specs[0], registry(), uniform(), logs[0].callbacks())
        .join()
        .expect("builder thread")
        .expect("leader starts");
    let b = spawn_member(&net, &specs[1], registry(), uniform(), logs[1].callbacks())
        .join()
        .expect("builder thread")
        .expect("node 2 admitted");
    let c = spawn_member(&net, &specs[2], registry(), uniform(), logs[2].callbacks())
        .join()
        .expect("builder thread")
        .expect("node 3 admitted");
    for group in [&a, &b, &c] {
        assert!(wait_until(DEADLINE, || {
            group
                .current_view()
                .map(|v| v.members == vec![1, 2, 3])
                .unwrap_or(false)
        }));
    }

    // Suspecting two of three members puts this node in a minority: it must
    // abort rather than risk split-brain progress.
    a.report_failure(2);
    a.report_failure(3);

    assert!(wait_until(DEADLINE, || {
        matches!(a.fatal_error(), Some(GroupError::PartitionDetected))
    }));

    a.leave();
    b.leave();
    c.leave();
}

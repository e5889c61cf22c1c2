//! Ordered-multicast delivery across a three-node shard: deterministic
//! sender interleaving, the NULL-fill scheme for lagging senders, and the
//! unordered fast path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{payload_strings, pick_free_port, send_text, spawn_member, wait_until, DeliveryLog, NodeSpec, TestNet};
use tessera_group::{
    FixedShardAllocator, GroupError, Mode, SubgroupRegistry, SubgroupTypeEntry,
    INVALID_VERSION,
};
use tessera_group::allocator::FixedShard;

const DEADLINE: Duration = Duration::from_secs(60);

fn registry() -> SubgroupRegistry {
    let mut registry = SubgroupRegistry::new();
    registry.register(SubgroupTypeEntry::volatile("data"));
    registry
}

fn fixed_allocator(members: Vec<u32>, senders: Option<Vec<bool>>, mode: Mode) -> Arc<FixedShardAllocator> {
    Arc::new(FixedShardAllocator {
        subgroups: vec![vec![FixedShard {
            members,
            senders,
            mode,
        }]],
    })
}

#[test]
fn two_senders_interleave_deterministically() {
    let net = TestNet::new();
    let dir = tempfile::tempdir().expect("create temp dir");
    let leader_port = pick_free_port();
    let specs: Vec<NodeSpec> = vec![
        NodeSpec::leader(1, leader_port, dir.path()),
        NodeSpec::new(2, leader_port, dir.path()),
        NodeSpec::new(3, leader_port, dir.path()),
    ];
    let logs: Vec<DeliveryLog> = (0..3).map(|_| DeliveryLog::new()).collect();
    let allocator = fixed_allocator(vec![1, 2, 3], Some(vec![true, true, false]), Mode::Ordered);
    let handles: Vec<_> = specs
        .iter()
        .zip(logs.iter())
        .map(|(spec, log)| {
            spawn_member(&net, spec, registry(), allocator.clone(), log.callbacks())
        })
        .collect();
    let groups: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("builder thread").expect("group starts"))
        .collect();

    // Sender ranks: node 1 -> 0, node 2 -> 1. Sequence numbers interleave
    // as index * 2 + sender_rank, so x0, y0, x1 is the only legal order.
    send_text(&groups[0], 0, "x0");
    send_text(&groups[1], 0, "y0");
    send_text(&groups[0], 0, "x1");

    for log in &logs {
        assert!(
            wait_until(DEADLINE, || log.len() >= 3),
            "all three messages should deliver everywhere, got {:?}",
            payload_strings(log)
        );
    }
    for log in &logs {
        assert_eq!(payload_strings(log), vec!["x0", "y0", "x1"]);
        // Delivered versions carry the view id and strictly increase.
        let versions: Vec<_> = log.entries().iter().map(|(_, _, v, _)| *v).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert!(versions.iter().all(|v| *v >= 0));
    }

    for group in &groups {
        group.leave();
    }
}

#[test]
fn silent_sender_is_filled_with_nulls() {
    let net = TestNet::new();
    let dir = tempfile::tempdir().expect("create temp dir");
    let leader_port = pick_free_port();
    let specs: Vec<NodeSpec> = vec![
        NodeSpec::leader(1, leader_port, dir.path()),
        NodeSpec::new(2, leader_port, dir.path()),
        NodeSpec::new(3, leader_port, dir.path()),
    ];
    let logs: Vec<DeliveryLog> = (0..3).map(|_| DeliveryLog::new()).collect();
    let allocator = fixed_allocator(vec![1, 2, 3], Some(vec![true, true, false]), Mode::Ordered);
    let handles: Vec<_> = specs
        .iter()
        .zip(logs.iter())
        .map(|(spec, log)| {
            spawn_member(&net, spec, registry(), allocator.clone(), log.callbacks())
        })
        .collect();
    let groups: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("builder thread").expect("group starts"))
        .collect();

    // Node 2 never sends. Without its NULL fills the interleaved sequence
    // would stall after x0; with them every x message delivers.
    send_text(&groups[0], 0, "x0");
    send_text(&groups[0], 0, "x1");
    send_text(&groups[0], 0, "x2");

    for log in &logs {
        assert!(
            wait_until(DEADLINE, || log.len() >= 3),
            "null fills should unblock delivery, got {:?}",
            payload_strings(log)
        );
        assert_eq!(payload_strings(log), vec!["x0", "x1", "x2"]);
        // Null messages produce no payload callbacks.
        assert!(log.entries().iter().all(|(sender, _, _, _)| *sender == 1));
    }

    for group in &groups {
        group.leave();
    }
}

#[test]
fn unordered_mode_delivers_without_versions() {
    let net = TestNet::new();
    let dir = tempfile::tempdir().expect("create temp dir");
    let leader_port = pick_free_port();
    let specs: Vec<NodeSpec> = vec![
        NodeSpec::leader(1, leader_port, dir.path()),
        NodeSpec::new(2, leader_port, dir.path()),
    ];
    let logs: Vec<DeliveryLog> = (0..2).map(|_| DeliveryLog::new()).collect();
    let allocator = fixed_allocator(vec![1, 2], None, Mode::Unordered);
    let handles: Vec<_> = specs
        .iter()
        .zip(logs.iter())
        .map(|(spec, log)| {
            spawn_member(&net, spec, registry(), allocator.clone(), log.callbacks())
        })
        .collect();
    let groups: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("builder thread").expect("group starts"))
        .collect();

    send_text(&groups[0], 0, "u0");
    send_text(&groups[0], 0, "u1");

    for log in &logs {
        assert!(
            wait_until(DEADLINE, || log.len() >= 2),
            "unordered messages should deliver, got {:?}",
            payload_strings(log)
        );
        assert_eq!(payload_strings(log), vec!["u0", "u1"]);
        assert!(log
            .entries()
            .iter()
            .all(|(_, _, version, _)| *version == INVALID_VERSION));
    }

    for group in &groups {
        group.leave();
    }
}

#[test]
fn zero_sender_shard_stays_idle() {
    let net = TestNet::new();
    let dir = tempfile::tempdir().expect("create temp dir");
    let leader_port = pick_free_port();
    let specs: Vec<NodeSpec> = vec![
        NodeSpec::leader(1, leader_port, dir.path()),
        NodeSpec::new(2, leader_port, dir.path()),
    ];
    let logs: Vec<DeliveryLog> = (0..2).map(|_| DeliveryLog::new()).collect();
    let allocator = fixed_allocator(vec![1, 2], Some(vec![false, false]), Mode::Ordered);
    let handles: Vec<_> = specs
        .iter()
        .zip(logs.iter())
        .map(|(spec, log)| {
            spawn_member(&net, spec, registry(), allocator.clone(), log.callbacks())
        })
        .collect();
    let groups: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("builder thread").expect("group starts"))
        .collect();

    // No member is a sender: sends are rejected and nothing progresses,
    // but the group stays healthy.
    let err = groups[0]
        .send(0, 2, |buf| buf.copy_from_slice(b"no"))
        .expect_err("non-sender must be rejected");
    assert!(matches!(err, GroupError::InvalidSubgroup(0)));

    std::thread::sleep(Duration::from_millis(300));
    for (group, log) in groups.iter().zip(logs.iter()) {
        assert_eq!(log.len(), 0);
        assert!(group.fatal_error().is_none());
    }

    for group in &groups {
        group.leave();
    }
}

#[test]
fn large_payloads_travel_the_bulk_path() {
    use rand::RngCore;

    let net = TestNet::new();
    let dir = tempfile::tempdir().expect("create temp dir");
    let leader_port = pick_free_port();
    let specs: Vec<NodeSpec> = vec![
        NodeSpec::leader(1, leader_port, dir.path()),
        NodeSpec::new(2, leader_port, dir.path()),
    ];
    let logs: Vec<DeliveryLog> = (0..2).map(|_| DeliveryLog::new()).collect();
    let allocator = fixed_allocator(vec![1, 2], None, Mode::Ordered);
    let handles: Vec<_> = specs
        .iter()
        .zip(logs.iter())
        .map(|(spec, log)| {
            spawn_member(&net, spec, registry(), allocator.clone(), log.callbacks())
        })
        .collect();
    let groups: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("builder thread").expect("group starts"))
        .collect();

    // 4 KiB payloads exceed the small-message bound (1 KiB in the test
    // params) and must ride the bulk transport.
    let mut rng = rand::thread_rng();
    let mut payloads = Vec::new();
    for _ in 0..3 {
        let mut payload = vec![0u8; 4096];
        rng.fill_bytes(&mut payload);
        payloads.push(payload);
    }
    for payload in &payloads {
        let bytes = payload.clone();
        groups[0]
            .send(0, bytes.len(), |buf| buf.copy_from_slice(&bytes))
            .expect("bulk send accepted");
    }

    for log in &logs {
        assert!(
            wait_until(DEADLINE, || log.len() >= 3),
            "bulk messages should deliver at every member"
        );
        assert_eq!(log.payloads(), payloads);
    }

    for group in &groups {
        group.leave();
    }
}

//! Total-restart recovery: every member shuts down, comes back with saved
//! state, and the restart leader re-forms the group from the logs.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{payload_strings, pick_free_port, send_text, spawn_member, wait_until, DeliveryLog, NodeSpec, TestNet};
use tessera_group::{Mode, SubgroupRegistry, SubgroupTypeEntry, UniformAllocator};

const DEADLINE: Duration = Duration::from_secs(60);

/// A subgroup type with persistent fields: its "replica state" is a byte
/// blob the test can inspect after state shipping.
fn persistent_registry(state: Arc<Mutex<Vec<u8>>>) -> SubgroupRegistry {
    let mut registry = SubgroupRegistry::new();
    let ser_state = Arc::clone(&state);
    let de_state = Arc::clone(&state);
    registry.register(SubgroupTypeEntry::persistent(
        "kv",
        Arc::new(move |_sid| Ok(ser_state.lock().unwrap().clone())),
        Arc::new(move |_sid, bytes| {
            *de_state.lock().unwrap() = bytes.to_vec();
            Ok(())
        }),
    ));
    registry
}

#[test]
fn group_recovers_from_a_full_shutdown() {
    let dir = tempfile::tempdir().expect("create temp dir");

    let state_a = Arc::new(Mutex::new(b"replica-state-a".to_vec()));
    let state_b = Arc::new(Mutex::new(Vec::new()));

    // First lifetime: bootstrap, join, replicate a little traffic.
    {
        let net = TestNet::new();
        let leader_port = pick_free_port();
        let spec_a = NodeSpec::leader(1, leader_port, dir.path());
        let spec_b = NodeSpec::new(2, leader_port, dir.path());
        let log_a = DeliveryLog::new();
        let log_b = DeliveryLog::new();
        let allocator = Arc::new(UniformAllocator::new(1, 16, Mode::Ordered));

        let a = spawn_member(
            &net,
            &spec_a,
            persistent_registry(Arc::clone(&state_a)),
            allocator.clone(),
            log_a.callbacks(),
        )
        .join()
        .expect("builder thread")
        .expect("leader starts");
        let b = spawn_member(
            &net,
            &spec_b,
            persistent_registry(Arc::clone(&state_b)),
            allocator.clone(),
            log_b.callbacks(),
        )
        .join()
        .expect("builder thread")
        .expect("joiner admitted");

        for group in [&a, &b] {
            assert!(wait_until(DEADLINE, || {
                group
                    .current_view()
                    .map(|v| v.vid == 1 && v.members == vec![1, 2])
                    .unwrap_or(false)
            }));
        }
        send_text(&a, 0, "durable-1");
        send_text(&a, 0, "durable-2");
        for log in [&log_a, &log_b] {
            assert!(wait_until(DEADLINE, || log.len() >= 2));
        }
        // The whole group goes down at once, the way a power failure would
        // take it: no departure announcements, no further view change.
        a.crash();
        b.crash();
    }

    // Both data directories hold the last installed view.
    let saved_vid = {
        let view = tessera_group::View::load(&dir.path().join("node-1"))
            .expect("read saved view")
            .expect("view was saved");
        view.vid
    };
    assert_eq!(saved_vid, 1);

    // Second lifetime: fresh transports and ports, same data directories.
    let net = TestNet::new();
    let leader_port = pick_free_port();
    let spec_a = NodeSpec::leader(1, leader_port, dir.path());
    let spec_b = NodeSpec::new(2, leader_port, dir.path());
    let log_a = DeliveryLog::new();
    let log_b = DeliveryLog::new();
    let allocator = Arc::new(UniformAllocator::new(1, 16, Mode::Ordered));

    // Clear B's replica blob so the shipped state is observable.
    state_b.lock().unwrap().clear();

    let handle_a = spawn_member(
        &net,
        &spec_a,
        persistent_registry(Arc::clone(&state_a)),
        allocator.clone(),
        log_a.callbacks(),
    );
    let handle_b = spawn_member(
        &net,
        &spec_b,
        persistent_registry(Arc::clone(&state_b)),
        allocator.clone(),
        log_b.callbacks(),
    );
    let a = handle_a
        .join()
        .expect("builder thread")
        .expect("restart leader recovers");
    let b = handle_b
        .join()
        .expect("builder thread")
        .expect("rejoiner recovers");

    // The recovery view advances past the saved one and contains every
    // respondent.
    for group in [&a, &b] {
        let view = group.current_view().expect("view");
        assert_eq!(view.vid, saved_vid + 1);
        assert_eq!(view.members, vec![1, 2]);
        assert!(group.fatal_error().is_none());
    }

    // The restart shard leader shipped its replica state to the rejoiner.
    assert!(wait_until(DEADLINE, || {
        *state_b.lock().unwrap() == b"replica-state-a".to_vec()
    }));

    // And the recovered group still carries ordered traffic.
    send_text(&b, 0, "post-restart");
    for log in [&log_a, &log_b] {
        assert!(wait_until(DEADLINE, || {
            payload_strings(log).contains(&"post-restart".to_string())
        }));
    }

    a.leave();
    b.leave();
}

//! In-process row replication mesh.
//!
//! Connects every table in one process by node id and applies published row
//! snapshots directly into the destination mirrors. This is the loopback
//! transport used by tests and single-host deployments; a real deployment
//! substitutes an RDMA-backed [`RowMesh`] implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::sst::{RowMesh, RowSink};
use crate::NodeId;

struct Registration<R> {
    token: u64,
    sink: Arc<dyn RowSink<R>>,
}

struct BarrierState {
    // participant set -> (generation, node -> generation reached)
    arrivals: HashMap<Vec<NodeId>, HashMap<NodeId, u64>>,
}

struct MeshInner<R> {
    sinks: Mutex<HashMap<NodeId, Registration<R>>>,
    next_token: AtomicU64,
    barrier: Mutex<BarrierState>,
    barrier_cv: Condvar,
}

/// Shared in-process mesh. Cheap to clone; all clones address the same set
/// of registered tables.
pub struct MemoryMesh<R> {
    inner: Arc<MeshInner<R>>,
}

impl<R> Clone for MemoryMesh<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> MemoryMesh<R> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MeshInner {
                sinks: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                barrier: Mutex::new(BarrierState {
                    arrivals: HashMap::new(),
                }),
                barrier_cv: Condvar::new(),
            }),
        }
    }

    fn deliver(&self, from: NodeId, to: &[NodeId], row: R)
    where
        R: Clone,
    {
        // Snapshot the sinks under the lock, apply outside it: a sink apply
        // takes the destination table's row lock and must not nest inside
        // the registry lock.
        let targets: Vec<Arc<dyn RowSink<R>>> = {
            let sinks = self.inner.sinks.lock().unwrap();
            to.iter()
                .filter(|node| **node != from)
                .filter_map(|node| sinks.get(node).map(|r| Arc::clone(&r.sink)))
                .collect()
        };
        for sink in targets {
            sink.apply(from, row.clone());
        }
    }
}

impl<R> Default for MemoryMesh<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Clone + Send + Sync + 'static> RowMesh<R> for MemoryMesh<R> {
    fn attach(&self, node: NodeId, sink: Arc<dyn RowSink<R>>) -> u64 {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner
            .sinks
            .lock()
            .unwrap()
            .insert(node, Registration { token, sink });
        token
    }

    fn detach(&self, node: NodeId, token: u64) {
        let mut sinks = self.inner.sinks.lock().unwrap();
        if sinks.get(&node).is_some_and(|r| r.token == token) {
            sinks.remove(&node);
        }
    }

    fn publish(&self, from: NodeId, to: &[NodeId], row: R) {
        self.deliver(from, to, row);
    }

    fn publish_with_completion(&self, from: NodeId, to: &[NodeId], row: R) {
        // In-process application is synchronous, so completion is implied.
        self.deliver(from, to, row);
    }

    fn barrier(&self, from: NodeId, participants: &[NodeId], timeout: Duration) {
        let key: Vec<NodeId> = {
            let mut k = participants.to_vec();
            k.sort_unstable();
            k
        };
        if key.len() <= 1 {
            return;
        }
        let mut state = self.inner.barrier.lock().unwrap();
        let my_generation = {
            let arrivals = state.arrivals.entry(key.clone()).or_default();
            let counter = arrivals.entry(from).or_insert(0);
            *counter += 1;
            *counter
        };
        self.inner.barrier_cv.notify_all();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let reached = state
                .arrivals
                .get(&key)
                .map(|arrivals| {
                    key.iter()
                        .all(|node| arrivals.get(node).copied().unwrap_or(0) >= my_generation)
                })
                .unwrap_or(false);
            if reached {
                return;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                tracing::warn!(node = from, "mesh barrier timed out; continuing");
                return;
            }
            let (next, _timeout) = self
                .inner
                .barrier_cv
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
        }
    }
}

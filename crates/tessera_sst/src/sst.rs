//! The shared state table proper: one writable local row, peer mirrors, and
//! the replication hooks that push the local row to other members.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;

use crate::predicates::Predicates;
use crate::NodeId;

/// Receiving side of row replication. The mesh hands incoming row snapshots
/// to the table that registered for the destination node id.
pub trait RowSink<R>: Send + Sync {
    fn apply(&self, from: NodeId, row: R);
}

/// One-sided row replication between group members.
///
/// `publish` pushes a snapshot of the local row towards `to`; delivery is
/// asynchronous and unacknowledged. `publish_with_completion` returns only
/// once every live destination has applied the snapshot. `barrier` blocks
/// until every participant has reached the same barrier call.
///
/// Transport failures are never reported here. Unresponsive peers are
/// detected by the liveness layer and surfaced through the `suspected`
/// flags of the table itself.
pub trait RowMesh<R>: Send + Sync {
    /// Registers `sink` as the receiver for rows addressed to `node`,
    /// replacing any previous registration. Returns a token identifying this
    /// registration so a stale table cannot detach its successor.
    fn attach(&self, node: NodeId, sink: Arc<dyn RowSink<R>>) -> u64;
    fn detach(&self, node: NodeId, token: u64);
    fn publish(&self, from: NodeId, to: &[NodeId], row: R);
    fn publish_with_completion(&self, from: NodeId, to: &[NodeId], row: R);
    fn barrier(&self, from: NodeId, participants: &[NodeId], timeout: Duration);
}

struct SstInner<R: Clone + Send + Sync + 'static> {
    members: Vec<NodeId>,
    my_rank: usize,
    rows: Vec<RwLock<R>>,
    frozen: Vec<AtomicBool>,
    mesh: Arc<dyn RowMesh<R>>,
    mesh_token: std::sync::OnceLock<u64>,
    predicates: Predicates<R>,
}

/// A replicated row-per-member counter table.
///
/// Cloning an `Sst` produces another handle to the same table; all interior
/// state is shared. The table registers itself with its mesh on construction
/// and detaches when the last handle is dropped.
pub struct Sst<R: Clone + Send + Sync + 'static> {
    inner: Arc<SstInner<R>>,
}

impl<R: Clone + Send + Sync + 'static> Clone for Sst<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SinkAdapter<R: Clone + Send + Sync + 'static> {
    inner: std::sync::Weak<SstInner<R>>,
}

impl<R: Clone + Send + Sync + 'static> RowSink<R> for SinkAdapter<R> {
    fn apply(&self, from: NodeId, row: R) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let Some(rank) = inner.members.iter().position(|m| *m == from) else {
            return;
        };
        if rank == inner.my_rank || inner.frozen[rank].load(Ordering::Acquire) {
            return;
        }
        *inner.rows[rank].write().unwrap() = row;
    }
}

impl<R: Clone + Send + Sync + 'static> Sst<R> {
    /// Builds a table for `members` with every row initialized to `initial`,
    /// and registers the local node as the replication sink for `my_rank`.
    pub fn new(members: Vec<NodeId>, my_rank: usize, initial: R, mesh: Arc<dyn RowMesh<R>>) -> Self {
        assert!(my_rank < members.len());
        let rows = members
            .iter()
            .map(|_| RwLock::new(initial.clone()))
            .collect();
        let frozen = members.iter().map(|_| AtomicBool::new(false)).collect();
        let inner = Arc::new(SstInner {
            members,
            my_rank,
            rows,
            frozen,
            mesh,
            mesh_token: std::sync::OnceLock::new(),
            predicates: Predicates::new(),
        });
        let sink = Arc::new(SinkAdapter {
            inner: Arc::downgrade(&inner),
        });
        let token = inner
            .mesh
            .attach(inner.members[inner.my_rank], sink as Arc<dyn RowSink<R>>);
        let _ = inner.mesh_token.set(token);
        Self { inner }
    }

    pub fn members(&self) -> &[NodeId] {
        &self.inner.members
    }

    pub fn num_rows(&self) -> usize {
        self.inner.members.len()
    }

    pub fn my_rank(&self) -> usize {
        self.inner.my_rank
    }

    pub fn my_id(&self) -> NodeId {
        self.inner.members[self.inner.my_rank]
    }

    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        self.inner.members.iter().position(|m| *m == node)
    }

    /// Read access to any row (the local row included).
    pub fn row(&self, rank: usize) -> RwLockReadGuard<'_, R> {
        self.inner.rows[rank].read().unwrap()
    }

    /// Mutates the local row in place. The change is not visible to peers
    /// until the next [`Sst::put`].
    pub fn update<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        let mut guard = self.inner.rows[self.inner.my_rank].write().unwrap();
        f(&mut guard)
    }

    fn live_destinations(&self, ranks: Option<&[usize]>) -> Vec<NodeId> {
        let selected: Vec<usize> = match ranks {
            Some(rs) => rs.to_vec(),
            None => (0..self.inner.members.len()).collect(),
        };
        selected
            .into_iter()
            .filter(|r| *r != self.inner.my_rank && !self.inner.frozen[*r].load(Ordering::Acquire))
            .map(|r| self.inner.members[r])
            .collect()
    }

    /// Replicates a snapshot of the local row to every live peer.
    pub fn put(&self) {
        self.put_to(None);
    }

    /// Replicates the local row to the given member ranks only.
    pub fn put_to(&self, ranks: Option<&[usize]>) {
        let snapshot = self.inner.rows[self.inner.my_rank].read().unwrap().clone();
        let to = self.live_destinations(ranks);
        self.inner.mesh.publish(self.my_id(), &to, snapshot);
    }

    /// Like [`Sst::put`], but returns only after every live peer has applied
    /// the snapshot.
    pub fn put_with_completion(&self) {
        let snapshot = self.inner.rows[self.inner.my_rank].read().unwrap().clone();
        let to = self.live_destinations(None);
        self.inner
            .mesh
            .publish_with_completion(self.my_id(), &to, snapshot);
    }

    /// Stops accepting replication updates from `rank`. The mirror keeps its
    /// last-applied contents. Freezing is local and irreversible for the
    /// lifetime of this table.
    pub fn freeze(&self, rank: usize) {
        self.inner.frozen[rank].store(true, Ordering::Release);
        tracing::debug!(rank, "froze sst row");
    }

    pub fn is_frozen(&self, rank: usize) -> bool {
        self.inner.frozen[rank].load(Ordering::Acquire)
    }

    /// Barrier with the given member ranks (all live members when `None`).
    /// Frozen rows are excluded; the barrier gives up after a bounded wait so
    /// that a peer failing mid-barrier cannot wedge the caller forever.
    pub fn sync_with_members(&self, ranks: Option<&[usize]>) {
        let mut participants = self.live_destinations(ranks);
        participants.push(self.my_id());
        participants.sort_unstable();
        self.inner
            .mesh
            .barrier(self.my_id(), &participants, Duration::from_secs(2));
    }

    pub fn predicates(&self) -> &Predicates<R> {
        &self.inner.predicates
    }

    /// Starts the predicate evaluation thread. Idempotent.
    pub fn start_predicate_evaluation(&self) {
        self.inner.predicates.start(self.clone());
    }
}

impl<R: Clone + Send + Sync + 'static> Drop for SstInner<R> {
    fn drop(&mut self) {
        self.predicates.stop();
    }
}

impl<R: Clone + Send + Sync + 'static> Drop for Sst<R> {
    fn drop(&mut self) {
        // Detach when the last handle goes away so replication stops cleanly.
        // A successor table for the same node replaces the registration, and
        // the token keeps this late detach from removing it.
        if Arc::strong_count(&self.inner) == 1 {
            if let Some(token) = self.inner.mesh_token.get() {
                self.inner
                    .mesh
                    .detach(self.inner.members[self.inner.my_rank], *token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MemoryMesh;

    #[derive(Clone, Default, Debug, PartialEq)]
    struct Row {
        counter: u64,
    }

    fn pair() -> (Sst<Row>, Sst<Row>) {
        let mesh = Arc::new(MemoryMesh::<Row>::new());
        let a = Sst::new(vec![1, 2], 0, Row::default(), Arc::clone(&mesh) as Arc<dyn RowMesh<Row>>);
        let b = Sst::new(vec![1, 2], 1, Row::default(), mesh as Arc<dyn RowMesh<Row>>);
        (a, b)
    }

    #[test]
    fn put_replicates_local_row_to_peers() {
        let (a, b) = pair();
        a.update(|row| row.counter = 7);
        assert_eq!(b.row(0).counter, 0);
        a.put();
        assert_eq!(b.row(0).counter, 7);
        assert_eq!(b.row(1).counter, 0);
    }

    #[test]
    fn frozen_row_stops_taking_updates() {
        let (a, b) = pair();
        a.update(|row| row.counter = 1);
        a.put();
        assert_eq!(b.row(0).counter, 1);
        b.freeze(0);
        a.update(|row| row.counter = 2);
        a.put();
        assert_eq!(b.row(0).counter, 1);
    }

    #[test]
    fn put_never_overwrites_the_local_row() {
        let (a, b) = pair();
        b.update(|row| row.counter = 9);
        a.update(|row| row.counter = 3);
        a.put();
        assert_eq!(b.row(1).counter, 9);
    }
}

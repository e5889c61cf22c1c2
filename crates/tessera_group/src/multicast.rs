//! Totally-ordered multicast engine for one view.
//!
//! One `MulticastGroup` exists per installed view. It owns, for every
//! subgroup the local node belongs to, the pending-send queue, the map of
//! received-but-undelivered messages, and the sequencing counters in the
//! shared state table. Two transports feed it: the bulk path for large
//! payloads and the small-message ring embedded in the SST rows. Both meet
//! in a common receive handler that assigns the stable sequence number
//! `seq = index * num_senders + sender_rank` and advances the contiguous
//! prefix counters that gate delivery.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::config::GroupParams;
use crate::error::GroupError;
use crate::group::CallbackSet;
use crate::group_sst::{min_persisted, min_stable_seq, GroupRow, GroupSst};
use crate::persistence::{combine_version, version_seq, Hlc, PersistenceBridge, Version};
use crate::transport::{BulkGroupKey, BulkReceiver, BulkTransport};
use crate::view::Mode;
use crate::{MessageId, NodeId, SubgroupId, INVALID_VERSION};

/// Fixed header prefix of every multicast message.
pub const HEADER_LEN: usize = 17;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub header_size: u32,
    pub index: MessageId,
    /// Wall-clock send time in nanoseconds.
    pub timestamp: u64,
    pub cooked: bool,
}

impl Header {
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.header_size.to_be_bytes());
        buf[4..8].copy_from_slice(&self.index.to_be_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[16] = self.cooked as u8;
    }

    pub fn parse(buf: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(buf.len() >= HEADER_LEN, "message shorter than its header");
        let mut header_size = [0u8; 4];
        header_size.copy_from_slice(&buf[0..4]);
        let mut index = [0u8; 4];
        index.copy_from_slice(&buf[4..8]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&buf[8..16]);
        Ok(Self {
            header_size: u32::from_be_bytes(header_size),
            index: MessageId::from_be_bytes(index),
            timestamp: u64::from_be_bytes(timestamp),
            cooked: buf[16] != 0,
        })
    }
}

/// Callback invoked as each message reaches global stability.
/// `None` payload means a cooked (RPC) delivery already dispatched.
pub type DeliveryCallback =
    Arc<dyn Fn(SubgroupId, NodeId, MessageId, Option<Bytes>, Version) + Send + Sync>;
pub type PersistenceCallback = Arc<dyn Fn(SubgroupId, Version) + Send + Sync>;
pub type RpcHandler = Arc<dyn Fn(SubgroupId, NodeId, &[u8]) + Send + Sync>;
/// Posts the version about to be delivered, so replicated objects know the
/// version a delivery upcall belongs to.
pub type PostNextVersion = Arc<dyn Fn(SubgroupId, Version, u64) + Send + Sync>;

/// Subgroup configuration the multicast engine needs, extracted from the
/// view's shard layouts for the subgroups this node belongs to.
#[derive(Clone, Debug)]
pub struct SubgroupSettings {
    pub shard_num: u32,
    pub shard_rank: u32,
    pub members: Vec<NodeId>,
    pub senders: Vec<bool>,
    /// This node's rank among the shard's senders, or -1 if it never sends.
    pub sender_rank: i32,
    pub num_received_offset: usize,
    pub mode: Mode,
}

impl SubgroupSettings {
    pub fn num_senders(&self) -> usize {
        self.senders.iter().filter(|s| **s).count()
    }

    /// Shard rank of each sender, indexed by sender rank.
    pub fn shard_ranks_by_sender_rank(&self) -> Vec<usize> {
        self.senders
            .iter()
            .enumerate()
            .filter(|(_, s)| **s)
            .map(|(rank, _)| rank)
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Medium {
    Bulk,
    Slot,
}

/// A message queued for sending over the bulk path.
struct PendingMessage {
    index: MessageId,
    data: Vec<u8>,
}

/// A received (or self-delivered) message awaiting stability.
struct StableMessage {
    sender_id: NodeId,
    index: MessageId,
    medium: Medium,
    data: Vec<u8>,
}

struct MsgState {
    free_buffers: HashMap<SubgroupId, Vec<Vec<u8>>>,
    future_index: HashMap<SubgroupId, MessageId>,
    pending_sends: HashMap<SubgroupId, VecDeque<PendingMessage>>,
    /// Received-but-undelivered messages keyed by stable sequence number.
    stable: HashMap<SubgroupId, BTreeMap<MessageId, StableMessage>>,
    /// Gap-free received-index intervals per num_received entry.
    received_intervals: Vec<Vec<(MessageId, MessageId)>>,
    /// Send timestamps of local messages not yet delivered/persisted.
    pending_timestamps: HashMap<SubgroupId, BTreeSet<u64>>,
    /// seq -> send timestamp for local versioned messages awaiting
    /// durability.
    pending_persistence: HashMap<SubgroupId, BTreeMap<MessageId, u64>>,
    /// Highest delivered sequence number that created a version (null
    /// messages do not).
    last_versioned_seq: HashMap<SubgroupId, MessageId>,
}

struct McInner {
    members: Vec<NodeId>,
    my_rank: usize,
    vid: i32,
    total_num_subgroups: usize,
    window_size: usize,
    max_msg_size: usize,
    /// Largest whole message (header included) served by the slot path.
    slot_msg_max: usize,
    block_size: usize,
    send_algorithm: crate::config::SendAlgorithm,
    sender_timeout_ms: u64,
    settings: BTreeMap<SubgroupId, SubgroupSettings>,
    sst: GroupSst,
    bulk: Arc<dyn BulkTransport>,
    callbacks: CallbackSet,
    rpc_callback: Mutex<Option<RpcHandler>>,
    post_next_version: PostNextVersion,
    bridge: Arc<dyn PersistenceBridge>,
    any_persistent: bool,
    state: Mutex<MsgState>,
    sender_cv: Condvar,
    wedged: AtomicBool,
    groups_created: bool,
    pred_handles: Mutex<Vec<tessera_sst::PredicateHandle>>,
    sender_thread: Mutex<Option<JoinHandle<()>>>,
    timeout_thread: Mutex<Option<JoinHandle<()>>>,
}

/// The per-view multicast engine. Cheap to clone.
pub struct MulticastGroup {
    inner: Arc<McInner>,
}

impl Clone for MulticastGroup {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct BulkSink {
    mc: Weak<McInner>,
    subgroup_id: SubgroupId,
    sender_id: NodeId,
    sender_rank: usize,
}

impl BulkReceiver for BulkSink {
    fn on_receive(&self, data: Vec<u8>) {
        if let Some(inner) = self.mc.upgrade() {
            inner.bulk_received(self.subgroup_id, self.sender_id, self.sender_rank, data);
        }
    }
}

fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .min(u128::from(u64::MAX)) as u64
}

/// Merges `index` into the interval set and returns the end of the first
/// interval: the last index below the first gap.
fn resolve_num_received(intervals: &mut Vec<(MessageId, MessageId)>, index: MessageId) -> MessageId {
    let mut pos = intervals.len();
    for (i, (start, _)) in intervals.iter().enumerate() {
        if *start > index {
            pos = i;
            break;
        }
    }
    // `pos` is the first interval starting past `index`; the interval before
    // it (if any) is the merge candidate on the low side.
    if pos > 0 {
        let (_, end) = intervals[pos - 1];
        if index <= end {
            // Duplicate receive; nothing changes.
            return intervals[0].1;
        }
        if index == end + 1 {
            intervals[pos - 1].1 = index;
            if pos < intervals.len() && intervals[pos].0 == index + 1 {
                let (_, next_end) = intervals.remove(pos);
                intervals[pos - 1].1 = next_end;
            }
            return intervals[0].1;
        }
    }
    if pos < intervals.len() && intervals[pos].0 == index + 1 {
        intervals[pos].0 = index;
    } else {
        intervals.insert(pos, (index, index));
    }
    intervals[0].1
}

impl MulticastGroup {
    /// Builds the engine for a view. When `prev` is given, reclaimable
    /// buffers move over from the retiring group and this node's undelivered
    /// own messages are re-queued with fresh indices.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sst: GroupSst,
        vid: i32,
        params: &GroupParams,
        total_num_subgroups: usize,
        settings: BTreeMap<SubgroupId, SubgroupSettings>,
        callbacks: CallbackSet,
        post_next_version: PostNextVersion,
        bridge: Arc<dyn PersistenceBridge>,
        any_persistent: bool,
        bulk: Arc<dyn BulkTransport>,
        prev: Option<&MulticastGroup>,
        already_failed: &[bool],
    ) -> anyhow::Result<Self> {
        let members = sst.members().to_vec();
        let my_rank = sst.my_rank();
        let max_msg_size = params.max_payload_size + HEADER_LEN;
        let slot_msg_max = params.max_smc_payload_size + HEADER_LEN;

        let mut state = MsgState {
            free_buffers: HashMap::new(),
            future_index: HashMap::new(),
            pending_sends: HashMap::new(),
            stable: HashMap::new(),
            received_intervals: Vec::new(),
            pending_timestamps: HashMap::new(),
            pending_persistence: HashMap::new(),
            last_versioned_seq: HashMap::new(),
        };
        {
            let row = sst.row(my_rank);
            state.received_intervals = vec![vec![(-1, -1)]; row.num_received.len()];
        }
        for (sid, sub) in &settings {
            let target = params.window_size * sub.members.len();
            let buffers = state.free_buffers.entry(*sid).or_default();
            while buffers.len() < target {
                buffers.push(vec![0u8; max_msg_size]);
            }
            state.future_index.insert(*sid, 0);
            state.pending_sends.insert(*sid, VecDeque::new());
            state.stable.insert(*sid, BTreeMap::new());
            state.pending_timestamps.insert(*sid, BTreeSet::new());
            state.pending_persistence.insert(*sid, BTreeMap::new());
        }

        let rpc_callback = prev
            .and_then(|old| old.inner.rpc_callback.lock().unwrap().clone());

        if let Some(old) = prev {
            // The retiring group must already be wedged before we steal its
            // buffers and unfinished sends.
            old.wedge();
            let mut old_state = old.inner.state.lock().unwrap();
            for (sid, sub) in &settings {
                if let Some(old_free) = old_state.free_buffers.get_mut(sid) {
                    let buffers = state.free_buffers.entry(*sid).or_default();
                    buffers.append(old_free);
                }
                let target = params.window_size * sub.members.len();
                let buffers = state.free_buffers.entry(*sid).or_default();
                while buffers.len() < target {
                    buffers.push(vec![0u8; max_msg_size]);
                }
            }
            let my_id = members[my_rank];
            for (sid, stable) in old_state.stable.iter_mut() {
                if !settings.contains_key(sid) {
                    continue;
                }
                for (_seq, msg) in std::mem::take(stable) {
                    // Locally stable but undelivered when the epoch ended.
                    // Our own messages are re-attempted in the new view; the
                    // rest were either delivered by the ragged trim or are
                    // discarded with it.
                    if msg.sender_id == my_id && msg.medium == Medium::Bulk {
                        let index = {
                            let slot = state.future_index.get_mut(sid).expect("own subgroup");
                            let index = *slot;
                            *slot += 1;
                            index
                        };
                        let mut data = msg.data;
                        let mut header = Header::parse(&data)?;
                        header.index = index;
                        header.encode_into(&mut data[..HEADER_LEN]);
                        state
                            .pending_sends
                            .get_mut(sid)
                            .expect("own subgroup")
                            .push_back(PendingMessage { index, data });
                    } else if msg.medium == Medium::Bulk {
                        state
                            .free_buffers
                            .entry(*sid)
                            .or_default()
                            .push(msg.data);
                    }
                }
            }
            for (sid, pending) in old_state.pending_sends.iter_mut() {
                if !settings.contains_key(sid) {
                    continue;
                }
                for mut msg in std::mem::take(pending) {
                    let index = {
                        let slot = state.future_index.get_mut(sid).expect("own subgroup");
                        let index = *slot;
                        *slot += 1;
                        index
                    };
                    msg.index = index;
                    let mut header = Header::parse(&msg.data)?;
                    header.index = index;
                    header.encode_into(&mut msg.data[..HEADER_LEN]);
                    state
                        .pending_sends
                        .get_mut(sid)
                        .expect("own subgroup")
                        .push_back(msg);
                }
            }
        }

        let inner = Arc::new(McInner {
            members,
            my_rank,
            vid,
            total_num_subgroups,
            window_size: params.window_size,
            max_msg_size,
            slot_msg_max,
            block_size: params.block_size,
            send_algorithm: params.send_algorithm,
            sender_timeout_ms: params.timeout_ms,
            settings,
            sst: sst.clone(),
            bulk,
            callbacks,
            rpc_callback: Mutex::new(rpc_callback),
            post_next_version,
            bridge,
            any_persistent,
            state: Mutex::new(state),
            sender_cv: Condvar::new(),
            wedged: AtomicBool::new(false),
            groups_created: !already_failed.iter().any(|f| *f),
            pred_handles: Mutex::new(Vec::new()),
            sender_thread: Mutex::new(None),
            timeout_thread: Mutex::new(None),
        });

        // Announce the initial counter values before any predicate can read
        // a peer's stale row.
        inner.sst.put();
        inner.sst.sync_with_members(None);

        if inner.groups_created {
            McInner::create_transport_groups(&inner)?;
        }
        McInner::register_predicates(&inner);
        McInner::start_threads(&inner);
        Ok(Self { inner })
    }

    pub fn register_rpc_callback(&self, handler: RpcHandler) {
        *self.inner.rpc_callback.lock().unwrap() = Some(handler);
    }

    pub fn settings(&self) -> &BTreeMap<SubgroupId, SubgroupSettings> {
        &self.inner.settings
    }

    pub fn is_wedged(&self) -> bool {
        self.inner.wedged.load(Ordering::Acquire)
    }

    /// Sends one multicast. Blocks while the send window is exhausted.
    /// Returns `Ok(false)` when the group wedged before the message could be
    /// accepted; the caller retries in the next view.
    pub fn send(
        &self,
        subgroup_id: SubgroupId,
        payload_size: usize,
        cooked: bool,
        fill: &mut dyn FnMut(&mut [u8]),
    ) -> Result<bool, GroupError> {
        let inner = &self.inner;
        if !inner.groups_created {
            return Ok(false);
        }
        let sub = inner
            .settings
            .get(&subgroup_id)
            .ok_or(GroupError::InvalidSubgroup(subgroup_id))?;
        if sub.sender_rank < 0 {
            return Err(GroupError::InvalidSubgroup(subgroup_id));
        }
        let msg_size = payload_size + HEADER_LEN;
        if msg_size > inner.max_msg_size {
            return Err(GroupError::PayloadTooLarge {
                got: payload_size,
                max: inner.max_msg_size - HEADER_LEN,
            });
        }

        let mut state = inner.state.lock().unwrap();
        loop {
            if inner.wedged.load(Ordering::Acquire) {
                return Ok(false);
            }
            if inner.send_credit_available(&state, subgroup_id, sub) {
                break;
            }
            let (next, _timeout) = inner
                .sender_cv
                .wait_timeout(state, Duration::from_millis(1))
                .unwrap();
            state = next;
        }

        let index = {
            let slot = state.future_index.get_mut(&subgroup_id).expect("own subgroup");
            let index = *slot;
            *slot += 1;
            index
        };
        let now = wall_clock_ns();
        state
            .pending_timestamps
            .get_mut(&subgroup_id)
            .expect("own subgroup")
            .insert(now);
        let header = Header {
            header_size: HEADER_LEN as u32,
            index,
            timestamp: now,
            cooked,
        };

        if msg_size > inner.slot_msg_max {
            let mut data = state
                .free_buffers
                .get_mut(&subgroup_id)
                .and_then(|b| b.pop())
                .unwrap_or_else(|| vec![0u8; inner.max_msg_size]);
            data.resize(inner.max_msg_size, 0);
            data.truncate(msg_size);
            header.encode_into(&mut data[..HEADER_LEN]);
            fill(&mut data[HEADER_LEN..msg_size]);
            state
                .pending_sends
                .get_mut(&subgroup_id)
                .expect("own subgroup")
                .push_back(PendingMessage { index, data });
            drop(state);
            inner.sender_cv.notify_all();
        } else {
            let window = inner.window_size;
            inner.sst.update(|row: &mut GroupRow| {
                let slot =
                    &mut row.slots[GroupRow::slot_index(window, subgroup_id as usize, index)];
                header.encode_into(&mut slot.buf[..HEADER_LEN]);
                // Payload bytes, then size, then the generation word last:
                // receivers poll the generation to know the rest is in place.
                fill(&mut slot.buf[HEADER_LEN..msg_size]);
                slot.used = msg_size as u64;
                slot.generation = (index as u64 / window as u64) + 1;
            });
            let shard_ranks = inner.shard_sst_ranks(subgroup_id);
            drop(state);
            inner.sst.put_to(Some(&shard_ranks));
        }
        Ok(true)
    }

    /// Stops all sending and receiving: cancels this group's predicates,
    /// tears down its transport groups, and joins the sender thread. Wedge
    /// is idempotent and leaves received state intact for ragged cleanup.
    pub fn wedge(&self) {
        self.inner.wedge();
    }

    /// Oldest undelivered-message timestamp across the shard: how stale the
    /// shard's accepted-but-undelivered messages may be.
    pub fn global_stability_frontier(&self, subgroup_id: SubgroupId) -> u64 {
        let inner = &self.inner;
        let ranks = inner.shard_sst_ranks(subgroup_id);
        let mut frontier = inner.sst.row(inner.my_rank).local_stability_frontier
            [subgroup_id as usize];
        for rank in ranks {
            frontier = frontier.min(inner.sst.row(rank).local_stability_frontier[subgroup_id as usize]);
        }
        frontier
    }

    /// SST ranks of the shard members of `subgroup_id`.
    pub fn shard_sst_ranks(&self, subgroup_id: SubgroupId) -> Vec<usize> {
        self.inner.shard_sst_ranks(subgroup_id)
    }

    /// Delivers every undelivered message up to the agreed per-sender cut,
    /// in sequence-number order, skipping indices past each sender's bound.
    pub fn deliver_messages_upto(
        &self,
        subgroup_id: SubgroupId,
        max_indices_by_sender: &[MessageId],
    ) {
        let inner = &self.inner;
        let Some(sub) = inner.settings.get(&subgroup_id) else {
            return;
        };
        let num_senders = sub.num_senders() as MessageId;
        debug_assert_eq!(max_indices_by_sender.len(), num_senders as usize);
        let mut state = inner.state.lock().unwrap();
        let curr_seq = inner.sst.row(inner.my_rank).delivered_num[subgroup_id as usize];
        let mut max_seq = curr_seq;
        for (sender, max_index) in max_indices_by_sender.iter().enumerate() {
            if *max_index >= 0 {
                max_seq = max_seq.max(*max_index * num_senders + sender as MessageId);
            }
        }
        let mut last_version = INVALID_VERSION;
        let mut non_null_delivered = false;
        for seq in (curr_seq + 1)..=max_seq {
            let index = seq / num_senders;
            let sender_rank = (seq % num_senders) as usize;
            if index > max_indices_by_sender[sender_rank] {
                continue;
            }
            let version = combine_version(inner.vid, seq);
            if inner.deliver_one(&mut state, subgroup_id, seq, version) {
                non_null_delivered = true;
            }
            last_version = version;
        }
        inner.sst.update(|row| {
            row.delivered_num[subgroup_id as usize] = max_seq;
        });
        let ranks = inner.shard_sst_ranks(subgroup_id);
        inner.sst.put_to(Some(&ranks));
        if non_null_delivered && inner.any_persistent {
            inner.bridge.post_persist(subgroup_id, last_version);
        }
        drop(state);
        inner.sender_cv.notify_all();
    }

    /// Runs the small-message receive logic to completion for one subgroup.
    /// Epoch termination calls this so the final counters include every slot
    /// the senders have already published.
    pub fn drain_slot_receives(&self, subgroup_id: SubgroupId) {
        let inner = &self.inner;
        while inner.slot_receive_ready(subgroup_id) {
            inner.slot_receive_pass(subgroup_id, inner.window_size.max(1));
        }
    }

    /// True while some slot holds a published message this node has not yet
    /// pulled out of the ring.
    pub fn slot_receive_ready(&self, subgroup_id: SubgroupId) -> bool {
        self.inner.slot_receive_ready(subgroup_id)
    }

    /// Highest delivered sequence number that produced a version, or -1.
    /// The persistence barrier at epoch termination waits on this bound
    /// rather than `delivered_num`, which may end on a null message.
    pub fn last_versioned_seq(&self, subgroup_id: SubgroupId) -> MessageId {
        self.inner
            .state
            .lock()
            .unwrap()
            .last_versioned_seq
            .get(&subgroup_id)
            .copied()
            .unwrap_or(-1)
    }
}

impl McInner {
    fn my_id(&self) -> NodeId {
        self.members[self.my_rank]
    }

    fn shard_sst_ranks(&self, subgroup_id: SubgroupId) -> Vec<usize> {
        let Some(sub) = self.settings.get(&subgroup_id) else {
            return Vec::new();
        };
        sub.members
            .iter()
            .filter_map(|m| self.sst.rank_of(*m))
            .collect()
    }

    fn create_transport_groups(inner: &Arc<Self>) -> anyhow::Result<()> {
        for (sid, sub) in &inner.settings {
            if sub.members.len() <= 1 {
                continue;
            }
            let shard_ranks = sub.shard_ranks_by_sender_rank();
            for (sender_rank, shard_rank) in shard_ranks.iter().enumerate() {
                let sender_id = sub.members[*shard_rank];
                // Rotate the member list so the sender comes first; the
                // transport uses the order for its fan-out topology.
                let n = sub.members.len();
                let rotated: Vec<NodeId> = (0..n)
                    .map(|k| sub.members[(*shard_rank + k) % n])
                    .collect();
                let sink = Arc::new(BulkSink {
                    mc: Arc::downgrade(inner),
                    subgroup_id: *sid,
                    sender_id,
                    sender_rank,
                });
                inner.bulk.create_group(
                    BulkGroupKey {
                        vid: inner.vid,
                        subgroup_id: *sid,
                        sender: sender_id,
                    },
                    &rotated,
                    inner.block_size,
                    inner.send_algorithm,
                    inner.my_id(),
                    sink,
                )?;
            }
        }
        Ok(())
    }

    fn register_predicates(inner: &Arc<Self>) {
        let mut handles = inner.pred_handles.lock().unwrap();
        for (sid, sub) in &inner.settings {
            let sid = *sid;
            let num_senders = sub.num_senders();
            if num_senders > 0 {
                let weak = Arc::downgrade(inner);
                let batch_size = (inner.window_size / 2).max(1);
                let pred_weak = Arc::downgrade(inner);
                handles.push(inner.sst.predicates().insert(
                    move |_sst| {
                        pred_weak
                            .upgrade()
                            .map(|mc| mc.slot_receive_ready(sid))
                            .unwrap_or(false)
                    },
                    move |_sst| {
                        if let Some(mc) = weak.upgrade() {
                            mc.slot_receive_pass(sid, batch_size);
                        }
                    },
                    tessera_sst::PredicateMode::Recurrent,
                ));
            }
            if sub.mode != Mode::Unordered {
                let weak = Arc::downgrade(inner);
                handles.push(inner.sst.predicates().insert(
                    |_sst| true,
                    move |_sst| {
                        if let Some(mc) = weak.upgrade() {
                            mc.delivery_pass(sid);
                        }
                    },
                    tessera_sst::PredicateMode::Recurrent,
                ));
                let weak = Arc::downgrade(inner);
                let mut version_seen = INVALID_VERSION;
                handles.push(inner.sst.predicates().insert(
                    |_sst| true,
                    move |_sst| {
                        if let Some(mc) = weak.upgrade() {
                            version_seen = mc.persistence_pass(sid, version_seen);
                        }
                    },
                    tessera_sst::PredicateMode::Recurrent,
                ));
            }
        }
    }

    fn start_threads(inner: &Arc<Self>) {
        let sender = Arc::clone(inner);
        *inner.sender_thread.lock().unwrap() = Some(
            thread::Builder::new()
                .name("mc-sender".to_string())
                .spawn(move || sender.send_loop())
                .expect("spawn mc-sender thread"),
        );
        let timer = Arc::clone(inner);
        *inner.timeout_thread.lock().unwrap() = Some(
            thread::Builder::new()
                .name("mc-timeout".to_string())
                .spawn(move || timer.timeout_loop())
                .expect("spawn mc-timeout thread"),
        );
    }

    /// Window credit check for the next message of the local sender.
    fn send_credit_available(
        &self,
        state: &MsgState,
        subgroup_id: SubgroupId,
        sub: &SubgroupSettings,
    ) -> bool {
        let future_index = *state.future_index.get(&subgroup_id).unwrap_or(&0);
        let num_senders = sub.num_senders() as MessageId;
        let window = self.window_size as MessageId;
        match sub.mode {
            Mode::Ordered => {
                let bound = (future_index - window) * num_senders + sub.sender_rank;
                self.shard_sst_ranks(subgroup_id)
                    .into_iter()
                    .all(|rank| self.sst.row(rank).delivered_num[subgroup_id as usize] >= bound)
            }
            Mode::Unordered => {
                let offset = sub.num_received_offset + sub.sender_rank as usize;
                let bound = future_index - window;
                self.shard_sst_ranks(subgroup_id)
                    .into_iter()
                    .all(|rank| self.sst.row(rank).num_received[offset] >= bound)
            }
        }
    }

    /// Emits one header-only message so that a lagging local sender keeps
    /// the interleaved sequence advancing.
    fn send_auto_null(&self, state: &mut MsgState, subgroup_id: SubgroupId) {
        let index = {
            let slot = state.future_index.get_mut(&subgroup_id).expect("own subgroup");
            let index = *slot;
            *slot += 1;
            index
        };
        let now = wall_clock_ns();
        state
            .pending_timestamps
            .get_mut(&subgroup_id)
            .expect("own subgroup")
            .insert(now);
        let header = Header {
            header_size: HEADER_LEN as u32,
            index,
            timestamp: now,
            cooked: false,
        };
        if HEADER_LEN > self.slot_msg_max {
            let mut data = state
                .free_buffers
                .get_mut(&subgroup_id)
                .and_then(|b| b.pop())
                .unwrap_or_else(|| vec![0u8; self.max_msg_size]);
            data.truncate(HEADER_LEN);
            header.encode_into(&mut data[..HEADER_LEN]);
            state
                .pending_sends
                .get_mut(&subgroup_id)
                .expect("own subgroup")
                .push_back(PendingMessage { index, data });
            self.sender_cv.notify_all();
        } else {
            let window = self.window_size;
            self.sst.update(|row| {
                let slot = &mut row.slots[GroupRow::slot_index(window, subgroup_id as usize, index)];
                header.encode_into(&mut slot.buf[..HEADER_LEN]);
                slot.used = HEADER_LEN as u64;
                slot.generation = (index as u64 / window as u64) + 1;
            });
            let ranks = self.shard_sst_ranks(subgroup_id);
            self.sst.put_to(Some(&ranks));
        }
    }

    /// Common receive path for both transports. Stores the message under its
    /// stable sequence number, merges the index into the gap-free intervals,
    /// runs the NULL-send scheme, delivers immediately in unordered mode,
    /// and pushes the updated counters out.
    fn handle_received(
        &self,
        state: &mut MsgState,
        subgroup_id: SubgroupId,
        sender_id: NodeId,
        sender_rank: usize,
        medium: Medium,
        data: Vec<u8>,
    ) {
        let Some(sub) = self.settings.get(&subgroup_id) else {
            return;
        };
        let num_senders = sub.num_senders() as MessageId;
        let header = match Header::parse(&data) {
            Ok(header) => header,
            Err(err) => {
                tracing::error!(error = ?err, subgroup_id, "dropping undecodable message");
                return;
            }
        };
        let index = header.index;
        let seq = index * num_senders + sender_rank as MessageId;
        tracing::trace!(subgroup_id, sender_rank, index, seq, "received message");
        state.stable.entry(subgroup_id).or_default().insert(
            seq,
            StableMessage {
                sender_id,
                index,
                medium,
                data,
            },
        );

        let entry = sub.num_received_offset + sender_rank;
        let new_num_received = resolve_num_received(&mut state.received_intervals[entry], index);

        // NULL send scheme: a sender that falls behind a faster co-sender
        // fills its own slots with header-only messages so the contiguous
        // prefix can keep growing. The rank comparison keeps exactly one
        // message in flight per round between any sender pair.
        if sub.sender_rank >= 0 && sub.mode != Mode::Unordered {
            if (sub.sender_rank as usize) < sender_rank {
                while *state.future_index.get(&subgroup_id).unwrap_or(&0) <= new_num_received {
                    self.send_auto_null(state, subgroup_id);
                }
            } else if (sub.sender_rank as usize) > sender_rank {
                while *state.future_index.get(&subgroup_id).unwrap_or(&0) < new_num_received {
                    self.send_auto_null(state, subgroup_id);
                }
            }
        }

        if sub.mode == Mode::Unordered {
            let prev_received = self.sst.row(self.my_rank).num_received[entry];
            for i in (prev_received + 1)..=new_num_received {
                let seq = i * num_senders + sender_rank as MessageId;
                let stable = state.stable.entry(subgroup_id).or_default();
                let Some((&head_seq, _)) = stable.first_key_value() else {
                    break;
                };
                if head_seq != seq {
                    continue;
                }
                let msg = stable.remove(&head_seq).expect("head entry present");
                self.deliver_payload(&msg, subgroup_id, INVALID_VERSION);
                if msg.sender_id == self.my_id() {
                    if let Ok(header) = Header::parse(&msg.data) {
                        state
                            .pending_timestamps
                            .entry(subgroup_id)
                            .or_default()
                            .remove(&header.timestamp);
                    }
                }
                if msg.medium == Medium::Bulk {
                    state.free_buffers.entry(subgroup_id).or_default().push(msg.data);
                }
            }
        }

        let prev = self.sst.row(self.my_rank).num_received[entry];
        if new_num_received > prev {
            let shard_ranks = self.shard_sst_ranks(subgroup_id);
            self.sst.update(|row| {
                row.num_received[entry] = new_num_received;
                // Largest contiguous prefix of the interleaved stream.
                let base = sub.num_received_offset;
                let counters = &row.num_received[base..base + num_senders as usize];
                let (argmin, min) = counters
                    .iter()
                    .enumerate()
                    .min_by_key(|(i, v)| (**v, *i))
                    .map(|(i, v)| (i as MessageId, *v))
                    .expect("shard has senders");
                let new_seq = (min + 1) * num_senders + argmin - 1;
                if new_seq > row.seq_num[subgroup_id as usize] {
                    row.seq_num[subgroup_id as usize] = new_seq;
                }
            });
            self.sst.put_to(Some(&shard_ranks));
        }
        self.sender_cv.notify_all();
    }

    fn bulk_received(
        &self,
        subgroup_id: SubgroupId,
        sender_id: NodeId,
        sender_rank: usize,
        data: Vec<u8>,
    ) {
        let mut state = self.state.lock().unwrap();
        self.handle_received(&mut state, subgroup_id, sender_id, sender_rank, Medium::Bulk, data);
    }

    /// True when some sender's ring holds the next expected message.
    fn slot_receive_ready(&self, subgroup_id: SubgroupId) -> bool {
        let Some(sub) = self.settings.get(&subgroup_id) else {
            return false;
        };
        let shard_ranks = sub.shard_ranks_by_sender_rank();
        let window = self.window_size;
        let my_row = self.sst.row(self.my_rank);
        for (sender_rank, shard_rank) in shard_ranks.iter().enumerate() {
            let entry = sub.num_received_offset + sender_rank;
            let next_index = my_row.num_received_sst[entry] + 1;
            let Some(sender_sst_rank) = self.sst.rank_of(sub.members[*shard_rank]) else {
                continue;
            };
            let expected_generation = (next_index as u64 / window as u64) + 1;
            let slot_index = GroupRow::slot_index(window, subgroup_id as usize, next_index);
            if sender_sst_rank == self.my_rank {
                if my_row.slots[slot_index].generation == expected_generation {
                    return true;
                }
            } else if self.sst.row(sender_sst_rank).slots[slot_index].generation
                == expected_generation
            {
                return true;
            }
        }
        false
    }

    /// Pulls up to `batch_size` rounds of published slots out of the rings.
    fn slot_receive_pass(&self, subgroup_id: SubgroupId, batch_size: usize) {
        let Some(sub) = self.settings.get(&subgroup_id) else {
            return;
        };
        let shard_ranks = sub.shard_ranks_by_sender_rank();
        let window = self.window_size;
        let mut state = self.state.lock().unwrap();
        for _ in 0..batch_size {
            for (sender_rank, shard_rank) in shard_ranks.iter().enumerate() {
                let entry = sub.num_received_offset + sender_rank;
                let next_index = self.sst.row(self.my_rank).num_received_sst[entry] + 1;
                let Some(sender_sst_rank) = self.sst.rank_of(sub.members[*shard_rank]) else {
                    continue;
                };
                let expected_generation = (next_index as u64 / window as u64) + 1;
                let slot_index = GroupRow::slot_index(window, subgroup_id as usize, next_index);
                let copied: Option<Vec<u8>> = {
                    let row = self.sst.row(sender_sst_rank);
                    let slot = &row.slots[slot_index];
                    if slot.generation == expected_generation {
                        Some(slot.buf[..slot.used as usize].to_vec())
                    } else {
                        None
                    }
                };
                let Some(data) = copied else {
                    continue;
                };
                let sender_id = sub.members[*shard_rank];
                self.handle_received(
                    &mut state,
                    subgroup_id,
                    sender_id,
                    sender_rank,
                    Medium::Slot,
                    data,
                );
                self.sst.update(|row| {
                    row.num_received_sst[entry] = next_index;
                });
            }
        }
        let ranks = self.shard_sst_ranks(subgroup_id);
        drop(state);
        self.sst.put_to(Some(&ranks));
    }

    /// Invokes the application-facing callbacks for one message.
    fn deliver_payload(&self, msg: &StableMessage, subgroup_id: SubgroupId, version: Version) {
        let Ok(header) = Header::parse(&msg.data) else {
            return;
        };
        let header_size = header.header_size as usize;
        if header.cooked {
            self.post_next_version_checked(subgroup_id, version, header.timestamp);
            let rpc = self.rpc_callback.lock().unwrap().clone();
            if let Some(rpc) = rpc {
                rpc(subgroup_id, msg.sender_id, &msg.data[header_size..]);
            }
            if let Some(cb) = &self.callbacks.global_stability {
                cb(subgroup_id, msg.sender_id, msg.index, None, version);
            }
        } else if msg.data.len() > header_size {
            self.post_next_version_checked(subgroup_id, version, header.timestamp);
            if let Some(cb) = &self.callbacks.global_stability {
                let payload = Bytes::copy_from_slice(&msg.data[header_size..]);
                cb(subgroup_id, msg.sender_id, msg.index, Some(payload), version);
            }
        }
        // Header-only NULL messages produce no payload callback.
    }

    fn post_next_version_checked(&self, subgroup_id: SubgroupId, version: Version, ts: u64) {
        if version != INVALID_VERSION {
            (self.post_next_version)(subgroup_id, version, ts);
        }
    }

    /// Delivers one stable message by sequence number and registers its
    /// version with the persistence bridge. Returns true when the message
    /// carried a payload (null messages create no version).
    fn deliver_one(
        &self,
        state: &mut MsgState,
        subgroup_id: SubgroupId,
        seq: MessageId,
        version: Version,
    ) -> bool {
        let Some(msg) = state
            .stable
            .get_mut(&subgroup_id)
            .and_then(|m| m.remove(&seq))
        else {
            return false;
        };
        self.deliver_payload(&msg, subgroup_id, version);
        let header = match Header::parse(&msg.data) {
            Ok(header) => header,
            Err(_) => return false,
        };
        let non_null = msg.data.len() > header.header_size as usize;
        if non_null {
            let slot = state.last_versioned_seq.entry(subgroup_id).or_insert(-1);
            *slot = (*slot).max(seq);
            if msg.sender_id == self.my_id() {
                state
                    .pending_persistence
                    .entry(subgroup_id)
                    .or_default()
                    .insert(seq, header.timestamp);
            }
            if self.any_persistent {
                self.bridge
                    .make_version(subgroup_id, version, Hlc::from_wall_ns(header.timestamp));
            }
        } else if msg.sender_id == self.my_id() {
            state
                .pending_timestamps
                .entry(subgroup_id)
                .or_default()
                .remove(&header.timestamp);
        }
        if msg.medium == Medium::Bulk {
            state
                .free_buffers
                .entry(subgroup_id)
                .or_default()
                .push(msg.data);
        }
        non_null
    }

    /// Ordered-mode delivery: walk stable messages while their sequence
    /// numbers stay at or below the shard-wide minimum of `seq_num`.
    fn delivery_pass(&self, subgroup_id: SubgroupId) {
        let ranks = self.shard_sst_ranks(subgroup_id);
        if ranks.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let stable_min = min_stable_seq(&self.sst, subgroup_id as usize, &ranks);
        let mut delivered_any = false;
        let mut non_null_delivered = false;
        let mut last_version = INVALID_VERSION;
        loop {
            let Some((&seq, _)) = state
                .stable
                .get(&subgroup_id)
                .and_then(|m| m.first_key_value())
            else {
                break;
            };
            if seq > stable_min {
                break;
            }
            let version = combine_version(self.vid, seq);
            if self.deliver_one(&mut state, subgroup_id, seq, version) {
                non_null_delivered = true;
            }
            last_version = version;
            delivered_any = true;
            self.sst.update(|row| {
                row.delivered_num[subgroup_id as usize] = seq;
            });
        }
        if delivered_any {
            self.sst.put_to(Some(&ranks));
            if non_null_delivered && self.any_persistent {
                self.bridge.post_persist(subgroup_id, last_version);
            }
            drop(state);
            self.sender_cv.notify_all();
        }
    }

    /// Fires the global-persistence callback when the shard-wide minimum of
    /// `persisted_num` advances past the last version reported.
    fn persistence_pass(&self, subgroup_id: SubgroupId, version_seen: Version) -> Version {
        let ranks = self.shard_sst_ranks(subgroup_id);
        if ranks.is_empty() {
            return version_seen;
        }
        let min = min_persisted(&self.sst, subgroup_id as usize, &ranks);
        if min > version_seen {
            if let Some(cb) = &self.callbacks.global_persistence {
                cb(subgroup_id, min);
            }
            min
        } else {
            version_seen
        }
    }

    /// Background sender: waits for a pending bulk message with send credit
    /// and publishes it, one subgroup at a time, round-robin.
    fn send_loop(self: Arc<Self>) {
        let mut subgroup_to_send: usize = 0;
        loop {
            let mut picked: Option<(SubgroupId, PendingMessage)> = None;
            {
                let mut state = self.state.lock().unwrap();
                loop {
                    if self.wedged.load(Ordering::Acquire) {
                        return;
                    }
                    if let Some(sid) = self.pick_sendable(&state, &mut subgroup_to_send) {
                        let msg = state
                            .pending_sends
                            .get_mut(&sid)
                            .and_then(|q| q.pop_front());
                        if let Some(msg) = msg {
                            picked = Some((sid, msg));
                            break;
                        }
                    }
                    let (next, _timeout) = self
                        .sender_cv
                        .wait_timeout(state, Duration::from_millis(1))
                        .unwrap();
                    state = next;
                }
            }
            // Publish outside the state lock: the self-delivery re-enters
            // the receive path, which takes the lock again.
            if let Some((sid, msg)) = picked {
                let key = BulkGroupKey {
                    vid: self.vid,
                    subgroup_id: sid,
                    sender: self.my_id(),
                };
                if let Err(err) = self.bulk.send(key, msg.data) {
                    tracing::error!(error = ?err, subgroup_id = sid, "bulk send failed");
                    return;
                }
            }
        }
    }

    fn pick_sendable(&self, state: &MsgState, cursor: &mut usize) -> Option<SubgroupId> {
        if !self.groups_created {
            return None;
        }
        let total = self.total_num_subgroups.max(1);
        for step in 1..=total {
            let candidate = ((*cursor + step) % total) as SubgroupId;
            if self.can_send_to(state, candidate) {
                *cursor = candidate as usize;
                return Some(candidate);
            }
        }
        None
    }

    fn can_send_to(&self, state: &MsgState, subgroup_id: SubgroupId) -> bool {
        let Some(sub) = self.settings.get(&subgroup_id) else {
            return false;
        };
        let Some(msg) = state.pending_sends.get(&subgroup_id).and_then(|q| q.front()) else {
            return false;
        };
        debug_assert!(sub.sender_rank >= 0);
        let num_senders = sub.num_senders() as MessageId;
        let window = self.window_size as MessageId;
        let offset = sub.num_received_offset + sub.sender_rank as usize;
        // The previous local message must have completed its own loopback
        // before the next one goes out.
        if self.sst.row(self.my_rank).num_received[offset] < msg.index - 1 {
            return false;
        }
        let ranks = self.shard_sst_ranks(subgroup_id);
        match sub.mode {
            Mode::Ordered => {
                let bound = (msg.index - window) * num_senders + sub.sender_rank;
                ranks.into_iter().all(|rank| {
                    let row = self.sst.row(rank);
                    if row.delivered_num[subgroup_id as usize] < bound {
                        return false;
                    }
                    // Durability lags delivery only for persistent groups;
                    // volatile groups gate on delivery alone. Versions carry
                    // the view id, so the bound must too.
                    !self.any_persistent
                        || bound < 0
                        || row.persisted_num[subgroup_id as usize]
                            >= combine_version(self.vid, bound)
                })
            }
            Mode::Unordered => {
                let bound = msg.index - window;
                ranks
                    .into_iter()
                    .all(|rank| self.sst.row(rank).num_received[offset] >= bound)
            }
        }
    }

    /// Periodically publishes the local stability frontier and prunes
    /// timestamps of messages that have become durable shard-wide.
    fn timeout_loop(self: Arc<Self>) {
        let period = Duration::from_millis(self.sender_timeout_ms.max(1));
        while !self.wedged.load(Ordering::Acquire) {
            thread::sleep(period);
            if self.wedged.load(Ordering::Acquire) {
                break;
            }
            let now = wall_clock_ns();
            let mut state = self.state.lock().unwrap();
            for (sid, _sub) in &self.settings {
                let ranks = self.shard_sst_ranks(*sid);
                let min_durable = min_persisted(&self.sst, *sid as usize, &ranks);
                let pending = state.pending_persistence.entry(*sid).or_default();
                let mut cleared = Vec::new();
                while let Some((&seq, &ts)) = pending.first_key_value() {
                    if min_durable != INVALID_VERSION && seq <= version_seq(min_durable) {
                        pending.remove(&seq);
                        cleared.push(ts);
                    } else {
                        break;
                    }
                }
                let timestamps = state.pending_timestamps.entry(*sid).or_default();
                for ts in cleared {
                    timestamps.remove(&ts);
                }
                let frontier = timestamps
                    .first()
                    .copied()
                    .map(|oldest| oldest.min(now))
                    .unwrap_or(now);
                self.sst.update(|row| {
                    row.local_stability_frontier[*sid as usize] = frontier;
                });
            }
            drop(state);
            self.sst.put_with_completion();
        }
        tracing::debug!("multicast timeout thread shutting down");
    }

    fn wedge(&self) {
        if self.wedged.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(vid = self.vid, "wedging multicast group");
        for handle in self.pred_handles.lock().unwrap().drain(..) {
            handle.cancel();
        }
        for (sid, sub) in &self.settings {
            let shard_ranks = sub.shard_ranks_by_sender_rank();
            for shard_rank in shard_ranks {
                self.bulk.destroy_group(
                    BulkGroupKey {
                        vid: self.vid,
                        subgroup_id: *sid,
                        sender: sub.members[shard_rank],
                    },
                    self.my_id(),
                );
            }
        }
        self.sender_cv.notify_all();
        let sender = self.sender_thread.lock().unwrap().take();
        if let Some(sender) = sender {
            if sender.thread().id() != thread::current().id() {
                let _ = sender.join();
            }
        }
    }
}

impl Drop for McInner {
    fn drop(&mut self) {
        self.wedge();
        let timer = self.timeout_thread.lock().unwrap().take();
        if let Some(timer) = timer {
            if timer.thread().id() != thread::current().id() {
                let _ = timer.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = Header {
            header_size: HEADER_LEN as u32,
            index: 41,
            timestamp: 1_234_567,
            cooked: true,
        };
        let mut buf = vec![0u8; HEADER_LEN];
        header.encode_into(&mut buf);
        assert_eq!(Header::parse(&buf).expect("parse header"), header);
    }

    #[test]
    fn interleaved_sequence_numbers_follow_index_times_senders_plus_rank() {
        // Two senders: A's x0,x1 and B's y0 land on 0, 2 and 1.
        let num_senders: MessageId = 2;
        assert_eq!(0 * num_senders + 0, 0); // x0
        assert_eq!(0 * num_senders + 1, 1); // y0
        assert_eq!(1 * num_senders + 0, 2); // x1
    }

    #[test]
    fn resolve_tracks_contiguous_prefix_across_gaps() {
        let mut intervals = vec![(-1, -1)];
        assert_eq!(resolve_num_received(&mut intervals, 0), 0);
        assert_eq!(resolve_num_received(&mut intervals, 1), 1);
        // Skip 2; the prefix stalls.
        assert_eq!(resolve_num_received(&mut intervals, 3), 1);
        assert_eq!(resolve_num_received(&mut intervals, 5), 1);
        // Filling 2 merges through the first gap but stops at 4.
        assert_eq!(resolve_num_received(&mut intervals, 2), 3);
        assert_eq!(resolve_num_received(&mut intervals, 4), 5);
        assert_eq!(intervals, vec![(-1, 5)]);
    }

    #[test]
    fn resolve_ignores_duplicate_indices() {
        let mut intervals = vec![(-1, -1)];
        assert_eq!(resolve_num_received(&mut intervals, 0), 0);
        assert_eq!(resolve_num_received(&mut intervals, 0), 0);
        assert_eq!(intervals, vec![(-1, 0)]);
    }

    #[test]
    fn out_of_order_singletons_merge_downward() {
        let mut intervals = vec![(-1, -1)];
        assert_eq!(resolve_num_received(&mut intervals, 2), -1);
        assert_eq!(resolve_num_received(&mut intervals, 1), -1);
        assert_eq!(intervals, vec![(-1, -1), (1, 2)]);
        assert_eq!(resolve_num_received(&mut intervals, 0), 2);
        assert_eq!(intervals, vec![(-1, 2)]);
    }
}

//! The group's shared-state-table row: every counter and flag the membership
//! protocol and the multicast engine replicate between members.

use tessera_sst::Sst;

use crate::persistence::Version;
use crate::view::MemberEndpoints;
use crate::{MessageId, NodeId, INVALID_VERSION};

/// Capacity of the pending-changes window. Proposing more uninstalled
/// changes than this is a fatal `PendingChangesOverflow`.
pub const MAX_CHANGES: usize = 64;

/// One small-message ring slot. The sender fills `buf`/`used`, then writes
/// `generation` last; receivers poll the generation for the next expected
/// value. Generations are 64-bit, so wraparound would take ~584,000 years of
/// one message per microsecond per sender.
#[derive(Clone, Debug, Default)]
pub struct Slot {
    pub buf: Vec<u8>,
    pub used: u64,
    pub generation: u64,
}

/// Per-member row of the shared state table.
///
/// Only the owning node writes its row; every other copy is a read-only
/// mirror. Vector lengths are fixed at view installation:
/// `suspected` by member count, `seq_num`/`delivered_num`/`persisted_num`/
/// `global_min_ready`/`local_stability_frontier` by total subgroup count,
/// `num_received*`/`global_min` by the num-received table width, and `slots`
/// by `total subgroups x window size`.
#[derive(Clone, Debug)]
pub struct GroupRow {
    pub vid: i32,
    pub suspected: Vec<bool>,
    pub wedged: bool,
    /// Clean-leave flag: set before departing so peers treat the removal as
    /// planned rather than a failure.
    pub rip: bool,

    pub changes: Vec<NodeId>,
    pub joiner_endpoints: Vec<MemberEndpoints>,
    pub num_changes: u32,
    pub num_acked: u32,
    pub num_committed: u32,
    pub num_installed: u32,

    pub seq_num: Vec<MessageId>,
    pub delivered_num: Vec<MessageId>,
    pub persisted_num: Vec<Version>,
    pub global_min: Vec<MessageId>,
    pub global_min_ready: Vec<bool>,
    pub num_received: Vec<MessageId>,
    pub num_received_sst: Vec<MessageId>,
    pub local_stability_frontier: Vec<u64>,
    pub slots: Vec<Slot>,
}

/// Static dimensions of a row, fixed per view.
#[derive(Clone, Copy, Debug)]
pub struct RowDims {
    pub num_members: usize,
    pub num_subgroups: usize,
    /// Width of the per-sender receive-counter block: the sum over
    /// subgroups of each subgroup's maximum shard sender count.
    pub num_received_size: usize,
    pub window_size: usize,
    pub slot_bytes: usize,
}

impl GroupRow {
    pub fn new(dims: RowDims) -> Self {
        let empty_endpoint = MemberEndpoints {
            ip: String::new(),
            gms_port: 0,
            rpc_port: 0,
            sst_port: 0,
            bulk_port: 0,
        };
        Self {
            vid: 0,
            suspected: vec![false; dims.num_members],
            wedged: false,
            rip: false,
            changes: vec![0; MAX_CHANGES],
            joiner_endpoints: vec![empty_endpoint; MAX_CHANGES],
            num_changes: 0,
            num_acked: 0,
            num_committed: 0,
            num_installed: 0,
            seq_num: vec![-1; dims.num_subgroups],
            delivered_num: vec![-1; dims.num_subgroups],
            persisted_num: vec![INVALID_VERSION; dims.num_subgroups],
            global_min: vec![0; dims.num_received_size],
            global_min_ready: vec![false; dims.num_subgroups],
            num_received: vec![-1; dims.num_received_size],
            num_received_sst: vec![-1; dims.num_received_size],
            local_stability_frontier: vec![0; dims.num_subgroups],
            slots: (0..dims.num_subgroups * dims.window_size)
                .map(|_| Slot {
                    buf: vec![0; dims.slot_bytes],
                    used: 0,
                    generation: 0,
                })
                .collect(),
        }
    }

    /// Index of the ring slot for message `index` of `subgroup_id`.
    pub fn slot_index(window_size: usize, subgroup_id: usize, index: MessageId) -> usize {
        subgroup_id * window_size + (index as usize % window_size)
    }
}

/// The group's shared state table.
pub type GroupSst = Sst<GroupRow>;

/// Smallest `seq_num` for `subgroup_id` across the given member ranks.
pub fn min_stable_seq(sst: &GroupSst, subgroup_id: usize, ranks: &[usize]) -> MessageId {
    let mut min = MessageId::MAX;
    for rank in ranks {
        let value = sst.row(*rank).seq_num[subgroup_id];
        min = min.min(value);
    }
    if min == MessageId::MAX {
        -1
    } else {
        min
    }
}

/// Smallest `persisted_num` for `subgroup_id` across the given member ranks.
pub fn min_persisted(sst: &GroupSst, subgroup_id: usize, ranks: &[usize]) -> Version {
    let mut min = Version::MAX;
    for rank in ranks {
        let value = sst.row(*rank).persisted_num[subgroup_id];
        min = min.min(value);
    }
    if min == Version::MAX {
        INVALID_VERSION
    } else {
        min
    }
}

//! Views: immutable membership + shard-layout snapshots, one per epoch.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::persistence::{combine_version, Version};
use crate::{MessageId, NodeId, SubgroupId};

pub const VIEW_FILE: &str = "view.json";

/// Operation mode of a shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Totally-ordered atomic multicast with stability-gated delivery.
    Ordered,
    /// Delivery straight from the receive handler, no version assignment.
    Unordered,
}

/// Endpoints a member listens on, one port per plane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEndpoints {
    pub ip: String,
    pub gms_port: u16,
    pub rpc_port: u16,
    pub sst_port: u16,
    pub bulk_port: u16,
}

/// One shard of one subgroup: the members that jointly execute the state
/// machine, with per-member sender flags.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubView {
    pub mode: Mode,
    pub members: Vec<NodeId>,
    pub is_sender: Vec<bool>,
    /// Members present here but not in the previous view's same shard.
    pub joined: Vec<NodeId>,
    /// Members present in the previous view's same shard but not here.
    pub departed: Vec<NodeId>,
    /// This node's rank in `members`, or -1 when it is not a member.
    pub my_rank: i32,
}

impl SubView {
    pub fn new(mode: Mode, members: Vec<NodeId>, is_sender: Vec<bool>) -> Self {
        assert_eq!(members.len(), is_sender.len());
        Self {
            mode,
            members,
            is_sender,
            joined: Vec::new(),
            departed: Vec::new(),
            my_rank: -1,
        }
    }

    /// All members send when every flag is true.
    pub fn all_senders(mode: Mode, members: Vec<NodeId>) -> Self {
        let senders = vec![true; members.len()];
        Self::new(mode, members, senders)
    }

    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        self.members.iter().position(|m| *m == node)
    }

    pub fn num_senders(&self) -> usize {
        self.is_sender.iter().filter(|s| **s).count()
    }

    /// Rank of `shard_rank` within the shard's senders, or -1 when that
    /// member does not send.
    pub fn sender_rank_of(&self, shard_rank: usize) -> i32 {
        if !self.is_sender.get(shard_rank).copied().unwrap_or(false) {
            return -1;
        }
        self.is_sender[..shard_rank].iter().filter(|s| **s).count() as i32
    }
}

/// The membership + layout snapshot for one epoch. Immutable once installed;
/// the multicast engine pins it until the next view retires it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct View {
    /// View id. Strictly increasing across installed views.
    pub vid: i32,
    pub members: Vec<NodeId>,
    pub member_endpoints: Vec<MemberEndpoints>,
    pub failed: Vec<bool>,
    pub num_failed: usize,
    /// Members newly added relative to the previous view.
    pub joined: Vec<NodeId>,
    /// Members removed relative to the previous view.
    pub departed: Vec<NodeId>,
    pub my_rank: usize,
    /// Cursor used by allocators that assign members in rank order.
    pub next_unassigned_rank: i32,
    /// Set by the subgroup allocator: false when the group cannot support
    /// the application's layout and must wait for more joins.
    #[serde(default)]
    pub is_adequately_provisioned: bool,
    /// Shard layouts indexed by subgroup id.
    #[serde(default)]
    pub subgroup_shard_views: Vec<Vec<SubView>>,
    /// Subgroup ids grouped by type, in registry declaration order.
    #[serde(default)]
    pub subgroup_ids_by_type_id: Vec<Vec<SubgroupId>>,
    /// Subgroup id -> shard number, for the subgroups this node belongs to.
    #[serde(default)]
    pub my_subgroups: BTreeMap<SubgroupId, u32>,
}

impl View {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vid: i32,
        members: Vec<NodeId>,
        member_endpoints: Vec<MemberEndpoints>,
        failed: Vec<bool>,
        joined: Vec<NodeId>,
        departed: Vec<NodeId>,
        my_rank: usize,
        next_unassigned_rank: i32,
    ) -> Self {
        let num_failed = failed.iter().filter(|f| **f).count();
        Self {
            vid,
            members,
            member_endpoints,
            failed,
            num_failed,
            joined,
            departed,
            my_rank,
            next_unassigned_rank,
            is_adequately_provisioned: false,
            subgroup_shard_views: Vec::new(),
            subgroup_ids_by_type_id: Vec::new(),
            my_subgroups: BTreeMap::new(),
        }
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn my_id(&self) -> NodeId {
        self.members[self.my_rank]
    }

    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        self.members.iter().position(|m| *m == node)
    }

    /// The leader is the lowest-rank member not marked failed.
    pub fn leader_rank(&self) -> usize {
        self.failed.iter().position(|f| !*f).unwrap_or(0)
    }

    pub fn leader_id(&self) -> NodeId {
        self.members[self.leader_rank()]
    }

    pub fn i_am_leader(&self) -> bool {
        self.leader_rank() == self.my_rank
    }

    /// Rank (within the shard's member list) of the shard leader: the first
    /// member of the shard not marked failed in this view.
    pub fn shard_leader_rank(&self, subgroup_id: SubgroupId, shard_num: u32) -> Option<usize> {
        let shard = &self.subgroup_shard_views[subgroup_id as usize][shard_num as usize];
        shard.members.iter().position(|m| {
            self.rank_of(*m)
                .map(|r| !self.failed[r])
                .unwrap_or(false)
        })
    }

    /// Number of live members required for the group to keep making
    /// progress; falling to or below `num_failed - num_rip` of this bound
    /// means a potential partition.
    pub fn in_minority(&self, num_failed: usize, num_rip: usize) -> bool {
        num_failed != 0
            && num_failed.saturating_sub(num_rip)
                >= (self.num_members() - num_rip + 1).div_ceil(2)
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir).context("create view dir")?;
        let data = serde_json::to_vec_pretty(self).context("serialize view")?;
        fs::write(dir.join(VIEW_FILE), data).context("write view file")?;
        Ok(())
    }

    pub fn load(dir: &Path) -> anyhow::Result<Option<Self>> {
        let path = dir.join(VIEW_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("read view file"),
        };
        let view = serde_json::from_slice(&data).context("decode view file")?;
        Ok(Some(view))
    }

    pub fn debug_string(&self) -> String {
        format!(
            "View {{ vid: {}, members: {:?}, failed: {:?}, joined: {:?}, departed: {:?} }}",
            self.vid, self.members, self.failed, self.joined, self.departed
        )
    }
}

/// The agreed cut of one terminated epoch for one shard: the per-sender
/// high-water marks beyond which messages are discarded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaggedTrim {
    pub subgroup_id: SubgroupId,
    pub shard_num: u32,
    pub vid: i32,
    /// Id of the leader that proposed the cut. Total restart stamps adopted
    /// trims with `NodeId::MAX` to mark them final.
    pub leader_id: NodeId,
    pub max_received_by_sender: Vec<MessageId>,
}

impl RaggedTrim {
    /// Sentinel leader id a restart leader uses to stamp its approval.
    pub const RESTART_LEADER: NodeId = NodeId::MAX;

    pub fn file_name(subgroup_id: SubgroupId, shard_num: u32) -> String {
        format!("ragged_trim.{subgroup_id}.{shard_num}.json")
    }

    /// The highest version any replica may have delivered in the trimmed
    /// epoch: the version of the last message below the cut.
    pub fn latest_version(&self) -> Version {
        let num_senders = self.max_received_by_sender.len() as i64;
        let mut last_seq: i64 = -1;
        for (sender, max_index) in self.max_received_by_sender.iter().enumerate() {
            if *max_index < 0 {
                continue;
            }
            last_seq = last_seq.max(*max_index as i64 * num_senders + sender as i64);
        }
        if last_seq < 0 {
            crate::INVALID_VERSION
        } else {
            combine_version(self.vid, last_seq as MessageId)
        }
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir).context("create trim dir")?;
        let path = dir.join(Self::file_name(self.subgroup_id, self.shard_num));
        let data = serde_json::to_vec_pretty(self).context("serialize ragged trim")?;
        fs::write(path, data).context("write ragged trim")?;
        Ok(())
    }

    pub fn load(dir: &Path, subgroup_id: SubgroupId, shard_num: u32) -> anyhow::Result<Option<Self>> {
        let path: PathBuf = dir.join(Self::file_name(subgroup_id, shard_num));
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("read ragged trim"),
        };
        let trim = serde_json::from_slice(&data).context("decode ragged trim")?;
        Ok(Some(trim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(n: usize) -> Vec<MemberEndpoints> {
        (0..n)
            .map(|i| MemberEndpoints {
                ip: "127.0.0.1".to_string(),
                gms_port: 23580 + i as u16,
                rpc_port: 28366 + i as u16,
                sst_port: 37683 + i as u16,
                bulk_port: 31675 + i as u16,
            })
            .collect()
    }

    #[test]
    fn leader_is_lowest_ranked_live_member() {
        let mut view = View::new(
            3,
            vec![10, 11, 12],
            endpoints(3),
            vec![false, false, false],
            vec![],
            vec![],
            2,
            0,
        );
        assert_eq!(view.leader_id(), 10);
        view.failed[0] = true;
        assert_eq!(view.leader_id(), 11);
        assert!(!view.i_am_leader());
    }

    #[test]
    fn sender_ranks_skip_non_senders() {
        let sub = SubView::new(Mode::Ordered, vec![1, 2, 3], vec![true, false, true]);
        assert_eq!(sub.num_senders(), 2);
        assert_eq!(sub.sender_rank_of(0), 0);
        assert_eq!(sub.sender_rank_of(1), -1);
        assert_eq!(sub.sender_rank_of(2), 1);
    }

    #[test]
    fn ragged_trim_latest_version_tracks_highest_cut_seq() {
        let trim = RaggedTrim {
            subgroup_id: 0,
            shard_num: 0,
            vid: 4,
            leader_id: 1,
            max_received_by_sender: vec![2, 1],
        };
        // Sender 0 index 2 -> seq 4, sender 1 index 1 -> seq 3.
        assert_eq!(trim.latest_version(), combine_version(4, 4));
    }

    #[test]
    fn ragged_trim_with_nothing_received_has_no_version() {
        let trim = RaggedTrim {
            subgroup_id: 1,
            shard_num: 0,
            vid: 2,
            leader_id: RaggedTrim::RESTART_LEADER,
            max_received_by_sender: vec![-1, -1],
        };
        assert_eq!(trim.latest_version(), crate::INVALID_VERSION);
    }

    #[test]
    fn view_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let view = View::new(
            1,
            vec![1, 2],
            endpoints(2),
            vec![false, false],
            vec![2],
            vec![],
            0,
            0,
        );
        view.save(dir.path()).expect("save view");
        let loaded = View::load(dir.path()).expect("load view").expect("view present");
        assert_eq!(loaded.vid, 1);
        assert_eq!(loaded.members, vec![1, 2]);
        assert!(View::load(std::path::Path::new("/nonexistent-tessera"))
            .expect("missing dir is not an error")
            .is_none());
    }
}

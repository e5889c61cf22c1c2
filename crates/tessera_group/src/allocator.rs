//! Subgroup allocation: mapping a proposed view onto per-type shard layouts.
//!
//! The allocator must be a pure function of its inputs; the view manager
//! re-invokes it on every proposed view and treats a provisioning failure as
//! "wait for more joins".

use crate::error::GroupError;
use crate::view::{Mode, SubView, View};
use crate::{NodeId, SubgroupTypeId};

/// Shard layout for one subgroup type: subgroups, each a list of shards.
pub type ShardLayout = Vec<Vec<SubView>>;

pub trait SubgroupAllocator: Send + Sync {
    /// Produces the shard layout for one subgroup type, or a
    /// [`GroupError::SubgroupProvisioning`] when the view cannot support it.
    ///
    /// `next_unassigned_rank` is a cursor over the view's live members in
    /// rank order; allocators that claim members exclusively advance it.
    fn allocate(
        &self,
        type_id: SubgroupTypeId,
        prev: Option<&View>,
        view: &View,
        next_unassigned_rank: &mut i32,
    ) -> Result<ShardLayout, GroupError>;
}

/// One subgroup with one shard per type, spanning the view's live members.
pub struct UniformAllocator {
    pub min_size: usize,
    pub max_size: usize,
    pub mode: Mode,
    /// When true, claimed members are consumed from the unassigned cursor so
    /// later types get disjoint member sets.
    pub exclusive: bool,
}

impl UniformAllocator {
    pub fn new(min_size: usize, max_size: usize, mode: Mode) -> Self {
        Self {
            min_size,
            max_size,
            mode,
            exclusive: false,
        }
    }
}

impl SubgroupAllocator for UniformAllocator {
    fn allocate(
        &self,
        type_id: SubgroupTypeId,
        _prev: Option<&View>,
        view: &View,
        next_unassigned_rank: &mut i32,
    ) -> Result<ShardLayout, GroupError> {
        let live: Vec<NodeId> = view
            .members
            .iter()
            .zip(view.failed.iter())
            .filter(|(_, failed)| !**failed)
            .map(|(m, _)| *m)
            .collect();
        let start = if self.exclusive {
            (*next_unassigned_rank).max(0) as usize
        } else {
            0
        };
        if live.len() < start + self.min_size {
            return Err(GroupError::SubgroupProvisioning {
                type_id,
                reason: format!(
                    "need {} live members, have {}",
                    start + self.min_size,
                    live.len()
                ),
            });
        }
        let take = (live.len() - start).min(self.max_size);
        let members: Vec<NodeId> = live[start..start + take].to_vec();
        if self.exclusive {
            *next_unassigned_rank = (start + take) as i32;
        }
        Ok(vec![vec![SubView::all_senders(self.mode, members)]])
    }
}

/// One fixed shard specification: explicit members, optional sender flags.
#[derive(Clone, Debug)]
pub struct FixedShard {
    pub members: Vec<NodeId>,
    /// Defaults to all-senders when `None`.
    pub senders: Option<Vec<bool>>,
    pub mode: Mode,
}

/// Allocator with an explicit layout per subgroup, mainly for tests and
/// static deployments. Provisioning fails while any listed member is absent
/// or failed.
pub struct FixedShardAllocator {
    /// subgroup index -> shard index -> shard spec, for a single type.
    pub subgroups: Vec<Vec<FixedShard>>,
}

impl SubgroupAllocator for FixedShardAllocator {
    fn allocate(
        &self,
        type_id: SubgroupTypeId,
        _prev: Option<&View>,
        view: &View,
        _next_unassigned_rank: &mut i32,
    ) -> Result<ShardLayout, GroupError> {
        let mut layout = Vec::with_capacity(self.subgroups.len());
        for shards in &self.subgroups {
            let mut shard_views = Vec::with_capacity(shards.len());
            for shard in shards {
                for member in &shard.members {
                    let live = view
                        .rank_of(*member)
                        .map(|rank| !view.failed[rank])
                        .unwrap_or(false);
                    if !live {
                        return Err(GroupError::SubgroupProvisioning {
                            type_id,
                            reason: format!("member {member} is absent or failed"),
                        });
                    }
                }
                let senders = shard
                    .senders
                    .clone()
                    .unwrap_or_else(|| vec![true; shard.members.len()]);
                shard_views.push(SubView::new(shard.mode, shard.members.clone(), senders));
            }
            layout.push(shard_views);
        }
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::MemberEndpoints;

    fn view_of(members: Vec<NodeId>, failed: Vec<bool>) -> View {
        let endpoints = members
            .iter()
            .map(|_| MemberEndpoints {
                ip: "127.0.0.1".to_string(),
                gms_port: 0,
                rpc_port: 0,
                sst_port: 0,
                bulk_port: 0,
            })
            .collect();
        View::new(0, members, endpoints, failed, vec![], vec![], 0, 0)
    }

    #[test]
    fn uniform_allocator_requires_min_size() {
        let alloc = UniformAllocator::new(2, 4, Mode::Ordered);
        let view = view_of(vec![1], vec![false]);
        let mut cursor = 0;
        let err = alloc.allocate(0, None, &view, &mut cursor).unwrap_err();
        assert!(matches!(err, GroupError::SubgroupProvisioning { .. }));
    }

    #[test]
    fn uniform_allocator_skips_failed_members() {
        let alloc = UniformAllocator::new(2, 4, Mode::Ordered);
        let view = view_of(vec![1, 2, 3], vec![false, true, false]);
        let mut cursor = 0;
        let layout = alloc.allocate(0, None, &view, &mut cursor).expect("layout");
        assert_eq!(layout[0][0].members, vec![1, 3]);
    }

    #[test]
    fn fixed_allocator_rejects_missing_members() {
        let alloc = FixedShardAllocator {
            subgroups: vec![vec![FixedShard {
                members: vec![1, 9],
                senders: None,
                mode: Mode::Ordered,
            }]],
        };
        let view = view_of(vec![1, 2], vec![false, false]);
        let mut cursor = 0;
        assert!(alloc.allocate(0, None, &view, &mut cursor).is_err());
    }
}

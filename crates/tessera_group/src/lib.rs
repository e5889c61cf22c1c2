//! Tessera: a replicated state-machine runtime for small process groups.
//!
//! Members form a single logical group. Within the group, application-defined
//! subgroups (each partitioned into shards) execute totally-ordered atomic
//! multicasts whose delivery order, failure semantics, and durability are
//! identical at every live shard replica. The crate couples three protocols
//! over one shared state table:
//!
//! - a leader-driven membership protocol that atomically installs successive
//!   views ([`view_manager`]),
//! - a totally-ordered multicast mixing a bulk and a small-message transport
//!   under one sequencing scheme ([`multicast`]),
//! - an epoch-termination protocol that computes an identical cut of
//!   delivered messages at every surviving replica on view change.

pub mod allocator;
pub mod config;
pub mod error;
pub mod group;
pub mod group_sst;
pub mod membership;
pub mod multicast;
pub mod persistence;
pub mod registry;
pub mod restart;
pub mod transport;
pub mod view;
pub mod view_manager;

pub use allocator::{FixedShardAllocator, ShardLayout, SubgroupAllocator, UniformAllocator};
pub use config::{GroupConfig, GroupParams, SendAlgorithm};
pub use error::GroupError;
pub use group::{CallbackSet, Group, GroupBuilder};
pub use group_sst::GroupRow;
pub use persistence::{combine_version, version_seq, version_vid, Hlc, PersistenceBridge, Version};
pub use registry::{SubgroupRegistry, SubgroupTypeEntry};
pub use view::{Mode, RaggedTrim, SubView, View};

/// Logical node identifier within a group.
pub type NodeId = tessera_sst::NodeId;
/// Index of a (type, subgroup-index) pair in the current view's enumeration.
/// Stable across views for the same pair.
pub type SubgroupId = u32;
/// Index of a subgroup type in the registry's declaration order.
pub type SubgroupTypeId = u32;
/// Per-sender message index / stable sequence number within a shard.
pub type MessageId = i32;

/// Sentinel version for messages delivered without a version assignment
/// (unordered mode, null messages).
pub const INVALID_VERSION: Version = -1;

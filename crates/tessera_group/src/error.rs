//! Protocol-level error kinds.

use thiserror::Error;

use crate::{NodeId, SubgroupId};

/// Errors surfaced by the membership protocol, the multicast engine, and
/// total-restart recovery. Recoverable kinds say so; the rest are fatal for
/// the local node.
#[derive(Debug, Error)]
pub enum GroupError {
    /// The leader refused a join because the node id is already a member.
    #[error("node id {0} is already in use in the group")]
    IdInUse(NodeId),

    /// The contacted member is not the leader; re-dial the given address.
    #[error("contacted node is not the leader; redirected to {ip}:{gms_port}")]
    LeaderRedirect { ip: String, gms_port: u16 },

    /// The leader's join socket died mid-handshake. Retry against the new
    /// leader.
    #[error("leader crashed during the join handshake")]
    LeaderCrashed,

    /// The subgroup allocator rejected the proposed view. Recoverable: wait
    /// for more joins.
    #[error("subgroup allocation failed for type {type_id}: {reason}")]
    SubgroupProvisioning { type_id: u32, reason: String },

    /// An operation was attempted while the current view is not adequately
    /// provisioned.
    #[error("current view is not adequately provisioned")]
    InadequateView,

    /// The local node is not a member of the requested subgroup.
    #[error("this node is not a member of subgroup {0}")]
    InvalidSubgroup(SubgroupId),

    /// This node observed itself in a minority partition and must shut down
    /// rather than risk split-brain progress.
    #[error("potential partition: this node is no longer in the majority and must shut down")]
    PartitionDetected,

    /// The pending-changes window in the shared state table is full.
    #[error("pending changes list is full; cannot accept more membership changes")]
    PendingChangesOverflow,

    /// Not enough rejoiners yet to satisfy the restart quorum. Recoverable:
    /// keep waiting.
    #[error("restart quorum not reached yet")]
    RestartQuorumFailed,

    /// A remote invocation raised an exception; propagated through the RPC
    /// reply path.
    #[error("remote exception: {0}")]
    RemoteException(String),

    /// Payload exceeds the configured maximum message size.
    #[error("payload of {got} bytes exceeds maximum message size {max}")]
    PayloadTooLarge { got: usize, max: usize },

    /// The group is shutting down.
    #[error("group is shutting down")]
    ShuttingDown,
}

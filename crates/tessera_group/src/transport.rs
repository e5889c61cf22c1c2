//! Bulk multicast transport.
//!
//! The engine treats the bulk path as an opaque transport: per shard sender
//! it creates a delivery group, and `send` publishes one message to every
//! group member exactly once, the sender included (the self-delivery is what
//! completes the send locally). Ordering across distinct senders is not the
//! transport's job; the sequencing layer above provides it.
//!
//! [`MemoryBulkHub`] is the in-process implementation used by tests and
//! single-host deployments; an RDMA-backed implementation is an external
//! collaborator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::SendAlgorithm;
use crate::{NodeId, SubgroupId};

/// Identifies one sender's delivery group. The view id keeps groups from
/// adjacent epochs apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BulkGroupKey {
    pub vid: i32,
    pub subgroup_id: SubgroupId,
    pub sender: NodeId,
}

/// Local receive hook for one delivery group. Called exactly once per
/// successful send, with the full message bytes (header included).
pub trait BulkReceiver: Send + Sync {
    fn on_receive(&self, data: Vec<u8>);
}

pub trait BulkTransport: Send + Sync {
    /// Registers the local node's receiver for the given group.
    fn create_group(
        &self,
        key: BulkGroupKey,
        members: &[NodeId],
        block_size: usize,
        algorithm: SendAlgorithm,
        local: NodeId,
        receiver: Arc<dyn BulkReceiver>,
    ) -> anyhow::Result<()>;

    /// Publishes `data` to every member of the group once.
    fn send(&self, key: BulkGroupKey, data: Vec<u8>) -> anyhow::Result<()>;

    /// Drops the local node's registration for the given group.
    fn destroy_group(&self, key: BulkGroupKey, local: NodeId);
}

struct HubGroup {
    members: Vec<NodeId>,
    receivers: HashMap<NodeId, Arc<dyn BulkReceiver>>,
}

/// In-process bulk transport connecting every node in one process.
pub struct MemoryBulkHub {
    groups: Mutex<HashMap<BulkGroupKey, HubGroup>>,
}

impl MemoryBulkHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            groups: Mutex::new(HashMap::new()),
        })
    }
}

impl BulkTransport for MemoryBulkHub {
    fn create_group(
        &self,
        key: BulkGroupKey,
        members: &[NodeId],
        _block_size: usize,
        _algorithm: SendAlgorithm,
        local: NodeId,
        receiver: Arc<dyn BulkReceiver>,
    ) -> anyhow::Result<()> {
        let mut groups = self.groups.lock().unwrap();
        let group = groups.entry(key).or_insert_with(|| HubGroup {
            members: members.to_vec(),
            receivers: HashMap::new(),
        });
        anyhow::ensure!(
            group.members == members,
            "bulk group {key:?} registered with mismatched membership"
        );
        group.receivers.insert(local, receiver);
        Ok(())
    }

    fn send(&self, key: BulkGroupKey, data: Vec<u8>) -> anyhow::Result<()> {
        let targets: Vec<Arc<dyn BulkReceiver>> = {
            let groups = self.groups.lock().unwrap();
            let group = groups
                .get(&key)
                .ok_or_else(|| anyhow::anyhow!("bulk group {key:?} does not exist"))?;
            group
                .members
                .iter()
                .filter_map(|m| group.receivers.get(m).map(Arc::clone))
                .collect()
        };
        for receiver in targets {
            receiver.on_receive(data.clone());
        }
        Ok(())
    }

    fn destroy_group(&self, key: BulkGroupKey, local: NodeId) {
        let mut groups = self.groups.lock().unwrap();
        if let Some(group) = groups.get_mut(&key) {
            group.receivers.remove(&local);
            if group.receivers.is_empty() {
                groups.remove(&key);
            }
        }
    }
}

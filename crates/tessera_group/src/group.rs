//! The top-level group handle an application holds: construction, sends,
//! membership queries, and teardown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tessera_sst::MemoryMesh;

use crate::allocator::SubgroupAllocator;
use crate::config::{GroupConfig, GroupParams};
use crate::error::GroupError;
use crate::group_sst::GroupRow;
use crate::multicast::{DeliveryCallback, PersistenceCallback, RpcHandler};
use crate::persistence::{FileLogBridge, NullBridge, PersistenceBridge};
use crate::registry::SubgroupRegistry;
use crate::transport::{BulkTransport, MemoryBulkHub};
use crate::view::View;
use crate::view_manager::{ViewManager, ViewRuntime, ViewUpcall, VmArgs};
use crate::{NodeId, SubgroupId, SubgroupTypeId};

/// Message delivery and durability callbacks, supplied by the application.
#[derive(Clone, Default)]
pub struct CallbackSet {
    /// Fired as each message reaches global stability, in delivery order.
    pub global_stability: Option<DeliveryCallback>,
    /// Fired when the local node has made a version durable.
    pub local_persistence: Option<PersistenceCallback>,
    /// Fired when every shard replica has made a version durable.
    pub global_persistence: Option<PersistenceCallback>,
}

/// Builder for [`Group`]. The mesh and bulk transports default to fresh
/// in-process instances; multi-node tests share one of each across nodes.
pub struct GroupBuilder {
    config: GroupConfig,
    params: GroupParams,
    registry: SubgroupRegistry,
    allocator: Arc<dyn SubgroupAllocator>,
    callbacks: CallbackSet,
    bridge: Option<Arc<dyn PersistenceBridge>>,
    mesh: Option<Arc<dyn tessera_sst::RowMesh<GroupRow>>>,
    bulk: Option<Arc<dyn BulkTransport>>,
    view_upcalls: Vec<ViewUpcall>,
}

impl GroupBuilder {
    pub fn new(
        config: GroupConfig,
        registry: SubgroupRegistry,
        allocator: Arc<dyn SubgroupAllocator>,
    ) -> Self {
        Self {
            config,
            params: GroupParams::default(),
            registry,
            allocator,
            callbacks: CallbackSet::default(),
            bridge: None,
            mesh: None,
            bulk: None,
            view_upcalls: Vec::new(),
        }
    }

    pub fn params(mut self, params: GroupParams) -> Self {
        self.params = params;
        self
    }

    pub fn callbacks(mut self, callbacks: CallbackSet) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn bridge(mut self, bridge: Arc<dyn PersistenceBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn mesh(mut self, mesh: Arc<dyn tessera_sst::RowMesh<GroupRow>>) -> Self {
        self.mesh = Some(mesh);
        self
    }

    pub fn bulk(mut self, bulk: Arc<dyn BulkTransport>) -> Self {
        self.bulk = Some(bulk);
        self
    }

    pub fn view_upcall(mut self, upcall: ViewUpcall) -> Self {
        self.view_upcalls.push(upcall);
        self
    }

    pub fn build(self) -> anyhow::Result<Group> {
        let bridge: Arc<dyn PersistenceBridge> = match self.bridge {
            Some(bridge) => bridge,
            None if self.registry.any_persistent() => {
                let log_dir = self.config.data_dir.join("logs");
                FileLogBridge::open_dir(&log_dir).context("open version log bridge")?
            }
            None => NullBridge::new(),
        };
        let mesh = self
            .mesh
            .unwrap_or_else(|| Arc::new(MemoryMesh::<GroupRow>::new()));
        let bulk = self.bulk.unwrap_or_else(|| MemoryBulkHub::new());
        let vm = ViewManager::start(VmArgs {
            config: self.config,
            params: self.params,
            registry: self.registry,
            allocator: self.allocator,
            callbacks: self.callbacks,
            bridge,
            mesh,
            bulk,
            view_upcalls: self.view_upcalls,
        })?;
        vm.begin()?;
        Ok(Group { vm })
    }
}

/// A member's handle on the replicated group.
pub struct Group {
    vm: ViewManager,
}

impl Group {
    pub fn builder(
        config: GroupConfig,
        registry: SubgroupRegistry,
        allocator: Arc<dyn SubgroupAllocator>,
    ) -> GroupBuilder {
        GroupBuilder::new(config, registry, allocator)
    }

    fn runtime(&self) -> Result<Arc<ViewRuntime>, GroupError> {
        self.vm.current().ok_or(GroupError::ShuttingDown)
    }

    /// Sends one totally-ordered multicast to `subgroup_id`. Blocks while
    /// the send window is exhausted and retries transparently across view
    /// changes; returns once the message is accepted for sending.
    pub fn send(
        &self,
        subgroup_id: SubgroupId,
        payload_size: usize,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<(), GroupError> {
        self.send_inner(subgroup_id, payload_size, false, fill)
    }

    /// Like [`Group::send`], but marks the payload as an RPC invocation to
    /// be dispatched by the registered RPC callback on delivery.
    pub fn cooked_send(
        &self,
        subgroup_id: SubgroupId,
        payload_size: usize,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<(), GroupError> {
        self.send_inner(subgroup_id, payload_size, true, fill)
    }

    fn send_inner(
        &self,
        subgroup_id: SubgroupId,
        payload_size: usize,
        cooked: bool,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<(), GroupError> {
        let mut pending = Some(fill);
        let mut shim = |buf: &mut [u8]| {
            if let Some(fill) = pending.take() {
                fill(buf);
            }
        };
        loop {
            if let Some(err) = self.vm.fatal_error() {
                return Err(err);
            }
            let runtime = self.runtime()?;
            if !runtime.view.is_adequately_provisioned {
                return Err(GroupError::InadequateView);
            }
            let epoch = self.vm.install_epoch();
            match runtime
                .group
                .send(subgroup_id, payload_size, cooked, &mut shim)
            {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    // The view wedged under us; wait for the next install
                    // and retry there.
                    self.vm.wait_for_install(epoch, Duration::from_secs(5));
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn members(&self) -> Result<Vec<NodeId>, GroupError> {
        Ok(self.runtime()?.view.members.clone())
    }

    pub fn my_rank(&self) -> Result<usize, GroupError> {
        Ok(self.runtime()?.view.my_rank)
    }

    pub fn my_id(&self) -> Result<NodeId, GroupError> {
        let runtime = self.runtime()?;
        Ok(runtime.view.members[runtime.view.my_rank])
    }

    /// Snapshot of the current view.
    pub fn current_view(&self) -> Result<View, GroupError> {
        Ok(self.runtime()?.view.clone())
    }

    /// Subgroup ids and shard numbers of the subgroups this node belongs to.
    pub fn my_subgroups(&self) -> Result<Vec<(SubgroupId, u32)>, GroupError> {
        Ok(self
            .runtime()?
            .view
            .my_subgroups
            .iter()
            .map(|(sid, shard)| (*sid, *shard))
            .collect())
    }

    /// Members of every shard of the given (type, subgroup index) pair.
    pub fn subgroup_members(
        &self,
        type_id: SubgroupTypeId,
        subgroup_index: usize,
    ) -> Result<Vec<Vec<NodeId>>, GroupError> {
        let runtime = self.runtime()?;
        let sid = *runtime
            .view
            .subgroup_ids_by_type_id
            .get(type_id as usize)
            .and_then(|ids| ids.get(subgroup_index))
            .ok_or(GroupError::InvalidSubgroup(subgroup_index as SubgroupId))?;
        Ok(runtime.view.subgroup_shard_views[sid as usize]
            .iter()
            .map(|shard| shard.members.clone())
            .collect())
    }

    /// This node's shard within the given (type, subgroup index) pair, or
    /// an error when it is not a member.
    pub fn my_shard(
        &self,
        type_id: SubgroupTypeId,
        subgroup_index: usize,
    ) -> Result<u32, GroupError> {
        let runtime = self.runtime()?;
        let sid = *runtime
            .view
            .subgroup_ids_by_type_id
            .get(type_id as usize)
            .and_then(|ids| ids.get(subgroup_index))
            .ok_or(GroupError::InvalidSubgroup(subgroup_index as SubgroupId))?;
        runtime
            .view
            .my_subgroups
            .get(&sid)
            .copied()
            .ok_or(GroupError::InvalidSubgroup(sid))
    }

    /// Barrier with every live member of the current view.
    pub fn barrier_sync(&self) -> Result<(), GroupError> {
        self.runtime()?.sst.sync_with_members(None);
        Ok(())
    }

    /// Oldest undelivered-message timestamp across the shard, in wall-clock
    /// nanoseconds. A liveness monitor bounds message staleness with it.
    pub fn stability_frontier(&self, subgroup_id: SubgroupId) -> Result<u64, GroupError> {
        Ok(self.runtime()?.group.global_stability_frontier(subgroup_id))
    }

    pub fn register_rpc_callback(&self, handler: RpcHandler) {
        self.vm.register_rpc_callback(handler);
    }

    pub fn add_view_upcall(&self, upcall: ViewUpcall) {
        self.vm.add_view_upcall(upcall);
    }

    /// Reports a locally detected member failure.
    pub fn report_failure(&self, who: NodeId) {
        self.vm.report_failure(who);
    }

    /// The fatal error that shut this node down, if one occurred.
    pub fn fatal_error(&self) -> Option<GroupError> {
        self.vm.fatal_error()
    }

    /// Number of installed views so far; advances on every view change.
    pub fn install_epoch(&self) -> u64 {
        self.vm.install_epoch()
    }

    /// Blocks until a view past `seen` installs or the timeout expires.
    pub fn wait_for_install(&self, seen: u64, timeout: Duration) -> u64 {
        self.vm.wait_for_install(seen, timeout)
    }

    /// Cleanly departs the group.
    pub fn leave(&self) {
        self.vm.leave();
    }

    /// Halts this member abruptly, without announcing departure. Peers see
    /// a silent failure; used for failure injection.
    pub fn crash(&self) {
        self.vm.crash();
    }
}

/// Directory helpers shared by the binary and tests.
pub fn node_data_dir(base: &Path, node_id: NodeId) -> std::path::PathBuf {
    base.join(format!("node-{node_id}"))
}

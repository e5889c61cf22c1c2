//! View management: the leader-driven membership protocol, epoch
//! termination with ragged-edge cleanup, and view installation.
//!
//! The protocol runs entirely as predicates over the shared state table.
//! Failures raise `suspected` flags; the leader turns suspicions and join
//! requests into proposed changes; followers echo and acknowledge; commits
//! wedge the epoch; and once every live member is wedged, the epoch is
//! terminated, the ragged edge is cut identically at every surviving
//! replica, and the next view is installed atomically.

use std::collections::{BTreeMap, VecDeque};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use tessera_sst::{PredicateHandle, PredicateMode, RowMesh, Sst};

use crate::allocator::SubgroupAllocator;
use crate::config::{GroupConfig, GroupParams};
use crate::error::GroupError;
use crate::group::CallbackSet;
use crate::group_sst::{GroupRow, GroupSst, RowDims, MAX_CHANGES};
use crate::membership::{self, JoinResponse, JoinResponseCode, JoinerPorts};
use crate::multicast::{MulticastGroup, PostNextVersion, RpcHandler, SubgroupSettings, HEADER_LEN};
use crate::persistence::{combine_version, PersistenceBridge};
use crate::registry::SubgroupRegistry;
use crate::restart::{self, RestartLeaderState, RestartState};
use crate::transport::BulkTransport;
use crate::view::{MemberEndpoints, Mode, RaggedTrim, View};
use crate::{NodeId, SubgroupId, SubgroupTypeId};

pub type ViewUpcall = Arc<dyn Fn(&View) + Send + Sync>;

/// Everything that exists per installed view: the view itself, its shared
/// state table, its multicast engine, and the mutable failure flags.
pub struct ViewRuntime {
    pub view: View,
    pub failed: Mutex<Vec<bool>>,
    pub sst: GroupSst,
    pub group: MulticastGroup,
    pub settings: BTreeMap<SubgroupId, SubgroupSettings>,
    pub num_received_size: usize,
}

impl ViewRuntime {
    pub fn failed_snapshot(&self) -> Vec<bool> {
        self.failed.lock().unwrap().clone()
    }

    pub fn num_failed(&self) -> usize {
        self.failed.lock().unwrap().iter().filter(|f| **f).count()
    }

    /// Current leader: the lowest-rank member not currently marked failed.
    pub fn leader_rank(&self) -> usize {
        self.failed
            .lock()
            .unwrap()
            .iter()
            .position(|f| !*f)
            .unwrap_or(0)
    }

    pub fn i_am_leader(&self) -> bool {
        self.leader_rank() == self.view.my_rank
    }

    pub fn live_ranks(&self) -> Vec<usize> {
        self.failed
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, f)| !**f)
            .map(|(r, _)| r)
            .collect()
    }

    /// Wedges the epoch locally: the multicast engine stops accepting and
    /// draining sends, and the wedged flag is pushed to peers.
    pub fn wedge(&self) {
        self.group.wedge();
        self.sst.update(|row| row.wedged = true);
        self.sst.put();
    }

    /// First non-failed member of the shard, by current failure knowledge.
    fn shard_leader_shard_rank(&self, subgroup_id: SubgroupId, shard_num: u32) -> Option<usize> {
        let failed = self.failed.lock().unwrap();
        let shard = &self.view.subgroup_shard_views[subgroup_id as usize][shard_num as usize];
        shard.members.iter().position(|m| {
            self.view
                .rank_of(*m)
                .map(|r| !failed[r])
                .unwrap_or(false)
        })
    }
}

#[derive(Default)]
struct ProtocolHandles {
    all: Vec<PredicateHandle>,
}

impl ProtocolHandles {
    fn cancel_all(&mut self) {
        for handle in self.all.drain(..) {
            handle.cancel();
        }
    }
}

/// A computed-but-not-yet-installed next view.
struct PendingInstall {
    next_view: View,
    next_settings: BTreeMap<SubgroupId, SubgroupSettings>,
    next_num_received_size: usize,
}

pub(crate) struct VmInner {
    config: GroupConfig,
    params: GroupParams,
    registry: SubgroupRegistry,
    allocator: Arc<dyn SubgroupAllocator>,
    callbacks: CallbackSet,
    bridge: Arc<dyn PersistenceBridge>,
    any_persistent: bool,
    mesh: Arc<dyn RowMesh<GroupRow>>,
    bulk: Arc<dyn BulkTransport>,
    view_upcalls: Mutex<Vec<ViewUpcall>>,
    rpc_callback: Mutex<Option<RpcHandler>>,

    curr: RwLock<Option<Arc<ViewRuntime>>>,
    pending_install: Mutex<Option<PendingInstall>>,
    last_suspected: Mutex<Vec<bool>>,
    handles: Mutex<ProtocolHandles>,
    pending_joins: Mutex<VecDeque<TcpStream>>,
    proposed_joins: Mutex<VecDeque<(NodeId, TcpStream)>>,
    old_views: Mutex<VecDeque<Arc<ViewRuntime>>>,
    old_views_cv: Condvar,
    install_epoch: Mutex<u64>,
    install_cv: Condvar,
    restart_state: Mutex<Option<RestartState>>,
    fatal: Mutex<Option<GroupError>>,
    shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    upcall_generation: AtomicU64,
}

/// Handle on the view-management machinery of one node.
pub struct ViewManager {
    inner: Arc<VmInner>,
}

/// Construction inputs for [`ViewManager::start`].
pub struct VmArgs {
    pub config: GroupConfig,
    pub params: GroupParams,
    pub registry: SubgroupRegistry,
    pub allocator: Arc<dyn SubgroupAllocator>,
    pub callbacks: CallbackSet,
    pub bridge: Arc<dyn PersistenceBridge>,
    pub mesh: Arc<dyn RowMesh<GroupRow>>,
    pub bulk: Arc<dyn BulkTransport>,
    pub view_upcalls: Vec<ViewUpcall>,
}

/* ---- view/layout computation helpers ---- */

/// Runs the subgroup allocator across every registered type and installs
/// the resulting layouts into `view`. Returns the local node's subgroup
/// settings and the width of the num-received counter block. A provisioning
/// failure marks the view inadequate and rolls every layout field back.
pub(crate) fn run_allocator(
    registry: &SubgroupRegistry,
    allocator: &dyn SubgroupAllocator,
    prev: Option<&View>,
    view: &mut View,
) -> Result<(BTreeMap<SubgroupId, SubgroupSettings>, usize), GroupError> {
    let initial_cursor = view.next_unassigned_rank;
    view.subgroup_shard_views.clear();
    view.subgroup_ids_by_type_id.clear();
    view.my_subgroups.clear();
    let mut cursor = initial_cursor;
    let mut layouts_by_type = Vec::with_capacity(registry.len());
    for type_id in 0..registry.len() as SubgroupTypeId {
        match allocator.allocate(type_id, prev, view, &mut cursor) {
            Ok(layout) => layouts_by_type.push(layout),
            Err(GroupError::SubgroupProvisioning { type_id, reason }) => {
                tracing::debug!(type_id, reason, "view is not adequately provisioned");
                view.is_adequately_provisioned = false;
                view.next_unassigned_rank = initial_cursor;
                view.subgroup_shard_views.clear();
                view.subgroup_ids_by_type_id.clear();
                view.my_subgroups.clear();
                return Ok((BTreeMap::new(), 0));
            }
            Err(err) => return Err(err),
        }
    }
    view.next_unassigned_rank = cursor;

    let my_id = view.members[view.my_rank];
    let mut settings = BTreeMap::new();
    let mut num_received_offset = 0usize;
    for (type_id, layout) in layouts_by_type.into_iter().enumerate() {
        let mut ids_for_type = Vec::with_capacity(layout.len());
        for (subgroup_index, mut shards) in layout.into_iter().enumerate() {
            let subgroup_id = view.subgroup_shard_views.len() as SubgroupId;
            ids_for_type.push(subgroup_id);
            let mut max_shard_senders = 0usize;
            for (shard_num, shard) in shards.iter_mut().enumerate() {
                max_shard_senders = max_shard_senders.max(shard.num_senders());
                shard.my_rank = shard.rank_of(my_id).map(|r| r as i32).unwrap_or(-1);
                if let Some(prev_view) = prev {
                    // The (type, subgroup index) pair identifies the same
                    // subgroup across views.
                    if let Some(prev_sid) = prev_view
                        .subgroup_ids_by_type_id
                        .get(type_id)
                        .and_then(|ids| ids.get(subgroup_index))
                    {
                        if let Some(prev_shard) = prev_view
                            .subgroup_shard_views
                            .get(*prev_sid as usize)
                            .and_then(|shards| shards.get(shard_num))
                        {
                            shard.joined = shard
                                .members
                                .iter()
                                .filter(|m| !prev_shard.members.contains(m))
                                .copied()
                                .collect();
                            shard.departed = prev_shard
                                .members
                                .iter()
                                .filter(|m| !shard.members.contains(m))
                                .copied()
                                .collect();
                        }
                    }
                }
                if shard.my_rank >= 0 {
                    view.my_subgroups.insert(subgroup_id, shard_num as u32);
                    settings.insert(
                        subgroup_id,
                        SubgroupSettings {
                            shard_num: shard_num as u32,
                            shard_rank: shard.my_rank as u32,
                            members: shard.members.clone(),
                            senders: shard.is_sender.clone(),
                            sender_rank: shard.sender_rank_of(shard.my_rank as usize),
                            num_received_offset,
                            mode: shard.mode,
                        },
                    );
                }
            }
            view.subgroup_shard_views.push(shards);
            num_received_offset += max_shard_senders;
        }
        view.subgroup_ids_by_type_id.push(ids_for_type);
    }
    view.is_adequately_provisioned = true;
    Ok((settings, num_received_offset))
}

/// Recomputes this node's ranks and subgroup settings from the shard
/// layouts already present in a received view.
pub(crate) fn derive_subgroup_settings(
    view: &mut View,
) -> (BTreeMap<SubgroupId, SubgroupSettings>, usize) {
    let my_id = view.members[view.my_rank];
    view.my_subgroups.clear();
    let mut settings = BTreeMap::new();
    let mut num_received_offset = 0usize;
    let mut shard_views = std::mem::take(&mut view.subgroup_shard_views);
    for (subgroup_id, shards) in shard_views.iter_mut().enumerate() {
        let mut max_shard_senders = 0usize;
        for (shard_num, shard) in shards.iter_mut().enumerate() {
            max_shard_senders = max_shard_senders.max(shard.num_senders());
            shard.my_rank = shard.rank_of(my_id).map(|r| r as i32).unwrap_or(-1);
            if shard.my_rank >= 0 {
                view.my_subgroups
                    .insert(subgroup_id as SubgroupId, shard_num as u32);
                settings.insert(
                    subgroup_id as SubgroupId,
                    SubgroupSettings {
                        shard_num: shard_num as u32,
                        shard_rank: shard.my_rank as u32,
                        members: shard.members.clone(),
                        senders: shard.is_sender.clone(),
                        sender_rank: shard.sender_rank_of(shard.my_rank as usize),
                        num_received_offset,
                        mode: shard.mode,
                    },
                );
            }
        }
        num_received_offset += max_shard_senders;
    }
    view.subgroup_shard_views = shard_views;
    (settings, num_received_offset)
}

impl ViewManager {
    /// Boots the node: obtains or awaits the initial view (fresh leader,
    /// joiner, or total restart), constructs the first runtime, wires the
    /// threads, and registers the protocol predicates. Call
    /// [`ViewManager::begin`] afterwards to start predicate evaluation.
    pub fn start(args: VmArgs) -> anyhow::Result<Self> {
        let mut params = args.params.clone().normalized();
        let any_persistent = args.registry.any_persistent();
        let saved_view = View::load(&args.config.data_dir)?;
        let listener = TcpListener::bind(args.config.gms_addr())
            .with_context(|| format!("bind membership listener on {}", args.config.gms_addr()))?;

        let mut restart_state = None;
        let (mut view, settings, num_received_size) = if let Some(mut saved) = saved_view {
            tracing::info!(vid = saved.vid, "saved view found on disk; restarting in recovery mode");
            saved.my_rank = saved
                .rank_of(args.config.local_id)
                .context("saved view does not contain this node")?;
            let (_, _) = derive_subgroup_settings(&mut saved);
            let state = RestartState::load(&saved, &args.config.data_dir)?;
            if args.config.is_initial_leader() {
                let mut leader_state = RestartLeaderState::new(&args.config, saved, state);
                let mut view = leader_state.await_quorum(
                    &listener,
                    &args.registry,
                    args.allocator.as_ref(),
                    &params,
                )?;
                let state = leader_state.into_state();
                let (settings, nrs) = run_allocator(
                    &args.registry,
                    args.allocator.as_ref(),
                    None,
                    &mut view,
                )?;
                restart_state = Some(state);
                (view, settings, nrs)
            } else {
                let (view, leader_params, settings, nrs, state, _leaders) =
                    join_existing_group(&args.config, Some((&saved, &state)))?;
                params = leader_params.normalized();
                restart_state = state;
                (view, settings, nrs)
            }
        } else if args.config.is_initial_leader() {
            await_first_view(&args.config, &params, &args.registry, args.allocator.as_ref(), &listener)?
        } else {
            let (view, leader_params, settings, nrs, _state, _leaders) =
                join_existing_group(&args.config, None)?;
            params = leader_params.normalized();
            (view, settings, nrs)
        };

        view.my_rank = view
            .rank_of(args.config.local_id)
            .context("initial view does not contain this node")?;
        if any_persistent {
            view.save(&args.config.data_dir)?;
        }

        let inner = Arc::new(VmInner {
            config: args.config,
            params,
            registry: args.registry,
            allocator: args.allocator,
            callbacks: args.callbacks,
            bridge: args.bridge,
            any_persistent,
            mesh: args.mesh,
            bulk: args.bulk,
            view_upcalls: Mutex::new(args.view_upcalls),
            rpc_callback: Mutex::new(None),
            curr: RwLock::new(None),
            pending_install: Mutex::new(None),
            last_suspected: Mutex::new(vec![false; view.num_members()]),
            handles: Mutex::new(ProtocolHandles::default()),
            pending_joins: Mutex::new(VecDeque::new()),
            proposed_joins: Mutex::new(VecDeque::new()),
            old_views: Mutex::new(VecDeque::new()),
            old_views_cv: Condvar::new(),
            install_epoch: Mutex::new(0),
            install_cv: Condvar::new(),
            restart_state: Mutex::new(restart_state),
            fatal: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            upcall_generation: AtomicU64::new(0),
        });

        // Hook durable-version reports back into the local row.
        {
            let weak = Arc::downgrade(&inner);
            inner.bridge.set_persisted_publisher(Arc::new(move |sid, version| {
                if let Some(vm) = weak.upgrade() {
                    vm.report_persisted(sid, version);
                }
            }));
        }

        let runtime = VmInner::build_runtime(&inner, view, settings, num_received_size, None)?;
        *inner.curr.write().unwrap() = Some(Arc::clone(&runtime));

        runtime.sst.put();
        runtime.sst.sync_with_members(None);

        // A node joining an established group copies the leader's standing
        // proposal counters so it does not mistake them for a fresh change.
        // The barrier above guarantees the leader's row has arrived.
        if runtime.view.vid != 0 && !runtime.i_am_leader() {
            let leader_rank = runtime.leader_rank();
            let (changes, endpoints, num_changes, num_acked, num_committed, num_installed) = {
                let leader_row = runtime.sst.row(leader_rank);
                (
                    leader_row.changes.clone(),
                    leader_row.joiner_endpoints.clone(),
                    leader_row.num_changes,
                    leader_row.num_acked,
                    leader_row.num_committed,
                    leader_row.num_installed,
                )
            };
            runtime.sst.update(|row| {
                row.changes = changes;
                row.joiner_endpoints = endpoints;
                row.num_changes = num_changes;
                row.num_acked = num_acked;
                row.num_committed = num_committed;
                row.num_installed = num_installed;
            });
            runtime.sst.put();
        }

        VmInner::create_threads(&inner, listener)?;
        VmInner::register_predicates(&inner, &runtime, true);
        inner.make_replicas_if_new(&runtime);
        inner.fire_view_upcalls(&runtime.view);
        VmInner::send_logs_if_total_restart(&inner, &runtime);
        Ok(Self { inner })
    }

    /// Completes restart bookkeeping (persisting trims, truncating logs)
    /// and starts predicate evaluation.
    pub fn begin(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        let state = inner.restart_state.lock().unwrap().take();
        if let Some(state) = state {
            for trims in state.logged_ragged_trim.values() {
                for trim in trims.values() {
                    trim.save(&inner.config.data_dir)?;
                }
            }
            if let Some(runtime) = inner.current() {
                for (subgroup_id, shard_num) in &runtime.view.my_subgroups {
                    if let Some(trim) = state.trim_for(*subgroup_id, *shard_num) {
                        inner
                            .bridge
                            .truncate(*subgroup_id, trim.latest_version())
                            .context("truncate version log to ragged trim")?;
                    }
                }
            }
        }
        if let Some(runtime) = inner.current() {
            runtime.sst.start_predicate_evaluation();
        }
        Ok(())
    }

    pub fn current(&self) -> Option<Arc<ViewRuntime>> {
        self.inner.current()
    }

    pub fn fatal_error(&self) -> Option<GroupError> {
        self.inner
            .fatal
            .lock()
            .unwrap()
            .as_ref()
            .map(describe_fatal)
    }

    pub fn register_rpc_callback(&self, handler: RpcHandler) {
        *self.inner.rpc_callback.lock().unwrap() = Some(handler.clone());
        if let Some(runtime) = self.inner.current() {
            runtime.group.register_rpc_callback(handler);
        }
    }

    pub fn add_view_upcall(&self, upcall: ViewUpcall) {
        self.inner.view_upcalls.lock().unwrap().push(upcall);
    }

    /// Blocks until the current install epoch advances past `seen`, or the
    /// timeout expires. Used by senders to wait out a view change.
    pub fn wait_for_install(&self, seen: u64, timeout: Duration) -> u64 {
        let inner = &self.inner;
        let mut epoch = inner.install_epoch.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while *epoch <= seen && !inner.shutdown.load(Ordering::Acquire) {
            let now = std::time::Instant::now();
            if now >= deadline {
                break;
            }
            let (next, _) = inner.install_cv.wait_timeout(epoch, deadline - now).unwrap();
            epoch = next;
        }
        *epoch
    }

    pub fn install_epoch(&self) -> u64 {
        *self.inner.install_epoch.lock().unwrap()
    }

    /// Reports a locally detected failure of `who`, as the liveness layer's
    /// entry point into the protocol.
    pub fn report_failure(&self, who: NodeId) {
        self.inner.report_failure(who);
    }

    /// Abruptly halts this member without announcing departure, the way a
    /// crash would: no clean-leave flag, no final row push. Peers keep the
    /// member's last-seen row until their failure detectors react. Used for
    /// failure injection and restart testing.
    pub fn crash(&self) {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = inner.current() {
            runtime.group.wedge();
            runtime.sst.predicates().clear();
            runtime.sst.predicates().stop();
        }
        inner.unblock_and_join_threads();
        inner.install_cv.notify_all();
    }

    /// Cleanly departs the group: wedge, drop the predicates, raise the
    /// clean-leave flag, and shut down the machinery.
    pub fn leave(&self) {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = inner.current() {
            tracing::debug!("leaving the group cleanly");
            runtime.group.wedge();
            runtime.sst.predicates().clear();
            let my_rank = runtime.view.my_rank;
            runtime.sst.update(|row| {
                row.suspected[my_rank] = true;
                row.rip = true;
            });
            runtime.sst.put_with_completion();
            runtime.sst.predicates().stop();
        }
        inner.unblock_and_join_threads();
        inner.install_cv.notify_all();
    }
}

impl Drop for ViewManager {
    fn drop(&mut self) {
        self.leave();
    }
}

fn describe_fatal(err: &GroupError) -> GroupError {
    match err {
        GroupError::PartitionDetected => GroupError::PartitionDetected,
        GroupError::PendingChangesOverflow => GroupError::PendingChangesOverflow,
        other => GroupError::RemoteException(other.to_string()),
    }
}

/* ---- initial view acquisition ---- */

/// Leader bootstrap: accept joins on the membership socket until the
/// subgroup allocator accepts the view, then ship it to every waiting
/// joiner.
fn await_first_view(
    config: &GroupConfig,
    params: &GroupParams,
    registry: &SubgroupRegistry,
    allocator: &dyn SubgroupAllocator,
    listener: &TcpListener,
) -> anyhow::Result<(View, BTreeMap<SubgroupId, SubgroupSettings>, usize)> {
    let my_endpoints = MemberEndpoints {
        ip: config.local_ip.clone(),
        gms_port: config.gms_port,
        rpc_port: config.rpc_port,
        sst_port: config.sst_port,
        bulk_port: config.bulk_port,
    };
    let mut view = View::new(
        0,
        vec![config.local_id],
        vec![my_endpoints],
        vec![false],
        Vec::new(),
        Vec::new(),
        0,
        0,
    );
    let mut waiting: Vec<(NodeId, TcpStream)> = Vec::new();
    let (mut settings, mut num_received_size) =
        run_allocator(registry, allocator, None, &mut view)?;

    loop {
        while !view.is_adequately_provisioned {
            let (mut stream, peer) = listener.accept().context("accept bootstrap joiner")?;
            let _ = stream.set_nodelay(true);
            let joiner_id = membership::read_u32(&mut stream)?;
            if view.rank_of(joiner_id).is_some() {
                let _ = membership::write_join_response(
                    &mut stream,
                    JoinResponse {
                        code: JoinResponseCode::IdInUse,
                        leader_id: config.local_id,
                    },
                );
                continue;
            }
            membership::write_join_response(
                &mut stream,
                JoinResponse {
                    code: JoinResponseCode::Ok,
                    leader_id: config.local_id,
                },
            )?;
            let ports: JoinerPorts = membership::read_joiner_ports(&mut stream)?;
            view.members.push(joiner_id);
            view.member_endpoints.push(MemberEndpoints {
                ip: peer.ip().to_string(),
                gms_port: ports.gms_port,
                rpc_port: ports.rpc_port,
                sst_port: ports.sst_port,
                bulk_port: ports.bulk_port,
            });
            view.failed.push(false);
            view.joined.push(joiner_id);
            waiting.push((joiner_id, stream));
            tracing::debug!(joiner_id, "bootstrap joiner connected");
            let (s, n) = run_allocator(registry, allocator, None, &mut view)?;
            settings = s;
            num_received_size = n;
        }

        // Ship the candidate view; a joiner dying here shrinks the view and
        // starts the adequacy check over.
        let mut failed_joiner: Option<NodeId> = None;
        for (joiner_id, stream) in waiting.iter_mut() {
            if membership::write_view_and_params(stream, &view, params).is_err() {
                failed_joiner = Some(*joiner_id);
                break;
            }
        }
        match failed_joiner {
            None => {
                for (_, stream) in waiting.iter_mut() {
                    let _ = membership::write_bool(stream, true);
                    let _ = membership::write_shard_leaders(stream, &[]);
                }
                tracing::info!(view = %view.debug_string(), "decided on the initial view");
                return Ok((view, settings, num_received_size));
            }
            Some(failed_id) => {
                tracing::info!(
                    node = failed_id,
                    "joiner failed after contacting the leader; removing it from the initial view"
                );
                for (_, stream) in waiting.iter_mut() {
                    let _ = membership::write_bool(stream, false);
                }
                let rank = view.rank_of(failed_id).expect("joiner was appended");
                view.members.remove(rank);
                view.member_endpoints.remove(rank);
                view.failed.remove(rank);
                view.joined.retain(|id| *id != failed_id);
                waiting.retain(|(id, _)| *id != failed_id);
                let (s, n) = run_allocator(registry, allocator, None, &mut view)?;
                settings = s;
                num_received_size = n;
            }
        }
    }
}

type JoinOutcome = (
    View,
    GroupParams,
    BTreeMap<SubgroupId, SubgroupSettings>,
    usize,
    Option<RestartState>,
    Vec<Vec<i64>>,
);

/// Joiner bootstrap: dial the leader (following redirects), run the
/// handshake, and wait for a confirmed view.
fn join_existing_group(
    config: &GroupConfig,
    restart: Option<(&View, &RestartState)>,
) -> anyhow::Result<JoinOutcome> {
    let mut conn = membership::connect_to_leader(config)?;
    let mut restart_state = None;
    if conn.total_restart {
        let (saved_view, state) = restart
            .context("leader is in total-restart mode but this node has no saved state")?;
        tracing::debug!(vid = saved_view.vid, "sending saved view and trims to the restart leader");
        restart::send_restart_logs(&mut conn.stream, saved_view, state)?;
        restart_state = Some(RestartState::default());
    }
    membership::write_joiner_ports(
        &mut conn.stream,
        JoinerPorts {
            gms_port: config.gms_port,
            rpc_port: config.rpc_port,
            sst_port: config.sst_port,
            bulk_port: config.bulk_port,
        },
    )?;

    let (mut view, params) = loop {
        let (view, params) = membership::read_view_and_params(&mut conn.stream)
            .context("leader crashed before sending the initial view")?;
        if let Some(state) = restart_state.as_mut() {
            let trims = membership::read_ragged_trims(&mut conn.stream)?;
            *state = RestartState::default();
            state.absorb(trims);
        }
        let confirmed = membership::read_bool(&mut conn.stream)?;
        tracing::debug!(vid = view.vid, confirmed, "received candidate view from leader");
        if confirmed {
            break (view, params);
        }
    };
    let shard_leaders = membership::read_shard_leaders(&mut conn.stream)?;
    if let Some(state) = restart_state.as_mut() {
        state.restart_shard_leaders = shard_leaders.clone();
    }
    view.my_rank = view
        .rank_of(config.local_id)
        .context("confirmed view does not include this node")?;
    let (settings, num_received_size) = derive_subgroup_settings(&mut view);
    Ok((
        view,
        params,
        settings,
        num_received_size,
        restart_state,
        shard_leaders,
    ))
}

/* ---- the protocol proper ---- */

impl VmInner {
    pub(crate) fn current(&self) -> Option<Arc<ViewRuntime>> {
        self.curr.read().unwrap().clone()
    }

    fn fatal(&self, err: GroupError) {
        tracing::error!(error = %err, "fatal group error; shutting down the local node");
        *self.fatal.lock().unwrap() = Some(err);
        if let Some(runtime) = self.current() {
            runtime.group.wedge();
            runtime.sst.predicates().clear();
            runtime.sst.predicates().stop();
        }
        self.shutdown.store(true, Ordering::Release);
        self.install_cv.notify_all();
    }

    fn report_persisted(&self, subgroup_id: SubgroupId, version: crate::persistence::Version) {
        let Some(runtime) = self.current() else {
            return;
        };
        let advanced = runtime.sst.update(|row| {
            let slot = &mut row.persisted_num[subgroup_id as usize];
            if version > *slot {
                *slot = version;
                true
            } else {
                false
            }
        });
        if advanced {
            runtime.sst.put();
            if let Some(cb) = &self.callbacks.local_persistence {
                cb(subgroup_id, version);
            }
        }
    }

    fn report_failure(&self, who: NodeId) {
        let Some(runtime) = self.current() else {
            return;
        };
        let Some(rank) = runtime.view.rank_of(who) else {
            return;
        };
        runtime.sst.update(|row| row.suspected[rank] = true);
        // Quantitative partition check: counting rip'd members as departed.
        let (num_suspected, num_rip) = {
            let row = runtime.sst.row(runtime.view.my_rank);
            let mut rip = 0;
            for r in 0..runtime.view.num_members() {
                if runtime.sst.row(r).rip {
                    rip += 1;
                }
            }
            (row.suspected.iter().filter(|s| **s).count(), rip)
        };
        let my_rip = runtime.sst.row(runtime.view.my_rank).rip;
        if !my_rip && runtime.view.in_minority(num_suspected, num_rip) {
            self.fatal(GroupError::PartitionDetected);
            return;
        }
        runtime.sst.put();
    }

    fn build_runtime(
        inner: &Arc<Self>,
        view: View,
        settings: BTreeMap<SubgroupId, SubgroupSettings>,
        num_received_size: usize,
        prev: Option<&ViewRuntime>,
    ) -> anyhow::Result<Arc<ViewRuntime>> {
        let dims = RowDims {
            num_members: view.num_members(),
            num_subgroups: view.subgroup_shard_views.len(),
            num_received_size,
            window_size: inner.params.window_size,
            slot_bytes: inner.params.max_smc_payload_size + HEADER_LEN,
        };
        let mut row = GroupRow::new(dims);
        row.vid = view.vid;
        if let Some(prev_runtime) = prev {
            // Carry the proposal counters across the install, consuming the
            // changes this view applied.
            let installed = (view.joined.len() + view.departed.len()) as u32;
            let old_row = prev_runtime.sst.row(prev_runtime.view.my_rank);
            row.num_changes = old_row.num_changes;
            row.num_acked = old_row.num_acked;
            row.num_committed = old_row.num_committed;
            row.num_installed = old_row.num_installed + installed;
            let shift = installed as usize;
            let live = (old_row.num_changes - old_row.num_installed) as usize;
            for i in 0..live.saturating_sub(shift).min(MAX_CHANGES) {
                row.changes[i] = old_row.changes[i + shift];
                row.joiner_endpoints[i] = old_row.joiner_endpoints[i + shift].clone();
            }
        }
        let sst: GroupSst = Sst::new(
            view.members.clone(),
            view.my_rank,
            row,
            Arc::clone(&inner.mesh),
        );
        let post_next_version: PostNextVersion = {
            let weak: Weak<VmInner> = Arc::downgrade(inner);
            Arc::new(move |sid, version, ts| {
                let _ = (&weak, sid, version, ts);
                // Replicated-object version posting is observed through the
                // persistence bridge; nothing further to do here.
            })
        };
        let group = MulticastGroup::new(
            sst.clone(),
            view.vid,
            &inner.params,
            view.subgroup_shard_views.len(),
            settings.clone(),
            inner.callbacks.clone(),
            post_next_version,
            Arc::clone(&inner.bridge),
            inner.any_persistent,
            Arc::clone(&inner.bulk),
            prev.map(|p| &p.group),
            &view.failed,
        )?;
        if let Some(handler) = inner.rpc_callback.lock().unwrap().clone() {
            group.register_rpc_callback(handler);
        }
        let failed = view.failed.clone();
        Ok(Arc::new(ViewRuntime {
            view,
            failed: Mutex::new(failed),
            sst,
            group,
            settings,
            num_received_size,
        }))
    }

    fn create_threads(inner: &Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let mut threads = inner.threads.lock().unwrap();

        let weak = Arc::downgrade(inner);
        threads.push(
            std::thread::Builder::new()
                .name("gms-listener".to_string())
                .spawn(move || {
                    while let Ok((stream, _peer)) = listener.accept() {
                        let Some(vm) = weak.upgrade() else {
                            break;
                        };
                        if vm.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        let _ = stream.set_nodelay(true);
                        vm.pending_joins.lock().unwrap().push_back(stream);
                    }
                    tracing::debug!("membership listener thread shutting down");
                })
                .context("spawn gms-listener thread")?,
        );

        let weak = Arc::downgrade(inner);
        threads.push(
            std::thread::Builder::new()
                .name("old-view-cleaner".to_string())
                .spawn(move || {
                    loop {
                        let Some(vm) = weak.upgrade() else {
                            break;
                        };
                        let mut old = vm.old_views.lock().unwrap();
                        while old.is_empty() && !vm.shutdown.load(Ordering::Acquire) {
                            let (next, timeout) = vm
                                .old_views_cv
                                .wait_timeout(old, Duration::from_millis(200))
                                .unwrap();
                            old = next;
                            if timeout.timed_out() {
                                break;
                            }
                        }
                        if vm.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        // Dropping outside the predicate thread keeps large
                        // buffer teardown off the delivery path.
                        let retired = old.pop_front();
                        drop(old);
                        drop(vm);
                        drop(retired);
                    }
                    tracing::debug!("old-view cleaner thread shutting down");
                })
                .context("spawn old-view-cleaner thread")?,
        );

        // State-transfer listener: shard leaders push replica state for
        // joiners and restarting members here.
        let state_listener = TcpListener::bind((
            inner.config.local_ip.as_str(),
            inner.config.rpc_port,
        ))
        .with_context(|| format!("bind state listener on rpc port {}", inner.config.rpc_port))?;
        let weak = Arc::downgrade(inner);
        threads.push(
            std::thread::Builder::new()
                .name("state-receiver".to_string())
                .spawn(move || {
                    while let Ok((mut stream, _peer)) = state_listener.accept() {
                        let Some(vm) = weak.upgrade() else {
                            break;
                        };
                        if vm.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        if let Err(err) = vm.receive_shipped_state(&mut stream) {
                            tracing::warn!(error = ?err, "failed to receive shipped replica state");
                        }
                    }
                    tracing::debug!("state receiver thread shutting down");
                })
                .context("spawn state-receiver thread")?,
        );
        Ok(())
    }

    fn receive_shipped_state(&self, stream: &mut TcpStream) -> anyhow::Result<()> {
        let subgroup_id = membership::read_u32(stream)?;
        let payload = membership::read_blob(stream)?;
        let Some(runtime) = self.current() else {
            return Ok(());
        };
        let type_id = runtime
            .view
            .subgroup_ids_by_type_id
            .iter()
            .position(|ids| ids.contains(&subgroup_id))
            .context("shipped state for unknown subgroup")?;
        let entry = self
            .registry
            .entry(type_id as SubgroupTypeId)
            .context("shipped state for unregistered type")?;
        (entry.deserialize_state)(subgroup_id, &payload)?;
        tracing::debug!(subgroup_id, bytes = payload.len(), "installed shipped replica state");
        Ok(())
    }

    fn ship_state(&self, subgroup_id: SubgroupId, target: &MemberEndpoints) -> anyhow::Result<()> {
        let runtime = self.current().context("no current view")?;
        let type_id = runtime
            .view
            .subgroup_ids_by_type_id
            .iter()
            .position(|ids| ids.contains(&subgroup_id))
            .context("shipping state for unknown subgroup")?;
        let entry = self
            .registry
            .entry(type_id as SubgroupTypeId)
            .context("shipping state for unregistered type")?;
        let payload = (entry.serialize_state)(subgroup_id)?;
        // The receiver may still be binding its listener; retry briefly.
        let mut stream = None;
        for _ in 0..50 {
            match TcpStream::connect((target.ip.as_str(), target.rpc_port)) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(_) => std::thread::sleep(Duration::from_millis(100)),
            }
        }
        let mut stream = stream.context("dial state receiver")?;
        membership::write_u32(&mut stream, subgroup_id)?;
        membership::write_blob(&mut stream, &payload)?;
        Ok(())
    }

    fn send_logs_if_total_restart(inner: &Arc<Self>, runtime: &ViewRuntime) {
        let leaders = {
            let state = inner.restart_state.lock().unwrap();
            match state.as_ref() {
                Some(state) => state.restart_shard_leaders.clone(),
                None => return,
            }
        };
        let my_id = inner.config.local_id;
        for (subgroup_id, shards) in leaders.iter().enumerate() {
            for (shard_num, leader) in shards.iter().enumerate() {
                if *leader != my_id as i64 {
                    continue;
                }
                let shard = &runtime.view.subgroup_shard_views[subgroup_id][shard_num];
                for member in &shard.members {
                    if *member == my_id {
                        continue;
                    }
                    let Some(rank) = runtime.view.rank_of(*member) else {
                        continue;
                    };
                    let target = runtime.view.member_endpoints[rank].clone();
                    if let Err(err) = inner.ship_state(subgroup_id as SubgroupId, &target) {
                        tracing::warn!(
                            error = ?err,
                            subgroup_id,
                            member,
                            "failed to ship restart replica state"
                        );
                    }
                }
            }
        }
    }

    fn fire_view_upcalls(&self, view: &View) {
        self.upcall_generation.fetch_add(1, Ordering::Relaxed);
        for upcall in self.view_upcalls.lock().unwrap().iter() {
            upcall(view);
        }
    }

    /// Constructs local replica objects for the subgroups this node has
    /// just become a member of.
    fn make_replicas_if_new(&self, runtime: &ViewRuntime) {
        let me = self.config.local_id;
        if runtime.view.vid != 0 && !runtime.view.joined.contains(&me) {
            return;
        }
        for subgroup_id in runtime.view.my_subgroups.keys() {
            let Some(type_id) = runtime
                .view
                .subgroup_ids_by_type_id
                .iter()
                .position(|ids| ids.contains(subgroup_id))
            else {
                continue;
            };
            if let Some(entry) = self.registry.entry(type_id as SubgroupTypeId) {
                (entry.make_replica)(*subgroup_id);
            }
        }
    }

    /* ---- predicate registration ---- */

    fn register_predicates(inner: &Arc<Self>, runtime: &ViewRuntime, with_terminator: bool) {
        let mut handles = inner.handles.lock().unwrap();
        let predicates = runtime.sst.predicates();

        // 1. A suspicion we have not yet acted on.
        let weak = Arc::downgrade(inner);
        let pred_weak = Arc::downgrade(inner);
        handles.all.push(predicates.insert(
            move |sst| {
                let Some(vm) = pred_weak.upgrade() else {
                    return false;
                };
                let last = vm.last_suspected.lock().unwrap();
                for r in 0..sst.num_rows() {
                    let row = sst.row(r);
                    for (who, suspected) in row.suspected.iter().enumerate() {
                        if *suspected && !last.get(who).copied().unwrap_or(true) {
                            return true;
                        }
                    }
                }
                false
            },
            move |_sst| {
                if let Some(vm) = weak.upgrade() {
                    vm.new_suspicion();
                }
            },
            PredicateMode::Recurrent,
        ));

        // 2. Leader accepts a pending join connection.
        let weak = Arc::downgrade(inner);
        let pred_weak = Arc::downgrade(inner);
        handles.all.push(predicates.insert(
            move |_sst| {
                pred_weak
                    .upgrade()
                    .map(|vm| {
                        vm.current()
                            .map(|rt| rt.i_am_leader())
                            .unwrap_or(false)
                            && !vm.pending_joins.lock().unwrap().is_empty()
                    })
                    .unwrap_or(false)
            },
            move |_sst| {
                if let Some(vm) = weak.upgrade() {
                    vm.leader_start_join();
                }
            },
            PredicateMode::Recurrent,
        ));

        // 3. Non-leader redirects join attempts to the leader.
        let weak = Arc::downgrade(inner);
        let pred_weak = Arc::downgrade(inner);
        handles.all.push(predicates.insert(
            move |_sst| {
                pred_weak
                    .upgrade()
                    .map(|vm| {
                        vm.current()
                            .map(|rt| !rt.i_am_leader())
                            .unwrap_or(false)
                            && !vm.pending_joins.lock().unwrap().is_empty()
                    })
                    .unwrap_or(false)
            },
            move |_sst| {
                if let Some(vm) = weak.upgrade() {
                    vm.redirect_join_attempt();
                }
            },
            PredicateMode::Recurrent,
        ));

        // 4. Leader commits once every live member acknowledged.
        let weak = Arc::downgrade(inner);
        let pred_weak = Arc::downgrade(inner);
        handles.all.push(predicates.insert(
            move |sst| {
                let Some(vm) = pred_weak.upgrade() else {
                    return false;
                };
                let Some(rt) = vm.current() else {
                    return false;
                };
                rt.i_am_leader()
                    && min_acked(sst, &rt.failed_snapshot())
                        > sst.row(sst.my_rank()).num_committed
            },
            move |_sst| {
                if let Some(vm) = weak.upgrade() {
                    vm.leader_commit_change();
                }
            },
            PredicateMode::Recurrent,
        ));

        // 5. Followers acknowledge newly proposed changes.
        let weak = Arc::downgrade(inner);
        let pred_weak = Arc::downgrade(inner);
        handles.all.push(predicates.insert(
            move |sst| {
                let Some(vm) = pred_weak.upgrade() else {
                    return false;
                };
                let Some(rt) = vm.current() else {
                    return false;
                };
                sst.row(rt.leader_rank()).num_changes > sst.row(sst.my_rank()).num_acked
            },
            move |_sst| {
                if let Some(vm) = weak.upgrade() {
                    vm.acknowledge_proposed_change();
                }
            },
            PredicateMode::Recurrent,
        ));

        // 6. A committed change this node has not installed starts the
        //    epoch-termination machinery (one-shot).
        if with_terminator {
            let weak = Arc::downgrade(inner);
            let pred_weak = Arc::downgrade(inner);
            handles.all.push(predicates.insert(
                move |sst| {
                    let Some(vm) = pred_weak.upgrade() else {
                        return false;
                    };
                    let Some(rt) = vm.current() else {
                        return false;
                    };
                    sst.row(rt.leader_rank()).num_committed
                        > sst.row(sst.my_rank()).num_installed
                },
                move |_sst| {
                    if let Some(vm) = weak.upgrade() {
                        vm.start_meta_wedge();
                    }
                },
                PredicateMode::OneShot,
            ));
        }
    }

    /* ---- protocol triggers ---- */

    fn new_suspicion(self: &Arc<Self>) {
        let Some(runtime) = self.current() else {
            return;
        };
        let sst = &runtime.sst;
        let n = runtime.view.num_members();
        // Fold every row's suspicions into the local row and count clean
        // leavers, whose departure does not count against the majority.
        let mut aggregated = vec![false; n];
        let mut num_rip = 0usize;
        for r in 0..n {
            let row = sst.row(r);
            if row.rip {
                num_rip += 1;
            }
            for (who, suspected) in row.suspected.iter().enumerate() {
                if *suspected {
                    aggregated[who] = true;
                }
            }
        }
        sst.update(|row| {
            for (who, suspected) in aggregated.iter().enumerate() {
                if *suspected {
                    row.suspected[who] = true;
                }
            }
        });

        let my_rip = sst.row(runtime.view.my_rank).rip;
        let newly_suspected: Vec<usize> = {
            let last = self.last_suspected.lock().unwrap();
            aggregated
                .iter()
                .enumerate()
                .filter(|(who, s)| **s && !last.get(*who).copied().unwrap_or(false))
                .map(|(who, _)| who)
                .collect()
        };
        for q in newly_suspected {
            {
                let mut last = self.last_suspected.lock().unwrap();
                last[q] = true;
            }
            let node_q = runtime.view.members[q];
            tracing::debug!(node = node_q, "marking suspected member failed");
            let num_failed = {
                let mut failed = runtime.failed.lock().unwrap();
                if !failed[q] {
                    failed[q] = true;
                }
                failed.iter().filter(|f| **f).count()
            };
            if !my_rip && runtime.view.in_minority(num_failed, num_rip) {
                self.fatal(GroupError::PartitionDetected);
                return;
            }
            sst.freeze(q);
            runtime.wedge();
            sst.put();

            if runtime.i_am_leader() && !self.changes_contain(&runtime, node_q) {
                let overflow = sst.update(|row| {
                    let next_change = (row.num_changes - row.num_installed) as usize;
                    if next_change >= MAX_CHANGES {
                        return true;
                    }
                    row.changes[next_change] = node_q;
                    row.num_changes += 1;
                    false
                });
                if overflow {
                    self.fatal(GroupError::PendingChangesOverflow);
                    return;
                }
                tracing::debug!(node = node_q, "leader proposed removing the failed member");
                sst.put();
            }
        }
    }

    fn changes_contain(&self, runtime: &ViewRuntime, q: NodeId) -> bool {
        let row = runtime.sst.row(runtime.view.my_rank);
        let live = (row.num_changes - row.num_installed) as usize;
        row.changes[..live.min(MAX_CHANGES)].contains(&q)
    }

    fn leader_start_join(self: &Arc<Self>) {
        let Some(stream) = self.pending_joins.lock().unwrap().pop_front() else {
            return;
        };
        if let Err(err) = self.receive_join(stream) {
            tracing::warn!(error = ?err, "join attempt failed");
        }
    }

    fn receive_join(self: &Arc<Self>, mut stream: TcpStream) -> anyhow::Result<()> {
        let Some(runtime) = self.current() else {
            return Ok(());
        };
        let sst = &runtime.sst;
        {
            let row = sst.row(runtime.view.my_rank);
            if (row.num_changes - row.num_committed) as usize == MAX_CHANGES {
                self.fatal(GroupError::PendingChangesOverflow);
                anyhow::bail!("pending changes window is full");
            }
        }
        let joiner_id = membership::read_u32(&mut stream)?;
        if runtime.view.rank_of(joiner_id).is_some() {
            tracing::warn!(joiner_id, "join refused: node id already in the view");
            membership::write_join_response(
                &mut stream,
                JoinResponse {
                    code: JoinResponseCode::IdInUse,
                    leader_id: self.config.local_id,
                },
            )?;
            return Ok(());
        }
        membership::write_join_response(
            &mut stream,
            JoinResponse {
                code: JoinResponseCode::Ok,
                leader_id: self.config.local_id,
            },
        )?;
        let ports = membership::read_joiner_ports(&mut stream)?;
        let joiner_ip = stream
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default();
        tracing::debug!(joiner_id, ip = %joiner_ip, "leader proposing join");
        sst.update(|row| {
            let next_change = (row.num_changes - row.num_installed) as usize;
            row.changes[next_change] = joiner_id;
            row.joiner_endpoints[next_change] = MemberEndpoints {
                ip: joiner_ip.clone(),
                gms_port: ports.gms_port,
                rpc_port: ports.rpc_port,
                sst_port: ports.sst_port,
                bulk_port: ports.bulk_port,
            };
            row.num_changes += 1;
        });
        runtime.wedge();
        sst.put();
        self.proposed_joins
            .lock()
            .unwrap()
            .push_back((joiner_id, stream));
        Ok(())
    }

    fn redirect_join_attempt(self: &Arc<Self>) {
        let Some(mut stream) = self.pending_joins.lock().unwrap().pop_front() else {
            return;
        };
        let Some(runtime) = self.current() else {
            return;
        };
        let leader_rank = runtime.leader_rank();
        let leader = &runtime.view.member_endpoints[leader_rank];
        let _ = membership::read_u32(&mut stream);
        if let Err(err) = membership::write_redirect(
            &mut stream,
            self.config.local_id,
            &leader.ip,
            leader.gms_port,
        ) {
            tracing::debug!(error = ?err, "failed to send join redirect");
        }
    }

    fn leader_commit_change(self: &Arc<Self>) {
        let Some(runtime) = self.current() else {
            return;
        };
        let committed = min_acked(&runtime.sst, &runtime.failed_snapshot());
        tracing::debug!(committed, "leader committing change proposals");
        runtime.sst.update(|row| row.num_committed = committed);
        runtime.sst.put();
    }

    fn acknowledge_proposed_change(self: &Arc<Self>) {
        let Some(runtime) = self.current() else {
            return;
        };
        let sst = &runtime.sst;
        let leader_rank = runtime.leader_rank();
        if leader_rank != runtime.view.my_rank {
            let (changes, endpoints, num_changes, num_committed) = {
                let leader_row = sst.row(leader_rank);
                (
                    leader_row.changes.clone(),
                    leader_row.joiner_endpoints.clone(),
                    leader_row.num_changes,
                    leader_row.num_committed,
                )
            };
            tracing::debug!(num_changes, "acknowledging leader change proposal");
            sst.update(|row| {
                row.changes = changes;
                row.joiner_endpoints = endpoints;
                row.num_changes = num_changes;
                row.num_committed = num_committed;
            });
        }
        sst.update(|row| row.num_acked = row.num_changes);
        sst.put();
        runtime.wedge();
    }

    fn start_meta_wedge(self: &Arc<Self>) {
        let Some(runtime) = self.current() else {
            return;
        };
        tracing::debug!(vid = runtime.view.vid, "meta-wedging the current view");
        // Only suspicion tracking stays live during epoch termination.
        self.handles.lock().unwrap().cancel_all();
        Self::register_suspicion_only(self, &runtime);
        runtime.wedge();

        let weak = Arc::downgrade(self);
        let pred_weak = Arc::downgrade(self);
        runtime.sst.predicates().insert(
            move |sst| {
                let Some(vm) = pred_weak.upgrade() else {
                    return false;
                };
                let Some(rt) = vm.current() else {
                    return false;
                };
                let failed = rt.failed_snapshot();
                (0..sst.num_rows()).all(|r| failed[r] || sst.row(r).wedged)
            },
            move |_sst| {
                if let Some(vm) = weak.upgrade() {
                    vm.terminate_epoch(true);
                }
            },
            PredicateMode::OneShot,
        );
    }

    /// Re-registers the suspicion predicate alone, for the window between
    /// meta-wedge and install.
    fn register_suspicion_only(inner: &Arc<Self>, runtime: &ViewRuntime) {
        let mut handles = inner.handles.lock().unwrap();
        let weak = Arc::downgrade(inner);
        let pred_weak = Arc::downgrade(inner);
        handles.all.push(runtime.sst.predicates().insert(
            move |sst| {
                let Some(vm) = pred_weak.upgrade() else {
                    return false;
                };
                let last = vm.last_suspected.lock().unwrap();
                for r in 0..sst.num_rows() {
                    let row = sst.row(r);
                    for (who, suspected) in row.suspected.iter().enumerate() {
                        if *suspected && !last.get(who).copied().unwrap_or(true) {
                            return true;
                        }
                    }
                }
                false
            },
            move |_sst| {
                if let Some(vm) = weak.upgrade() {
                    vm.new_suspicion();
                }
            },
            PredicateMode::Recurrent,
        ));
    }

    fn terminate_epoch(self: &Arc<Self>, first_call: bool) {
        let Some(runtime) = self.current() else {
            return;
        };
        tracing::debug!(vid = runtime.view.vid, "meta-wedged; terminating the epoch");
        let mut next_view = match self.make_next_view(&runtime) {
            Ok(view) => view,
            Err(err) => {
                self.fatal(err);
                return;
            }
        };
        let allocation = run_allocator(
            &self.registry,
            self.allocator.as_ref(),
            Some(&runtime.view),
            &mut next_view,
        );
        let (next_settings, next_num_received_size) = match allocation {
            Ok(result) => result,
            Err(err) => {
                self.fatal(err);
                return;
            }
        };
        if !next_view.is_adequately_provisioned {
            tracing::debug!(
                vid = next_view.vid,
                "next view would not be adequately provisioned; waiting for more joins"
            );
            if first_call {
                // Joins must keep flowing while we wait.
                Self::register_predicates(self, &runtime, false);
            }
            let committed_seen = runtime.sst.row(runtime.leader_rank()).num_committed;
            let weak = Arc::downgrade(self);
            let pred_weak = Arc::downgrade(self);
            runtime.sst.predicates().insert(
                move |sst| {
                    let Some(vm) = pred_weak.upgrade() else {
                        return false;
                    };
                    let Some(rt) = vm.current() else {
                        return false;
                    };
                    sst.row(rt.leader_rank()).num_committed > committed_seen
                },
                move |_sst| {
                    if let Some(vm) = weak.upgrade() {
                        vm.terminate_epoch(false);
                    }
                },
                PredicateMode::OneShot,
            );
            return;
        }

        // Drain the small-message rings so the final counters are complete
        // and identical everywhere.
        for (sid, _sub) in &runtime.settings {
            runtime.sst.put_with_completion();
            let shard_ranks = runtime.group.shard_sst_ranks(*sid);
            runtime.sst.sync_with_members(Some(&shard_ranks));
            runtime.group.drain_slot_receives(*sid);
        }
        runtime.sst.put_with_completion();
        runtime.sst.sync_with_members(None);

        *self.pending_install.lock().unwrap() = Some(PendingInstall {
            next_view,
            next_settings,
            next_num_received_size,
        });

        // Ragged-edge cleanup: shard leaders first, followers echo.
        let mut follower_shards: Vec<(SubgroupId, usize)> = Vec::new();
        for (sid, sub) in &runtime.settings {
            if sub.num_senders() == 0 {
                continue;
            }
            let leader_shard_rank = runtime
                .shard_leader_shard_rank(*sid, sub.shard_num)
                .unwrap_or(0);
            if leader_shard_rank == sub.shard_rank as usize {
                self.leader_ragged_edge_cleanup(&runtime, *sid, sub);
            } else {
                let leader_id = sub.members[leader_shard_rank];
                if let Some(leader_sst_rank) = runtime.sst.rank_of(leader_id) {
                    follower_shards.push((*sid, leader_sst_rank));
                }
            }
        }

        let weak = Arc::downgrade(self);
        let pred_weak = Arc::downgrade(self);
        let waiting = follower_shards.clone();
        runtime.sst.predicates().insert(
            move |sst| {
                let Some(_vm) = pred_weak.upgrade() else {
                    return false;
                };
                waiting
                    .iter()
                    .all(|(sid, leader_rank)| sst.row(*leader_rank).global_min_ready[*sid as usize])
            },
            move |_sst| {
                if let Some(vm) = weak.upgrade() {
                    vm.finish_ragged_edge(follower_shards.clone());
                }
            },
            PredicateMode::OneShot,
        );
    }

    fn finish_ragged_edge(self: &Arc<Self>, follower_shards: Vec<(SubgroupId, usize)>) {
        let Some(runtime) = self.current() else {
            return;
        };
        for (sid, leader_sst_rank) in follower_shards {
            let Some(sub) = runtime.settings.get(&sid) else {
                continue;
            };
            self.follower_ragged_edge_cleanup(&runtime, sid, leader_sst_rank, sub);
        }

        // Persistence barrier: every live shard member must have persisted
        // up to the last versioned message delivered in the trimmed epoch.
        let weak = Arc::downgrade(self);
        let pred_weak = Arc::downgrade(self);
        runtime.sst.predicates().insert(
            move |sst| {
                let Some(vm) = pred_weak.upgrade() else {
                    return false;
                };
                let Some(rt) = vm.current() else {
                    return false;
                };
                if !vm.any_persistent {
                    return true;
                }
                let failed = rt.failed_snapshot();
                for (sid, sub) in &rt.settings {
                    if sub.mode == Mode::Unordered {
                        continue;
                    }
                    let needed_seq = rt.group.last_versioned_seq(*sid);
                    if needed_seq < 0 {
                        continue;
                    }
                    let needed = combine_version(rt.view.vid, needed_seq);
                    for member in &sub.members {
                        let Some(rank) = rt.view.rank_of(*member) else {
                            continue;
                        };
                        if failed[rank] {
                            continue;
                        }
                        if sst.row(rank).persisted_num[*sid as usize] < needed {
                            return false;
                        }
                    }
                }
                true
            },
            move |_sst| {
                if let Some(vm) = weak.upgrade() {
                    vm.finish_view_change();
                }
            },
            PredicateMode::OneShot,
        );
    }

    fn leader_ragged_edge_cleanup(
        self: &Arc<Self>,
        runtime: &ViewRuntime,
        subgroup_id: SubgroupId,
        sub: &SubgroupSettings,
    ) {
        tracing::debug!(subgroup_id, "running shard-leader ragged-edge cleanup");
        let sst = &runtime.sst;
        let offset = sub.num_received_offset;
        let num_senders = sub.num_senders();
        let shard_ranks = runtime.group.shard_sst_ranks(subgroup_id);
        // Adopt a previously published cut if any member already has one;
        // the cut must be identical no matter who computes it.
        let adopted: Option<Vec<i32>> = shard_ranks.iter().find_map(|rank| {
            let row = sst.row(*rank);
            row.global_min_ready[subgroup_id as usize]
                .then(|| row.global_min[offset..offset + num_senders].to_vec())
        });
        let global_min = match adopted {
            Some(mins) => mins,
            None => {
                let failed = runtime.failed_snapshot();
                (0..num_senders)
                    .map(|s| {
                        shard_ranks
                            .iter()
                            .filter(|rank| !failed[**rank])
                            .map(|rank| sst.row(*rank).num_received[offset + s])
                            .min()
                            .unwrap_or(-1)
                    })
                    .collect()
            }
        };
        sst.update(|row| {
            row.global_min[offset..offset + num_senders].copy_from_slice(&global_min);
            row.global_min_ready[subgroup_id as usize] = true;
        });
        sst.put_to(Some(&shard_ranks));
        self.deliver_in_order(runtime, runtime.view.my_rank, subgroup_id, sub);
    }

    fn follower_ragged_edge_cleanup(
        self: &Arc<Self>,
        runtime: &ViewRuntime,
        subgroup_id: SubgroupId,
        leader_sst_rank: usize,
        sub: &SubgroupSettings,
    ) {
        tracing::debug!(subgroup_id, "echoing shard leader's ragged-edge cut");
        let sst = &runtime.sst;
        let offset = sub.num_received_offset;
        let num_senders = sub.num_senders();
        let leader_min: Vec<i32> = {
            let row = sst.row(leader_sst_rank);
            row.global_min[offset..offset + num_senders].to_vec()
        };
        sst.update(|row| {
            row.global_min[offset..offset + num_senders].copy_from_slice(&leader_min);
            row.global_min_ready[subgroup_id as usize] = true;
        });
        let shard_ranks = runtime.group.shard_sst_ranks(subgroup_id);
        sst.put_to(Some(&shard_ranks));
        self.deliver_in_order(runtime, leader_sst_rank, subgroup_id, sub);
    }

    /// Delivers the agreed cut and, when anything is persistent, records the
    /// ragged trim before delivering so a crash cannot lose the decision.
    fn deliver_in_order(
        self: &Arc<Self>,
        runtime: &ViewRuntime,
        cut_source_rank: usize,
        subgroup_id: SubgroupId,
        sub: &SubgroupSettings,
    ) {
        let offset = sub.num_received_offset;
        let num_senders = sub.num_senders();
        let max_received: Vec<i32> = {
            let row = runtime.sst.row(cut_source_rank);
            row.global_min[offset..offset + num_senders].to_vec()
        };
        if self.any_persistent {
            let trim = RaggedTrim {
                subgroup_id,
                shard_num: sub.shard_num,
                vid: runtime.view.vid,
                leader_id: runtime.view.members[runtime.leader_rank()],
                max_received_by_sender: max_received.clone(),
            };
            if let Err(err) = trim.save(&self.config.data_dir) {
                tracing::error!(error = ?err, subgroup_id, "failed to log ragged trim");
            }
        }
        tracing::debug!(subgroup_id, cut = ?max_received, "delivering the ragged edge in order");
        runtime.group.deliver_messages_upto(subgroup_id, &max_received);
    }

    /// Builds the next view by applying the committed changes: leaves are
    /// removed, joins are appended at the tail.
    fn make_next_view(&self, runtime: &ViewRuntime) -> Result<View, GroupError> {
        let sst = &runtime.sst;
        let view = &runtime.view;
        let my_row_rank = view.my_rank;
        let leader_rank = runtime.leader_rank();
        let committed_count = {
            let leader_row = sst.row(leader_rank);
            (leader_row.num_committed - leader_row.num_installed) as usize
        };
        let row = sst.row(my_row_rank);
        let mut leave_ranks: Vec<usize> = Vec::new();
        let mut join_indexes: Vec<usize> = Vec::new();
        for change_index in 0..committed_count.min(MAX_CHANGES) {
            let change_id = row.changes[change_index];
            match view.rank_of(change_id) {
                Some(rank) => leave_ranks.push(rank),
                None => join_indexes.push(change_index),
            }
        }
        leave_ranks.sort_unstable();
        leave_ranks.dedup();

        let mut members = Vec::new();
        let mut endpoints = Vec::new();
        let mut failed = Vec::new();
        let mut departed = Vec::new();
        let mut joined = Vec::new();
        let runtime_failed = runtime.failed_snapshot();
        let mut next_unassigned_rank = view.next_unassigned_rank;
        for old_rank in 0..view.num_members() {
            if leave_ranks.contains(&old_rank) {
                departed.push(view.members[old_rank]);
                if (old_rank as i32) <= view.next_unassigned_rank {
                    next_unassigned_rank -= 1;
                }
                continue;
            }
            members.push(view.members[old_rank]);
            endpoints.push(view.member_endpoints[old_rank].clone());
            failed.push(runtime_failed[old_rank]);
        }
        for join_index in join_indexes {
            let joiner_id = row.changes[join_index];
            joined.push(joiner_id);
            members.push(joiner_id);
            endpoints.push(row.joiner_endpoints[join_index].clone());
            failed.push(false);
            tracing::debug!(joiner_id, "next view adds a new member");
        }
        drop(row);

        let my_id = view.members[my_row_rank];
        let Some(my_new_rank) = members.iter().position(|m| *m == my_id) else {
            return Err(GroupError::RemoteException(
                "another member reported this node failed; terminating".to_string(),
            ));
        };
        let mut next = View::new(
            view.vid + 1,
            members,
            endpoints,
            failed,
            joined,
            departed,
            my_new_rank,
            next_unassigned_rank.max(0),
        );
        next.num_failed = next.failed.iter().filter(|f| **f).count();
        Ok(next)
    }

    fn finish_view_change(self: &Arc<Self>) {
        let Some(old_runtime) = self.current() else {
            return;
        };
        let Some(install) = self.pending_install.lock().unwrap().take() else {
            return;
        };
        let PendingInstall {
            next_view,
            next_settings,
            next_num_received_size,
        } = install;
        tracing::debug!(vid = next_view.vid, "installing the next view");
        self.handles.lock().unwrap().cancel_all();

        // Committed joiners receive the new view over their join sockets
        // before the new SST comes up.
        let mut joiner_sockets: Vec<(NodeId, TcpStream)> = Vec::new();
        if old_runtime.i_am_leader() && !next_view.joined.is_empty() {
            let mut proposed = self.proposed_joins.lock().unwrap();
            for joiner_id in &next_view.joined {
                if let Some(pos) = proposed.iter().position(|(id, _)| id == joiner_id) {
                    let (id, mut stream) = proposed.remove(pos).expect("position valid");
                    let ok = membership::write_view_and_params(&mut stream, &next_view, &self.params)
                        .and_then(|_| membership::write_bool(&mut stream, true));
                    match ok {
                        Ok(()) => joiner_sockets.push((id, stream)),
                        Err(err) => {
                            tracing::warn!(joiner_id = id, error = ?err, "joiner died while receiving the view");
                        }
                    }
                }
            }
        }

        let old_shard_leaders = old_shard_leaders_by_new_ids(&old_runtime, &next_view);
        // Joiners must receive the shard-leaders table before this node
        // blocks in the new table's synchronization barrier, or neither
        // side can make progress.
        for (_, mut stream) in joiner_sockets {
            let _ = membership::write_shard_leaders(&mut stream, &old_shard_leaders);
        }

        let new_runtime = match Self::build_runtime(
            self,
            next_view,
            next_settings,
            next_num_received_size,
            Some(&old_runtime),
        ) {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::error!(error = ?err, "failed to construct the next view's runtime");
                self.fatal(GroupError::RemoteException(err.to_string()));
                return;
            }
        };

        new_runtime.sst.put();
        new_runtime.sst.sync_with_members(None);

        {
            let mut old = self.old_views.lock().unwrap();
            old.push_back(Arc::clone(&old_runtime));
        }
        self.old_views_cv.notify_all();

        *self.curr.write().unwrap() = Some(Arc::clone(&new_runtime));
        if self.any_persistent {
            if let Err(err) = new_runtime.view.save(&self.config.data_dir) {
                tracing::error!(error = ?err, "failed to save the installed view");
            }
        }
        *self.last_suspected.lock().unwrap() = vec![false; new_runtime.view.num_members()];
        Self::register_predicates(self, &new_runtime, true);
        self.make_replicas_if_new(&new_runtime);
        self.fire_view_upcalls(&new_runtime.view);

        // Old shard leaders ship replica state to members that joined their
        // shard in the new view.
        let my_id = self.config.local_id;
        for (sid, shards) in old_shard_leaders.iter().enumerate() {
            for (shard_num, leader) in shards.iter().enumerate() {
                if *leader != my_id as i64 {
                    continue;
                }
                let shard = &new_runtime.view.subgroup_shard_views[sid][shard_num];
                for joiner in &shard.joined {
                    if *joiner == my_id {
                        continue;
                    }
                    let Some(rank) = new_runtime.view.rank_of(*joiner) else {
                        continue;
                    };
                    let target = new_runtime.view.member_endpoints[rank].clone();
                    if let Err(err) = self.ship_state(sid as SubgroupId, &target) {
                        tracing::warn!(error = ?err, subgroup_id = sid, joiner, "failed to ship replica state");
                    }
                }
            }
        }

        // The old engine stops after this trigger returns; the new one takes
        // over evaluation.
        old_runtime.sst.predicates().stop();
        new_runtime.sst.start_predicate_evaluation();

        {
            let mut epoch = self.install_epoch.lock().unwrap();
            *epoch += 1;
        }
        self.install_cv.notify_all();
        tracing::info!(view = %new_runtime.view.debug_string(), "view installed");
    }

    fn unblock_and_join_threads(&self) {
        self.shutdown.store(true, Ordering::Release);
        // Unblock the blocking accept loops with loopback connections.
        let _ = TcpStream::connect(self.config.gms_addr());
        let _ = TcpStream::connect((self.config.local_ip.as_str(), self.config.rpc_port));
        self.old_views_cv.notify_all();
        let threads: Vec<JoinHandle<()>> = self.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Smallest acknowledged change count across live rows.
fn min_acked(sst: &GroupSst, failed: &[bool]) -> u32 {
    let mut min = sst.row(sst.my_rank()).num_acked;
    for rank in 0..sst.num_rows() {
        if !failed.get(rank).copied().unwrap_or(false) {
            min = min.min(sst.row(rank).num_acked);
        }
    }
    min
}

/// Shard leaders of the old view, re-indexed by the new view's subgroup
/// ids; -1 where a shard had no live leader.
fn old_shard_leaders_by_new_ids(old_runtime: &ViewRuntime, next_view: &View) -> Vec<Vec<i64>> {
    let old_view = &old_runtime.view;
    let mut result = vec![Vec::new(); next_view.subgroup_shard_views.len()];
    for (type_id, old_ids) in old_view.subgroup_ids_by_type_id.iter().enumerate() {
        for (subgroup_index, old_sid) in old_ids.iter().enumerate() {
            let Some(new_sid) = next_view
                .subgroup_ids_by_type_id
                .get(type_id)
                .and_then(|ids| ids.get(subgroup_index))
            else {
                continue;
            };
            let new_num_shards = next_view.subgroup_shard_views[*new_sid as usize].len();
            let mut leaders = vec![-1i64; new_num_shards];
            for (shard_num, leader) in leaders.iter_mut().enumerate().take(
                old_view.subgroup_shard_views[*old_sid as usize]
                    .len()
                    .min(new_num_shards),
            ) {
                if let Some(shard_rank) =
                    old_runtime.shard_leader_shard_rank(*old_sid, shard_num as u32)
                {
                    let old_shard =
                        &old_view.subgroup_shard_views[*old_sid as usize][shard_num];
                    *leader = old_shard.members[shard_rank] as i64;
                }
            }
            result[*new_sid as usize] = leaders;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::UniformAllocator;
    use crate::registry::{SubgroupRegistry, SubgroupTypeEntry};

    fn test_view(members: Vec<NodeId>) -> View {
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
        let n = members.len();
        View::new(0, members, endpoints, vec![false; n], vec![], vec![], 0, 0)
    }

    #[test]
    fn run_allocator_marks_inadequate_views_and_rolls_back() {
        let mut registry = SubgroupRegistry::new();
        registry.register(SubgroupTypeEntry::volatile("kv"));
        let allocator = UniformAllocator::new(3, 8, Mode::Ordered);
        let mut view = test_view(vec![1, 2]);
        let (settings, nrs) =
            run_allocator(&registry, &allocator, None, &mut view).expect("allocation runs");
        assert!(!view.is_adequately_provisioned);
        assert!(settings.is_empty());
        assert_eq!(nrs, 0);
        assert!(view.subgroup_shard_views.is_empty());
    }

    #[test]
    fn run_allocator_fills_settings_for_members() {
        let mut registry = SubgroupRegistry::new();
        registry.register(SubgroupTypeEntry::volatile("kv"));
        let allocator = UniformAllocator::new(1, 8, Mode::Ordered);
        let mut view = test_view(vec![1, 2, 3]);
        let (settings, nrs) =
            run_allocator(&registry, &allocator, None, &mut view).expect("allocation runs");
        assert!(view.is_adequately_provisioned);
        assert_eq!(view.subgroup_shard_views.len(), 1);
        assert_eq!(nrs, 3);
        let sub = settings.get(&0).expect("node 1 is in subgroup 0");
        assert_eq!(sub.sender_rank, 0);
        assert_eq!(sub.members, vec![1, 2, 3]);
        assert_eq!(view.my_subgroups.get(&0), Some(&0));
    }

    #[test]
    fn subgroup_ids_are_stable_across_views_for_the_same_pair() {
        let mut registry = SubgroupRegistry::new();
        registry.register(SubgroupTypeEntry::volatile("a"));
        registry.register(SubgroupTypeEntry::volatile("b"));
        let allocator = UniformAllocator::new(1, 8, Mode::Ordered);
        let mut first = test_view(vec![1, 2]);
        run_allocator(&registry, &allocator, None, &mut first).expect("first allocation");
        let mut second = test_view(vec![1, 2, 3]);
        run_allocator(&registry, &allocator, Some(&first), &mut second)
            .expect("second allocation");
        assert_eq!(first.subgroup_ids_by_type_id, second.subgroup_ids_by_type_id);
        // The member diff is recorded per shard.
        assert_eq!(second.subgroup_shard_views[0][0].joined, vec![3]);
        assert!(second.subgroup_shard_views[0][0].departed.is_empty());
    }

    #[test]
    fn derive_settings_recomputes_ranks_from_shipped_layouts() {
        let mut registry = SubgroupRegistry::new();
        registry.register(SubgroupTypeEntry::volatile("kv"));
        let allocator = UniformAllocator::new(1, 8, Mode::Ordered);
        let mut view = test_view(vec![1, 2, 3]);
        run_allocator(&registry, &allocator, None, &mut view).expect("allocation");
        // Reinterpret the same view from member 3's perspective.
        view.my_rank = 2;
        let (settings, nrs) = derive_subgroup_settings(&mut view);
        assert_eq!(nrs, 3);
        let sub = settings.get(&0).expect("member of subgroup 0");
        assert_eq!(sub.shard_rank, 2);
        assert_eq!(sub.sender_rank, 2);
    }
}

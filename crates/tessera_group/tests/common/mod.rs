//! Shared harness for multi-node tests: every node lives in this process,
//! rows replicate through one in-memory mesh, bulk messages through one
//! in-memory hub, and the membership handshakes run over loopback TCP.

#![allow(dead_code)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tessera_group::group_sst::GroupRow;
use tessera_group::transport::MemoryBulkHub;
use tessera_group::{
    CallbackSet, Group, GroupConfig, GroupParams, SendAlgorithm, SubgroupRegistry,
    Version,
};
use tessera_sst::MemoryMesh;

/// One in-process "network": shared row mesh and bulk hub.
pub struct TestNet {
    pub mesh: Arc<MemoryMesh<GroupRow>>,
    pub bulk: Arc<MemoryBulkHub>,
}

impl TestNet {
    pub fn new() -> Self {
        Self {
            mesh: Arc::new(MemoryMesh::new()),
            bulk: MemoryBulkHub::new(),
        }
    }
}

pub fn pick_free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind probe socket")
        .local_addr()
        .expect("probe socket addr")
        .port()
}

/// Parameters small enough to exercise windows and both transports.
pub fn small_params() -> GroupParams {
    GroupParams {
        max_payload_size: 64 * 1024,
        max_smc_payload_size: 1024,
        block_size: 8 * 1024,
        window_size: 4,
        timeout_ms: 5,
        send_algorithm: SendAlgorithm::Binomial,
    }
}

pub struct NodeSpec {
    pub id: u32,
    pub gms_port: u16,
    pub rpc_port: u16,
    pub leader_gms_port: u16,
    pub data_dir: PathBuf,
}

impl NodeSpec {
    pub fn new(id: u32, leader_gms_port: u16, base_dir: &std::path::Path) -> Self {
        let gms_port = if id == 0 { leader_gms_port } else { pick_free_port() };
        Self {
            id,
            gms_port,
            rpc_port: pick_free_port(),
            leader_gms_port,
            data_dir: base_dir.join(format!("node-{id}")),
        }
    }

    /// The bootstrap leader listens on the leader port itself.
    pub fn leader(id: u32, leader_gms_port: u16, base_dir: &std::path::Path) -> Self {
        Self {
            id,
            gms_port: leader_gms_port,
            rpc_port: pick_free_port(),
            leader_gms_port,
            data_dir: base_dir.join(format!("node-{id}")),
        }
    }

    pub fn config(&self) -> GroupConfig {
        GroupConfig {
            local_id: self.id,
            local_ip: "127.0.0.1".to_string(),
            gms_port: self.gms_port,
            rpc_port: self.rpc_port,
            sst_port: pick_free_port(),
            bulk_port: pick_free_port(),
            leader_ip: "127.0.0.1".to_string(),
            leader_gms_port: self.leader_gms_port,
            data_dir: self.data_dir.clone(),
        }
    }
}

/// Records every payload delivery a node observes.
#[derive(Clone, Default)]
pub struct DeliveryLog {
    entries: Arc<Mutex<Vec<(u32, i32, Version, Vec<u8>)>>>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(&self) -> CallbackSet {
        let entries = Arc::clone(&self.entries);
        CallbackSet {
            global_stability: Some(Arc::new(move |_sid, sender, index, payload, version| {
                if let Some(payload) = payload {
                    entries
                        .lock()
                        .unwrap()
                        .push((sender, index, version, payload.to_vec()));
                }
            })),
            ..CallbackSet::default()
        }
    }

    pub fn entries(&self) -> Vec<(u32, i32, Version, Vec<u8>)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.entries()
            .into_iter()
            .map(|(_, _, _, payload)| payload)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Polls `condition` until it holds or the deadline passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Builds a member on a background thread; bootstrap members block until
/// the group forms, so concurrent construction is the norm.
pub fn spawn_member(
    net: &TestNet,
    spec: &NodeSpec,
    registry: SubgroupRegistry,
    allocator: Arc<dyn tessera_group::SubgroupAllocator>,
    callbacks: CallbackSet,
) -> std::thread::JoinHandle<anyhow::Result<Group>> {
    let config = spec.config();
    let mesh = Arc::clone(&net.mesh) as Arc<dyn tessera_sst::RowMesh<GroupRow>>;
    let bulk = Arc::clone(&net.bulk) as Arc<dyn tessera_group::transport::BulkTransport>;
    std::thread::spawn(move || {
        Group::builder(config, registry, allocator)
            .params(small_params())
            .callbacks(callbacks)
            .mesh(mesh)
            .bulk(bulk)
            .build()
    })
}

pub fn send_text(group: &Group, subgroup: u32, text: &str) {
    let bytes = text.as_bytes().to_vec();
    group
        .send(subgroup, bytes.len(), |buf| buf.copy_from_slice(&bytes))
        .expect("send should be accepted");
}

pub fn payload_strings(log: &DeliveryLog) -> Vec<String> {
    log.payloads()
        .into_iter()
        .map(|p| String::from_utf8_lossy(&p).to_string())
        .collect()
}

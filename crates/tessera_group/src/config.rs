//! Runtime configuration: group-wide multicast parameters and local node
//! identity/bootstrap settings.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Topology used by the bulk transport to fan a multicast out of unicasts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendAlgorithm {
    Binomial,
    Chain,
    Sequential,
    Tree,
}

impl FromStr for SendAlgorithm {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "binomial" | "binomial_send" => Ok(Self::Binomial),
            "chain" | "chain_send" => Ok(Self::Chain),
            "sequential" | "sequential_send" => Ok(Self::Sequential),
            "tree" | "tree_send" => Ok(Self::Tree),
            other => anyhow::bail!("unknown send algorithm {other:?}"),
        }
    }
}

/// Low-level multicast parameters, identical at every member of a group.
/// The leader ships these to each joiner together with the first view, so
/// they must stay serializable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupParams {
    /// Upper bound on one multicast payload over the bulk path.
    pub max_payload_size: usize,
    /// Largest payload served by the small-message path; anything bigger
    /// goes through the bulk transport.
    pub max_smc_payload_size: usize,
    /// Bulk transport block size.
    pub block_size: usize,
    /// Send-window credit per sender per shard.
    pub window_size: usize,
    /// Period of the stability-frontier / failure-timeout thread.
    pub timeout_ms: u64,
    /// Bulk transport fan-out topology.
    pub send_algorithm: SendAlgorithm,
}

impl Default for GroupParams {
    fn default() -> Self {
        Self {
            max_payload_size: read_env_usize("TESSERA_MAX_PAYLOAD_SIZE", 10 * 1024 * 1024),
            max_smc_payload_size: read_env_usize("TESSERA_MAX_SMC_PAYLOAD_SIZE", 10 * 1024),
            block_size: read_env_usize("TESSERA_BLOCK_SIZE", 1024 * 1024),
            window_size: read_env_usize("TESSERA_WINDOW_SIZE", 16),
            timeout_ms: read_env_u64("TESSERA_TIMEOUT_MS", 1),
            send_algorithm: env::var("TESSERA_SEND_ALGORITHM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(SendAlgorithm::Binomial),
        }
    }
}

impl GroupParams {
    /// Clamps the small-message bound to the bulk bound, as a configuration
    /// with `max_smc_payload_size > max_payload_size` is meaningless.
    pub fn normalized(mut self) -> Self {
        self.max_smc_payload_size = self.max_smc_payload_size.min(self.max_payload_size);
        self.window_size = self.window_size.max(1);
        self
    }
}

/// Identity and bootstrap settings for the local node.
#[derive(Clone, Debug)]
pub struct GroupConfig {
    pub local_id: crate::NodeId,
    pub local_ip: String,
    pub gms_port: u16,
    pub rpc_port: u16,
    pub sst_port: u16,
    pub bulk_port: u16,
    /// Membership address of the group leader to contact when joining. A
    /// node whose own gms address equals this one starts as the leader.
    pub leader_ip: String,
    pub leader_gms_port: u16,
    /// Directory for the saved view, ragged-trim records, and version logs.
    pub data_dir: PathBuf,
}

impl GroupConfig {
    pub fn gms_addr(&self) -> String {
        format!("{}:{}", self.local_ip, self.gms_port)
    }

    pub fn leader_gms_addr(&self) -> String {
        format!("{}:{}", self.leader_ip, self.leader_gms_port)
    }

    /// True when this node is the configured bootstrap leader.
    pub fn is_initial_leader(&self) -> bool {
        let local: Option<SocketAddr> = self.gms_addr().parse().ok();
        let leader: Option<SocketAddr> = self.leader_gms_addr().parse().ok();
        match (local, leader) {
            (Some(a), Some(b)) => a == b,
            _ => self.local_ip == self.leader_ip && self.gms_port == self.leader_gms_port,
        }
    }
}

pub(crate) fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}

pub(crate) fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}

// Tessera node binary: joins (or bootstraps) a group and keeps a simple
// ordered-multicast heartbeat going so deployments can be smoke-tested.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tessera_group::{
    CallbackSet, Group, GroupConfig, GroupParams, Mode, SendAlgorithm, SubgroupRegistry,
    SubgroupTypeEntry, UniformAllocator,
};

#[derive(Parser, Debug)]
#[command(name = "tessera-node", about = "Run one member of a tessera group")]
struct Args {
    /// Unique node id within the group.
    #[arg(long)]
    id: u32,

    /// Address this node binds its listeners on.
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    #[arg(long, default_value_t = 23580)]
    gms_port: u16,
    #[arg(long, default_value_t = 28366)]
    rpc_port: u16,
    #[arg(long, default_value_t = 37683)]
    sst_port: u16,
    #[arg(long, default_value_t = 31675)]
    bulk_port: u16,

    /// Membership address of the group leader. A node whose own gms address
    /// equals this bootstraps the group.
    #[arg(long, default_value = "127.0.0.1")]
    leader_ip: String,
    #[arg(long, default_value_t = 23580)]
    leader_gms_port: u16,

    /// Directory for the saved view, ragged trims, and version logs.
    #[arg(long, default_value = "./tessera-data")]
    data_dir: PathBuf,

    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    max_payload_size: usize,
    #[arg(long, default_value_t = 10 * 1024)]
    max_smc_payload_size: usize,
    #[arg(long, default_value_t = 1024 * 1024)]
    block_size: usize,
    #[arg(long, default_value_t = 16)]
    window_size: usize,
    #[arg(long, default_value_t = 1)]
    timeout_ms: u64,
    #[arg(long, default_value = "binomial")]
    send_algorithm: SendAlgorithm,

    /// Period of the demo heartbeat multicast; 0 disables sending.
    #[arg(long, default_value_t = 1000)]
    heartbeat_ms: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let config = GroupConfig {
        local_id: args.id,
        local_ip: args.ip.clone(),
        gms_port: args.gms_port,
        rpc_port: args.rpc_port,
        sst_port: args.sst_port,
        bulk_port: args.bulk_port,
        leader_ip: args.leader_ip.clone(),
        leader_gms_port: args.leader_gms_port,
        data_dir: args.data_dir.clone(),
    };
    let params = GroupParams {
        max_payload_size: args.max_payload_size,
        max_smc_payload_size: args.max_smc_payload_size,
        block_size: args.block_size,
        window_size: args.window_size,
        timeout_ms: args.timeout_ms,
        send_algorithm: args.send_algorithm,
    };

    let mut registry = SubgroupRegistry::new();
    registry.register(SubgroupTypeEntry::volatile("heartbeat"));
    let allocator = Arc::new(UniformAllocator::new(1, usize::MAX, Mode::Ordered));

    let callbacks = CallbackSet {
        global_stability: Some(Arc::new(|subgroup_id, sender, index, payload, version| {
            if let Some(payload) = payload {
                tracing::info!(
                    subgroup_id,
                    sender,
                    index,
                    version,
                    payload = %String::from_utf8_lossy(&payload),
                    "delivered"
                );
            }
        })),
        ..CallbackSet::default()
    };

    let group = Group::builder(config, registry, allocator)
        .params(params)
        .callbacks(callbacks)
        .build()
        .context("start group member")?;

    tracing::info!(
        members = ?group.members().ok(),
        "node is up; view {:?}",
        group.current_view().map(|v| v.vid).ok()
    );

    loop {
        if let Some(err) = group.fatal_error() {
            tracing::error!(error = %err, "node shut down");
            group.leave();
            return Err(err.into());
        }
        if args.heartbeat_ms > 0 {
            let beat = format!("heartbeat from {}", args.id);
            if let Err(err) = group.send(0, beat.len(), |buf| buf.copy_from_slice(beat.as_bytes()))
            {
                tracing::warn!(error = %err, "heartbeat send failed");
            }
            std::thread::sleep(Duration::from_millis(args.heartbeat_ms));
        } else {
            std::thread::sleep(Duration::from_millis(500));
        }
    }
}

//! Membership TCP side channel: the join handshake, redirect handling, and
//! the framed primitives shared with total-restart recovery.
//!
//! All integers travel big-endian; variable-size payloads are a `u64`
//! length followed by the bytes. Views, parameters, ragged trims, and the
//! old-shard-leaders table are serde_json blobs inside those frames.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::Context;

use crate::config::{GroupConfig, GroupParams};
use crate::error::GroupError;
use crate::view::{RaggedTrim, View};
use crate::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum JoinResponseCode {
    Ok = 0,
    IdInUse = 1,
    LeaderRedirect = 2,
    TotalRestart = 3,
}

impl JoinResponseCode {
    fn from_u8(value: u8) -> anyhow::Result<Self> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::IdInUse),
            2 => Ok(Self::LeaderRedirect),
            3 => Ok(Self::TotalRestart),
            other => anyhow::bail!("unknown join response code {other}"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct JoinResponse {
    pub code: JoinResponseCode,
    pub leader_id: NodeId,
}

/// Ports a joiner announces after an accepted handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinerPorts {
    pub gms_port: u16,
    pub rpc_port: u16,
    pub sst_port: u16,
    pub bulk_port: u16,
}

/* ---- framed primitives ---- */

pub fn write_u8(stream: &mut TcpStream, value: u8) -> anyhow::Result<()> {
    stream.write_all(&[value]).context("write u8")
}

pub fn read_u8(stream: &mut TcpStream) -> anyhow::Result<u8> {
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).context("read u8")?;
    Ok(buf[0])
}

pub fn write_u16(stream: &mut TcpStream, value: u16) -> anyhow::Result<()> {
    stream.write_all(&value.to_be_bytes()).context("write u16")
}

pub fn read_u16(stream: &mut TcpStream) -> anyhow::Result<u16> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).context("read u16")?;
    Ok(u16::from_be_bytes(buf))
}

pub fn write_u32(stream: &mut TcpStream, value: u32) -> anyhow::Result<()> {
    stream.write_all(&value.to_be_bytes()).context("write u32")
}

pub fn read_u32(stream: &mut TcpStream) -> anyhow::Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).context("read u32")?;
    Ok(u32::from_be_bytes(buf))
}

pub fn write_u64(stream: &mut TcpStream, value: u64) -> anyhow::Result<()> {
    stream.write_all(&value.to_be_bytes()).context("write u64")
}

pub fn read_u64(stream: &mut TcpStream) -> anyhow::Result<u64> {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).context("read u64")?;
    Ok(u64::from_be_bytes(buf))
}

pub fn write_bool(stream: &mut TcpStream, value: bool) -> anyhow::Result<()> {
    write_u8(stream, value as u8)
}

pub fn read_bool(stream: &mut TcpStream) -> anyhow::Result<bool> {
    Ok(read_u8(stream)? != 0)
}

pub fn write_blob(stream: &mut TcpStream, bytes: &[u8]) -> anyhow::Result<()> {
    write_u64(stream, bytes.len() as u64)?;
    stream.write_all(bytes).context("write blob body")
}

pub fn read_blob(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let len = read_u64(stream)? as usize;
    anyhow::ensure!(len <= 256 * 1024 * 1024, "blob of {len} bytes is implausible");
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).context("read blob body")?;
    Ok(buf)
}

pub fn write_json<T: serde::Serialize>(stream: &mut TcpStream, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(value).context("encode json frame")?;
    write_blob(stream, &bytes)
}

pub fn read_json<T: serde::de::DeserializeOwned>(stream: &mut TcpStream) -> anyhow::Result<T> {
    let bytes = read_blob(stream)?;
    serde_json::from_slice(&bytes).context("decode json frame")
}

/* ---- join handshake ---- */

pub fn write_join_response(stream: &mut TcpStream, response: JoinResponse) -> anyhow::Result<()> {
    write_u8(stream, response.code as u8)?;
    write_u32(stream, response.leader_id)
}

pub fn read_join_response(stream: &mut TcpStream) -> anyhow::Result<JoinResponse> {
    let code = JoinResponseCode::from_u8(read_u8(stream)?)?;
    let leader_id = read_u32(stream)?;
    Ok(JoinResponse { code, leader_id })
}

/// Non-leader response: the joiner should re-dial the given address.
pub fn write_redirect(stream: &mut TcpStream, my_id: NodeId, ip: &str, gms_port: u16) -> anyhow::Result<()> {
    write_join_response(
        stream,
        JoinResponse {
            code: JoinResponseCode::LeaderRedirect,
            leader_id: my_id,
        },
    )?;
    write_blob(stream, ip.as_bytes())?;
    write_u16(stream, gms_port)
}

pub fn write_joiner_ports(stream: &mut TcpStream, ports: JoinerPorts) -> anyhow::Result<()> {
    write_u16(stream, ports.gms_port)?;
    write_u16(stream, ports.rpc_port)?;
    write_u16(stream, ports.sst_port)?;
    write_u16(stream, ports.bulk_port)
}

pub fn read_joiner_ports(stream: &mut TcpStream) -> anyhow::Result<JoinerPorts> {
    Ok(JoinerPorts {
        gms_port: read_u16(stream)?,
        rpc_port: read_u16(stream)?,
        sst_port: read_u16(stream)?,
        bulk_port: read_u16(stream)?,
    })
}

/// What the leader ships once a next view including the joiner commits.
pub fn write_view_and_params(
    stream: &mut TcpStream,
    view: &View,
    params: &GroupParams,
) -> anyhow::Result<()> {
    write_json(stream, view)?;
    write_json(stream, params)
}

pub fn read_view_and_params(stream: &mut TcpStream) -> anyhow::Result<(View, GroupParams)> {
    let view = read_json(stream)?;
    let params = read_json(stream)?;
    Ok((view, params))
}

pub fn write_ragged_trims(stream: &mut TcpStream, trims: &[RaggedTrim]) -> anyhow::Result<()> {
    write_u64(stream, trims.len() as u64)?;
    for trim in trims {
        write_json(stream, trim)?;
    }
    Ok(())
}

pub fn read_ragged_trims(stream: &mut TcpStream) -> anyhow::Result<Vec<RaggedTrim>> {
    let count = read_u64(stream)? as usize;
    anyhow::ensure!(count <= 1_000_000, "ragged trim count {count} is implausible");
    let mut trims = Vec::with_capacity(count);
    for _ in 0..count {
        trims.push(read_json(stream)?);
    }
    Ok(trims)
}

pub fn write_shard_leaders(stream: &mut TcpStream, leaders: &[Vec<i64>]) -> anyhow::Result<()> {
    write_json(stream, &leaders.to_vec())
}

pub fn read_shard_leaders(stream: &mut TcpStream) -> anyhow::Result<Vec<Vec<i64>>> {
    read_json(stream)
}

/// Result of the dial-the-leader loop.
pub struct LeaderConnection {
    pub stream: TcpStream,
    pub leader_id: NodeId,
    pub total_restart: bool,
}

/// Dials the configured leader, following redirects until an accepting
/// leader answers. Returns the open socket positioned right after the
/// `JoinResponse`.
pub fn connect_to_leader(config: &GroupConfig) -> Result<LeaderConnection, GroupError> {
    let mut target = config.leader_gms_addr();
    loop {
        let mut stream = dial(&target)?;
        if write_u32(&mut stream, config.local_id).is_err() {
            return Err(GroupError::LeaderCrashed);
        }
        let response = read_join_response(&mut stream).map_err(|_| GroupError::LeaderCrashed)?;
        match response.code {
            JoinResponseCode::Ok => {
                return Ok(LeaderConnection {
                    stream,
                    leader_id: response.leader_id,
                    total_restart: false,
                });
            }
            JoinResponseCode::TotalRestart => {
                return Ok(LeaderConnection {
                    stream,
                    leader_id: response.leader_id,
                    total_restart: true,
                });
            }
            JoinResponseCode::IdInUse => {
                return Err(GroupError::IdInUse(config.local_id));
            }
            JoinResponseCode::LeaderRedirect => {
                let ip_bytes = read_blob(&mut stream).map_err(|_| GroupError::LeaderCrashed)?;
                let port = read_u16(&mut stream).map_err(|_| GroupError::LeaderCrashed)?;
                let ip = String::from_utf8_lossy(&ip_bytes).to_string();
                tracing::info!(ip, port, "redirected to the current leader");
                target = format!("{ip}:{port}");
            }
        }
    }
}

fn dial(addr: &str) -> Result<TcpStream, GroupError> {
    let mut last_err = None;
    // The leader may still be binding its listener; retry briefly.
    for _ in 0..50 {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(err) => {
                last_err = Some(err);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    tracing::error!(addr, error = ?last_err, "failed to reach the group leader");
    Err(GroupError::LeaderCrashed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let addr = listener.local_addr().expect("listener addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, server)
    }

    #[test]
    fn join_response_and_ports_cross_the_wire() {
        let (mut client, mut server) = connected_pair();
        write_join_response(
            &mut server,
            JoinResponse {
                code: JoinResponseCode::Ok,
                leader_id: 42,
            },
        )
        .expect("write response");
        let response = read_join_response(&mut client).expect("read response");
        assert_eq!(response.code, JoinResponseCode::Ok);
        assert_eq!(response.leader_id, 42);

        let ports = JoinerPorts {
            gms_port: 23580,
            rpc_port: 28366,
            sst_port: 37683,
            bulk_port: 31675,
        };
        write_joiner_ports(&mut client, ports).expect("write ports");
        assert_eq!(read_joiner_ports(&mut server).expect("read ports"), ports);
    }

    #[test]
    fn redirect_carries_the_leader_address() {
        let (mut client, mut server) = connected_pair();
        write_redirect(&mut server, 7, "10.1.2.3", 9876).expect("write redirect");
        let response = read_join_response(&mut client).expect("read response");
        assert_eq!(response.code, JoinResponseCode::LeaderRedirect);
        assert_eq!(response.leader_id, 7);
        let ip = read_blob(&mut client).expect("read ip");
        assert_eq!(ip, b"10.1.2.3");
        assert_eq!(read_u16(&mut client).expect("read port"), 9876);
    }
}

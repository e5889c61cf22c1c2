//! Total-restart recovery.
//!
//! When every member of a group shuts down (or crashes) and the processes
//! come back, each finds a saved view on disk and enters restart mode. A
//! designated restart leader collects rejoining members, their saved views
//! and ragged-trim records, waits for a restart quorum, and ships a recovery
//! view plus the per-shard "longest log" leaders to every respondent.

use std::collections::BTreeMap;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;

use crate::allocator::SubgroupAllocator;
use crate::config::{GroupConfig, GroupParams};
use crate::error::GroupError;
use crate::membership::{
    self, JoinResponse, JoinResponseCode, JoinerPorts,
};
use crate::registry::SubgroupRegistry;
use crate::view::{MemberEndpoints, RaggedTrim, View};
use crate::{NodeId, SubgroupId};

/// Ragged trims and restart leadership carried from recovery into the first
/// installed view.
#[derive(Debug, Default)]
pub struct RestartState {
    /// subgroup id -> shard -> trim record.
    pub logged_ragged_trim: BTreeMap<SubgroupId, BTreeMap<u32, RaggedTrim>>,
    /// subgroup id -> shard -> node id of the member with the longest log,
    /// or -1 when the shard has none.
    pub restart_shard_leaders: Vec<Vec<i64>>,
}

impl RestartState {
    /// Loads the ragged-trim records for every shard this node belongs to
    /// in the saved view.
    pub fn load(saved_view: &View, dir: &Path) -> anyhow::Result<Self> {
        let mut state = Self::default();
        for (subgroup_id, shard_num) in &saved_view.my_subgroups {
            if let Some(trim) = RaggedTrim::load(dir, *subgroup_id, *shard_num)? {
                state
                    .logged_ragged_trim
                    .entry(*subgroup_id)
                    .or_default()
                    .insert(*shard_num, trim);
            }
        }
        Ok(state)
    }

    pub fn trims(&self) -> Vec<RaggedTrim> {
        self.logged_ragged_trim
            .values()
            .flat_map(|shards| shards.values().cloned())
            .collect()
    }

    /// Merges a respondent's trims, keeping per shard the most authoritative
    /// record: a restart-leader-stamped trim wins, then the higher view id,
    /// then the longer log.
    pub fn absorb(&mut self, trims: Vec<RaggedTrim>) {
        for trim in trims {
            let slot = self
                .logged_ragged_trim
                .entry(trim.subgroup_id)
                .or_default()
                .entry(trim.shard_num);
            match slot {
                std::collections::btree_map::Entry::Vacant(entry) => {
                    entry.insert(trim);
                }
                std::collections::btree_map::Entry::Occupied(mut entry) => {
                    if trim_rank(&trim) > trim_rank(entry.get()) {
                        entry.insert(trim);
                    }
                }
            }
        }
    }

    /// Stamps every collected trim with the restart-leader sentinel before
    /// re-shipping it; receivers persist the sentinel verbatim.
    pub fn stamp_final(&mut self) {
        for shards in self.logged_ragged_trim.values_mut() {
            for trim in shards.values_mut() {
                trim.leader_id = RaggedTrim::RESTART_LEADER;
            }
        }
    }

    pub fn trim_for(&self, subgroup_id: SubgroupId, shard_num: u32) -> Option<&RaggedTrim> {
        self.logged_ragged_trim
            .get(&subgroup_id)
            .and_then(|shards| shards.get(&shard_num))
    }
}

fn trim_rank(trim: &RaggedTrim) -> (bool, i32, i64) {
    (
        trim.leader_id == RaggedTrim::RESTART_LEADER,
        trim.vid,
        trim.latest_version(),
    )
}

struct Rejoiner {
    endpoints: MemberEndpoints,
    stream: Option<TcpStream>,
}

/// State machine run by the restart leader while collecting rejoiners.
pub struct RestartLeaderState {
    my_id: NodeId,
    /// The saved view with the highest vid seen so far; defines the shards
    /// the quorum is measured against.
    base_view: View,
    pub state: RestartState,
    rejoiners: BTreeMap<NodeId, Rejoiner>,
}

impl RestartLeaderState {
    pub fn new(
        config: &GroupConfig,
        saved_view: View,
        state: RestartState,
    ) -> Self {
        let my_endpoints = MemberEndpoints {
            ip: config.local_ip.clone(),
            gms_port: config.gms_port,
            rpc_port: config.rpc_port,
            sst_port: config.sst_port,
            bulk_port: config.bulk_port,
        };
        let mut rejoiners = BTreeMap::new();
        rejoiners.insert(
            config.local_id,
            Rejoiner {
                endpoints: my_endpoints,
                stream: None,
            },
        );
        Self {
            my_id: config.local_id,
            base_view: saved_view,
            state,
            rejoiners,
        }
    }

    /// Accepts rejoining members until the restart quorum is reached and the
    /// allocator accepts the recovery view. Returns the recovery view with
    /// its shard layouts installed.
    pub fn await_quorum(
        &mut self,
        listener: &TcpListener,
        registry: &SubgroupRegistry,
        allocator: &dyn SubgroupAllocator,
        params: &GroupParams,
    ) -> anyhow::Result<View> {
        listener
            .set_nonblocking(true)
            .context("set restart listener nonblocking")?;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = self.handle_rejoiner(stream, peer.ip().to_string()) {
                        tracing::warn!(error = ?err, "restart rejoiner handshake failed");
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(err) => return Err(err).context("accept restart rejoiner"),
            }

            if !self.has_quorum() {
                continue;
            }
            let Some(mut view) = self.compose_recovery_view() else {
                continue;
            };
            let adequate = crate::view_manager::run_allocator(
                registry,
                allocator,
                None,
                &mut view,
            )
            .is_ok_and(|_| view.is_adequately_provisioned);
            if !adequate {
                tracing::info!(
                    respondents = self.rejoiners.len(),
                    "restart quorum reached but recovery view is inadequate; waiting for more rejoiners"
                );
                continue;
            }

            self.state.stamp_final();
            self.compute_shard_leaders(&view);
            match self.send_restart_view(&view, params) {
                Ok(()) => {
                    self.confirm(true);
                    self.send_shard_leaders();
                    listener
                        .set_nonblocking(false)
                        .context("restore restart listener blocking mode")?;
                    return Ok(view);
                }
                Err(failed_node) => {
                    tracing::info!(
                        node = failed_node,
                        "rejoiner failed while receiving the recovery view; recomputing"
                    );
                    self.confirm(false);
                    self.rejoiners.remove(&failed_node);
                }
            }
        }
    }

    fn handle_rejoiner(&mut self, mut stream: TcpStream, peer_ip: String) -> anyhow::Result<()> {
        let _ = stream.set_nodelay(true);
        let node_id = membership::read_u32(&mut stream)?;
        membership::write_join_response(
            &mut stream,
            JoinResponse {
                code: JoinResponseCode::TotalRestart,
                leader_id: self.my_id,
            },
        )?;
        let their_view: View = membership::read_json(&mut stream)?;
        let trims = membership::read_ragged_trims(&mut stream)?;
        let ports: JoinerPorts = membership::read_joiner_ports(&mut stream)?;
        tracing::info!(
            node = node_id,
            saved_vid = their_view.vid,
            trims = trims.len(),
            "restart rejoiner checked in"
        );
        if their_view.vid > self.base_view.vid {
            self.base_view = their_view;
        }
        self.state.absorb(trims);
        self.rejoiners.insert(
            node_id,
            Rejoiner {
                endpoints: MemberEndpoints {
                    ip: peer_ip,
                    gms_port: ports.gms_port,
                    rpc_port: ports.rpc_port,
                    sst_port: ports.sst_port,
                    bulk_port: ports.bulk_port,
                },
                stream: Some(stream),
            },
        );
        Ok(())
    }

    /// Restart quorum: for every shard of every subgroup in the saved view,
    /// a majority of its members have responded, and shards of persistent
    /// subgroups have at least one trim record.
    pub fn has_quorum(&self) -> bool {
        for (subgroup_id, shards) in self.base_view.subgroup_shard_views.iter().enumerate() {
            for (shard_num, shard) in shards.iter().enumerate() {
                if shard.members.is_empty() {
                    continue;
                }
                let responded = shard
                    .members
                    .iter()
                    .filter(|m| self.rejoiners.contains_key(m))
                    .count();
                if responded < shard.members.len() / 2 + 1 {
                    return false;
                }
                let needs_trim = self
                    .state
                    .trim_for(subgroup_id as SubgroupId, shard_num as u32)
                    .is_none();
                // A shard that never persisted anything has no trim to find.
                if needs_trim && self.shard_ever_persisted(subgroup_id as SubgroupId) {
                    return false;
                }
            }
        }
        true
    }

    fn shard_ever_persisted(&self, subgroup_id: SubgroupId) -> bool {
        self.state.logged_ragged_trim.contains_key(&subgroup_id)
    }

    /// Recovery view: every respondent is a joiner, ordered by their rank in
    /// the saved view (newcomers, if any, go last); vid advances past the
    /// highest saved vid.
    fn compose_recovery_view(&self) -> Option<View> {
        let mut members: Vec<NodeId> = Vec::new();
        for member in &self.base_view.members {
            if self.rejoiners.contains_key(member) {
                members.push(*member);
            }
        }
        for node in self.rejoiners.keys() {
            if !members.contains(node) {
                members.push(*node);
            }
        }
        let my_rank = members.iter().position(|m| *m == self.my_id)?;
        let endpoints = members
            .iter()
            .map(|m| self.rejoiners.get(m).expect("member responded").endpoints.clone())
            .collect();
        let joined = members.clone();
        let failed = vec![false; members.len()];
        Some(View::new(
            self.base_view.vid + 1,
            members,
            endpoints,
            failed,
            joined,
            Vec::new(),
            my_rank,
            0,
        ))
    }

    /// Per shard, the respondent whose trim implies the longest persistent
    /// log. Volatile shards get -1.
    fn compute_shard_leaders(&mut self, view: &View) {
        let mut leaders = Vec::with_capacity(view.subgroup_shard_views.len());
        for (subgroup_id, shards) in view.subgroup_shard_views.iter().enumerate() {
            let mut shard_leaders = Vec::with_capacity(shards.len());
            for (shard_num, shard) in shards.iter().enumerate() {
                let trim = self.state.trim_for(subgroup_id as SubgroupId, shard_num as u32);
                // Every respondent truncates to the same final trim, so any
                // responding shard member can replay the agreed prefix. The
                // member that led the trimmed epoch is preferred when it
                // rejoined.
                let leader = match trim {
                    Some(trim) if self.rejoiners.contains_key(&trim.leader_id)
                        && shard.members.contains(&trim.leader_id) =>
                    {
                        trim.leader_id as i64
                    }
                    Some(_) => shard
                        .members
                        .iter()
                        .find(|m| self.rejoiners.contains_key(m))
                        .map(|m| *m as i64)
                        .unwrap_or(-1),
                    None => -1,
                };
                shard_leaders.push(leader);
            }
            leaders.push(shard_leaders);
        }
        self.state.restart_shard_leaders = leaders;
    }

    /// Ships the recovery view, parameters, and stamped trims to every
    /// rejoiner. On the first send failure, returns the failed node.
    fn send_restart_view(&mut self, view: &View, params: &GroupParams) -> Result<(), NodeId> {
        let trims = self.state.trims();
        for (node, rejoiner) in self.rejoiners.iter_mut() {
            let Some(stream) = rejoiner.stream.as_mut() else {
                continue;
            };
            let sent = membership::write_view_and_params(stream, view, params)
                .and_then(|_| membership::write_ragged_trims(stream, &trims));
            if sent.is_err() {
                return Err(*node);
            }
        }
        Ok(())
    }

    /// Tells every rejoiner whether to commit the view it just received.
    fn confirm(&mut self, commit: bool) {
        for rejoiner in self.rejoiners.values_mut() {
            if let Some(stream) = rejoiner.stream.as_mut() {
                let _ = membership::write_bool(stream, commit);
            }
        }
    }

    fn send_shard_leaders(&mut self) {
        let leaders = self.state.restart_shard_leaders.clone();
        for rejoiner in self.rejoiners.values_mut() {
            if let Some(stream) = rejoiner.stream.as_mut() {
                let _ = membership::write_shard_leaders(stream, &leaders);
            }
        }
    }

    pub fn into_state(self) -> RestartState {
        self.state
    }
}

/// Joiner-side restart handshake, run right after the leader answered
/// `TOTAL_RESTART`: ship the saved view and trims, then receive the
/// recovery view like any join.
pub fn send_restart_logs(
    stream: &mut TcpStream,
    saved_view: &View,
    state: &RestartState,
) -> Result<(), GroupError> {
    membership::write_json(stream, saved_view).map_err(|_| GroupError::LeaderCrashed)?;
    membership::write_ragged_trims(stream, &state.trims()).map_err(|_| GroupError::LeaderCrashed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trim(vid: i32, leader_id: NodeId, max: Vec<i32>) -> RaggedTrim {
        RaggedTrim {
            subgroup_id: 0,
            shard_num: 0,
            vid,
            leader_id,
            max_received_by_sender: max,
        }
    }

    #[test]
    fn absorb_prefers_final_then_newest_trims() {
        let mut state = RestartState::default();
        state.absorb(vec![trim(3, 1, vec![5])]);
        state.absorb(vec![trim(4, 2, vec![1])]);
        assert_eq!(state.trim_for(0, 0).expect("trim").vid, 4);
        // An older trim stamped by a previous restart leader still wins.
        state.absorb(vec![trim(3, RaggedTrim::RESTART_LEADER, vec![2])]);
        assert_eq!(
            state.trim_for(0, 0).expect("trim").leader_id,
            RaggedTrim::RESTART_LEADER
        );
        // A later final trim beats an earlier final trim.
        state.absorb(vec![trim(5, RaggedTrim::RESTART_LEADER, vec![0])]);
        assert_eq!(state.trim_for(0, 0).expect("trim").vid, 5);
    }

    #[test]
    fn stamping_marks_every_trim_final() {
        let mut state = RestartState::default();
        state.absorb(vec![trim(1, 9, vec![3])]);
        state.stamp_final();
        assert_eq!(
            state.trim_for(0, 0).expect("trim").leader_id,
            RaggedTrim::RESTART_LEADER
        );
    }
}

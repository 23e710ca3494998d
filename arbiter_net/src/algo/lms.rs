//! Generalized last-man-standing.
//!
//! Clients are grouped into partitions by ring id; no decision is made
//! until every peer believed to share the caller's partition reports the
//! same ring id (a deferred-decision timer rechecks while views catch
//! up). The partition with the strictly highest score wins, then the
//! strictly largest one, then the one holding the tie-breaker node.

use std::time::Duration;

use arbiter_proto::{
    Heuristics, NodeInfo, Quorate, ReplyErrorCode, RingId, TieBreaker, Vote,
};
use tracing::{debug, info};

use crate::server::{ClientKey, ServerState};

use super::{
    all_ring_ids_match, create_partitions, Algorithm, ClientAlgoData, TimerDecision,
};

/// Per-client scratch.
#[derive(Debug, Default)]
pub(crate) struct LmsData {
    /// Configured cluster size from the last config node list.
    pub num_config_nodes: usize,
    /// Last result handed to this client; `Undefined` while new.
    pub last_result: Vote,
}

/// See the module docs.
pub(crate) struct LmsAlgorithm;

fn data(state: &ServerState, key: ClientKey) -> &LmsData {
    match &state.clients[key].algo {
        ClientAlgoData::Lms(data) => data,
        other => unreachable!("lms client scratch missing: {:?}", other),
    }
}

fn data_mut(state: &mut ServerState, key: ClientKey) -> &mut LmsData {
    match &mut state.clients[key].algo {
        ClientAlgoData::Lms(data) => data,
        other => unreachable!("lms client scratch missing: {:?}", other),
    }
}

fn save_result(state: &mut ServerState, key: ClientKey, vote: Vote) -> Vote {
    data_mut(state, key).last_result = vote;
    vote
}

fn recheck_interval(state: &ServerState, key: ClientKey) -> Duration {
    Duration::from_millis(state.clients[key].heartbeat_interval as u64 / 4)
}

fn do_lms_algorithm(
    state: &mut ServerState,
    key: ClientKey,
    ring_id: &RingId,
) -> Result<Vote, ReplyErrorCode> {
    // The algorithm is running now; any pending recheck is stale.
    state.cancel_algo_timer(key);

    if !all_ring_ids_match(state, key, ring_id) {
        debug!(%ring_id, "lms: ring id not unique in this membership, waiting");
        let interval = recheck_interval(state, key);
        state.schedule_algo_timer(key, interval);
        return Ok(save_result(state, key, Vote::WaitForReply));
    }

    let partitions = create_partitions(state, key);
    if partitions.is_empty() {
        // First client on the block; its own ring is not registered yet.
        debug!("lms: no partitions found");
        let interval = recheck_interval(state, key);
        state.schedule_algo_timer(key, interval);
        return Ok(save_result(state, key, Vote::WaitForReply));
    }

    for partition in &partitions {
        debug!(ring_id = %partition.ring_id, nodes = partition.num_nodes, score = partition.score, "lms: partition");
    }

    if partitions.len() == 1 {
        debug!("lms: only one partition, the local quorum subsystem arbitrates");
        return Ok(save_result(state, key, Vote::Ack));
    }

    // A newcomer must not steal quorum from an already-voting partition;
    // refuse it without remembering the refusal.
    if data(state, key).last_result == Vote::Undefined {
        for other_key in state.cluster_member_keys(key) {
            if state.clients[other_key].last_ring_id != *ring_id
                && data(state, other_key).last_result == Vote::Ack
            {
                debug!("lms: new partition while another is active, NACK");
                return Ok(Vote::Nack);
            }
        }
    }

    // Highest score wins when it is unique.
    let best_score = partitions
        .iter()
        .map(|partition| partition.score)
        .max()
        .unwrap_or(0);
    let mut best = partitions
        .iter()
        .filter(|partition| partition.score == best_score);
    if let (Some(winner), None) = (best.next(), best.next()) {
        let vote = if winner.ring_id == *ring_id {
            Vote::Ack
        } else {
            Vote::Nack
        };
        debug!(ring_id = %winner.ring_id, score = winner.score, %vote, "lms: unique best score partition");
        return Ok(save_result(state, key, vote));
    }

    // Several partitions tie on score; the largest wins when unique.
    let most_nodes = partitions
        .iter()
        .map(|partition| partition.num_nodes)
        .max()
        .unwrap_or(0);
    let mut largest = partitions
        .iter()
        .filter(|partition| partition.num_nodes == most_nodes);
    if let (Some(winner), None) = (largest.next(), largest.next()) {
        let vote = if winner.ring_id == *ring_id {
            Vote::Ack
        } else {
            Vote::Nack
        };
        debug!(ring_id = %winner.ring_id, nodes = winner.num_nodes, %vote, "lms: unique largest partition");
        return Ok(save_result(state, key, vote));
    }

    // Full tie: the partition holding the tie-breaker node wins.
    let tie_breaker = state.clients[key].tie_breaker.unwrap_or(TieBreaker::Lowest);
    let mut tb_node_id = None;
    let mut tb_ring_id = RingId::default();
    for other_key in state.cluster_member_keys(key) {
        let other = &state.clients[other_key];
        let Some(node_id) = other.node_id else {
            continue;
        };
        let better = match tie_breaker {
            TieBreaker::Lowest => tb_node_id.is_none_or(|current| node_id < current),
            TieBreaker::Highest => tb_node_id.is_none_or(|current| node_id > current),
            TieBreaker::NodeId(wanted) => node_id == wanted,
        };
        if better {
            tb_node_id = Some(node_id);
            tb_ring_id = other.last_ring_id;
        }
    }

    let client = &state.clients[key];
    let vote = if (tb_node_id.is_some() && client.node_id == tb_node_id)
        || tb_ring_id == *ring_id
    {
        Vote::Ack
    } else {
        Vote::Nack
    };
    debug!(?tb_node_id, %vote, "lms: tie-breaker decision");
    Ok(save_result(state, key, vote))
}

impl Algorithm for LmsAlgorithm {
    fn client_init(&self, state: &mut ServerState, key: ClientKey) -> Result<(), ReplyErrorCode> {
        state.clients[key].algo = ClientAlgoData::Lms(LmsData::default());
        Ok(())
    }

    fn config_node_list_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        _seq: u32,
        _config_version: Option<u64>,
        nodes: &[NodeInfo],
        _initial: bool,
    ) -> Result<Vote, ReplyErrorCode> {
        data_mut(state, key).num_config_nodes = nodes.len();
        debug!(nodes = nodes.len(), "lms: config node list received");
        Ok(Vote::NoChange)
    }

    fn membership_node_list_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        _seq: u32,
        ring_id: &RingId,
        _nodes: &[NodeInfo],
        _heuristics: Heuristics,
    ) -> Result<Vote, ReplyErrorCode> {
        debug!(%ring_id, "lms: membership node list received");
        do_lms_algorithm(state, key, ring_id)
    }

    fn quorum_node_list_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        _seq: u32,
        _quorate: Quorate,
        _nodes: &[NodeInfo],
    ) -> Result<Vote, ReplyErrorCode> {
        // By quorum-list time every node knows the current ring id, so
        // this is often the most reliable rerun.
        let ring_id = state.clients[key].last_ring_id;
        do_lms_algorithm(state, key, &ring_id)
    }

    fn ask_for_vote_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        _seq: u32,
    ) -> Result<Vote, ReplyErrorCode> {
        let ring_id = state.clients[key].last_ring_id;
        do_lms_algorithm(state, key, &ring_id)
    }

    fn vote_info_reply_received(
        &self,
        _state: &mut ServerState,
        _key: ClientKey,
        _seq: u32,
    ) -> Result<(), ReplyErrorCode> {
        Ok(())
    }

    fn heuristics_change_received(
        &self,
        _state: &mut ServerState,
        _key: ClientKey,
        _seq: u32,
        _heuristics: Heuristics,
    ) -> Result<Vote, ReplyErrorCode> {
        info!("lms: heuristics change is not supported");
        Ok(Vote::NoChange)
    }

    fn client_disconnect(&self, state: &mut ServerState, key: ClientKey, server_going_down: bool) {
        let client = &state.clients[key];
        debug!(addr = %client.addr, server_going_down, "lms: client disconnect");
    }

    fn timer_callback(
        &self,
        state: &mut ServerState,
        key: ClientKey,
    ) -> Result<TimerDecision, ReplyErrorCode> {
        let ring_id = state.clients[key].last_ring_id;
        let vote = do_lms_algorithm(state, key, &ring_id)?;

        Ok(TimerDecision {
            // do_lms_algorithm arms its own recheck; rescheduling here
            // keeps exactly one pending timer because scheduling replaces.
            reschedule: vote == Vote::WaitForReply,
            send_vote: vote.is_ack_or_nack(),
            vote,
        })
    }
}

//! Last-man-standing for clusters of exactly two nodes.
//!
//! If both nodes see each other, both keep their vote and the local
//! quorum subsystem arbitrates. If only one is left talking to the
//! arbiter it keeps the vote. If both are alive but split, heuristics
//! dominate, then the tie-breaker decides. A newcomer joining while a
//! different partition is actively voting is refused so quorum cannot hop
//! onto a rejoiner.

use arbiter_proto::{Heuristics, NodeInfo, Quorate, ReplyErrorCode, RingId, TieBreaker, Vote};
use tracing::{debug, info};

use crate::server::{ClientKey, ServerState};

use super::{Algorithm, ClientAlgoData, TimerDecision};

/// Per-client scratch.
#[derive(Debug, Default)]
pub(crate) struct TwoNodeLmsData {
    /// Configured cluster size from the last config node list.
    pub num_config_nodes: usize,
    /// Last ACK/NACK handed to this client; `Undefined` while new.
    pub last_result: Vote,
}

/// See the module docs.
pub(crate) struct TwoNodeLmsAlgorithm;

fn data(state: &ServerState, key: ClientKey) -> &TwoNodeLmsData {
    match &state.clients[key].algo {
        ClientAlgoData::TwoNodeLms(data) => data,
        other => unreachable!("2nodelms client scratch missing: {:?}", other),
    }
}

fn data_mut(state: &mut ServerState, key: ClientKey) -> &mut TwoNodeLmsData {
    match &mut state.clients[key].algo {
        ClientAlgoData::TwoNodeLms(data) => data,
        other => unreachable!("2nodelms client scratch missing: {:?}", other),
    }
}

fn save_result(state: &mut ServerState, key: ClientKey, vote: Vote) -> Vote {
    data_mut(state, key).last_result = vote;
    vote
}

impl Algorithm for TwoNodeLmsAlgorithm {
    fn client_init(&self, state: &mut ServerState, key: ClientKey) -> Result<(), ReplyErrorCode> {
        state.clients[key].algo = ClientAlgoData::TwoNodeLms(TwoNodeLmsData::default());
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
        debug!(nodes = nodes.len(), "2nodelms: config node list received");

        if nodes.len() != 2 {
            info!(
                nodes = nodes.len(),
                "2nodelms: cluster does not have 2 configured nodes"
            );
            return Err(ReplyErrorCode::UnsupportedDecisionAlgorithm);
        }

        Ok(Vote::NoChange)
    }

    fn membership_node_list_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        _seq: u32,
        ring_id: &RingId,
        nodes: &[NodeInfo],
        heuristics: Heuristics,
    ) -> Result<Vote, ReplyErrorCode> {
        let members = state.cluster_member_keys(key);

        // A newcomer must not steal quorum from an already-voting
        // partition; refuse it without remembering the refusal.
        if data(state, key).last_result == Vote::Undefined {
            for &other_key in &members {
                let other = &state.clients[other_key];
                if other.last_ring_id != *ring_id
                    && data(state, other_key).last_result == Vote::Ack
                {
                    debug!("2nodelms: new partition while another is active, NACK");
                    return Ok(Vote::Nack);
                }
            }
        }

        if nodes.len() == 2 {
            debug!("2nodelms: both nodes active");
            return Ok(save_result(state, key, Vote::Ack));
        }

        // The membership is split; look at who else still talks to us.
        let mut low_node_id = u32::MAX;
        let mut high_node_id = 0;
        let mut other_node_heuristics = Heuristics::Undefined;
        for &other_key in &members {
            let other = &state.clients[other_key];
            if let Some(node_id) = other.node_id {
                low_node_id = low_node_id.min(node_id);
                high_node_id = high_node_id.max(node_id);
            }
            if other_key != key {
                other_node_heuristics = other.last_heuristics;
            }
        }

        if members.len() == 1 {
            debug!("2nodelms: running on the last man standing");
            return Ok(save_result(state, key, Vote::Ack));
        }

        // Both alive but split: heuristics dominate the tie-breaker.
        match heuristics.cmp(&other_node_heuristics) {
            std::cmp::Ordering::Greater => return Ok(save_result(state, key, Vote::Ack)),
            std::cmp::Ordering::Less => return Ok(save_result(state, key, Vote::Nack)),
            std::cmp::Ordering::Equal => {}
        }

        let client = &state.clients[key];
        let tie_breaker_wins = match client.tie_breaker {
            Some(TieBreaker::Lowest) => client.node_id == Some(low_node_id),
            Some(TieBreaker::Highest) => client.node_id == Some(high_node_id),
            Some(TieBreaker::NodeId(node_id)) => client.node_id == Some(node_id),
            None => false,
        };
        let vote = if tie_breaker_wins { Vote::Ack } else { Vote::Nack };
        debug!(%vote, "2nodelms: tie-breaker decision");
        Ok(save_result(state, key, vote))
    }

    fn quorum_node_list_received(
        &self,
        _state: &mut ServerState,
        _key: ClientKey,
        _seq: u32,
        _quorate: Quorate,
        _nodes: &[NodeInfo],
    ) -> Result<Vote, ReplyErrorCode> {
        Ok(Vote::NoChange)
    }

    fn ask_for_vote_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        _seq: u32,
    ) -> Result<Vote, ReplyErrorCode> {
        match data(state, key).last_result {
            Vote::Undefined => Ok(Vote::AskLater),
            last_result => Ok(last_result),
        }
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
        info!("2nodelms: heuristics change is not supported");
        Ok(Vote::NoChange)
    }

    fn client_disconnect(&self, state: &mut ServerState, key: ClientKey, server_going_down: bool) {
        let client = &state.clients[key];
        debug!(addr = %client.addr, server_going_down, "2nodelms: client disconnect");
    }

    fn timer_callback(
        &self,
        _state: &mut ServerState,
        _key: ClientKey,
    ) -> Result<TimerDecision, ReplyErrorCode> {
        Ok(TimerDecision::default())
    }
}

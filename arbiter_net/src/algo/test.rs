//! The unconditional-ACK test algorithm.
//!
//! Grants a vote to every membership, no matter how the cluster is split,
//! so two partitions can become quorate at once. Useful only for protocol
//! testing; the server refuses to negotiate it unless the
//! `test_algorithm_enabled` advanced setting is on.

use arbiter_proto::{Heuristics, NodeInfo, Quorate, ReplyErrorCode, RingId, Vote};
use tracing::warn;

use crate::server::{ClientKey, ServerState};

use super::{Algorithm, TimerDecision};

/// See the module docs.
pub(crate) struct TestAlgorithm;

impl Algorithm for TestAlgorithm {
    fn client_init(&self, state: &mut ServerState, key: ClientKey) -> Result<(), ReplyErrorCode> {
        let client = &state.clients[key];
        warn!(
            addr = %client.addr,
            "client negotiated the test algorithm; this is NOT SAFE for production"
        );
        Ok(())
    }

    fn config_node_list_received(
        &self,
        _state: &mut ServerState,
        _key: ClientKey,
        _seq: u32,
        _config_version: Option<u64>,
        _nodes: &[NodeInfo],
        _initial: bool,
    ) -> Result<Vote, ReplyErrorCode> {
        Ok(Vote::NoChange)
    }

    fn membership_node_list_received(
        &self,
        _state: &mut ServerState,
        _key: ClientKey,
        _seq: u32,
        _ring_id: &RingId,
        _nodes: &[NodeInfo],
        _heuristics: Heuristics,
    ) -> Result<Vote, ReplyErrorCode> {
        Ok(Vote::Ack)
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
        _state: &mut ServerState,
        _key: ClientKey,
        _seq: u32,
    ) -> Result<Vote, ReplyErrorCode> {
        Ok(Vote::Ack)
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
        Ok(Vote::NoChange)
    }

    fn client_disconnect(
        &self,
        _state: &mut ServerState,
        _key: ClientKey,
        _server_going_down: bool,
    ) {
    }

    fn timer_callback(
        &self,
        _state: &mut ServerState,
        _key: ClientKey,
    ) -> Result<TimerDecision, ReplyErrorCode> {
        Ok(TimerDecision::default())
    }
}

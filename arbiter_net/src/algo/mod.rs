//! Server-side decision algorithms.
//!
//! An algorithm is a set of callbacks invoked at specific server events;
//! each receives the affected client and produces a reply error code and a
//! result vote. Per-client and per-cluster scratch lives in the records,
//! tagged by the negotiated algorithm.

pub(crate) mod ffsplit;
pub(crate) mod lms;
pub(crate) mod test;
pub(crate) mod two_node_lms;

use arbiter_proto::{
    DecisionAlgorithm, Heuristics, NodeInfo, Quorate, ReplyErrorCode, RingId, Vote,
};

use crate::server::{ClientKey, ServerState};

/// What a fired per-client algorithm timer decided.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerDecision {
    /// Re-arm the timer for another tick.
    pub reschedule: bool,
    /// Push the vote to the client as a VoteInfo.
    pub send_vote: bool,
    /// The vote itself.
    pub vote: Vote,
}

impl Default for TimerDecision {
    fn default() -> Self {
        TimerDecision {
            reschedule: false,
            send_vote: false,
            vote: Vote::WaitForReply,
        }
    }
}

/// The callback set every decision algorithm implements.
///
/// Node lists arriving with a callback are not yet stored in the client
/// record; the record still holds the previous view, and the handler
/// stores the new list only after the callback succeeds.
pub(crate) trait Algorithm {
    /// Client passed init validation and joined its cluster.
    fn client_init(&self, state: &mut ServerState, key: ClientKey) -> Result<(), ReplyErrorCode>;

    /// Client sent a configuration node list.
    fn config_node_list_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        seq: u32,
        config_version: Option<u64>,
        nodes: &[NodeInfo],
        initial: bool,
    ) -> Result<Vote, ReplyErrorCode>;

    /// Client sent a membership node list for `ring_id`.
    fn membership_node_list_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        seq: u32,
        ring_id: &RingId,
        nodes: &[NodeInfo],
        heuristics: Heuristics,
    ) -> Result<Vote, ReplyErrorCode>;

    /// Client sent a quorum node list.
    fn quorum_node_list_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        seq: u32,
        quorate: Quorate,
        nodes: &[NodeInfo],
    ) -> Result<Vote, ReplyErrorCode>;

    /// Client asked for a vote, usually after an earlier AskLater.
    fn ask_for_vote_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        seq: u32,
    ) -> Result<Vote, ReplyErrorCode>;

    /// Client acknowledged a VoteInfo.
    fn vote_info_reply_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        seq: u32,
    ) -> Result<(), ReplyErrorCode>;

    /// Client reported a changed heuristics result.
    fn heuristics_change_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        seq: u32,
        heuristics: Heuristics,
    ) -> Result<Vote, ReplyErrorCode>;

    /// Client is going away; it is still listed in its cluster and is
    /// removed right after this returns.
    fn client_disconnect(&self, state: &mut ServerState, key: ClientKey, server_going_down: bool);

    /// The per-client deferred-decision timer fired.
    fn timer_callback(
        &self,
        state: &mut ServerState,
        key: ClientKey,
    ) -> Result<TimerDecision, ReplyErrorCode>;
}

/// Dispatch table, algorithm enum to implementation.
pub(crate) fn algorithm(kind: DecisionAlgorithm) -> &'static dyn Algorithm {
    match kind {
        DecisionAlgorithm::Test => &test::TestAlgorithm,
        DecisionAlgorithm::Ffsplit => &ffsplit::FfsplitAlgorithm,
        DecisionAlgorithm::TwoNodeLms => &two_node_lms::TwoNodeLmsAlgorithm,
        DecisionAlgorithm::Lms => &lms::LmsAlgorithm,
    }
}

/// Per-client scratch, tagged by the negotiated algorithm.
#[derive(Debug, Default)]
pub(crate) enum ClientAlgoData {
    /// No algorithm negotiated yet, or the algorithm keeps no state.
    #[default]
    None,
    /// Fifty-fifty split resolver.
    Ffsplit(ffsplit::FfsplitClientData),
    /// Two-node last-man-standing.
    TwoNodeLms(two_node_lms::TwoNodeLmsData),
    /// Generalized last-man-standing.
    Lms(lms::LmsData),
}

/// Per-cluster scratch, tagged by the cluster's algorithm.
#[derive(Debug, Default)]
pub(crate) enum ClusterAlgoData {
    /// No cluster-wide state.
    #[default]
    None,
    /// Fifty-fifty split resolver.
    Ffsplit(ffsplit::FfsplitClusterData),
}

/// One partition of a split cluster, grouped by ring id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Partition {
    /// The ring id shared by the partition's members.
    pub ring_id: RingId,
    /// Connected clients reporting this ring id.
    pub num_nodes: usize,
    /// Connected clients plus heuristics adjustment.
    pub score: i64,
}

/// True when every connected client in the same partition as `key`
/// reports `ring_id`. A mismatch means the server does not yet have the
/// full current view and should wait.
pub(crate) fn all_ring_ids_match(state: &ServerState, key: ClientKey, ring_id: &RingId) -> bool {
    let client = &state.clients[key];
    for other_key in state.cluster_member_keys(key) {
        if other_key == key {
            continue;
        }
        let other = &state.clients[other_key];
        let in_our_partition = client
            .last_membership_node_list
            .iter()
            .any(|node| Some(node.node_id) == other.node_id)
            || other
                .last_membership_node_list
                .iter()
                .any(|node| Some(node.node_id) == client.node_id);
        if in_our_partition && other.last_ring_id != *ring_id {
            return false;
        }
    }
    true
}

/// Group the cluster's connected clients into partitions by their last
/// known ring id. Clients that have not reported a ring yet (seq zero)
/// are left out.
pub(crate) fn create_partitions(state: &ServerState, key: ClientKey) -> Vec<Partition> {
    let mut partitions: Vec<Partition> = Vec::new();
    for other_key in state.cluster_member_keys(key) {
        let other = &state.clients[other_key];
        if other.last_ring_id.seq == 0 {
            continue;
        }
        let index = match partitions
            .iter()
            .position(|partition| partition.ring_id == other.last_ring_id)
        {
            Some(index) => index,
            None => {
                partitions.push(Partition {
                    ring_id: other.last_ring_id,
                    num_nodes: 0,
                    score: 0,
                });
                partitions.len() - 1
            }
        };
        let partition = &mut partitions[index];
        partition.num_nodes += 1;
        partition.score += 1;
        match other.last_heuristics {
            Heuristics::Pass => partition.score += 1,
            Heuristics::Fail => partition.score -= 1,
            Heuristics::Undefined => {}
        }
    }
    partitions
}

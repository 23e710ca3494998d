//! Fifty-fifty split resolver.
//!
//! On every event that could change the outcome, a cluster-wide stability
//! check runs; once all connected clients agree on the configuration and
//! each partition agrees on its ring id and membership, the best partition
//! is selected and votes are pushed as VoteInfo messages, NACKs strictly
//! before ACKs. ACKs are held back until every NACK has been acknowledged,
//! which is what keeps two partitions from ever being quorate at once.

use arbiter_proto::{Heuristics, NodeInfo, Quorate, ReplyErrorCode, RingId, TieBreaker, Vote};
use tracing::debug;

use crate::server::{ClientKey, ServerState};

use super::{Algorithm, ClientAlgoData, ClusterAlgoData, TimerDecision};

/// Per-client voting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum FfsplitClientState {
    /// Nothing outstanding.
    #[default]
    WaitingForChange,
    /// A NACK VoteInfo is in flight, awaiting its reply.
    SendingNack,
    /// An ACK VoteInfo is in flight, awaiting its reply.
    SendingAck,
}

/// Per-client scratch.
#[derive(Debug, Default)]
pub(crate) struct FfsplitClientData {
    /// Voting state.
    pub state: FfsplitClientState,
    /// Seq number of the VoteInfo this client must acknowledge.
    pub vote_info_expected_seq: u32,
}

/// Cluster-wide phase of the NACK-before-ACK protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum FfsplitClusterState {
    /// Idle.
    #[default]
    WaitingForChange,
    /// A change arrived but the views do not line up yet.
    WaitingForStableMembership,
    /// NACKs are in flight.
    SendingNacks,
    /// Every NACK is acknowledged; ACKs are in flight.
    SendingAcks,
}

/// Per-cluster scratch.
#[derive(Debug, Default)]
pub(crate) struct FfsplitClusterData {
    /// Current phase.
    pub state: FfsplitClusterState,
}

/// See the module docs.
pub(crate) struct FfsplitAlgorithm;

fn client_data(state: &ServerState, key: ClientKey) -> &FfsplitClientData {
    match &state.clients[key].algo {
        ClientAlgoData::Ffsplit(data) => data,
        other => unreachable!("ffsplit client scratch missing: {:?}", other),
    }
}

fn client_data_mut(state: &mut ServerState, key: ClientKey) -> &mut FfsplitClientData {
    match &mut state.clients[key].algo {
        ClientAlgoData::Ffsplit(data) => data,
        other => unreachable!("ffsplit client scratch missing: {:?}", other),
    }
}

fn set_cluster_state(state: &mut ServerState, key: ClientKey, new_state: FfsplitClusterState) {
    if let Some(ClusterAlgoData::Ffsplit(data)) = state.cluster_algo_mut(key) {
        data.state = new_state;
    }
}

fn cluster_state(state: &ServerState, key: ClientKey) -> FfsplitClusterState {
    match state.cluster_algo(key) {
        Some(ClusterAlgoData::Ffsplit(data)) => data.state,
        _ => FfsplitClusterState::WaitingForChange,
    }
}

fn contains_node(list: &[NodeInfo], node_id: u32) -> bool {
    list.iter().any(|node| node.node_id == node_id)
}

/// The candidate partition of one client: its view of the configuration
/// and membership, with the in-flight values substituted for the client
/// that triggered the decision.
struct PartitionView<'a> {
    key: ClientKey,
    config: &'a [NodeInfo],
    membership: &'a [NodeInfo],
    heuristics: Heuristics,
}

/// All connected clients of the cluster must share one configuration node
/// list, and all members of one partition must report the same ring id
/// and the same membership node list.
fn is_membership_stable(
    state: &ServerState,
    key: ClientKey,
    leaving: bool,
    ring_id: &RingId,
    config_nodes: &[NodeInfo],
    membership_nodes: &[NodeInfo],
) -> bool {
    let members = state.cluster_member_keys(key);

    for &k1 in &members {
        for &k2 in &members {
            if k1 == k2 {
                continue;
            }
            if (k1 == key || k2 == key) && leaving {
                continue;
            }
            let list1 = if k1 == key {
                config_nodes
            } else {
                state.clients[k1].configuration_node_list.as_slice()
            };
            let list2 = if k2 == key {
                config_nodes
            } else {
                state.clients[k2].configuration_node_list.as_slice()
            };
            if list1.iter().any(|node| !contains_node(list2, node.node_id)) {
                return false;
            }
        }
    }

    for &k1 in &members {
        if k1 == key && leaving {
            continue;
        }
        let (membership1, ring1) = if k1 == key {
            (membership_nodes, ring_id)
        } else {
            let client = &state.clients[k1];
            (
                client.last_membership_node_list.as_slice(),
                &client.last_ring_id,
            )
        };
        for node in membership1 {
            let Some(k2) = state.find_cluster_member_by_node_id(key, node.node_id) else {
                // Not connected; nothing to compare against.
                continue;
            };
            if k2 == key && leaving {
                continue;
            }
            let (membership2, ring2) = if k2 == key {
                (membership_nodes, ring_id)
            } else {
                let client = &state.clients[k2];
                (
                    client.last_membership_node_list.as_slice(),
                    &client.last_ring_id,
                )
            };
            if ring1 != ring2 {
                return false;
            }
            if membership1
                .iter()
                .any(|node| !contains_node(membership2, node.node_id))
            {
                return false;
            }
        }
    }

    true
}

/// Connected clients of a partition plus their heuristics tallies.
fn partition_stats(state: &ServerState, key: ClientKey, view: &PartitionView) -> (i64, i64, i64) {
    let mut active = 0;
    let mut pass = 0;
    let mut fail = 0;
    for node in view.membership {
        let Some(k) = state.find_cluster_member_by_node_id(key, node.node_id) else {
            continue;
        };
        active += 1;
        let heuristics = if k == view.key {
            view.heuristics
        } else {
            state.clients[k].last_heuristics
        };
        match heuristics {
            Heuristics::Pass => pass += 1,
            Heuristics::Fail => fail += 1,
            Heuristics::Undefined => {}
        }
    }
    (active, pass, fail)
}

/// The tie-breaker node under the cluster's configured mode is inside
/// this partition.
fn is_preferred_partition(state: &ServerState, view: &PartitionView) -> bool {
    let tie_breaker = state.clients[view.key]
        .tie_breaker
        .unwrap_or(TieBreaker::Lowest);
    let preferred = match tie_breaker {
        TieBreaker::Lowest => view.config.iter().map(|node| node.node_id).min(),
        TieBreaker::Highest => view.config.iter().map(|node| node.node_id).max(),
        TieBreaker::NodeId(node_id) => Some(node_id),
    };
    preferred.is_some_and(|node_id| contains_node(view.membership, node_id))
}

/// Strictly ordered partition comparison: configured-majority first, then
/// score, then active client count, then the tie-breaker.
fn partition_better(
    state: &ServerState,
    key: ClientKey,
    candidate: &PartitionView,
    best: Option<&PartitionView>,
) -> bool {
    let config_size = candidate.config.len();
    if config_size % 2 != 0 {
        // Odd clusters never split fifty-fifty; majority is decisive.
        return candidate.membership.len() > config_size / 2;
    }
    if candidate.membership.len() > config_size / 2 {
        return true;
    }
    if candidate.membership.len() < config_size / 2 {
        return false;
    }

    let (active1, pass1, fail1) = partition_stats(state, key, candidate);
    let (active2, pass2, fail2) = match best {
        Some(best) => partition_stats(state, key, best),
        None => (0, 0, 0),
    };

    let score1 = active1 + pass1 - fail1;
    let score2 = active2 + pass2 - fail2;
    if score1 != score2 {
        return score1 > score2;
    }
    if active1 != active2 {
        return active1 > active2;
    }

    is_preferred_partition(state, candidate)
}

/// Pick the membership node list of the winning partition, or `None` when
/// no partition qualifies for quorum.
fn select_partition(
    state: &ServerState,
    key: ClientKey,
    leaving: bool,
    config_nodes: &[NodeInfo],
    membership_nodes: &[NodeInfo],
    heuristics: Heuristics,
) -> Option<Vec<u32>> {
    let members = state.cluster_member_keys(key);
    let mut best: Option<PartitionView> = None;

    for &k in &members {
        let view = if k == key {
            if leaving {
                continue;
            }
            PartitionView {
                key,
                config: config_nodes,
                membership: membership_nodes,
                heuristics,
            }
        } else {
            let client = &state.clients[k];
            PartitionView {
                key: k,
                config: &client.configuration_node_list,
                membership: &client.last_membership_node_list,
                heuristics: client.last_heuristics,
            }
        };
        if partition_better(state, key, &view, best.as_ref()) {
            best = Some(view);
        }
    }

    best.map(|view| view.membership.iter().map(|node| node.node_id).collect())
}

/// Flip every client's voting state to match the winning partition.
fn update_nodes_state(
    state: &mut ServerState,
    key: ClientKey,
    leaving: bool,
    winning: Option<&[u32]>,
) {
    for k in state.cluster_member_keys(key) {
        if k == key && leaving {
            client_data_mut(state, k).state = FfsplitClientState::WaitingForChange;
            continue;
        }
        let node_id = state.clients[k].node_id;
        let in_winning = match (winning, node_id) {
            (Some(winning), Some(node_id)) => winning.contains(&node_id),
            _ => false,
        };
        client_data_mut(state, k).state = if in_winning {
            FfsplitClientState::SendingAck
        } else {
            FfsplitClientState::SendingNack
        };
    }
}

/// Push VoteInfo to every client in the matching sending state. Returns
/// the number of votes pushed.
fn send_votes(
    state: &mut ServerState,
    key: ClientKey,
    leaving: bool,
    ring_id: &RingId,
    send_acks: bool,
) -> usize {
    let mut sent = 0;
    for k in state.cluster_member_keys(key) {
        let ring_id_to_send = if k == key {
            if leaving {
                continue;
            }
            *ring_id
        } else {
            state.clients[k].last_ring_id
        };

        let vote = {
            let data = client_data(state, k);
            match (send_acks, data.state) {
                (true, FfsplitClientState::SendingAck) => Vote::Ack,
                (false, FfsplitClientState::SendingNack) => Vote::Nack,
                _ => continue,
            }
        };

        let seq_number = {
            let data = client_data_mut(state, k);
            data.vote_info_expected_seq += 1;
            data.vote_info_expected_seq
        };
        sent += 1;

        let _ = state.send_vote_info(k, seq_number, ring_id_to_send, vote);
    }
    sent
}

/// How many clients are still awaiting a VoteInfo reply in the given
/// sending state.
fn clients_in_sending_state(state: &ServerState, key: ClientKey, sending_acks: bool) -> usize {
    let wanted = if sending_acks {
        FfsplitClientState::SendingAck
    } else {
        FfsplitClientState::SendingNack
    };
    state
        .cluster_member_keys(key)
        .into_iter()
        .filter(|&k| client_data(state, k).state == wanted)
        .count()
}

/// The decision driver, run on every event that could change the outcome.
fn ffsplit_do(
    state: &mut ServerState,
    key: ClientKey,
    leaving: bool,
    ring_id: &RingId,
    config_nodes: &[NodeInfo],
    membership_nodes: &[NodeInfo],
    heuristics: Heuristics,
) -> Vote {
    set_cluster_state(state, key, FfsplitClusterState::WaitingForStableMembership);

    if !is_membership_stable(state, key, leaving, ring_id, config_nodes, membership_nodes) {
        debug!("ffsplit: membership is not yet stable");
        return Vote::WaitForReply;
    }
    debug!("ffsplit: membership is now stable");

    let winning = select_partition(state, key, leaving, config_nodes, membership_nodes, heuristics);
    match &winning {
        None => debug!("ffsplit: no quorate partition was selected"),
        Some(nodes) => debug!(?nodes, "ffsplit: quorate partition selected"),
    }

    update_nodes_state(state, key, leaving, winning.as_deref());

    set_cluster_state(state, key, FfsplitClusterState::SendingNacks);
    if send_votes(state, key, leaving, ring_id, false) == 0 {
        debug!("ffsplit: no client gets NACK");
        set_cluster_state(state, key, FfsplitClusterState::SendingAcks);
        if send_votes(state, key, leaving, ring_id, true) == 0 {
            debug!("ffsplit: no client gets ACK");
            set_cluster_state(state, key, FfsplitClusterState::WaitingForChange);
        }
    }

    Vote::NoChange
}

impl Algorithm for FfsplitAlgorithm {
    fn client_init(&self, state: &mut ServerState, key: ClientKey) -> Result<(), ReplyErrorCode> {
        if state.cluster_member_keys(key).len() == 1 {
            if let Some(data) = state.cluster_algo_mut(key) {
                *data = ClusterAlgoData::Ffsplit(FfsplitClusterData::default());
            }
        }
        state.clients[key].algo = ClientAlgoData::Ffsplit(FfsplitClientData::default());
        Ok(())
    }

    fn config_node_list_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        _seq: u32,
        _config_version: Option<u64>,
        nodes: &[NodeInfo],
        initial: bool,
    ) -> Result<Vote, ReplyErrorCode> {
        let client = &state.clients[key];
        if nodes.is_empty() {
            return Err(ReplyErrorCode::InvalidConfigNodeList);
        }
        if !client
            .node_id
            .is_some_and(|node_id| contains_node(nodes, node_id))
        {
            return Err(ReplyErrorCode::InvalidConfigNodeList);
        }

        if initial || client.last_membership_node_list.is_empty() {
            // Membership is going to be sent by the client next.
            return Ok(Vote::AskLater);
        }

        let ring_id = client.last_ring_id;
        let membership = client.last_membership_node_list.clone();
        let heuristics = client.last_heuristics;
        Ok(ffsplit_do(
            state, key, false, &ring_id, nodes, &membership, heuristics,
        ))
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
        let client = &state.clients[key];
        if nodes.is_empty() {
            return Err(ReplyErrorCode::InvalidMembershipNodeList);
        }
        if !client
            .node_id
            .is_some_and(|node_id| contains_node(nodes, node_id))
        {
            return Err(ReplyErrorCode::InvalidMembershipNodeList);
        }

        if client.configuration_node_list.is_empty() {
            // Config node list not received yet; it is on its way.
            return Ok(Vote::AskLater);
        }

        let config = client.configuration_node_list.clone();
        Ok(ffsplit_do(
            state, key, false, ring_id, &config, nodes, heuristics,
        ))
    }

    fn quorum_node_list_received(
        &self,
        _state: &mut ServerState,
        _key: ClientKey,
        _seq: u32,
        _quorate: Quorate,
        _nodes: &[NodeInfo],
    ) -> Result<Vote, ReplyErrorCode> {
        // The quorum node list is informative only.
        Ok(Vote::NoChange)
    }

    fn ask_for_vote_received(
        &self,
        _state: &mut ServerState,
        _key: ClientKey,
        _seq: u32,
    ) -> Result<Vote, ReplyErrorCode> {
        Err(ReplyErrorCode::UnsupportedDecisionAlgorithmMessage)
    }

    fn vote_info_reply_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        seq: u32,
    ) -> Result<(), ReplyErrorCode> {
        {
            let data = client_data_mut(state, key);
            if data.vote_info_expected_seq != seq {
                debug!("ffsplit: received old vote info reply");
                return Ok(());
            }
            data.state = FfsplitClientState::WaitingForChange;
        }

        match cluster_state(state, key) {
            FfsplitClusterState::SendingNacks => {
                if clients_in_sending_state(state, key, false) == 0 {
                    debug!("ffsplit: all NACK votes acknowledged");
                    set_cluster_state(state, key, FfsplitClusterState::SendingAcks);
                    let ring_id = state.clients[key].last_ring_id;
                    if send_votes(state, key, false, &ring_id, true) == 0 {
                        debug!("ffsplit: no client gets ACK");
                        set_cluster_state(state, key, FfsplitClusterState::WaitingForChange);
                    }
                }
            }
            FfsplitClusterState::SendingAcks => {
                if clients_in_sending_state(state, key, true) == 0 {
                    debug!("ffsplit: all ACK votes acknowledged");
                    set_cluster_state(state, key, FfsplitClusterState::WaitingForChange);
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn heuristics_change_received(
        &self,
        state: &mut ServerState,
        key: ClientKey,
        _seq: u32,
        heuristics: Heuristics,
    ) -> Result<Vote, ReplyErrorCode> {
        let client = &state.clients[key];
        if client.configuration_node_list.is_empty()
            || client.last_membership_node_list.is_empty()
        {
            return Ok(Vote::AskLater);
        }
        let ring_id = client.last_ring_id;
        let config = client.configuration_node_list.clone();
        let membership = client.last_membership_node_list.clone();
        Ok(ffsplit_do(
            state,
            key,
            false,
            &ring_id,
            &config,
            &membership,
            heuristics,
        ))
    }

    fn client_disconnect(&self, state: &mut ServerState, key: ClientKey, _server_going_down: bool) {
        let client = &state.clients[key];
        let ring_id = client.last_ring_id;
        let config = client.configuration_node_list.clone();
        let membership = client.last_membership_node_list.clone();
        let heuristics = client.last_heuristics;
        ffsplit_do(state, key, true, &ring_id, &config, &membership, heuristics);
    }

    fn timer_callback(
        &self,
        _state: &mut ServerState,
        _key: ClientKey,
    ) -> Result<TimerDecision, ReplyErrorCode> {
        Ok(TimerDecision::default())
    }
}

//! Server-side message handling: legality per state, option validation,
//! algorithm dispatch and reply construction.

use std::time::Duration;

use arbiter_proto::{
    decode_message, encode_echo_reply, DecodedMessage, InboundFrame, Message, MsgType,
    NodeListType, ReplyErrorCode, SkipReason, TlsSupported, SUPPORTED_DECISION_ALGORITHMS,
    SUPPORTED_MESSAGES, SUPPORTED_OPTIONS,
};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::algo::algorithm;
use crate::server::{ClientKey, Cluster, ServerState};

/// What the connection pump should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Keep the connection.
    Continue,
    /// Install the TLS layer, then keep the connection.
    StartTls,
    /// Tear the connection down.
    Disconnect,
}

/// Queue a ServerError reply. A failure already marked the client for
/// disconnect.
pub(crate) fn send_err(
    state: &mut ServerState,
    key: ClientKey,
    seq_number: Option<u32>,
    reply_error_code: ReplyErrorCode,
) -> Result<(), ()> {
    state.send_to_client(
        key,
        &Message::ServerError {
            seq_number,
            reply_error_code,
        },
    )
}

fn err_disposition(result: Result<(), ()>) -> Disposition {
    match result {
        Ok(()) => Disposition::Continue,
        Err(()) => Disposition::Disconnect,
    }
}

enum TlsCheck {
    Proceed,
    Skip,
    Disconnect,
}

/// Enforce the TLS policy on a post-handshake message: a TLS-required
/// server refuses plaintext, and a certificate-requiring server verifies
/// the client presented one during the handshake.
fn check_tls(state: &mut ServerState, key: ClientKey, seq_number: Option<u32>) -> TlsCheck {
    let (addr, tls_started, cert_presented, cert_verified) = {
        let client = &state.clients[key];
        (
            client.addr,
            client.tls_started,
            client.tls_cert_presented,
            client.tls_peer_cert_verified,
        )
    };

    let (tls_required, check_certificate) = match state.tls_supported {
        TlsSupported::Unsupported => (false, false),
        TlsSupported::Supported => (
            false,
            tls_started && state.tls_client_cert_required && !cert_verified,
        ),
        TlsSupported::Required => (true, state.tls_client_cert_required && !cert_verified),
    };

    if tls_required && !tls_started {
        warn!(%addr, "TLS is required but not started, sending error reply");
        return match send_err(state, key, seq_number, ReplyErrorCode::TlsRequired) {
            Ok(()) => TlsCheck::Skip,
            Err(()) => TlsCheck::Disconnect,
        };
    }

    if check_certificate && tls_started {
        if !cert_presented {
            warn!(%addr, "client did not present a certificate, disconnecting");
            return TlsCheck::Disconnect;
        }
        state.clients[key].tls_peer_cert_verified = true;
    }

    TlsCheck::Proceed
}

/// Handle one inbound item, under the state lock.
pub(crate) fn process_inbound(
    state: &mut ServerState,
    key: ClientKey,
    inbound: &InboundFrame,
) -> Disposition {
    match state.clients.get_mut(key) {
        Some(client) => client.dpd_msg_received = true,
        None => return Disposition::Disconnect,
    }

    let frame = match inbound {
        InboundFrame::Skipped(SkipReason::UnknownType(msg_type)) => {
            warn!(msg_type, "unsupported message received, sending error reply");
            return err_disposition(send_err(
                state,
                key,
                None,
                ReplyErrorCode::UnsupportedMessage,
            ));
        }
        InboundFrame::Skipped(SkipReason::TooLong { declared, max }) => {
            warn!(declared, max, "oversized message skipped, sending error reply");
            return err_disposition(send_err(state, key, None, ReplyErrorCode::MessageTooLong));
        }
        InboundFrame::Frame(frame) => frame,
    };

    let msg = match decode_message(frame) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(%err, "can't decode message, sending error reply");
            return err_disposition(send_err(
                state,
                key,
                None,
                ReplyErrorCode::ErrorDecodingMsg,
            ));
        }
    };

    match msg.msg_type {
        Some(MsgType::Preinit) => msg_preinit(state, key, &msg),
        Some(MsgType::StartTls) => msg_starttls(state, key, &msg),
        Some(MsgType::Init) => msg_init(state, key, &msg),
        Some(MsgType::SetOption) => msg_set_option(state, key, &msg),
        Some(MsgType::EchoRequest) => msg_echo_request(state, key, &msg, frame),
        Some(MsgType::NodeList) => msg_node_list(state, key, &msg),
        Some(MsgType::AskForVote) => msg_ask_for_vote(state, key, &msg),
        Some(MsgType::VoteInfoReply) => msg_vote_info_reply(state, key, &msg),
        Some(MsgType::HeuristicsChange) => msg_heuristics_change(state, key, &msg),
        Some(
            MsgType::PreinitReply
            | MsgType::InitReply
            | MsgType::ServerError
            | MsgType::SetOptionReply
            | MsgType::EchoReply
            | MsgType::NodeListReply
            | MsgType::AskForVoteReply
            | MsgType::VoteInfo
            | MsgType::HeuristicsChangeReply,
        ) => {
            warn!("received a reply-type message from a client, sending error reply");
            err_disposition(send_err(
                state,
                key,
                msg.seq_number,
                ReplyErrorCode::UnexpectedMessage,
            ))
        }
        None => err_disposition(send_err(
            state,
            key,
            msg.seq_number,
            ReplyErrorCode::UnsupportedMessage,
        )),
    }
}

fn msg_preinit(state: &mut ServerState, key: ClientKey, msg: &DecodedMessage) -> Disposition {
    let Some(cluster_name) = msg.cluster_name.clone() else {
        warn!("preinit without cluster name, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            msg.seq_number,
            ReplyErrorCode::DoesntContainRequiredOption,
        ));
    };

    {
        let client = &mut state.clients[key];
        client.cluster_name = Some(cluster_name);
        client.preinit_received = true;
    }

    let reply = Message::PreinitReply {
        seq_number: msg.seq_number,
        tls_supported: state.tls_supported,
        tls_client_cert_required: state.tls_client_cert_required,
    };
    err_disposition(state.send_to_client(key, &reply))
}

fn msg_starttls(state: &mut ServerState, key: ClientKey, msg: &DecodedMessage) -> Disposition {
    if !state.clients[key].preinit_received {
        warn!("starttls before preinit, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            msg.seq_number,
            ReplyErrorCode::PreinitRequired,
        ));
    }
    if state.clients[key].tls_started {
        warn!("starttls on an already-upgraded connection, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            msg.seq_number,
            ReplyErrorCode::UnexpectedMessage,
        ));
    }
    Disposition::StartTls
}

/// Cluster-wide consistency: one tie-breaker, one algorithm, unique node
/// ids. Run before the new client joins its cluster.
fn check_new_client(state: &ServerState, key: ClientKey) -> ReplyErrorCode {
    let new_client = &state.clients[key];
    let Some(cluster) = new_client
        .cluster_name
        .as_deref()
        .and_then(|name| state.clusters.get(name))
    else {
        return ReplyErrorCode::NoError;
    };

    for &member in &cluster.members {
        let other = &state.clients[member];
        if other.tie_breaker != new_client.tie_breaker {
            warn!("init with a tie-breaker differing from the rest of the cluster");
            return ReplyErrorCode::TieBreakerDiffersFromOtherNodes;
        }
        if other.decision_algorithm != new_client.decision_algorithm {
            warn!("init with an algorithm differing from the rest of the cluster");
            return ReplyErrorCode::AlgorithmDiffersFromOtherNodes;
        }
        if other.node_id == new_client.node_id {
            warn!("init with a node id already used in the cluster");
            return ReplyErrorCode::DuplicateNodeId;
        }
    }
    ReplyErrorCode::NoError
}

fn supported_algorithms(state: &ServerState) -> Vec<arbiter_proto::DecisionAlgorithm> {
    SUPPORTED_DECISION_ALGORITHMS
        .iter()
        .copied()
        .filter(|algorithm| {
            state.settings.test_algorithm_enabled
                || *algorithm != arbiter_proto::DecisionAlgorithm::Test
        })
        .collect()
}

fn msg_init(state: &mut ServerState, key: ClientKey, msg: &DecodedMessage) -> Disposition {
    match check_tls(state, key, msg.seq_number) {
        TlsCheck::Proceed => {}
        TlsCheck::Skip => return Disposition::Continue,
        TlsCheck::Disconnect => return Disposition::Disconnect,
    }

    let mut code = ReplyErrorCode::NoError;

    if !state.clients[key].preinit_received {
        warn!("init before preinit, sending error reply");
        code = ReplyErrorCode::PreinitRequired;
    }

    if code == ReplyErrorCode::NoError {
        match msg.node_id {
            None => {
                warn!("init without node id, sending error reply");
                code = ReplyErrorCode::DoesntContainRequiredOption;
            }
            Some(node_id) => state.clients[key].node_id = Some(node_id),
        }
    }

    if code == ReplyErrorCode::NoError {
        match msg.ring_id {
            None => {
                warn!("init without ring id, sending error reply");
                code = ReplyErrorCode::DoesntContainRequiredOption;
            }
            Some(ring_id) => state.clients[key].last_ring_id = ring_id,
        }
    }

    if code == ReplyErrorCode::NoError {
        match msg.heartbeat_interval {
            None => {
                warn!("init without heartbeat interval, sending error reply");
                code = ReplyErrorCode::DoesntContainRequiredOption;
            }
            Some(interval)
                if interval < state.settings.heartbeat_interval_min
                    || interval > state.settings.heartbeat_interval_max =>
            {
                warn!(interval, "init with invalid heartbeat interval, sending error reply");
                code = ReplyErrorCode::InvalidHeartbeatInterval;
            }
            Some(interval) => state.clients[key].heartbeat_interval = interval,
        }
    }

    if code == ReplyErrorCode::NoError {
        match msg.tie_breaker {
            None => {
                warn!("init without tie-breaker, sending error reply");
                code = ReplyErrorCode::DoesntContainRequiredOption;
            }
            Some(tie_breaker) => state.clients[key].tie_breaker = Some(tie_breaker),
        }
    }

    if code == ReplyErrorCode::NoError {
        match msg.decision_algorithm {
            None => {
                warn!("init without decision algorithm, sending error reply");
                code = ReplyErrorCode::DoesntContainRequiredOption;
            }
            Some(kind) => {
                if supported_algorithms(state).contains(&kind) {
                    state.clients[key].decision_algorithm = Some(kind);
                } else {
                    warn!(%kind, "unsupported decision algorithm requested, sending error reply");
                    code = ReplyErrorCode::UnsupportedDecisionAlgorithm;
                }
            }
        }
    }

    if code == ReplyErrorCode::NoError {
        code = check_new_client(state, key);
    }

    if code == ReplyErrorCode::NoError {
        let name = state.clients[key]
            .cluster_name
            .clone()
            .unwrap_or_default();
        state
            .clusters
            .entry(name)
            .or_insert_with(|| Cluster {
                members: Vec::new(),
                algo: Default::default(),
            })
            .members
            .push(key);

        let kind = state.clients[key]
            .decision_algorithm
            .unwrap_or(arbiter_proto::DecisionAlgorithm::Ffsplit);
        if let Err(algo_code) = algorithm(kind).client_init(state, key) {
            warn!("algorithm init returned error code, sending error reply");
            code = algo_code;
        }
    }

    if code == ReplyErrorCode::NoError {
        let client = &mut state.clients[key];
        client.init_received = true;
        debug!(
            addr = %client.addr,
            cluster = client.cluster_name.as_deref().unwrap_or(""),
            node_id = client.node_id.unwrap_or(0),
            "new client initialized"
        );
    }

    let reply = Message::InitReply {
        reply_error_code: code,
        supported_messages: if msg.supported_messages.is_some() {
            SUPPORTED_MESSAGES.to_vec()
        } else {
            Vec::new()
        },
        supported_options: if msg.supported_options.is_some() {
            SUPPORTED_OPTIONS.to_vec()
        } else {
            Vec::new()
        },
        seq_number: msg.seq_number,
        server_maximum_request_size: state.settings.max_client_receive_size as u32,
        server_maximum_reply_size: state.settings.max_client_send_size as u32,
        supported_decision_algorithms: supported_algorithms(state),
    };
    err_disposition(state.send_to_client(key, &reply))
}

fn msg_set_option(state: &mut ServerState, key: ClientKey, msg: &DecodedMessage) -> Disposition {
    match check_tls(state, key, msg.seq_number) {
        TlsCheck::Proceed => {}
        TlsCheck::Skip => return Disposition::Continue,
        TlsCheck::Disconnect => return Disposition::Disconnect,
    }

    if !state.clients[key].init_received {
        warn!("set option before init, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            msg.seq_number,
            ReplyErrorCode::InitRequired,
        ));
    }

    if let Some(interval) = msg.heartbeat_interval {
        if interval < state.settings.heartbeat_interval_min
            || interval > state.settings.heartbeat_interval_max
        {
            warn!(interval, "set option with invalid heartbeat interval, sending error reply");
            return err_disposition(send_err(
                state,
                key,
                msg.seq_number,
                ReplyErrorCode::InvalidHeartbeatInterval,
            ));
        }
        state.clients[key].heartbeat_interval = interval;
    }

    let reply = Message::SetOptionReply {
        seq_number: msg.seq_number,
        heartbeat_interval: state.clients[key].heartbeat_interval,
    };
    err_disposition(state.send_to_client(key, &reply))
}

fn msg_echo_request(
    state: &mut ServerState,
    key: ClientKey,
    msg: &DecodedMessage,
    frame: &Bytes,
) -> Disposition {
    match check_tls(state, key, msg.seq_number) {
        TlsCheck::Proceed => {}
        TlsCheck::Skip => return Disposition::Continue,
        TlsCheck::Disconnect => return Disposition::Disconnect,
    }

    if !state.clients[key].init_received {
        warn!("echo request before init, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            msg.seq_number,
            ReplyErrorCode::InitRequired,
        ));
    }

    let reply = match encode_echo_reply(frame, state.settings.max_client_send_size) {
        Ok(reply) => reply,
        Err(err) => {
            warn!(%err, "can't build echo reply, disconnecting client");
            return Disposition::Disconnect;
        }
    };
    err_disposition(state.send_frame(key, reply))
}

fn msg_node_list(state: &mut ServerState, key: ClientKey, msg: &DecodedMessage) -> Disposition {
    match check_tls(state, key, msg.seq_number) {
        TlsCheck::Proceed => {}
        TlsCheck::Skip => return Disposition::Continue,
        TlsCheck::Disconnect => return Disposition::Disconnect,
    }

    if !state.clients[key].init_received {
        warn!("node list before init, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            msg.seq_number,
            ReplyErrorCode::InitRequired,
        ));
    }

    let Some(list_type) = msg.node_list_type else {
        warn!("node list without list type, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            msg.seq_number,
            ReplyErrorCode::DoesntContainRequiredOption,
        ));
    };
    let Some(seq) = msg.seq_number else {
        warn!("node list without seq number, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            None,
            ReplyErrorCode::DoesntContainRequiredOption,
        ));
    };

    let kind = match state.clients[key].decision_algorithm {
        Some(kind) => kind,
        None => return Disposition::Disconnect,
    };

    let result = match list_type {
        NodeListType::InitialConfig | NodeListType::ChangedConfig => {
            debug!(seq, %list_type, nodes = msg.nodes.len(), "config node list received");
            algorithm(kind).config_node_list_received(
                state,
                key,
                seq,
                msg.config_version,
                &msg.nodes,
                list_type == NodeListType::InitialConfig,
            )
        }
        NodeListType::Membership => {
            let Some(ring_id) = msg.ring_id else {
                warn!("membership node list without ring id, sending error reply");
                return err_disposition(send_err(
                    state,
                    key,
                    msg.seq_number,
                    ReplyErrorCode::DoesntContainRequiredOption,
                ));
            };
            debug!(seq, %ring_id, nodes = msg.nodes.len(), "membership node list received");
            algorithm(kind).membership_node_list_received(
                state,
                key,
                seq,
                &ring_id,
                &msg.nodes,
                msg.heuristics,
            )
        }
        NodeListType::Quorum => {
            let Some(quorate) = msg.quorate else {
                warn!("quorum node list without quorate flag, sending error reply");
                return err_disposition(send_err(
                    state,
                    key,
                    msg.seq_number,
                    ReplyErrorCode::DoesntContainRequiredOption,
                ));
            };
            debug!(seq, ?quorate, nodes = msg.nodes.len(), "quorum node list received");
            algorithm(kind).quorum_node_list_received(state, key, seq, quorate, &msg.nodes)
        }
    };

    let vote = match result {
        Ok(vote) => vote,
        Err(code) => {
            warn!("algorithm returned error code, sending error reply");
            return err_disposition(send_err(state, key, msg.seq_number, code));
        }
    };
    debug!(%vote, "algorithm result vote");

    {
        let client = &mut state.clients[key];
        match list_type {
            NodeListType::InitialConfig | NodeListType::ChangedConfig => {
                client.configuration_node_list = msg.nodes.clone();
                client.config_version = msg.config_version;
            }
            NodeListType::Membership => {
                client.last_membership_node_list = msg.nodes.clone();
                client.last_ring_id = msg.ring_id.unwrap_or_default();
                client.last_membership_heuristics = msg.heuristics;
                client.last_heuristics = msg.heuristics;
            }
            NodeListType::Quorum => {
                client.last_quorum_node_list = msg.nodes.clone();
            }
        }

        client.last_sent_vote = vote;
        if vote.is_ack_or_nack() {
            client.last_sent_ack_nack_vote = vote;
        }
    }

    let reply = Message::NodeListReply {
        seq_number: seq,
        list_type,
        ring_id: state.clients[key].last_ring_id,
        vote,
    };
    err_disposition(state.send_to_client(key, &reply))
}

fn msg_ask_for_vote(state: &mut ServerState, key: ClientKey, msg: &DecodedMessage) -> Disposition {
    match check_tls(state, key, msg.seq_number) {
        TlsCheck::Proceed => {}
        TlsCheck::Skip => return Disposition::Continue,
        TlsCheck::Disconnect => return Disposition::Disconnect,
    }

    if !state.clients[key].init_received {
        warn!("ask for vote before init, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            msg.seq_number,
            ReplyErrorCode::InitRequired,
        ));
    }
    let Some(seq) = msg.seq_number else {
        warn!("ask for vote without seq number, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            None,
            ReplyErrorCode::DoesntContainRequiredOption,
        ));
    };

    let kind = match state.clients[key].decision_algorithm {
        Some(kind) => kind,
        None => return Disposition::Disconnect,
    };

    let vote = match algorithm(kind).ask_for_vote_received(state, key, seq) {
        Ok(vote) => vote,
        Err(code) => {
            warn!("algorithm returned error code, sending error reply");
            return err_disposition(send_err(state, key, msg.seq_number, code));
        }
    };
    debug!(%vote, "algorithm result vote");

    {
        let client = &mut state.clients[key];
        client.last_sent_vote = vote;
        if vote.is_ack_or_nack() {
            client.last_sent_ack_nack_vote = vote;
        }
    }

    let reply = Message::AskForVoteReply {
        seq_number: seq,
        ring_id: state.clients[key].last_ring_id,
        vote,
    };
    err_disposition(state.send_to_client(key, &reply))
}

fn msg_vote_info_reply(
    state: &mut ServerState,
    key: ClientKey,
    msg: &DecodedMessage,
) -> Disposition {
    match check_tls(state, key, msg.seq_number) {
        TlsCheck::Proceed => {}
        TlsCheck::Skip => return Disposition::Continue,
        TlsCheck::Disconnect => return Disposition::Disconnect,
    }

    if !state.clients[key].init_received {
        warn!("vote info reply before init, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            msg.seq_number,
            ReplyErrorCode::InitRequired,
        ));
    }
    let Some(seq) = msg.seq_number else {
        warn!("vote info reply without seq number, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            None,
            ReplyErrorCode::DoesntContainRequiredOption,
        ));
    };

    let kind = match state.clients[key].decision_algorithm {
        Some(kind) => kind,
        None => return Disposition::Disconnect,
    };
    debug!(seq, "vote info reply received");

    match algorithm(kind).vote_info_reply_received(state, key, seq) {
        Ok(()) => Disposition::Continue,
        Err(code) => {
            warn!("algorithm returned error code, sending error reply");
            err_disposition(send_err(state, key, msg.seq_number, code))
        }
    }
}

fn msg_heuristics_change(
    state: &mut ServerState,
    key: ClientKey,
    msg: &DecodedMessage,
) -> Disposition {
    match check_tls(state, key, msg.seq_number) {
        TlsCheck::Proceed => {}
        TlsCheck::Skip => return Disposition::Continue,
        TlsCheck::Disconnect => return Disposition::Disconnect,
    }

    if !state.clients[key].init_received {
        warn!("heuristics change before init, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            msg.seq_number,
            ReplyErrorCode::InitRequired,
        ));
    }

    let Some(seq) = msg.seq_number else {
        warn!("heuristics change without seq number, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            None,
            ReplyErrorCode::DoesntContainRequiredOption,
        ));
    };
    let heuristics = msg.heuristics;
    if heuristics == arbiter_proto::Heuristics::Undefined {
        warn!("heuristics change with undefined result, sending error reply");
        return err_disposition(send_err(
            state,
            key,
            msg.seq_number,
            ReplyErrorCode::DoesntContainRequiredOption,
        ));
    }

    let kind = match state.clients[key].decision_algorithm {
        Some(kind) => kind,
        None => return Disposition::Disconnect,
    };
    debug!(seq, %heuristics, "heuristics change received");

    let vote = match algorithm(kind).heuristics_change_received(state, key, seq, heuristics) {
        Ok(vote) => vote,
        Err(code) => {
            warn!("algorithm returned error code, sending error reply");
            return err_disposition(send_err(state, key, msg.seq_number, code));
        }
    };
    debug!(%vote, "algorithm result vote");

    {
        let client = &mut state.clients[key];
        client.last_sent_vote = vote;
        if vote.is_ack_or_nack() {
            client.last_sent_ack_nack_vote = vote;
        }
        client.last_regular_heuristics = heuristics;
        client.last_heuristics = heuristics;
    }

    let reply = Message::HeuristicsChangeReply {
        seq_number: seq,
        ring_id: state.clients[key].last_ring_id,
        heuristics,
        vote,
    };
    err_disposition(state.send_to_client(key, &reply))
}

/// Per-client deferred-decision timer fired.
pub(crate) fn algo_timer_fired(state: &mut ServerState, key: ClientKey) {
    let Some(client) = state.clients.get(key) else {
        return;
    };
    if !client.init_received {
        return;
    }
    let Some(kind) = client.decision_algorithm else {
        return;
    };

    match algorithm(kind).timer_callback(state, key) {
        Err(code) => {
            warn!("algorithm timer returned error code, sending error reply");
            let _ = send_err(state, key, None, code);
        }
        Ok(decision) => {
            debug!(
                reschedule = decision.reschedule,
                send_vote = decision.send_vote,
                vote = %decision.vote,
                "algorithm timer decision"
            );
            if decision.send_vote {
                let (seq_number, ring_id) = {
                    let client = &mut state.clients[key];
                    client.algo_timer_vote_info_seq += 1;
                    (client.algo_timer_vote_info_seq, client.last_ring_id)
                };
                let _ = state.send_vote_info(key, seq_number, ring_id, decision.vote);
            }
            if decision.reschedule {
                let interval =
                    Duration::from_millis(state.clients[key].heartbeat_interval as u64 / 4);
                state.schedule_algo_timer(key, interval);
            }
        }
    }
}

/// A client's connection is gone: run the algorithm hook while the client
/// is still listed in its cluster, then drop it from the registry.
pub(crate) fn client_disconnected(state: &mut ServerState, key: ClientKey, server_going_down: bool) {
    if !state.clients.contains_key(key) {
        return;
    }
    state.cancel_algo_timer(key);

    let client = &state.clients[key];
    if client.init_received {
        if let Some(kind) = client.decision_algorithm {
            algorithm(kind).client_disconnect(state, key, server_going_down);
        }
    }

    if let Some(name) = state.clients[key].cluster_name.clone() {
        if let Some(cluster) = state.clusters.get_mut(&name) {
            cluster.members.retain(|&member| member != key);
            if cluster.members.is_empty() {
                state.clusters.remove(&name);
            }
        }
    }
    state.clients.remove(key);
}

/// The whole server is shutting down; every algorithm hears about it once.
pub(crate) fn server_going_down(state: &mut ServerState) {
    let keys: Vec<ClientKey> = state.clients.keys().collect();
    for key in keys {
        client_disconnected(state, key, true);
    }
}

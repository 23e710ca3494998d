//! Scenario tests for the agent's connection state machine.

use arbiter_proto::{
    DecisionAlgorithm, Heuristics, Message, MsgType, NodeListType, Quorate, ReplyErrorCode,
    RingId, TieBreaker, TlsSupported, Vote, SUPPORTED_DECISION_ALGORITHMS, SUPPORTED_MESSAGES,
    SUPPORTED_OPTIONS,
};
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::{AgentConfig, HeuristicsSettings};
use crate::error::DisconnectReason;
use crate::runtime::RuntimeEvent;
use crate::timer::TimerWheel;

use super::{
    Agent, ConnState, ConnTimerEvent, Connection, HeuristicsKind, HeuristicsOutcome, TimerEvent,
};

const MAX: usize = 1 << 15;

fn agent_config(algorithm: DecisionAlgorithm) -> AgentConfig {
    AgentConfig {
        cluster_name: "alpha".into(),
        node_id: 1,
        host: "arbiter.example.net".into(),
        port: 5403,
        tls: TlsSupported::Unsupported,
        algorithm,
        tie_breaker: TieBreaker::Lowest,
        force_ip_version: 0,
        wait_for_all: false,
        heartbeat_interval: 8_000,
        sync_heartbeat_interval: 24_000,
        cast_vote_timer_interval: 5_000,
        connect_timeout: 8_000,
        min_send_size: 1 << 15,
        max_receive_size: 1 << 24,
        max_send_buffers: 10,
        heuristics: HeuristicsSettings::default(),
        tls_server_name: "arbiter.example.net".into(),
        tls_ca_file: None,
        tls_cert_file: None,
        tls_key_file: None,
    }
}

struct Harness {
    agent: Agent,
    conn: Connection,
    conn_wheel: TimerWheel<ConnTimerEvent>,
    wheel: TimerWheel<TimerEvent>,
    votes_tx: mpsc::UnboundedSender<bool>,
    votes_rx: mpsc::UnboundedReceiver<bool>,
    heur_tx: mpsc::UnboundedSender<HeuristicsOutcome>,
    heur_rx: mpsc::UnboundedReceiver<HeuristicsOutcome>,
}

fn harness(algorithm: DecisionAlgorithm) -> Harness {
    let config = agent_config(algorithm);
    let agent = Agent::new(config.clone(), false).unwrap();
    let conn = Connection::new(&config);
    let (votes_tx, votes_rx) = mpsc::unbounded_channel();
    let (heur_tx, heur_rx) = mpsc::unbounded_channel();
    Harness {
        agent,
        conn,
        conn_wheel: TimerWheel::new(),
        wheel: TimerWheel::new(),
        votes_tx,
        votes_rx,
        heur_tx,
        heur_rx,
    }
}

impl Harness {
    fn feed(&mut self, msg: &Message) -> Result<(), DisconnectReason> {
        let frame: Bytes = msg.encode(MAX).unwrap();
        self.agent.process_frame(
            &mut self.conn,
            &mut self.conn_wheel,
            &mut self.wheel,
            &self.votes_tx,
            &frame,
            &self.heur_tx,
        )
    }

    fn drain_sent(&mut self) -> Vec<MsgType> {
        let mut sent = Vec::new();
        while let Some(entry) = self.conn.send_queue.pop() {
            sent.push(arbiter_proto::frame_msg_type(&entry.frame).unwrap());
        }
        sent
    }

    fn good_init_reply(&self) -> Message {
        Message::InitReply {
            reply_error_code: ReplyErrorCode::NoError,
            supported_messages: SUPPORTED_MESSAGES.to_vec(),
            supported_options: SUPPORTED_OPTIONS.to_vec(),
            seq_number: Some(self.conn.last_msg_seq),
            server_maximum_request_size: 1 << 15,
            server_maximum_reply_size: 1 << 15,
            supported_decision_algorithms: SUPPORTED_DECISION_ALGORITHMS.to_vec(),
        }
    }
}

#[tokio::test]
async fn incompatible_tls_aborts_before_init() {
    let mut h = harness(DecisionAlgorithm::Ffsplit);
    // Agent offers no TLS, server requires it.
    let result = h.feed(&Message::PreinitReply {
        seq_number: Some(h.conn.last_msg_seq),
        tls_supported: TlsSupported::Required,
        tls_client_cert_required: true,
    });
    assert_eq!(result, Err(DisconnectReason::IncompatibleTls));
    assert!(h.drain_sent().is_empty());
}

#[tokio::test]
async fn plain_handshake_proceeds_to_init() {
    let mut h = harness(DecisionAlgorithm::Ffsplit);
    h.feed(&Message::PreinitReply {
        seq_number: Some(h.conn.last_msg_seq),
        tls_supported: TlsSupported::Supported,
        tls_client_cert_required: false,
    })
    .unwrap();
    assert_eq!(h.conn.state, ConnState::WaitingInitReply);
    // Seqs increase strictly: preinit used 1, init uses 2.
    assert_eq!(h.conn.last_msg_seq, 2);
    assert_eq!(h.drain_sent(), vec![MsgType::Init]);
}

#[tokio::test]
async fn preinit_reply_with_wrong_seq_disconnects() {
    let mut h = harness(DecisionAlgorithm::Ffsplit);
    let result = h.feed(&Message::PreinitReply {
        seq_number: Some(99),
        tls_supported: TlsSupported::Supported,
        tls_client_cert_required: false,
    });
    assert_eq!(result, Err(DisconnectReason::RequiredOptionMissing));
}

#[tokio::test]
async fn init_reply_negotiates_sizes_and_enters_steady_state() {
    let mut h = harness(DecisionAlgorithm::Ffsplit);
    h.conn.state = ConnState::WaitingInitReply;
    h.conn.connect_timer = Some(h.conn_wheel.schedule(
        ConnTimerEvent::ConnectTimeout,
        std::time::Duration::from_secs(8),
    ));

    let reply = h.good_init_reply();
    h.feed(&reply).unwrap();

    assert_eq!(h.conn.state, ConnState::WaitingVotequorumCmapEvents);
    assert_eq!(h.conn.max_send_size, 1 << 15);
    assert_eq!(h.conn.pending_receive_cap, Some(1 << 15));
    assert!(h.conn.connect_timer.is_none());
    assert!(h.conn.echo_timer.is_some());
    assert!(h.conn.server_supports_heuristics);
    assert_eq!(h.drain_sent(), vec![MsgType::SetOption]);

    // The after-connect heuristics run was kicked off.
    let outcome = h.heur_rx.recv().await.unwrap();
    assert!(matches!(outcome.kind, HeuristicsKind::AfterConnect));
}

#[tokio::test]
async fn init_reply_size_envelope_is_enforced() {
    let mut h = harness(DecisionAlgorithm::Ffsplit);
    h.conn.state = ConnState::WaitingInitReply;

    let Message::InitReply {
        reply_error_code,
        supported_messages,
        supported_options,
        seq_number,
        supported_decision_algorithms,
        ..
    } = h.good_init_reply()
    else {
        unreachable!();
    };
    let reply = Message::InitReply {
        reply_error_code,
        supported_messages,
        supported_options,
        seq_number,
        // Server accepts less than this client's guaranteed minimum.
        server_maximum_request_size: 1 << 10,
        server_maximum_reply_size: 1 << 15,
        supported_decision_algorithms,
    };
    assert_eq!(h.feed(&reply), Err(DisconnectReason::IncompatibleMsgSize));
}

#[tokio::test]
async fn init_reply_error_codes_map_to_retryable_reasons() {
    let mut h = harness(DecisionAlgorithm::Ffsplit);
    h.conn.state = ConnState::WaitingInitReply;

    let reply = Message::InitReply {
        reply_error_code: ReplyErrorCode::DuplicateNodeId,
        supported_messages: Vec::new(),
        supported_options: Vec::new(),
        seq_number: Some(h.conn.last_msg_seq),
        server_maximum_request_size: 1 << 15,
        server_maximum_reply_size: 1 << 15,
        supported_decision_algorithms: Vec::new(),
    };
    let result = h.feed(&reply);
    assert_eq!(result, Err(DisconnectReason::ServerSentDuplicateNodeId));
    assert!(DisconnectReason::ServerSentDuplicateNodeId.try_reconnect());
}

#[tokio::test]
async fn init_reply_without_required_algorithm_disconnects() {
    let mut h = harness(DecisionAlgorithm::Lms);
    h.conn.state = ConnState::WaitingInitReply;

    let reply = Message::InitReply {
        reply_error_code: ReplyErrorCode::NoError,
        supported_messages: SUPPORTED_MESSAGES.to_vec(),
        supported_options: SUPPORTED_OPTIONS.to_vec(),
        seq_number: Some(h.conn.last_msg_seq),
        server_maximum_request_size: 1 << 15,
        server_maximum_reply_size: 1 << 15,
        supported_decision_algorithms: vec![DecisionAlgorithm::Ffsplit],
    };
    assert_eq!(
        h.feed(&reply),
        Err(DisconnectReason::ServerDoesntSupportRequiredAlgorithm)
    );
}

#[tokio::test]
async fn stale_ring_id_reply_leaves_cast_vote_timer_unchanged() {
    let mut h = harness(DecisionAlgorithm::Ffsplit);
    h.conn.state = ConnState::WaitingVotequorumCmapEvents;

    let old_ring = RingId::new(1, 1);
    let new_ring = RingId::new(1, 2);
    h.conn.last_sent_ring_id = new_ring;

    // A reply for the ring we no longer stand behind: no effect.
    h.feed(&Message::NodeListReply {
        seq_number: 5,
        list_type: NodeListType::Membership,
        ring_id: old_ring,
        vote: Vote::Ack,
    })
    .unwrap();
    assert_eq!(h.agent.cast_vote.vote(), Vote::Undefined);
    assert!(h.votes_rx.try_recv().is_err());
    assert!(h.wheel.is_empty());

    // The same vote for the current ring takes effect immediately.
    h.feed(&Message::NodeListReply {
        seq_number: 6,
        list_type: NodeListType::Membership,
        ring_id: new_ring,
        vote: Vote::Ack,
    })
    .unwrap();
    assert_eq!(h.agent.cast_vote.vote(), Vote::Ack);
    assert_eq!(h.votes_rx.try_recv(), Ok(true));
    assert_eq!(h.wheel.len(), 1);
}

#[tokio::test]
async fn vote_info_is_acknowledged_and_applied() {
    let mut h = harness(DecisionAlgorithm::Ffsplit);
    h.conn.state = ConnState::WaitingVotequorumCmapEvents;
    let ring = RingId::new(1, 4);
    h.conn.last_sent_ring_id = ring;

    h.feed(&Message::VoteInfo {
        seq_number: 3,
        ring_id: ring,
        vote: Vote::Nack,
    })
    .unwrap();
    assert_eq!(h.agent.cast_vote.vote(), Vote::Nack);
    assert_eq!(h.votes_rx.try_recv(), Ok(false));
    assert_eq!(h.drain_sent(), vec![MsgType::VoteInfoReply]);
}

#[tokio::test]
async fn echo_miss_disconnects_by_default_but_not_under_lms_wfa() {
    // Default behavior: one missed reply window drops the link.
    let mut h = harness(DecisionAlgorithm::Ffsplit);
    h.conn.state = ConnState::WaitingVotequorumCmapEvents;
    h.conn.echo_expected_seq = 3;
    h.conn.echo_received_seq = 2;
    assert_eq!(
        h.agent.echo_tick(&mut h.conn, &mut h.conn_wheel),
        Err(DisconnectReason::EchoReplyNotReceived)
    );

    // lms with wait_for_all and local quorum keeps asserting the vote.
    let mut config = agent_config(DecisionAlgorithm::Lms);
    config.wait_for_all = true;
    let mut agent = Agent::new(config.clone(), false).unwrap();
    let mut conn = Connection::new(&config);
    conn.state = ConnState::WaitingVotequorumCmapEvents;
    let mut conn_wheel = TimerWheel::new();
    let mut wheel = TimerWheel::new();
    let (votes_tx, mut votes_rx) = mpsc::unbounded_channel();

    agent.cache_view(RuntimeEvent::QuorumNodeList {
        quorate: Quorate::Quorate,
        nodes: Vec::new(),
    });
    agent
        .update_cast_vote(&mut wheel, &votes_tx, Vote::Ack)
        .unwrap();
    assert_eq!(votes_rx.try_recv(), Ok(true));

    conn.echo_expected_seq = 3;
    conn.echo_received_seq = 2;
    assert_eq!(agent.echo_tick(&mut conn, &mut conn_wheel), Ok(()));
    // The vote is still asserted on the next tick.
    assert_eq!(agent.cast_vote.vote(), Vote::Ack);
    agent.cast_vote.tick(&mut wheel, &votes_tx).unwrap();
    assert_eq!(votes_rx.try_recv(), Ok(true));
}

#[tokio::test]
async fn stale_membership_heuristics_outcome_is_dropped() {
    let mut h = harness(DecisionAlgorithm::Ffsplit);
    h.conn.state = ConnState::WaitingVotequorumCmapEvents;
    h.agent.membership_generation = 5;

    h.agent
        .handle_heuristics_outcome(
            &mut h.conn,
            &mut h.conn_wheel,
            &mut h.wheel,
            &h.votes_tx,
            HeuristicsOutcome {
                kind: HeuristicsKind::Membership {
                    generation: 4,
                    ring_id: RingId::new(1, 9),
                    nodes: vec![1, 2],
                },
                result: Heuristics::Pass,
            },
        )
        .unwrap();
    assert!(h.drain_sent().is_empty());
}

#[tokio::test]
async fn membership_event_pauses_cast_vote_and_probes() {
    let mut h = harness(DecisionAlgorithm::Ffsplit);
    h.conn.state = ConnState::WaitingVotequorumCmapEvents;

    let ring = RingId::new(1, 7);
    let votes_tx = h.votes_tx.clone();
    h.agent
        .handle_runtime_event(
            &mut h.conn,
            &mut h.wheel,
            &votes_tx,
            RuntimeEvent::MembershipNodeList {
                ring_id: ring,
                nodes: vec![1, 2],
            },
            &h.heur_tx.clone(),
        )
        .unwrap();

    let outcome = h.heur_rx.recv().await.unwrap();
    let HeuristicsKind::Membership {
        generation,
        ring_id,
        nodes,
    } = outcome.kind
    else {
        panic!("expected a membership probe run");
    };
    assert_eq!(generation, h.agent.membership_generation);
    assert_eq!(ring_id, ring);
    assert_eq!(nodes, vec![1, 2]);

    // Completing the run sends the list and records the ring id.
    h.agent
        .handle_heuristics_outcome(
            &mut h.conn,
            &mut h.conn_wheel,
            &mut h.wheel,
            &votes_tx,
            HeuristicsOutcome {
                kind: HeuristicsKind::Membership {
                    generation,
                    ring_id: ring,
                    nodes: vec![1, 2],
                },
                result: Heuristics::Undefined,
            },
        )
        .unwrap();
    assert_eq!(h.conn.last_sent_ring_id, ring);
    assert_eq!(h.drain_sent(), vec![MsgType::NodeList]);
}

//! Wire-level tests: a real server on an ephemeral port, driven by raw
//! framed clients.

use std::net::SocketAddr;
use std::time::Duration;

use arbiter_net::{Server, ServerSettings};
use arbiter_proto::{
    decode_message, DecisionAlgorithm, DecodedMessage, FrameCodec, Heuristics, InboundFrame,
    Message, MsgType, NodeInfo, NodeListType, ReplyErrorCode, RingId, TieBreaker, TlsSupported,
    Vote, DEFAULT_MAX_FRAME_SIZE, SUPPORTED_DECISION_ALGORITHMS, SUPPORTED_MESSAGES,
    SUPPORTED_OPTIONS,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

struct TestServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<std::io::Result<()>>,
}

fn start_server() -> TestServer {
    let server = Server {
        settings: ServerSettings::default(),
        tls_supported: TlsSupported::Unsupported,
        tls_client_cert_required: false,
    };
    let bound = server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = bound.local_addr();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(bound.serve(cancel.clone()));
    TestServer {
        addr,
        cancel,
        handle,
    }
}

impl TestServer {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

struct TestClient {
    framed: Framed<TcpStream, FrameCodec>,
    seq: u32,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        TestClient {
            framed: Framed::new(stream, FrameCodec::new(DEFAULT_MAX_FRAME_SIZE)),
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u32 {
        self.seq += 1;
        self.seq
    }

    async fn send(&mut self, msg: &Message) {
        let frame = msg.encode(DEFAULT_MAX_FRAME_SIZE).unwrap();
        self.framed.send(frame).await.unwrap();
    }

    async fn recv(&mut self) -> DecodedMessage {
        let item = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for a server reply")
            .expect("server closed the connection")
            .unwrap();
        match item {
            InboundFrame::Frame(frame) => decode_message(&frame).unwrap(),
            InboundFrame::Skipped(reason) => panic!("unprocessable reply: {:?}", reason),
        }
    }

    /// Preinit + init, asserting the success path.
    async fn handshake(
        &mut self,
        cluster: &str,
        node_id: u32,
        algorithm: DecisionAlgorithm,
        tie_breaker: TieBreaker,
        ring_id: RingId,
    ) {
        let seq = self.next_seq();
        self.send(&Message::Preinit {
            seq_number: Some(seq),
            cluster_name: cluster.to_string(),
        })
        .await;
        let reply = self.recv().await;
        assert_eq!(reply.msg_type, Some(MsgType::PreinitReply));
        assert_eq!(reply.seq_number, Some(seq));
        assert_eq!(reply.tls_supported, Some(TlsSupported::Unsupported));

        let seq = self.next_seq();
        self.send(&Message::Init {
            seq_number: Some(seq),
            supported_messages: SUPPORTED_MESSAGES.to_vec(),
            supported_options: SUPPORTED_OPTIONS.to_vec(),
            node_id,
            decision_algorithm: algorithm,
            heartbeat_interval: 8_000,
            tie_breaker,
            ring_id,
        })
        .await;
        let reply = self.recv().await;
        assert_eq!(reply.msg_type, Some(MsgType::InitReply));
        assert_eq!(reply.seq_number, Some(seq));
        assert_eq!(reply.reply_error_code, Some(ReplyErrorCode::NoError));
        assert_eq!(reply.server_maximum_request_size, Some(1 << 15));
        assert_eq!(reply.server_maximum_reply_size, Some(1 << 15));
        assert!(reply.supports_algorithm(algorithm));
    }

    async fn send_config(&mut self, ids: &[u32]) -> DecodedMessage {
        let seq = self.next_seq();
        self.send(&Message::NodeList {
            seq_number: seq,
            list_type: NodeListType::InitialConfig,
            ring_id: None,
            config_version: None,
            quorate: None,
            heuristics: Heuristics::Undefined,
            nodes: ids.iter().map(|&id| NodeInfo::new(id)).collect(),
        })
        .await;
        let reply = self.recv().await;
        assert_eq!(reply.msg_type, Some(MsgType::NodeListReply));
        assert_eq!(reply.seq_number, Some(seq));
        reply
    }

    async fn send_membership(&mut self, ring_id: RingId, ids: &[u32]) -> DecodedMessage {
        let seq = self.next_seq();
        self.send(&Message::NodeList {
            seq_number: seq,
            list_type: NodeListType::Membership,
            ring_id: Some(ring_id),
            config_version: None,
            quorate: None,
            heuristics: Heuristics::Undefined,
            nodes: ids.iter().map(|&id| NodeInfo::new(id)).collect(),
        })
        .await;
        let reply = self.recv().await;
        assert_eq!(reply.msg_type, Some(MsgType::NodeListReply));
        assert_eq!(reply.seq_number, Some(seq));
        reply
    }

    /// Wait for a VoteInfo and acknowledge it.
    async fn expect_vote_info(&mut self) -> Vote {
        let msg = self.recv().await;
        assert_eq!(msg.msg_type, Some(MsgType::VoteInfo));
        let seq = msg.seq_number.unwrap();
        self.send(&Message::VoteInfoReply { seq_number: seq }).await;
        msg.vote.unwrap()
    }
}

#[tokio::test]
async fn handshake_set_option_and_echo() {
    let server = start_server();
    let mut client = TestClient::connect(server.addr).await;
    client
        .handshake(
            "alpha",
            1,
            DecisionAlgorithm::Ffsplit,
            TieBreaker::Lowest,
            RingId::new(1, 1),
        )
        .await;

    let seq = client.next_seq();
    client
        .send(&Message::SetOption {
            seq_number: Some(seq),
            heartbeat_interval: Some(9_000),
        })
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.msg_type, Some(MsgType::SetOptionReply));
    assert_eq!(reply.seq_number, Some(seq));
    assert_eq!(reply.heartbeat_interval, Some(9_000));

    let seq = client.next_seq();
    client
        .send(&Message::EchoRequest {
            seq_number: Some(seq),
        })
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.msg_type, Some(MsgType::EchoReply));
    assert_eq!(reply.seq_number, Some(seq));

    server.stop().await;
}

#[tokio::test]
async fn three_node_cluster_gets_acks_after_first_membership() {
    let server = start_server();
    let ring = RingId::new(1, 1);

    let mut clients = Vec::new();
    for node_id in 1..=3u32 {
        let mut client = TestClient::connect(server.addr).await;
        client
            .handshake(
                "alpha",
                node_id,
                DecisionAlgorithm::Ffsplit,
                TieBreaker::Lowest,
                ring,
            )
            .await;
        clients.push(client);
    }

    for client in &mut clients {
        let reply = client.send_config(&[1, 2, 3]).await;
        assert_eq!(reply.vote, Some(Vote::AskLater));
    }

    // No decision until the cluster's view is consistent.
    let membership = RingId::new(1, 2);
    let reply = clients[0].send_membership(membership, &[1, 2, 3]).await;
    assert_eq!(reply.vote, Some(Vote::WaitForReply));
    let reply = clients[1].send_membership(membership, &[1, 2, 3]).await;
    assert_eq!(reply.vote, Some(Vote::WaitForReply));

    // The last report completes the view; the triggering client sees its
    // VoteInfo queued ahead of the node list reply.
    let seq = clients[2].next_seq();
    clients[2]
        .send(&Message::NodeList {
            seq_number: seq,
            list_type: NodeListType::Membership,
            ring_id: Some(membership),
            config_version: None,
            quorate: None,
            heuristics: Heuristics::Undefined,
            nodes: vec![NodeInfo::new(1), NodeInfo::new(2), NodeInfo::new(3)],
        })
        .await;
    assert_eq!(clients[2].expect_vote_info().await, Vote::Ack);
    let reply = clients[2].recv().await;
    assert_eq!(reply.msg_type, Some(MsgType::NodeListReply));
    assert_eq!(reply.vote, Some(Vote::NoChange));

    // Everyone is in the single partition: everyone keeps the vote.
    assert_eq!(clients[0].expect_vote_info().await, Vote::Ack);
    assert_eq!(clients[1].expect_vote_info().await, Vote::Ack);

    server.stop().await;
}

#[tokio::test]
async fn split_sends_nack_before_ack() {
    let server = start_server();
    let ring = RingId::new(1, 1);

    let mut clients = Vec::new();
    for node_id in 1..=3u32 {
        let mut client = TestClient::connect(server.addr).await;
        client
            .handshake(
                "alpha",
                node_id,
                DecisionAlgorithm::Ffsplit,
                TieBreaker::Lowest,
                ring,
            )
            .await;
        client.send_config(&[1, 2, 3]).await;
        clients.push(client);
    }

    let majority = RingId::new(1, 2);
    let minority = RingId::new(3, 2);
    clients[0].send_membership(majority, &[1, 2]).await;
    clients[1].send_membership(majority, &[1, 2]).await;

    // The isolated node may already be NACKed on the stale view; drain
    // until its post-split report is answered.
    let node_c = &mut clients[2];
    let seq = node_c.next_seq();
    node_c
        .send(&Message::NodeList {
            seq_number: seq,
            list_type: NodeListType::Membership,
            ring_id: Some(minority),
            config_version: None,
            quorate: None,
            heuristics: Heuristics::Undefined,
            nodes: vec![NodeInfo::new(3)],
        })
        .await;

    // C must see its NACK; only after the acknowledgment do A and B get
    // their ACKs.
    let mut nacked = false;
    for _ in 0..4 {
        let msg = node_c.recv().await;
        match msg.msg_type {
            Some(MsgType::VoteInfo) => {
                assert_eq!(msg.vote, Some(Vote::Nack));
                let seq = msg.seq_number.unwrap();
                node_c
                    .send(&Message::VoteInfoReply { seq_number: seq })
                    .await;
                if msg.ring_id == Some(minority) {
                    nacked = true;
                    break;
                }
            }
            Some(MsgType::NodeListReply) => {
                assert_eq!(msg.vote, Some(Vote::NoChange));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
    assert!(nacked);

    assert_eq!(clients[0].expect_vote_info().await, Vote::Ack);
    assert_eq!(clients[1].expect_vote_info().await, Vote::Ack);

    server.stop().await;
}

#[tokio::test]
async fn oversized_frame_gets_typed_error_not_disconnect() {
    let server = start_server();
    let mut client = TestClient::connect(server.addr).await;
    client
        .handshake(
            "alpha",
            1,
            DecisionAlgorithm::Ffsplit,
            TieBreaker::Lowest,
            RingId::new(1, 1),
        )
        .await;

    // Hand-build a frame whose declared size exceeds the server cap.
    let mut raw = Vec::new();
    raw.extend_from_slice(&(MsgType::NodeList as u16).to_be_bytes());
    raw.extend_from_slice(&((1u32 << 20) - 6).to_be_bytes());
    raw.resize(1 << 20, 0);
    client.framed.send(raw.into()).await.unwrap();

    let reply = client.recv().await;
    assert_eq!(reply.msg_type, Some(MsgType::ServerError));
    assert_eq!(
        reply.reply_error_code,
        Some(ReplyErrorCode::MessageTooLong)
    );

    // The connection survives: a normal request still works.
    let seq = client.next_seq();
    client
        .send(&Message::EchoRequest {
            seq_number: Some(seq),
        })
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.msg_type, Some(MsgType::EchoReply));
    assert_eq!(reply.seq_number, Some(seq));

    server.stop().await;
}

#[tokio::test]
async fn algorithm_mismatch_in_cluster_is_rejected() {
    let server = start_server();
    let ring = RingId::new(1, 1);

    let mut first = TestClient::connect(server.addr).await;
    first
        .handshake(
            "alpha",
            1,
            DecisionAlgorithm::Ffsplit,
            TieBreaker::Lowest,
            ring,
        )
        .await;

    let mut second = TestClient::connect(server.addr).await;
    let seq = second.next_seq();
    second
        .send(&Message::Preinit {
            seq_number: Some(seq),
            cluster_name: "alpha".into(),
        })
        .await;
    second.recv().await;

    let seq = second.next_seq();
    second
        .send(&Message::Init {
            seq_number: Some(seq),
            supported_messages: SUPPORTED_MESSAGES.to_vec(),
            supported_options: SUPPORTED_OPTIONS.to_vec(),
            node_id: 2,
            decision_algorithm: DecisionAlgorithm::TwoNodeLms,
            heartbeat_interval: 8_000,
            tie_breaker: TieBreaker::Lowest,
            ring_id: ring,
        })
        .await;
    let reply = second.recv().await;
    assert_eq!(reply.msg_type, Some(MsgType::InitReply));
    assert_eq!(
        reply.reply_error_code,
        Some(ReplyErrorCode::AlgorithmDiffersFromOtherNodes)
    );

    server.stop().await;
}

#[tokio::test]
async fn supported_algorithms_exclude_test_by_default() {
    let server = start_server();
    let mut client = TestClient::connect(server.addr).await;
    let seq = client.next_seq();
    client
        .send(&Message::Preinit {
            seq_number: Some(seq),
            cluster_name: "alpha".into(),
        })
        .await;
    client.recv().await;

    let seq = client.next_seq();
    client
        .send(&Message::Init {
            seq_number: Some(seq),
            supported_messages: SUPPORTED_MESSAGES.to_vec(),
            supported_options: SUPPORTED_OPTIONS.to_vec(),
            node_id: 1,
            decision_algorithm: DecisionAlgorithm::Ffsplit,
            heartbeat_interval: 8_000,
            tie_breaker: TieBreaker::Lowest,
            ring_id: RingId::new(1, 1),
        })
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.reply_error_code, Some(ReplyErrorCode::NoError));
    assert!(!reply.supports_algorithm(DecisionAlgorithm::Test));
    let advertised = reply.supported_decision_algorithms.unwrap();
    assert_eq!(
        advertised.len(),
        SUPPORTED_DECISION_ALGORITHMS.len() - 1
    );

    server.stop().await;
}

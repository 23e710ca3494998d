//! The per-node agent: connects to the arbiter, publishes the local
//! cluster view, and feeds the granted vote into the local quorum
//! subsystem through the cast-vote timer.
//!
//! Everything runs in one `select!` loop over the framed connection, the
//! timer wheels, the local runtime's event stream and the heuristics
//! results. Reconnects happen after a jittered delay; the cast-vote timer
//! keeps ticking across them.

pub(crate) mod algo;
pub(crate) mod cast_vote;
pub(crate) mod handler;
#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::time::Duration;

use arbiter_proto::{
    DecisionAlgorithm, FrameCodec, Heuristics, InboundFrame, Message, NodeInfo, NodeListType,
    Quorate, RingId, TlsSupported, Vote, DEFAULT_MAX_FRAME_SIZE,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::DisconnectReason;
use crate::heuristics::HeuristicsExecutor;
use crate::runtime::{RuntimeEvent, RuntimeHandle};
use crate::send_queue::{AfterSend, SendQueue};
use crate::timer::{TimerKey, TimerWheel};
use crate::tls::{self, MaybeTlsStream};

use self::algo::{net_algorithm, NetAlgorithm};
use self::cast_vote::CastVoteTimer;

/// Events on the wheel that outlives reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    /// Assert the current vote to the local runtime.
    CastVoteTick,
}

/// Events on the per-connection wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnTimerEvent {
    /// Steady state was not reached within the connect budget.
    ConnectTimeout,
    /// Time to check the last echo reply and send the next request.
    EchoTick,
    /// Time for a regular heuristics re-run.
    RegularHeuristics,
}

/// Latest view of the cluster received from the local runtime; published
/// to the server after every (re)connect.
#[derive(Debug, Clone, Default)]
pub(crate) struct LocalView {
    /// Configured nodes.
    pub config_nodes: Vec<NodeInfo>,
    /// Configuration version, when tracked.
    pub config_version: Option<u64>,
    /// A configuration list has been received at least once.
    pub config_known: bool,
    /// Current membership with its ring id.
    pub membership: Option<(RingId, Vec<u32>)>,
    /// Current quorum view.
    pub quorum: Option<(Quorate, Vec<NodeInfo>)>,
}

/// Client connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Preinit sent, awaiting the reply.
    WaitingPreinitReply,
    /// StartTls queued; the TLS layer goes up once it is flushed.
    WaitingStarttlsBeingSent,
    /// Init sent, awaiting the reply.
    WaitingInitReply,
    /// Steady exchange with the server.
    WaitingVotequorumCmapEvents,
}

/// Per-connection state; recreated on every connect attempt.
#[derive(Debug)]
pub(crate) struct Connection {
    /// Connection state tag.
    pub state: ConnState,
    /// Monotonically increasing seq used in every request.
    pub last_msg_seq: u32,
    /// Seq of the latest echo request sent.
    pub echo_expected_seq: u32,
    /// Seq of the latest echo reply received.
    pub echo_received_seq: u32,
    /// Ring id of the last init/membership list sent; replies carrying a
    /// different one are stale.
    pub last_sent_ring_id: RingId,
    /// Outbound FIFO.
    pub send_queue: SendQueue,
    /// Server advertised the Heuristics option in InitReply.
    pub server_supports_heuristics: bool,
    /// Negotiated cap on our requests.
    pub max_send_size: usize,
    /// New receive cap to apply to the codec after InitReply.
    pub pending_receive_cap: Option<usize>,
    /// Echo tick handle.
    pub echo_timer: Option<TimerKey>,
    /// Connect-budget handle.
    pub connect_timer: Option<TimerKey>,
    /// Regular heuristics tick handle.
    pub regular_timer: Option<TimerKey>,
    /// An initial config node list has been sent on this connection.
    pub initial_config_sent: bool,
    /// Seq of the SetOption awaiting its reply.
    pub pending_set_option_seq: Option<u32>,
}

impl Connection {
    fn new(config: &AgentConfig) -> Self {
        Connection {
            state: ConnState::WaitingPreinitReply,
            last_msg_seq: 1,
            echo_expected_seq: 0,
            echo_received_seq: 0,
            last_sent_ring_id: RingId::default(),
            send_queue: SendQueue::new(config.max_send_buffers),
            server_supports_heuristics: false,
            max_send_size: config.min_send_size,
            pending_receive_cap: None,
            echo_timer: None,
            connect_timer: None,
            regular_timer: None,
            initial_config_sent: false,
            pending_set_option_seq: None,
        }
    }

    /// True once the handshake finished.
    pub(crate) fn steady(&self) -> bool {
        self.state == ConnState::WaitingVotequorumCmapEvents
    }

    /// Next request seq number.
    pub(crate) fn next_seq(&mut self) -> u32 {
        self.last_msg_seq += 1;
        self.last_msg_seq
    }

    /// Encode and queue a message.
    pub(crate) fn push_message(&mut self, msg: &Message) -> Result<(), DisconnectReason> {
        self.push_message_with(msg, AfterSend::None)
    }

    /// Encode and queue a message with a completion action.
    pub(crate) fn push_message_with(
        &mut self,
        msg: &Message,
        after_send: AfterSend,
    ) -> Result<(), DisconnectReason> {
        let frame = msg
            .encode(self.max_send_size)
            .map_err(|_| DisconnectReason::SendBufferFull)?;
        self.send_queue
            .push_with(frame, after_send)
            .map_err(|_| DisconnectReason::SendBufferFull)
    }
}

/// Which run a heuristics result belongs to.
#[derive(Debug, Clone)]
pub(crate) enum HeuristicsKind {
    /// The run right after reaching steady state.
    AfterConnect,
    /// A run against a new membership.
    Membership {
        /// Discards the result when a newer membership arrived meanwhile.
        generation: u64,
        /// The membership's ring id.
        ring_id: RingId,
        /// The membership's node ids.
        nodes: Vec<u32>,
    },
    /// A regular interval re-run.
    Regular,
}

/// A finished heuristics run.
#[derive(Debug)]
pub(crate) struct HeuristicsOutcome {
    /// Which run this is.
    pub kind: HeuristicsKind,
    /// The result.
    pub result: Heuristics,
}

/// How one connect attempt ended.
enum ConnOutcome {
    /// The TCP connection never came up; nothing to tell the algorithm.
    NeverConnected,
    /// An established connection went away.
    Dropped(DisconnectReason),
}

/// Why the agent stopped for good.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Configuration or environment problem; exit code 1.
    #[error("configuration error: {0}")]
    Config(String),
    /// An algorithm hook failed in a way that forbids reconnecting;
    /// exit code 2.
    #[error("algorithm returned a fatal error")]
    AlgorithmFatal,
}

/// The agent itself; state that survives reconnects.
pub struct Agent {
    config: AgentConfig,
    connector: Option<TlsConnector>,
    tls_offer: TlsSupported,
    algo: Box<dyn NetAlgorithm>,
    view: LocalView,
    cast_vote: CastVoteTimer,
    executor: HeuristicsExecutor,
    last_exec_result: Heuristics,
    membership_generation: u64,
}

impl Agent {
    /// Build an agent from its derived configuration. The test algorithm
    /// must be opted into explicitly.
    pub fn new(config: AgentConfig, allow_test_algorithm: bool) -> Result<Self, AgentError> {
        if config.algorithm == DecisionAlgorithm::Test && !allow_test_algorithm {
            return Err(AgentError::Config(
                "the test algorithm is unsafe and must be enabled explicitly".into(),
            ));
        }

        let mut tls_offer = config.tls;
        let connector = match (tls_offer, &config.tls_ca_file) {
            (TlsSupported::Unsupported, _) => None,
            (_, Some(ca_file)) => Some(
                tls::client_connector(
                    ca_file,
                    config.tls_cert_file.as_deref(),
                    config.tls_key_file.as_deref(),
                )
                .map_err(|err| AgentError::Config(format!("can't set up TLS: {}", err)))?,
            ),
            (TlsSupported::Required, None) => {
                return Err(AgentError::Config(
                    "TLS is required but no CA bundle is configured".into(),
                ));
            }
            (TlsSupported::Supported, None) => {
                warn!("no CA bundle configured, continuing without TLS");
                tls_offer = TlsSupported::Unsupported;
                None
            }
        };

        let mut algo = net_algorithm(&config);
        algo.init(&config).map_err(AgentError::Config)?;

        let cast_vote = CastVoteTimer::new(config.cast_vote_timer_interval);
        let executor = HeuristicsExecutor::new(config.heuristics.clone());

        Ok(Agent {
            config,
            connector,
            tls_offer,
            algo,
            view: LocalView::default(),
            cast_vote,
            executor,
            last_exec_result: Heuristics::Undefined,
            membership_generation: 0,
        })
    }

    /// Run until the local runtime goes away (clean stop) or an algorithm
    /// hook forbids going on.
    pub async fn run(mut self, runtime: RuntimeHandle) -> Result<(), AgentError> {
        let RuntimeHandle { mut events, votes } = runtime;
        let mut wheel: TimerWheel<TimerEvent> = TimerWheel::new();

        loop {
            match self.run_connection(&mut events, &votes, &mut wheel).await {
                ConnOutcome::NeverConnected => {}
                ConnOutcome::Dropped(reason) => {
                    info!(%reason, "disconnected from the arbiter server");

                    let mut try_reconnect = reason.try_reconnect();
                    let mut vote = Vote::NoChange;
                    if self
                        .algo
                        .disconnected(reason, &mut try_reconnect, &mut vote)
                        .is_err()
                    {
                        error!("algorithm disconnect hook failed, forcing exit");
                        return Err(AgentError::AlgorithmFatal);
                    }
                    if self.cast_vote.update(&mut wheel, &votes, vote).is_err() {
                        return Ok(());
                    }
                    if !try_reconnect {
                        return Ok(());
                    }
                }
            }

            let delay = reconnect_delay(self.config.cast_vote_timer_interval);
            debug!(?delay, "waiting before reconnecting");
            if self
                .idle_wait(&mut events, &votes, &mut wheel, delay)
                .await
                .is_err()
            {
                return Ok(());
            }
        }
    }

    /// One connect attempt plus its steady phase.
    async fn run_connection(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<RuntimeEvent>,
        votes: &mpsc::UnboundedSender<bool>,
        wheel: &mut TimerWheel<TimerEvent>,
    ) -> ConnOutcome {
        let stream = match self.connect().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%err, host = %self.config.host, "can't connect to the arbiter server");
                return ConnOutcome::NeverConnected;
            }
        };
        info!(host = %self.config.host, port = self.config.port, "connected to the arbiter server");
        ConnOutcome::Dropped(self.drive_connection(stream, events, votes, wheel).await)
    }

    /// The per-connection poll loop. Returns why the connection ended.
    async fn drive_connection(
        &mut self,
        stream: TcpStream,
        events: &mut mpsc::UnboundedReceiver<RuntimeEvent>,
        votes: &mpsc::UnboundedSender<bool>,
        wheel: &mut TimerWheel<TimerEvent>,
    ) -> DisconnectReason {
        let mut framed = Framed::new(
            MaybeTlsStream::Plain(stream),
            FrameCodec::new(DEFAULT_MAX_FRAME_SIZE),
        );
        let mut conn = Connection::new(&self.config);
        let mut conn_wheel: TimerWheel<ConnTimerEvent> = TimerWheel::new();
        conn.connect_timer = Some(conn_wheel.schedule(
            ConnTimerEvent::ConnectTimeout,
            self.config.connect_timeout_duration(),
        ));
        let (heur_tx, mut heur_rx) = mpsc::unbounded_channel::<HeuristicsOutcome>();

        if let Err(reason) = conn.push_message(&Message::Preinit {
            seq_number: Some(conn.last_msg_seq),
            cluster_name: self.config.cluster_name.clone(),
        }) {
            return reason;
        }
        conn.state = ConnState::WaitingPreinitReply;

        loop {
            // Drain the outbound queue before sleeping.
            while let Some(entry) = conn.send_queue.pop() {
                if framed.send(entry.frame).await.is_err() {
                    return DisconnectReason::ServerClosedConnection;
                }
                if entry.after_send == AfterSend::StartTlsUpgrade {
                    // The StartTls frame is flushed; bring up TLS and
                    // continue the handshake over it.
                    framed = match self.upgrade_tls(framed).await {
                        Ok(framed) => framed,
                        Err(reason) => return reason,
                    };
                    if let Err(reason) = self.send_init(&mut conn) {
                        return reason;
                    }
                }
            }
            if let Some(cap) = conn.pending_receive_cap.take() {
                framed.codec_mut().set_max_frame_size(cap);
            }

            tokio::select! {
                item = framed.next() => match item {
                    None | Some(Err(_)) => return DisconnectReason::ServerClosedConnection,
                    Some(Ok(InboundFrame::Skipped(reason))) => {
                        warn!(?reason, "server sent an unprocessable frame, disconnecting");
                        return DisconnectReason::MsgDecodeError;
                    }
                    Some(Ok(InboundFrame::Frame(frame))) => {
                        if let Err(reason) = self.process_frame(
                            &mut conn,
                            &mut conn_wheel,
                            wheel,
                            votes,
                            &frame,
                            &heur_tx,
                        ) {
                            return reason;
                        }
                    }
                },
                event = conn_wheel.expired() => match event {
                    ConnTimerEvent::ConnectTimeout => {
                        warn!("server was not reached within the connect timeout");
                        return DisconnectReason::CantConnectToTheServer;
                    }
                    ConnTimerEvent::EchoTick => {
                        if let Err(reason) = self.echo_tick(&mut conn, &mut conn_wheel) {
                            return reason;
                        }
                    }
                    ConnTimerEvent::RegularHeuristics => {
                        self.spawn_heuristics(HeuristicsKind::Regular, false, &heur_tx);
                        conn.regular_timer = Some(conn_wheel.schedule(
                            ConnTimerEvent::RegularHeuristics,
                            Duration::from_millis(self.config.heuristics.interval as u64),
                        ));
                    }
                },
                event = wheel.expired() => match event {
                    TimerEvent::CastVoteTick => {
                        if self.cast_vote.tick(wheel, votes).is_err() {
                            return DisconnectReason::LocalRuntimeClosed;
                        }
                    }
                },
                event = events.recv() => match event {
                    None => return DisconnectReason::LocalRuntimeClosed,
                    Some(event) => {
                        if let Err(reason) =
                            self.handle_runtime_event(&mut conn, wheel, votes, event, &heur_tx)
                        {
                            return reason;
                        }
                    }
                },
                outcome = heur_rx.recv() => {
                    // The sender lives in this scope, so the channel
                    // cannot close under us.
                    if let Some(outcome) = outcome {
                        if let Err(reason) = self.handle_heuristics_outcome(
                            &mut conn,
                            &mut conn_wheel,
                            wheel,
                            votes,
                            outcome,
                        ) {
                            return reason;
                        }
                    }
                },
            }
        }
    }

    async fn connect(&self) -> std::io::Result<TcpStream> {
        let addrs = tokio::net::lookup_host((self.config.host.as_str(), self.config.port)).await?;
        let wanted: Vec<SocketAddr> = addrs
            .filter(|addr| match self.config.force_ip_version {
                4 => addr.is_ipv4(),
                6 => addr.is_ipv6(),
                _ => true,
            })
            .collect();
        if wanted.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "no address of the requested family",
            ));
        }

        let budget = self.config.connect_timeout_duration();
        let mut last_err =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out");
        for addr in wanted {
            match tokio::time::timeout(budget, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Ok(Err(err)) => last_err = err,
                Err(_) => {}
            }
        }
        Err(last_err)
    }

    async fn upgrade_tls(
        &self,
        framed: Framed<MaybeTlsStream, FrameCodec>,
    ) -> Result<Framed<MaybeTlsStream, FrameCodec>, DisconnectReason> {
        let Some(connector) = self.connector.clone() else {
            return Err(DisconnectReason::IncompatibleTls);
        };
        let server_name = tls::server_name(&self.config.tls_server_name)
            .map_err(|_| DisconnectReason::TlsHandshakeFailed)?;

        let parts = framed.into_parts();
        let read_buf = parts.read_buf;
        let write_buf = parts.write_buf;
        let codec = parts.codec;
        let Some(tcp) = parts.io.into_plain() else {
            return Err(DisconnectReason::TlsHandshakeFailed);
        };

        match connector.connect(server_name, tcp).await {
            Ok(stream) => {
                debug!("TLS layer established");
                let mut new_parts = FramedParts::new::<Bytes>(
                    MaybeTlsStream::ClientTls(Box::new(stream)),
                    codec,
                );
                new_parts.read_buf = read_buf;
                new_parts.write_buf = write_buf;
                Ok(Framed::from_parts(new_parts))
            }
            Err(err) => {
                warn!(%err, "TLS handshake with server failed");
                Err(DisconnectReason::TlsHandshakeFailed)
            }
        }
    }

    /// Queue the Init message; called after PreinitReply (plain) or after
    /// the TLS layer is up.
    pub(crate) fn send_init(&mut self, conn: &mut Connection) -> Result<(), DisconnectReason> {
        let ring_id = self
            .view
            .membership
            .as_ref()
            .map(|(ring_id, _)| *ring_id)
            .unwrap_or_default();
        let seq_number = conn.next_seq();
        conn.push_message(&Message::Init {
            seq_number: Some(seq_number),
            supported_messages: arbiter_proto::SUPPORTED_MESSAGES.to_vec(),
            supported_options: arbiter_proto::SUPPORTED_OPTIONS.to_vec(),
            node_id: self.config.node_id,
            decision_algorithm: self.config.algorithm,
            heartbeat_interval: self.config.heartbeat_interval,
            tie_breaker: self.config.tie_breaker,
            ring_id,
        })?;
        conn.last_sent_ring_id = ring_id;
        conn.state = ConnState::WaitingInitReply;
        Ok(())
    }

    /// (Re)arm the echo-request timer, resetting the seq pair.
    pub(crate) fn schedule_echo_timer(
        &self,
        conn: &mut Connection,
        conn_wheel: &mut TimerWheel<ConnTimerEvent>,
    ) {
        conn.echo_expected_seq = 0;
        conn.echo_received_seq = 0;
        if let Some(timer) = conn.echo_timer.take() {
            conn_wheel.cancel(timer);
        }
        let interval = Duration::from_millis(self.config.heartbeat_interval as u64);
        debug!(?interval, "scheduling echo requests");
        conn.echo_timer = Some(conn_wheel.schedule(ConnTimerEvent::EchoTick, interval));
    }

    fn echo_tick(
        &mut self,
        conn: &mut Connection,
        conn_wheel: &mut TimerWheel<ConnTimerEvent>,
    ) -> Result<(), DisconnectReason> {
        let interval = Duration::from_millis(self.config.heartbeat_interval as u64);

        if conn.echo_received_seq != conn.echo_expected_seq {
            warn!("server didn't send an echo reply on time");
            if self.algo.echo_reply_not_received().is_err() {
                debug!("algorithm decided to disconnect");
                return Err(DisconnectReason::EchoReplyNotReceived);
            }
            debug!("algorithm decided to keep going without the server");
            conn.echo_timer = Some(conn_wheel.schedule(ConnTimerEvent::EchoTick, interval));
            return Ok(());
        }

        conn.echo_expected_seq += 1;
        let seq_number = conn.echo_expected_seq;
        conn.push_message(&Message::EchoRequest {
            seq_number: Some(seq_number),
        })?;
        conn.echo_timer = Some(conn_wheel.schedule(ConnTimerEvent::EchoTick, interval));
        Ok(())
    }

    /// Arm the regular heuristics tick when the mode and the server allow.
    pub(crate) fn maybe_schedule_regular_heuristics(
        &self,
        conn: &mut Connection,
        conn_wheel: &mut TimerWheel<ConnTimerEvent>,
    ) {
        if self.executor.regular_runs() && conn.server_supports_heuristics {
            conn.regular_timer = Some(conn_wheel.schedule(
                ConnTimerEvent::RegularHeuristics,
                Duration::from_millis(self.config.heuristics.interval as u64),
            ));
        }
    }

    /// Run the probes off the poll loop; the outcome comes back through
    /// the channel.
    pub(crate) fn spawn_heuristics(
        &self,
        kind: HeuristicsKind,
        sync: bool,
        heur_tx: &mpsc::UnboundedSender<HeuristicsOutcome>,
    ) {
        let executor = self.executor.clone();
        let heur_tx = heur_tx.clone();
        tokio::spawn(async move {
            let result = if sync {
                executor.run_sync().await
            } else {
                executor.run().await
            };
            let _ = heur_tx.send(HeuristicsOutcome { kind, result });
        });
    }

    /// Apply the vote of a reply to the cast-vote timer.
    pub(crate) fn update_cast_vote(
        &mut self,
        wheel: &mut TimerWheel<TimerEvent>,
        votes: &mpsc::UnboundedSender<bool>,
        vote: Vote,
    ) -> Result<(), DisconnectReason> {
        self.cast_vote
            .update(wheel, votes, vote)
            .map_err(|_| DisconnectReason::LocalRuntimeClosed)
    }

    fn handle_runtime_event(
        &mut self,
        conn: &mut Connection,
        wheel: &mut TimerWheel<TimerEvent>,
        votes: &mpsc::UnboundedSender<bool>,
        event: RuntimeEvent,
        heur_tx: &mpsc::UnboundedSender<HeuristicsOutcome>,
    ) -> Result<(), DisconnectReason> {
        match event {
            RuntimeEvent::ConfigNodeList {
                config_version,
                nodes,
            } => {
                self.view.config_nodes = nodes;
                self.view.config_version = config_version;
                self.view.config_known = true;

                if conn.steady() {
                    let mut send_node_list = true;
                    let mut vote = Vote::NoChange;
                    if self
                        .algo
                        .config_node_list_changed(
                            &self.view.config_nodes,
                            config_version,
                            &mut send_node_list,
                            &mut vote,
                        )
                        .is_err()
                    {
                        return Err(DisconnectReason::AlgorithmError);
                    }
                    if send_node_list {
                        self.send_config_node_list(conn, !conn.initial_config_sent)?;
                    }
                    self.update_cast_vote(wheel, votes, vote)?;
                }
            }
            RuntimeEvent::MembershipNodeList { ring_id, nodes } => {
                self.membership_generation += 1;
                self.view.membership = Some((ring_id, nodes.clone()));

                if conn.steady() {
                    let mut pause_cast_vote_timer = true;
                    let mut vote = Vote::NoChange;
                    if self
                        .algo
                        .votequorum_node_list_notify(
                            ring_id,
                            &nodes,
                            &mut pause_cast_vote_timer,
                            &mut vote,
                        )
                        .is_err()
                    {
                        return Err(DisconnectReason::AlgorithmError);
                    }
                    self.update_cast_vote(wheel, votes, vote)?;
                    // Hold the vote steady while the probes size up the
                    // new membership.
                    self.cast_vote.set_paused(pause_cast_vote_timer);
                    self.spawn_heuristics(
                        HeuristicsKind::Membership {
                            generation: self.membership_generation,
                            ring_id,
                            nodes,
                        },
                        false,
                        heur_tx,
                    );
                }
            }
            RuntimeEvent::QuorumNodeList { quorate, nodes } => {
                self.view.quorum = Some((quorate, nodes.clone()));

                let mut send_node_list = true;
                let mut vote = Vote::NoChange;
                if self
                    .algo
                    .votequorum_quorum_notify(quorate, &nodes, &mut send_node_list, &mut vote)
                    .is_err()
                {
                    return Err(DisconnectReason::AlgorithmError);
                }
                if conn.steady() {
                    if send_node_list {
                        self.send_quorum_node_list(conn, quorate, &nodes)?;
                    }
                    self.update_cast_vote(wheel, votes, vote)?;
                }
            }
            RuntimeEvent::ExpectedVotes { expected_votes } => {
                let mut vote = Vote::NoChange;
                if self
                    .algo
                    .votequorum_expected_votes_notify(expected_votes, &mut vote)
                    .is_err()
                {
                    return Err(DisconnectReason::AlgorithmError);
                }
                if conn.steady() {
                    self.update_cast_vote(wheel, votes, vote)?;
                }
            }
        }
        Ok(())
    }

    fn handle_heuristics_outcome(
        &mut self,
        conn: &mut Connection,
        conn_wheel: &mut TimerWheel<ConnTimerEvent>,
        wheel: &mut TimerWheel<TimerEvent>,
        votes: &mpsc::UnboundedSender<bool>,
        outcome: HeuristicsOutcome,
    ) -> Result<(), DisconnectReason> {
        match outcome.kind {
            HeuristicsKind::AfterConnect => {
                let mut heuristics = outcome.result;
                let mut vote = Vote::NoChange;
                if self
                    .algo
                    .connected(&self.view, &mut heuristics, &mut vote)
                    .is_err()
                {
                    return Err(DisconnectReason::AlgorithmError);
                }
                self.last_exec_result = outcome.result;

                // Publish everything the runtime has told us so far.
                if self.view.config_known {
                    self.send_config_node_list(conn, true)?;
                }
                if let Some((ring_id, nodes)) = self.view.membership.clone() {
                    self.send_membership_node_list(conn, ring_id, &nodes, heuristics)?;
                }
                if let Some((quorate, nodes)) = self.view.quorum.clone() {
                    self.send_quorum_node_list(conn, quorate, &nodes)?;
                }

                self.maybe_schedule_regular_heuristics(conn, conn_wheel);
                self.update_cast_vote(wheel, votes, vote)?;
            }
            HeuristicsKind::Membership {
                generation,
                ring_id,
                nodes,
            } => {
                if generation != self.membership_generation {
                    // A newer membership is already being probed.
                    return Ok(());
                }
                let mut heuristics = outcome.result;
                let mut send_node_list = true;
                let mut vote = Vote::NoChange;
                if self
                    .algo
                    .votequorum_node_list_heuristics_notify(
                        ring_id,
                        &nodes,
                        &mut send_node_list,
                        &mut vote,
                        &mut heuristics,
                    )
                    .is_err()
                {
                    return Err(DisconnectReason::AlgorithmError);
                }
                if conn.steady() && send_node_list {
                    self.send_membership_node_list(conn, ring_id, &nodes, heuristics)?;
                }
                self.cast_vote.set_paused(false);
                self.update_cast_vote(wheel, votes, vote)?;
            }
            HeuristicsKind::Regular => {
                let mut heuristics = outcome.result;
                let mut send_msg = heuristics != self.last_exec_result;
                let mut vote = Vote::NoChange;
                if self
                    .algo
                    .heuristics_change(&mut heuristics, &mut send_msg, &mut vote)
                    .is_err()
                {
                    return Err(DisconnectReason::AlgorithmError);
                }
                if send_msg
                    && conn.steady()
                    && conn.server_supports_heuristics
                    && heuristics != Heuristics::Undefined
                {
                    let seq_number = conn.next_seq();
                    debug!(seq_number, %heuristics, "sending heuristics change");
                    conn.push_message(&Message::HeuristicsChange {
                        seq_number,
                        heuristics,
                    })?;
                }
                self.last_exec_result = outcome.result;
                self.update_cast_vote(wheel, votes, vote)?;
            }
        }
        Ok(())
    }

    fn send_config_node_list(
        &mut self,
        conn: &mut Connection,
        initial: bool,
    ) -> Result<(), DisconnectReason> {
        let seq_number = conn.next_seq();
        debug!(seq_number, initial, "sending config node list");
        conn.push_message(&Message::NodeList {
            seq_number,
            list_type: if initial {
                NodeListType::InitialConfig
            } else {
                NodeListType::ChangedConfig
            },
            ring_id: None,
            config_version: self.view.config_version,
            quorate: None,
            heuristics: Heuristics::Undefined,
            nodes: self.view.config_nodes.clone(),
        })?;
        conn.initial_config_sent = true;
        Ok(())
    }

    fn send_membership_node_list(
        &mut self,
        conn: &mut Connection,
        ring_id: RingId,
        nodes: &[u32],
        heuristics: Heuristics,
    ) -> Result<(), DisconnectReason> {
        let seq_number = conn.next_seq();
        debug!(seq_number, %ring_id, %heuristics, "sending membership node list");
        conn.push_message(&Message::NodeList {
            seq_number,
            list_type: NodeListType::Membership,
            ring_id: Some(ring_id),
            config_version: None,
            quorate: None,
            heuristics,
            nodes: nodes.iter().map(|&node_id| NodeInfo::new(node_id)).collect(),
        })?;
        conn.last_sent_ring_id = ring_id;
        Ok(())
    }

    fn send_quorum_node_list(
        &mut self,
        conn: &mut Connection,
        quorate: Quorate,
        nodes: &[NodeInfo],
    ) -> Result<(), DisconnectReason> {
        let seq_number = conn.next_seq();
        debug!(seq_number, ?quorate, "sending quorum node list");
        conn.push_message(&Message::NodeList {
            seq_number,
            list_type: NodeListType::Quorum,
            ring_id: None,
            config_version: None,
            quorate: Some(quorate),
            heuristics: Heuristics::Undefined,
            nodes: nodes.iter().filter(|node| node.node_id != 0).cloned().collect(),
        })
    }

    /// Service timers and cache runtime events between connect attempts.
    async fn idle_wait(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<RuntimeEvent>,
        votes: &mpsc::UnboundedSender<bool>,
        wheel: &mut TimerWheel<TimerEvent>,
        delay: Duration,
    ) -> Result<(), ()> {
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(()),
                event = wheel.expired() => match event {
                    TimerEvent::CastVoteTick => self.cast_vote.tick(wheel, votes)?,
                },
                event = events.recv() => match event {
                    None => return Err(()),
                    Some(event) => self.cache_view(event),
                },
            }
        }
    }

    fn cache_view(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::ConfigNodeList {
                config_version,
                nodes,
            } => {
                self.view.config_nodes = nodes;
                self.view.config_version = config_version;
                self.view.config_known = true;
            }
            RuntimeEvent::MembershipNodeList { ring_id, nodes } => {
                self.membership_generation += 1;
                self.view.membership = Some((ring_id, nodes));
            }
            RuntimeEvent::QuorumNodeList { quorate, nodes } => {
                // Keep the quorate flag flowing so an lms client tracks
                // its wait-for-all condition while disconnected.
                let mut send_node_list = false;
                let mut vote = Vote::NoChange;
                let _ = self.algo.votequorum_quorum_notify(
                    quorate,
                    &nodes,
                    &mut send_node_list,
                    &mut vote,
                );
                self.view.quorum = Some((quorate, nodes));
            }
            RuntimeEvent::ExpectedVotes { .. } => {}
        }
    }
}

fn reconnect_delay(cast_vote_timer_interval: u32) -> Duration {
    let max = (cast_vote_timer_interval as u64 * 9 / 10).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(0..max))
}

//! The arbiter server: one well-known daemon serving many clusters.
//!
//! All protocol and decision state lives in [`ServerState`]; connection
//! tasks are thin pumps that decode frames, hand them to the handler
//! under the state lock, and drain their client's send queue. Votes for
//! other clients land in those clients' queues and their pumps are woken
//! through a per-client [`Notify`].

pub(crate) mod handler;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arbiter_proto::{
    DecisionAlgorithm, FrameCodec, Heuristics, Message, NodeInfo, RingId, TieBreaker,
    TlsSupported, Vote,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use slotmap::SlotMap;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::algo::{ClientAlgoData, ClusterAlgoData};
use crate::config::ServerSettings;
use crate::send_queue::{SendEntry, SendQueue};
use crate::timer::{TimerKey, TimerWheel};
use crate::tls::MaybeTlsStream;

slotmap::new_key_type! {
    /// Stable identifier of one connected client.
    pub struct ClientKey;
}

/// Everything the server remembers about one client connection.
#[derive(Debug)]
pub(crate) struct ClientRecord {
    /// Peer address, for logs.
    pub addr: SocketAddr,
    /// Cluster name from Preinit.
    pub cluster_name: Option<String>,
    /// Node id from Init.
    pub node_id: Option<u32>,
    /// Negotiated decision algorithm.
    pub decision_algorithm: Option<DecisionAlgorithm>,
    /// Cluster-wide tie breaker from Init.
    pub tie_breaker: Option<TieBreaker>,
    /// Accepted heartbeat interval, ms.
    pub heartbeat_interval: u32,
    /// Preinit finished.
    pub preinit_received: bool,
    /// Init finished successfully.
    pub init_received: bool,
    /// TLS layer installed.
    pub tls_started: bool,
    /// Client certificate policy satisfied.
    pub tls_peer_cert_verified: bool,
    /// Client presented a certificate during the TLS handshake.
    pub tls_cert_presented: bool,
    /// Last configuration node list.
    pub configuration_node_list: Vec<NodeInfo>,
    /// Configuration version, when the client reports one.
    pub config_version: Option<u64>,
    /// Last membership node list.
    pub last_membership_node_list: Vec<NodeInfo>,
    /// Last quorum node list.
    pub last_quorum_node_list: Vec<NodeInfo>,
    /// Last reported ring id.
    pub last_ring_id: RingId,
    /// Latest heuristics result from any source.
    pub last_heuristics: Heuristics,
    /// Latest result carried by a membership list.
    pub last_membership_heuristics: Heuristics,
    /// Latest result carried by a HeuristicsChange.
    pub last_regular_heuristics: Heuristics,
    /// Last vote of any kind sent to this client.
    pub last_sent_vote: Vote,
    /// Last ACK or NACK sent to this client.
    pub last_sent_ack_nack_vote: Vote,
    /// Seq counter for VoteInfos pushed from the algorithm timer.
    pub algo_timer_vote_info_seq: u32,
    /// Algorithm scratch.
    pub algo: ClientAlgoData,
    /// Outbound FIFO, drained by this client's pump.
    pub send_queue: SendQueue,
    /// Wakes the pump when the queue or flags change.
    pub notify: Arc<Notify>,
    /// Pump should drop the connection at the next opportunity.
    pub schedule_disconnect: bool,
    /// An inbound frame arrived since the last dead-peer check.
    pub dpd_msg_received: bool,
    /// Silence accumulated by the dead-peer sweep, ms.
    pub dpd_time_since_last_check: u32,
}

impl ClientRecord {
    fn new(addr: SocketAddr, settings: &ServerSettings, notify: Arc<Notify>) -> Self {
        ClientRecord {
            addr,
            cluster_name: None,
            node_id: None,
            decision_algorithm: None,
            tie_breaker: None,
            heartbeat_interval: 0,
            preinit_received: false,
            init_received: false,
            tls_started: false,
            tls_peer_cert_verified: false,
            tls_cert_presented: false,
            configuration_node_list: Vec::new(),
            config_version: None,
            last_membership_node_list: Vec::new(),
            last_quorum_node_list: Vec::new(),
            last_ring_id: RingId::default(),
            last_heuristics: Heuristics::Undefined,
            last_membership_heuristics: Heuristics::Undefined,
            last_regular_heuristics: Heuristics::Undefined,
            last_sent_vote: Vote::Undefined,
            last_sent_ack_nack_vote: Vote::Undefined,
            algo_timer_vote_info_seq: 0,
            algo: ClientAlgoData::None,
            send_queue: SendQueue::new(settings.max_client_send_buffers),
            notify,
            schedule_disconnect: false,
            dpd_msg_received: false,
            dpd_time_since_last_check: 0,
        }
    }
}

/// One cluster: a named group of clients sharing quorum.
#[derive(Debug)]
pub(crate) struct Cluster {
    /// Members, as stable client keys.
    pub members: Vec<ClientKey>,
    /// Algorithm scratch shared by the whole cluster.
    pub algo: ClusterAlgoData,
}

/// Commands for the per-client algorithm timer task.
#[derive(Debug)]
pub(crate) enum TimerCmd {
    /// Arm (or re-arm) the client's timer.
    Schedule {
        /// The client.
        key: ClientKey,
        /// Delay until the callback.
        after: Duration,
    },
    /// Drop the client's pending timer.
    Cancel {
        /// The client.
        key: ClientKey,
    },
}

/// The server's entire mutable state.
#[derive(Debug)]
pub(crate) struct ServerState {
    /// Settings in force.
    pub settings: ServerSettings,
    /// TLS policy advertised in PreinitReply.
    pub tls_supported: TlsSupported,
    /// Whether clients must present a certificate.
    pub tls_client_cert_required: bool,
    /// All connected clients.
    pub clients: SlotMap<ClientKey, ClientRecord>,
    /// Clusters by name.
    pub clusters: HashMap<String, Cluster>,
    /// Channel to the algorithm timer task.
    pub timer_tx: mpsc::UnboundedSender<TimerCmd>,
}

impl ServerState {
    /// Keys of every client in the same cluster as `key`, including `key`
    /// itself. Empty when the client has not joined a cluster.
    pub(crate) fn cluster_member_keys(&self, key: ClientKey) -> Vec<ClientKey> {
        self.clients
            .get(key)
            .and_then(|client| client.cluster_name.as_deref())
            .and_then(|name| self.clusters.get(name))
            .map(|cluster| cluster.members.clone())
            .unwrap_or_default()
    }

    /// The connected cluster member carrying `node_id`, if any.
    pub(crate) fn find_cluster_member_by_node_id(
        &self,
        key: ClientKey,
        node_id: u32,
    ) -> Option<ClientKey> {
        self.cluster_member_keys(key)
            .into_iter()
            .find(|&member| self.clients[member].node_id == Some(node_id))
    }

    /// Shared algorithm scratch of `key`'s cluster.
    pub(crate) fn cluster_algo(&self, key: ClientKey) -> Option<&ClusterAlgoData> {
        let name = self.clients.get(key)?.cluster_name.as_deref()?;
        Some(&self.clusters.get(name)?.algo)
    }

    /// Mutable shared algorithm scratch of `key`'s cluster.
    pub(crate) fn cluster_algo_mut(&mut self, key: ClientKey) -> Option<&mut ClusterAlgoData> {
        let name = self.clients.get(key)?.cluster_name.clone()?;
        Some(&mut self.clusters.get_mut(&name)?.algo)
    }

    /// Encode and queue a message for `key`, waking its pump. On failure
    /// the client is marked for disconnect.
    pub(crate) fn send_to_client(&mut self, key: ClientKey, msg: &Message) -> Result<(), ()> {
        let max_size = self.settings.max_client_send_size;
        let frame = match msg.encode(max_size) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "can't encode message, dropping client");
                self.mark_disconnect(key);
                return Err(());
            }
        };
        self.send_frame(key, frame)
    }

    /// Queue an already-encoded frame for `key`.
    pub(crate) fn send_frame(&mut self, key: ClientKey, frame: Bytes) -> Result<(), ()> {
        let Some(client) = self.clients.get_mut(key) else {
            return Err(());
        };
        if let Err(err) = client.send_queue.push(frame) {
            warn!(addr = %client.addr, %err, "send queue overflow, dropping client");
            self.mark_disconnect(key);
            return Err(());
        }
        client.notify.notify_one();
        Ok(())
    }

    /// Push a VoteInfo, remembering it as the client's last sent vote.
    pub(crate) fn send_vote_info(
        &mut self,
        key: ClientKey,
        seq_number: u32,
        ring_id: RingId,
        vote: Vote,
    ) -> Result<(), ()> {
        if let Some(client) = self.clients.get_mut(key) {
            client.last_sent_vote = vote;
            if vote.is_ack_or_nack() {
                client.last_sent_ack_nack_vote = vote;
            }
        }
        self.send_to_client(
            key,
            &Message::VoteInfo {
                seq_number,
                ring_id,
                vote,
            },
        )
    }

    /// Flag `key` for teardown and wake its pump.
    pub(crate) fn mark_disconnect(&mut self, key: ClientKey) {
        if let Some(client) = self.clients.get_mut(key) {
            client.schedule_disconnect = true;
            client.notify.notify_one();
        }
    }

    /// Arm (or replace) the client's deferred-decision timer.
    pub(crate) fn schedule_algo_timer(&mut self, key: ClientKey, after: Duration) {
        let _ = self.timer_tx.send(TimerCmd::Schedule { key, after });
    }

    /// Drop the client's pending deferred-decision timer.
    pub(crate) fn cancel_algo_timer(&mut self, key: ClientKey) {
        let _ = self.timer_tx.send(TimerCmd::Cancel { key });
    }
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<ServerState>,
    acceptor: Option<TlsAcceptor>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Server configuration handed to [`Server::bind`].
#[derive(Debug)]
pub struct Server {
    /// Tunables.
    pub settings: ServerSettings,
    /// TLS policy.
    pub tls_supported: TlsSupported,
    /// Whether clients must present a certificate.
    pub tls_client_cert_required: bool,
}

/// A server bound to its listen socket, ready to serve.
pub struct BoundServer {
    listener: tokio::net::TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    timer_rx: mpsc::UnboundedReceiver<TimerCmd>,
}

impl Server {
    /// Bind the listen socket and set up TLS. With a TLS policy other
    /// than `Unsupported` the certificate material must be loadable.
    pub fn bind(self, addr: SocketAddr) -> io::Result<BoundServer> {
        let acceptor = if self.tls_supported != TlsSupported::Unsupported {
            Some(crate::tls::server_acceptor(
                &self.settings.tls_cert_file,
                &self.settings.tls_key_file,
                &self.settings.tls_ca_file,
                self.tls_client_cert_required,
            )?)
        } else {
            None
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(self.settings.listen_backlog)?;
        let local_addr = listener.local_addr()?;

        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let state = ServerState {
            settings: self.settings,
            tls_supported: self.tls_supported,
            tls_client_cert_required: self.tls_client_cert_required,
            clients: SlotMap::with_key(),
            clusters: HashMap::new(),
            timer_tx,
        };

        Ok(BoundServer {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                acceptor,
            }),
            timer_rx,
        })
    }
}

impl BoundServer {
    /// The address actually bound, for ephemeral ports.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and serve clients until `cancel` fires. On shutdown every
    /// algorithm gets its disconnect hook with `server_going_down` set.
    pub async fn serve(self, cancel: CancellationToken) -> io::Result<()> {
        let BoundServer {
            listener,
            local_addr,
            shared,
            timer_rx,
        } = self;
        info!(%local_addr, "arbiter server is listening");

        let mut tasks = JoinSet::new();
        tasks.spawn(algo_timer_task(shared.clone(), timer_rx, cancel.clone()));
        let (dpd_enabled, dpd_interval) = {
            let state = shared.lock();
            (state.settings.dpd_enabled, state.settings.dpd_interval)
        };
        if dpd_enabled {
            let interval = Duration::from_millis(dpd_interval as u64);
            tasks.spawn(dpd_task(shared.clone(), interval, cancel.clone()));
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let admit = {
                            let state = shared.lock();
                            state.settings.max_clients == 0
                                || state.clients.len() < state.settings.max_clients
                        };
                        if !admit {
                            info!(%addr, "maximum clients reached, refusing connection");
                            continue;
                        }
                        tasks.spawn(serve_connection(shared.clone(), stream, addr, cancel.clone()));
                    }
                    Err(err) => warn!(%err, "accept failed"),
                },
            }
        }

        info!("arbiter server is shutting down");
        {
            let mut state = shared.lock();
            handler::server_going_down(&mut state);
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

async fn dpd_task(shared: Arc<Shared>, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let mut state = shared.lock();
        let interval_ms = state.settings.dpd_interval;
        let mut stale = Vec::new();
        for (key, client) in state.clients.iter_mut() {
            if !client.init_received {
                continue;
            }
            client.dpd_time_since_last_check += interval_ms;
            if client.dpd_time_since_last_check > client.heartbeat_interval.saturating_mul(2) {
                if !client.dpd_msg_received {
                    warn!(
                        addr = %client.addr,
                        silence_ms = client.dpd_time_since_last_check,
                        "client sent nothing across two heartbeat windows, disconnecting"
                    );
                    stale.push(key);
                } else {
                    client.dpd_time_since_last_check = 0;
                    client.dpd_msg_received = false;
                }
            }
        }
        for key in stale {
            state.mark_disconnect(key);
        }
    }
}

async fn algo_timer_task(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<TimerCmd>,
    cancel: CancellationToken,
) {
    let mut wheel = TimerWheel::new();
    let mut pending: HashMap<ClientKey, TimerKey> = HashMap::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            cmd = rx.recv() => match cmd {
                None => return,
                Some(TimerCmd::Schedule { key, after }) => {
                    if let Some(timer_key) = pending.remove(&key) {
                        wheel.cancel(timer_key);
                    }
                    pending.insert(key, wheel.schedule(key, after));
                }
                Some(TimerCmd::Cancel { key }) => {
                    if let Some(timer_key) = pending.remove(&key) {
                        wheel.cancel(timer_key);
                    }
                }
            },
            key = wheel.expired() => {
                pending.remove(&key);
                let mut state = shared.lock();
                handler::algo_timer_fired(&mut state, key);
            }
        }
    }
}

async fn serve_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let notify = Arc::new(Notify::new());
    let key = {
        let mut state = shared.lock();
        let settings = state.settings.clone();
        state
            .clients
            .insert(ClientRecord::new(addr, &settings, notify.clone()))
    };
    debug!(%addr, "client connected");

    let receive_cap = shared.lock().settings.max_client_receive_size;
    let mut framed = Framed::new(
        MaybeTlsStream::Plain(stream),
        FrameCodec::new(receive_cap),
    );

    'conn: loop {
        // Drain this client's outbound queue before sleeping.
        loop {
            let (entry, disconnect) = {
                let mut state = shared.lock();
                match state.clients.get_mut(key) {
                    Some(client) => (client.send_queue.pop(), client.schedule_disconnect),
                    None => (None, true),
                }
            };
            match entry {
                Some(SendEntry { frame, .. }) => {
                    if framed.send(frame).await.is_err() {
                        break 'conn;
                    }
                }
                None => {
                    if disconnect {
                        break 'conn;
                    }
                    break;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break 'conn,
            _ = notify.notified() => {}
            item = framed.next() => {
                let Some(Ok(inbound)) = item else {
                    break 'conn;
                };
                let disposition = {
                    let mut state = shared.lock();
                    handler::process_inbound(&mut state, key, &inbound)
                };
                match disposition {
                    handler::Disposition::Continue => {}
                    handler::Disposition::Disconnect => {
                        // Flush the error reply, if one was queued.
                        while let Some(entry) = {
                            let mut state = shared.lock();
                            state
                                .clients
                                .get_mut(key)
                                .and_then(|client| client.send_queue.pop())
                        } {
                            if framed.send(entry.frame).await.is_err() {
                                break;
                            }
                        }
                        break 'conn;
                    }
                    handler::Disposition::StartTls => {
                        match upgrade_to_tls(&shared, framed).await {
                            Ok(upgraded) => {
                                framed = upgraded;
                                let presented = framed.get_ref().peer_cert_presented();
                                let mut state = shared.lock();
                                let Some(client) = state.clients.get_mut(key) else {
                                    break 'conn;
                                };
                                client.tls_started = true;
                                client.tls_peer_cert_verified = false;
                                client.tls_cert_presented = presented;
                            }
                            Err(()) => break 'conn,
                        }
                    }
                }
            }
        }
    }

    debug!(%addr, "client disconnected");
    let mut state = shared.lock();
    handler::client_disconnected(&mut state, key, false);
}

async fn upgrade_to_tls(
    shared: &Arc<Shared>,
    framed: Framed<MaybeTlsStream, FrameCodec>,
) -> Result<Framed<MaybeTlsStream, FrameCodec>, ()> {
    let Some(acceptor) = shared.acceptor.clone() else {
        warn!("client requested STARTTLS but TLS is not configured");
        return Err(());
    };

    let parts = framed.into_parts();
    let read_buf = parts.read_buf;
    let write_buf = parts.write_buf;
    let codec = parts.codec;
    let Some(tcp) = parts.io.into_plain() else {
        warn!("client requested STARTTLS twice");
        return Err(());
    };

    match acceptor.accept(tcp).await {
        Ok(tls) => {
            let mut new_parts = FramedParts::new::<Bytes>(
                MaybeTlsStream::ServerTls(Box::new(tls)),
                codec,
            );
            new_parts.read_buf = read_buf;
            new_parts.write_buf = write_buf;
            Ok(Framed::from_parts(new_parts))
        }
        Err(err) => {
            warn!(%err, "TLS handshake with client failed");
            Err(())
        }
    }
}

//! Client-side message handling: reply legality per state, sequence
//! discipline, TLS negotiation and the hand-off of votes to the
//! cast-vote timer.

use arbiter_proto::{
    decode_message, DecodedMessage, Heuristics, Message, MsgType, NodeListType, OptionType,
    ReplyErrorCode, TlsSupported,
};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::DisconnectReason;
use crate::send_queue::AfterSend;
use crate::timer::TimerWheel;

use super::{
    Agent, ConnState, ConnTimerEvent, Connection, HeuristicsKind, HeuristicsOutcome, TimerEvent,
};

/// The client TLS view of the preinit exchange: whether to upgrade, stay
/// in the clear, or give up.
fn tls_compatibility(server: TlsSupported, client: TlsSupported) -> Option<bool> {
    match (server, client) {
        (TlsSupported::Unsupported, TlsSupported::Required) => None,
        (TlsSupported::Required, TlsSupported::Unsupported) => None,
        (TlsSupported::Unsupported, _) => Some(false),
        (_, TlsSupported::Unsupported) => Some(false),
        _ => Some(true),
    }
}

fn check_seq(conn: &Connection, msg: &DecodedMessage) -> Result<(), DisconnectReason> {
    if msg.seq_number != Some(conn.last_msg_seq) {
        warn!("reply doesn't carry the expected seq number");
        return Err(DisconnectReason::RequiredOptionMissing);
    }
    Ok(())
}

impl Agent {
    /// Handle one complete frame from the server.
    pub(crate) fn process_frame(
        &mut self,
        conn: &mut Connection,
        conn_wheel: &mut TimerWheel<ConnTimerEvent>,
        wheel: &mut TimerWheel<TimerEvent>,
        votes: &mpsc::UnboundedSender<bool>,
        frame: &Bytes,
        heur_tx: &mpsc::UnboundedSender<HeuristicsOutcome>,
    ) -> Result<(), DisconnectReason> {
        let msg = match decode_message(frame) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%err, "can't decode message from server, disconnecting");
                return Err(DisconnectReason::MsgDecodeError);
            }
        };

        match msg.msg_type {
            Some(MsgType::PreinitReply) => self.msg_preinit_reply(conn, &msg),
            Some(MsgType::InitReply) => self.msg_init_reply(conn, conn_wheel, &msg, heur_tx),
            Some(MsgType::ServerError) => msg_server_error(&msg),
            Some(MsgType::SetOptionReply) => self.msg_set_option_reply(conn, conn_wheel, &msg),
            Some(MsgType::EchoReply) => self.msg_echo_reply(conn, &msg),
            Some(MsgType::NodeListReply) => self.msg_node_list_reply(conn, wheel, votes, &msg),
            Some(MsgType::AskForVoteReply) => {
                self.msg_ask_for_vote_reply(conn, wheel, votes, &msg)
            }
            Some(MsgType::VoteInfo) => self.msg_vote_info(conn, wheel, votes, &msg),
            Some(MsgType::HeuristicsChangeReply) => {
                self.msg_heuristics_change_reply(conn, wheel, votes, &msg)
            }
            Some(
                MsgType::Preinit
                | MsgType::StartTls
                | MsgType::Init
                | MsgType::SetOption
                | MsgType::EchoRequest
                | MsgType::NodeList
                | MsgType::AskForVote
                | MsgType::VoteInfoReply
                | MsgType::HeuristicsChange,
            )
            | None => {
                warn!("received an unexpected message from server, disconnecting");
                Err(DisconnectReason::UnexpectedMsg)
            }
        }
    }

    fn msg_preinit_reply(
        &mut self,
        conn: &mut Connection,
        msg: &DecodedMessage,
    ) -> Result<(), DisconnectReason> {
        debug!("received preinit reply");
        if conn.state != ConnState::WaitingPreinitReply {
            warn!("unexpected preinit reply, disconnecting");
            return Err(DisconnectReason::UnexpectedMsg);
        }
        check_seq(conn, msg)?;

        let (Some(server_tls), Some(_cert_required)) =
            (msg.tls_supported, msg.tls_client_cert_required)
        else {
            warn!("preinit reply lacks the TLS options, disconnecting");
            return Err(DisconnectReason::RequiredOptionMissing);
        };

        match tls_compatibility(server_tls, self.tls_offer) {
            None => {
                warn!(
                    server = %server_tls,
                    client = %self.tls_offer,
                    "incompatible TLS configuration, disconnecting"
                );
                Err(DisconnectReason::IncompatibleTls)
            }
            Some(true) => {
                let seq_number = conn.next_seq();
                conn.push_message_with(
                    &Message::StartTls {
                        seq_number: Some(seq_number),
                    },
                    AfterSend::StartTlsUpgrade,
                )?;
                conn.state = ConnState::WaitingStarttlsBeingSent;
                Ok(())
            }
            Some(false) => self.send_init(conn),
        }
    }

    fn msg_init_reply(
        &mut self,
        conn: &mut Connection,
        conn_wheel: &mut TimerWheel<ConnTimerEvent>,
        msg: &DecodedMessage,
        heur_tx: &mpsc::UnboundedSender<HeuristicsOutcome>,
    ) -> Result<(), DisconnectReason> {
        debug!("received init reply");
        if conn.state != ConnState::WaitingInitReply {
            warn!("unexpected init reply, disconnecting");
            return Err(DisconnectReason::UnexpectedMsg);
        }
        check_seq(conn, msg)?;

        let Some(code) = msg.reply_error_code else {
            warn!("init reply without error code, disconnecting");
            return Err(DisconnectReason::RequiredOptionMissing);
        };
        if code != ReplyErrorCode::NoError {
            warn!(%code, "init reply carries an error code, disconnecting");
            return Err(match code {
                ReplyErrorCode::DuplicateNodeId => {
                    // Likely the server has not noticed our previous
                    // connection dropping; a retry usually clears it.
                    DisconnectReason::ServerSentDuplicateNodeId
                }
                ReplyErrorCode::TieBreakerDiffersFromOtherNodes => {
                    DisconnectReason::ServerSentTieBreakerDiffers
                }
                ReplyErrorCode::AlgorithmDiffersFromOtherNodes => {
                    DisconnectReason::ServerSentAlgorithmDiffers
                }
                _ => DisconnectReason::ServerSentError,
            });
        }

        let (Some(max_request), Some(max_reply)) = (
            msg.server_maximum_request_size,
            msg.server_maximum_reply_size,
        ) else {
            warn!("init reply without the size limits, disconnecting");
            return Err(DisconnectReason::RequiredOptionMissing);
        };
        if msg.supported_messages.is_none() || msg.supported_options.is_none() {
            warn!("init reply without the supported sets, disconnecting");
            return Err(DisconnectReason::RequiredOptionMissing);
        }
        if msg.supported_decision_algorithms.is_none() {
            warn!("init reply without the supported algorithms, disconnecting");
            return Err(DisconnectReason::RequiredOptionMissing);
        }

        if (max_request as usize) < self.config.min_send_size {
            warn!(
                max_request,
                min_send = self.config.min_send_size,
                "server accepts smaller requests than this client can guarantee"
            );
            return Err(DisconnectReason::IncompatibleMsgSize);
        }
        if max_reply as usize > self.config.max_receive_size {
            warn!(
                max_reply,
                max_receive = self.config.max_receive_size,
                "server may send larger replies than this client can buffer"
            );
            return Err(DisconnectReason::IncompatibleMsgSize);
        }

        // Grow into the negotiated bounds.
        conn.max_send_size = max_request as usize;
        conn.pending_receive_cap = Some(max_reply as usize);

        if !msg.supports_algorithm(self.config.algorithm) {
            warn!("server doesn't support the required decision algorithm");
            return Err(DisconnectReason::ServerDoesntSupportRequiredAlgorithm);
        }

        conn.server_supports_heuristics = msg.supports_option(OptionType::Heuristics);
        if !conn.server_supports_heuristics && self.executor.enabled() {
            warn!("heuristics are enabled locally but not supported by the server");
            return Err(DisconnectReason::ServerDoesntSupportRequiredOption);
        }

        // Fully connected; the connect budget no longer applies.
        if let Some(timer) = conn.connect_timer.take() {
            conn_wheel.cancel(timer);
        }

        self.schedule_echo_timer(conn, conn_wheel);
        conn.state = ConnState::WaitingVotequorumCmapEvents;

        let seq_number = conn.next_seq();
        conn.push_message(&Message::SetOption {
            seq_number: Some(seq_number),
            heartbeat_interval: Some(self.config.heartbeat_interval),
        })?;
        conn.pending_set_option_seq = Some(seq_number);

        // Run the probes once before publishing the first node lists;
        // with heuristics disabled this resolves to Undefined.
        self.spawn_heuristics(HeuristicsKind::AfterConnect, true, heur_tx);

        Ok(())
    }

    fn msg_set_option_reply(
        &mut self,
        conn: &mut Connection,
        conn_wheel: &mut TimerWheel<ConnTimerEvent>,
        msg: &DecodedMessage,
    ) -> Result<(), DisconnectReason> {
        if conn.state != ConnState::WaitingVotequorumCmapEvents {
            warn!("unexpected set option reply, disconnecting");
            return Err(DisconnectReason::UnexpectedMsg);
        }
        if conn.pending_set_option_seq.take() != msg.seq_number {
            warn!("set option reply doesn't carry the expected seq number");
            return Err(DisconnectReason::RequiredOptionMissing);
        }

        // The server accepted the heartbeat interval; restart the echo
        // cadence from it.
        self.schedule_echo_timer(conn, conn_wheel);
        Ok(())
    }

    fn msg_echo_reply(
        &mut self,
        conn: &mut Connection,
        msg: &DecodedMessage,
    ) -> Result<(), DisconnectReason> {
        let Some(seq_number) = msg.seq_number else {
            warn!("echo reply without seq number, disconnecting");
            return Err(DisconnectReason::RequiredOptionMissing);
        };

        let is_expected = seq_number == conn.echo_expected_seq;
        if !is_expected {
            warn!(seq_number, expected = conn.echo_expected_seq, "unexpected echo reply seq");
        }
        if self.algo.echo_reply_received(seq_number, is_expected).is_err() {
            debug!("algorithm rejected the echo reply, disconnecting");
            return Err(DisconnectReason::AlgorithmError);
        }

        conn.echo_received_seq = seq_number;
        Ok(())
    }

    fn msg_node_list_reply(
        &mut self,
        conn: &mut Connection,
        wheel: &mut TimerWheel<TimerEvent>,
        votes: &mpsc::UnboundedSender<bool>,
        msg: &DecodedMessage,
    ) -> Result<(), DisconnectReason> {
        if conn.state != ConnState::WaitingVotequorumCmapEvents {
            warn!("unexpected node list reply, disconnecting");
            return Err(DisconnectReason::UnexpectedMsg);
        }
        let (Some(vote), Some(seq_number), Some(list_type)) =
            (msg.vote, msg.seq_number, msg.node_list_type)
        else {
            warn!("node list reply without required options, disconnecting");
            return Err(DisconnectReason::RequiredOptionMissing);
        };
        let Some(ring_id) = msg.ring_id else {
            warn!("node list reply without ring id, disconnecting");
            return Err(DisconnectReason::RequiredOptionMissing);
        };

        let ring_id_is_valid = ring_id == conn.last_sent_ring_id;
        debug!(seq_number, %list_type, %vote, %ring_id, ring_id_is_valid, "received node list reply");

        let mut result_vote = vote;
        let hook_result = match list_type {
            NodeListType::InitialConfig | NodeListType::ChangedConfig => {
                self.algo.config_node_list_reply_received(
                    seq_number,
                    list_type == NodeListType::InitialConfig,
                    &ring_id,
                    ring_id_is_valid,
                    &mut result_vote,
                )
            }
            NodeListType::Membership => self.algo.membership_node_list_reply_received(
                seq_number,
                &ring_id,
                ring_id_is_valid,
                &mut result_vote,
            ),
            NodeListType::Quorum => self.algo.quorum_node_list_reply_received(
                seq_number,
                &ring_id,
                ring_id_is_valid,
                &mut result_vote,
            ),
        };
        if hook_result.is_err() {
            debug!("algorithm returned error, disconnecting");
            return Err(DisconnectReason::AlgorithmError);
        }
        debug!(vote = %result_vote, "algorithm result vote");

        self.update_cast_vote(wheel, votes, result_vote)
    }

    fn msg_ask_for_vote_reply(
        &mut self,
        conn: &mut Connection,
        wheel: &mut TimerWheel<TimerEvent>,
        votes: &mpsc::UnboundedSender<bool>,
        msg: &DecodedMessage,
    ) -> Result<(), DisconnectReason> {
        if conn.state != ConnState::WaitingVotequorumCmapEvents {
            warn!("unexpected ask for vote reply, disconnecting");
            return Err(DisconnectReason::UnexpectedMsg);
        }
        let (Some(vote), Some(seq_number), Some(ring_id)) =
            (msg.vote, msg.seq_number, msg.ring_id)
        else {
            warn!("ask for vote reply without required options, disconnecting");
            return Err(DisconnectReason::RequiredOptionMissing);
        };

        let ring_id_is_valid = ring_id == conn.last_sent_ring_id;
        debug!(seq_number, %vote, %ring_id, ring_id_is_valid, "received ask for vote reply");

        let mut result_vote = vote;
        if self
            .algo
            .ask_for_vote_reply_received(seq_number, &ring_id, ring_id_is_valid, &mut result_vote)
            .is_err()
        {
            debug!("algorithm returned error, disconnecting");
            return Err(DisconnectReason::AlgorithmError);
        }
        debug!(vote = %result_vote, "algorithm result vote");

        self.update_cast_vote(wheel, votes, result_vote)
    }

    fn msg_vote_info(
        &mut self,
        conn: &mut Connection,
        wheel: &mut TimerWheel<TimerEvent>,
        votes: &mpsc::UnboundedSender<bool>,
        msg: &DecodedMessage,
    ) -> Result<(), DisconnectReason> {
        if conn.state != ConnState::WaitingVotequorumCmapEvents {
            warn!("unexpected vote info, disconnecting");
            return Err(DisconnectReason::UnexpectedMsg);
        }
        let (Some(vote), Some(seq_number), Some(ring_id)) =
            (msg.vote, msg.seq_number, msg.ring_id)
        else {
            warn!("vote info without required options, disconnecting");
            return Err(DisconnectReason::RequiredOptionMissing);
        };

        let ring_id_is_valid = ring_id == conn.last_sent_ring_id;
        debug!(seq_number, %vote, %ring_id, ring_id_is_valid, "received vote info");

        let mut result_vote = vote;
        if self
            .algo
            .vote_info_received(seq_number, &ring_id, ring_id_is_valid, &mut result_vote)
            .is_err()
        {
            debug!("algorithm returned error, disconnecting");
            return Err(DisconnectReason::AlgorithmError);
        }
        debug!(vote = %result_vote, "algorithm result vote");

        self.update_cast_vote(wheel, votes, result_vote)?;
        conn.push_message(&Message::VoteInfoReply { seq_number })
    }

    fn msg_heuristics_change_reply(
        &mut self,
        conn: &mut Connection,
        wheel: &mut TimerWheel<TimerEvent>,
        votes: &mpsc::UnboundedSender<bool>,
        msg: &DecodedMessage,
    ) -> Result<(), DisconnectReason> {
        if conn.state != ConnState::WaitingVotequorumCmapEvents {
            warn!("unexpected heuristics change reply, disconnecting");
            return Err(DisconnectReason::UnexpectedMsg);
        }
        let (Some(vote), Some(seq_number), Some(ring_id)) =
            (msg.vote, msg.seq_number, msg.ring_id)
        else {
            warn!("heuristics change reply without required options, disconnecting");
            return Err(DisconnectReason::RequiredOptionMissing);
        };
        if msg.heuristics == Heuristics::Undefined {
            warn!("heuristics change reply without a result, disconnecting");
            return Err(DisconnectReason::RequiredOptionMissing);
        }

        let ring_id_is_valid = ring_id == conn.last_sent_ring_id;
        debug!(
            seq_number, %vote, %ring_id, ring_id_is_valid,
            heuristics = %msg.heuristics,
            "received heuristics change reply"
        );

        let mut result_vote = vote;
        if self
            .algo
            .heuristics_change_reply_received(
                seq_number,
                &ring_id,
                ring_id_is_valid,
                msg.heuristics,
                &mut result_vote,
            )
            .is_err()
        {
            debug!("algorithm returned error, disconnecting");
            return Err(DisconnectReason::AlgorithmError);
        }
        debug!(vote = %result_vote, "algorithm result vote");

        self.update_cast_vote(wheel, votes, result_vote)
    }
}

fn msg_server_error(msg: &DecodedMessage) -> Result<(), DisconnectReason> {
    match msg.reply_error_code {
        Some(code) => {
            warn!(%code, "received server error, disconnecting");
            Err(DisconnectReason::ServerSentError)
        }
        None => {
            warn!("received server error without error code, disconnecting");
            Err(DisconnectReason::RequiredOptionMissing)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_intersection_matrix() {
        use TlsSupported::*;

        // Either side refusing what the other requires is fatal.
        assert_eq!(tls_compatibility(Unsupported, Required), None);
        assert_eq!(tls_compatibility(Required, Unsupported), None);

        // Plain text when either side cannot do TLS.
        assert_eq!(tls_compatibility(Unsupported, Unsupported), Some(false));
        assert_eq!(tls_compatibility(Unsupported, Supported), Some(false));
        assert_eq!(tls_compatibility(Supported, Unsupported), Some(false));

        // TLS whenever both sides can.
        assert_eq!(tls_compatibility(Supported, Supported), Some(true));
        assert_eq!(tls_compatibility(Supported, Required), Some(true));
        assert_eq!(tls_compatibility(Required, Supported), Some(true));
        assert_eq!(tls_compatibility(Required, Required), Some(true));
    }
}

//! Whole-message encoding and decoding.
//!
//! A message is a fixed 6-byte header (`msg_type: u16be ‖ payload_len:
//! u32be`, the length excluding the header) followed by a TLV option
//! payload. [`Message`] enumerates everything this implementation sends;
//! [`DecodedMessage`] is the option bag produced from a received frame,
//! with one `Option` (or defaulted) field per option type so callers can
//! check mandatory options per message and state.

use bytes::{Bytes, BytesMut};

use crate::options::{
    self, DecodeError, EncodeError, OptionType, TlvIter, TlvWriter, SUPPORTED_OPTIONS,
};
use crate::types::{
    DecisionAlgorithm, Heuristics, NodeInfo, NodeListType, Quorate, ReplyErrorCode, RingId,
    TieBreaker, TlsSupported, Vote, SUPPORTED_DECISION_ALGORITHMS,
};

/// Size of the fixed message header.
pub const HEADER_LEN: usize = 6;

/// Message types 0–17.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    Preinit = 0,
    PreinitReply = 1,
    StartTls = 2,
    Init = 3,
    InitReply = 4,
    ServerError = 5,
    SetOption = 6,
    SetOptionReply = 7,
    EchoRequest = 8,
    EchoReply = 9,
    NodeList = 10,
    NodeListReply = 11,
    AskForVote = 12,
    AskForVoteReply = 13,
    VoteInfo = 14,
    VoteInfoReply = 15,
    HeuristicsChange = 16,
    HeuristicsChangeReply = 17,
}

/// Every message type this implementation understands, in wire order.
pub const SUPPORTED_MESSAGES: [MsgType; 18] = [
    MsgType::Preinit,
    MsgType::PreinitReply,
    MsgType::StartTls,
    MsgType::Init,
    MsgType::InitReply,
    MsgType::ServerError,
    MsgType::SetOption,
    MsgType::SetOptionReply,
    MsgType::EchoRequest,
    MsgType::EchoReply,
    MsgType::NodeList,
    MsgType::NodeListReply,
    MsgType::AskForVote,
    MsgType::AskForVoteReply,
    MsgType::VoteInfo,
    MsgType::VoteInfoReply,
    MsgType::HeuristicsChange,
    MsgType::HeuristicsChangeReply,
];

impl MsgType {
    /// Parse the two-byte wire value.
    pub fn from_u16(value: u16) -> Option<Self> {
        SUPPORTED_MESSAGES.get(value as usize).copied()
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MsgType::Preinit => "Preinit",
            MsgType::PreinitReply => "Preinit reply",
            MsgType::StartTls => "StartTLS",
            MsgType::Init => "Init",
            MsgType::InitReply => "Init reply",
            MsgType::ServerError => "Server error",
            MsgType::SetOption => "Set option",
            MsgType::SetOptionReply => "Set option reply",
            MsgType::EchoRequest => "Echo request",
            MsgType::EchoReply => "Echo reply",
            MsgType::NodeList => "Node list",
            MsgType::NodeListReply => "Node list reply",
            MsgType::AskForVote => "Ask for vote",
            MsgType::AskForVoteReply => "Ask for vote reply",
            MsgType::VoteInfo => "Vote info",
            MsgType::VoteInfoReply => "Vote info reply",
            MsgType::HeuristicsChange => "Heuristics change",
            MsgType::HeuristicsChangeReply => "Heuristics change reply",
        };
        write!(f, "{}", name)
    }
}

/// A message to be encoded. EchoReply has no variant: it is produced by
/// [`encode_echo_reply`] as a byte copy of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// First message of the handshake, naming the cluster.
    Preinit {
        /// Correlation number echoed by the reply.
        seq_number: Option<u32>,
        /// Cluster this client belongs to.
        cluster_name: String,
    },
    /// Server's answer to Preinit, advertising TLS policy.
    PreinitReply {
        /// Echo of the request's seq number.
        seq_number: Option<u32>,
        /// Server's TLS capability.
        tls_supported: TlsSupported,
        /// Whether the server demands a client certificate.
        tls_client_cert_required: bool,
    },
    /// Client request to upgrade the connection to TLS.
    StartTls {
        /// Correlation number.
        seq_number: Option<u32>,
    },
    /// Client's registration carrying everything the server must validate.
    Init {
        /// Correlation number echoed by the reply.
        seq_number: Option<u32>,
        /// Message types the client implements.
        supported_messages: Vec<MsgType>,
        /// Option types the client implements.
        supported_options: Vec<OptionType>,
        /// This node's id.
        node_id: u32,
        /// Requested decision algorithm.
        decision_algorithm: DecisionAlgorithm,
        /// Requested heartbeat interval in milliseconds.
        heartbeat_interval: u32,
        /// Cluster-wide tie breaker.
        tie_breaker: TieBreaker,
        /// Current ring id.
        ring_id: RingId,
    },
    /// Server's answer to Init.
    InitReply {
        /// `NoError` on the success path.
        reply_error_code: ReplyErrorCode,
        /// Message types the server implements.
        supported_messages: Vec<MsgType>,
        /// Option types the server implements.
        supported_options: Vec<OptionType>,
        /// Echo of the request's seq number.
        seq_number: Option<u32>,
        /// Largest request the server accepts.
        server_maximum_request_size: u32,
        /// Largest reply the server may send.
        server_maximum_reply_size: u32,
        /// Decision algorithms the server offers.
        supported_decision_algorithms: Vec<DecisionAlgorithm>,
    },
    /// Typed error reply that does not terminate the connection.
    ServerError {
        /// Echo of the offending request's seq number, when known.
        seq_number: Option<u32>,
        /// What went wrong.
        reply_error_code: ReplyErrorCode,
    },
    /// Client request to change negotiable options mid-session.
    SetOption {
        /// Correlation number echoed by the reply.
        seq_number: Option<u32>,
        /// New heartbeat interval, when changing it.
        heartbeat_interval: Option<u32>,
    },
    /// Server's answer to SetOption, echoing the effective values.
    SetOptionReply {
        /// Echo of the request's seq number.
        seq_number: Option<u32>,
        /// Heartbeat interval now in effect.
        heartbeat_interval: u32,
    },
    /// Heartbeat probe; the server copies it back verbatim as EchoReply.
    EchoRequest {
        /// Correlation number carried back by the reply.
        seq_number: Option<u32>,
    },
    /// A configuration, membership or quorum node list from the client.
    NodeList {
        /// Correlation number echoed by the reply.
        seq_number: u32,
        /// Which list this is.
        list_type: NodeListType,
        /// Ring id; mandatory for membership lists.
        ring_id: Option<RingId>,
        /// Configuration version, for config lists that carry one.
        config_version: Option<u64>,
        /// Quorate flag; mandatory for quorum lists.
        quorate: Option<Quorate>,
        /// Heuristics result; `Undefined` is omitted from the wire.
        heuristics: Heuristics,
        /// The nodes themselves.
        nodes: Vec<NodeInfo>,
    },
    /// Server's answer to NodeList.
    NodeListReply {
        /// Echo of the request's seq number.
        seq_number: u32,
        /// Which list is being answered.
        list_type: NodeListType,
        /// Ring id the vote applies to.
        ring_id: RingId,
        /// The vote.
        vote: Vote,
    },
    /// Client poll after an `AskLater` vote.
    AskForVote {
        /// Correlation number echoed by the reply.
        seq_number: u32,
    },
    /// Server's answer to AskForVote.
    AskForVoteReply {
        /// Echo of the request's seq number.
        seq_number: u32,
        /// Ring id the vote applies to.
        ring_id: RingId,
        /// The vote.
        vote: Vote,
    },
    /// Unsolicited vote pushed by the server.
    VoteInfo {
        /// Server-chosen correlation number, acknowledged by the reply.
        seq_number: u32,
        /// Ring id the vote applies to.
        ring_id: RingId,
        /// The vote.
        vote: Vote,
    },
    /// Client acknowledgment of a VoteInfo.
    VoteInfoReply {
        /// Echo of the VoteInfo's seq number.
        seq_number: u32,
    },
    /// Client report that its heuristics result changed.
    HeuristicsChange {
        /// Correlation number echoed by the reply.
        seq_number: u32,
        /// The new result; never `Undefined` on the wire.
        heuristics: Heuristics,
    },
    /// Server's answer to HeuristicsChange.
    HeuristicsChangeReply {
        /// Echo of the request's seq number.
        seq_number: u32,
        /// Ring id the vote applies to.
        ring_id: RingId,
        /// Echo of the reported result.
        heuristics: Heuristics,
        /// The vote.
        vote: Vote,
    },
}

impl Message {
    /// The wire type of this message.
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Preinit { .. } => MsgType::Preinit,
            Message::PreinitReply { .. } => MsgType::PreinitReply,
            Message::StartTls { .. } => MsgType::StartTls,
            Message::Init { .. } => MsgType::Init,
            Message::InitReply { .. } => MsgType::InitReply,
            Message::ServerError { .. } => MsgType::ServerError,
            Message::SetOption { .. } => MsgType::SetOption,
            Message::SetOptionReply { .. } => MsgType::SetOptionReply,
            Message::EchoRequest { .. } => MsgType::EchoRequest,
            Message::NodeList { .. } => MsgType::NodeList,
            Message::NodeListReply { .. } => MsgType::NodeListReply,
            Message::AskForVote { .. } => MsgType::AskForVote,
            Message::AskForVoteReply { .. } => MsgType::AskForVoteReply,
            Message::VoteInfo { .. } => MsgType::VoteInfo,
            Message::VoteInfoReply { .. } => MsgType::VoteInfoReply,
            Message::HeuristicsChange { .. } => MsgType::HeuristicsChange,
            Message::HeuristicsChangeReply { .. } => MsgType::HeuristicsChangeReply,
        }
    }

    /// Encode into a complete frame, refusing to exceed `max_size` bytes
    /// (header included).
    pub fn encode(&self, max_size: usize) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(self.msg_type() as u16).to_be_bytes());
        // Placeholder; patched once the payload length is known.
        buf.extend_from_slice(&0u32.to_be_bytes());

        let mut w = TlvWriter::new(&mut buf, max_size);
        match self {
            Message::Preinit {
                seq_number,
                cluster_name,
            } => {
                add_opt_seq(&mut w, *seq_number)?;
                w.add_string(OptionType::ClusterName, cluster_name)?;
            }
            Message::PreinitReply {
                seq_number,
                tls_supported,
                tls_client_cert_required,
            } => {
                add_opt_seq(&mut w, *seq_number)?;
                w.add_u8(OptionType::TlsSupported, *tls_supported as u8)?;
                w.add_u8(
                    OptionType::TlsClientCertRequired,
                    u8::from(*tls_client_cert_required),
                )?;
            }
            Message::StartTls { seq_number } => {
                add_opt_seq(&mut w, *seq_number)?;
            }
            Message::Init {
                seq_number,
                supported_messages,
                supported_options,
                node_id,
                decision_algorithm,
                heartbeat_interval,
                tie_breaker,
                ring_id,
            } => {
                add_opt_seq(&mut w, *seq_number)?;
                if !supported_messages.is_empty() {
                    w.add_u16_array(
                        OptionType::SupportedMessages,
                        supported_messages.iter().map(|m| *m as u16),
                    )?;
                }
                if !supported_options.is_empty() {
                    w.add_u16_array(
                        OptionType::SupportedOptions,
                        supported_options.iter().map(|o| *o as u16),
                    )?;
                }
                w.add_u32(OptionType::NodeId, *node_id)?;
                w.add_u16(OptionType::DecisionAlgorithm, *decision_algorithm as u16)?;
                w.add_u32(OptionType::HeartbeatInterval, *heartbeat_interval)?;
                w.add_tie_breaker(*tie_breaker)?;
                w.add_ring_id(ring_id)?;
            }
            Message::InitReply {
                reply_error_code,
                supported_messages,
                supported_options,
                seq_number,
                server_maximum_request_size,
                server_maximum_reply_size,
                supported_decision_algorithms,
            } => {
                w.add_u16(OptionType::ReplyErrorCode, *reply_error_code as u16)?;
                if !supported_messages.is_empty() {
                    w.add_u16_array(
                        OptionType::SupportedMessages,
                        supported_messages.iter().map(|m| *m as u16),
                    )?;
                }
                if !supported_options.is_empty() {
                    w.add_u16_array(
                        OptionType::SupportedOptions,
                        supported_options.iter().map(|o| *o as u16),
                    )?;
                }
                add_opt_seq(&mut w, *seq_number)?;
                w.add_u32(
                    OptionType::ServerMaximumRequestSize,
                    *server_maximum_request_size,
                )?;
                w.add_u32(
                    OptionType::ServerMaximumReplySize,
                    *server_maximum_reply_size,
                )?;
                if !supported_decision_algorithms.is_empty() {
                    w.add_u16_array(
                        OptionType::SupportedDecisionAlgorithms,
                        supported_decision_algorithms.iter().map(|a| *a as u16),
                    )?;
                }
            }
            Message::ServerError {
                seq_number,
                reply_error_code,
            } => {
                add_opt_seq(&mut w, *seq_number)?;
                w.add_u16(OptionType::ReplyErrorCode, *reply_error_code as u16)?;
            }
            Message::SetOption {
                seq_number,
                heartbeat_interval,
            } => {
                add_opt_seq(&mut w, *seq_number)?;
                if let Some(interval) = heartbeat_interval {
                    w.add_u32(OptionType::HeartbeatInterval, *interval)?;
                }
            }
            Message::SetOptionReply {
                seq_number,
                heartbeat_interval,
            } => {
                add_opt_seq(&mut w, *seq_number)?;
                w.add_u32(OptionType::HeartbeatInterval, *heartbeat_interval)?;
            }
            Message::EchoRequest { seq_number } => {
                add_opt_seq(&mut w, *seq_number)?;
            }
            Message::NodeList {
                seq_number,
                list_type,
                ring_id,
                config_version,
                quorate,
                heuristics,
                nodes,
            } => {
                w.add_u32(OptionType::MsgSeqNumber, *seq_number)?;
                w.add_u8(OptionType::NodeListType, *list_type as u8)?;
                if let Some(ring_id) = ring_id {
                    w.add_ring_id(ring_id)?;
                }
                if let Some(version) = config_version {
                    w.add_u64(OptionType::ConfigVersion, *version)?;
                }
                if let Some(quorate) = quorate {
                    w.add_u8(OptionType::Quorate, *quorate as u8)?;
                }
                for node in nodes {
                    w.add_node_info(node)?;
                }
                if *heuristics != Heuristics::Undefined {
                    w.add_heuristics(*heuristics)?;
                }
            }
            Message::NodeListReply {
                seq_number,
                list_type,
                ring_id,
                vote,
            } => {
                w.add_u32(OptionType::MsgSeqNumber, *seq_number)?;
                w.add_u8(OptionType::NodeListType, *list_type as u8)?;
                w.add_ring_id(ring_id)?;
                w.add_u8(OptionType::Vote, *vote as u8)?;
            }
            Message::AskForVote { seq_number } => {
                w.add_u32(OptionType::MsgSeqNumber, *seq_number)?;
            }
            Message::AskForVoteReply {
                seq_number,
                ring_id,
                vote,
            }
            | Message::VoteInfo {
                seq_number,
                ring_id,
                vote,
            } => {
                w.add_u32(OptionType::MsgSeqNumber, *seq_number)?;
                w.add_u8(OptionType::Vote, *vote as u8)?;
                w.add_ring_id(ring_id)?;
            }
            Message::VoteInfoReply { seq_number } => {
                w.add_u32(OptionType::MsgSeqNumber, *seq_number)?;
            }
            Message::HeuristicsChange {
                seq_number,
                heuristics,
            } => {
                w.add_u32(OptionType::MsgSeqNumber, *seq_number)?;
                w.add_heuristics(*heuristics)?;
            }
            Message::HeuristicsChangeReply {
                seq_number,
                ring_id,
                heuristics,
                vote,
            } => {
                w.add_u32(OptionType::MsgSeqNumber, *seq_number)?;
                w.add_u8(OptionType::Vote, *vote as u8)?;
                w.add_ring_id(ring_id)?;
                w.add_heuristics(*heuristics)?;
            }
        }

        let payload_len = (buf.len() - HEADER_LEN) as u32;
        buf[2..HEADER_LEN].copy_from_slice(&payload_len.to_be_bytes());
        Ok(buf.freeze())
    }
}

fn add_opt_seq(w: &mut TlvWriter, seq_number: Option<u32>) -> Result<(), EncodeError> {
    if let Some(seq) = seq_number {
        w.add_u32(OptionType::MsgSeqNumber, seq)?;
    }
    Ok(())
}

/// Produce an EchoReply frame: the request copied verbatim with the type
/// field overwritten.
pub fn encode_echo_reply(request_frame: &[u8], max_size: usize) -> Result<Bytes, EncodeError> {
    if request_frame.len() > max_size {
        return Err(EncodeError::TooLarge { max: max_size });
    }
    let mut buf = BytesMut::new();
    buf.extend_from_slice(request_frame);
    buf[..2].copy_from_slice(&(MsgType::EchoReply as u16).to_be_bytes());
    Ok(buf.freeze())
}

/// The wire type of a framed message, if the frame is long enough and the
/// type is known.
pub fn frame_msg_type(frame: &[u8]) -> Option<MsgType> {
    if frame.len() < 2 {
        return None;
    }
    MsgType::from_u16(u16::from_be_bytes([frame[0], frame[1]]))
}

/// A decoded message: one field per option type, `None`/defaulted when the
/// option was absent. Supported-set arrays keep their raw u16 values so
/// that entries from newer protocol revisions survive the round trip.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedMessage {
    /// The message type from the header.
    pub msg_type: Option<MsgType>,
    /// Correlation number.
    pub seq_number: Option<u32>,
    /// Cluster name.
    pub cluster_name: Option<String>,
    /// TLS capability byte.
    pub tls_supported: Option<TlsSupported>,
    /// Client-certificate requirement flag.
    pub tls_client_cert_required: Option<bool>,
    /// Raw supported message types.
    pub supported_messages: Option<Vec<u16>>,
    /// Raw supported option types.
    pub supported_options: Option<Vec<u16>>,
    /// Typed error code.
    pub reply_error_code: Option<ReplyErrorCode>,
    /// Largest request the server accepts.
    pub server_maximum_request_size: Option<u32>,
    /// Largest reply the server may send.
    pub server_maximum_reply_size: Option<u32>,
    /// Node id.
    pub node_id: Option<u32>,
    /// Raw supported decision algorithms.
    pub supported_decision_algorithms: Option<Vec<u16>>,
    /// Decision algorithm.
    pub decision_algorithm: Option<DecisionAlgorithm>,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: Option<u32>,
    /// Ring id.
    pub ring_id: Option<RingId>,
    /// Configuration version.
    pub config_version: Option<u64>,
    /// Node infos, in wire order.
    pub nodes: Vec<NodeInfo>,
    /// Node list type.
    pub node_list_type: Option<NodeListType>,
    /// Vote.
    pub vote: Option<Vote>,
    /// Quorate flag.
    pub quorate: Option<Quorate>,
    /// Tie breaker.
    pub tie_breaker: Option<TieBreaker>,
    /// Heuristics result; `Undefined` when absent.
    pub heuristics: Heuristics,
}

impl DecodedMessage {
    /// True when the supported-options set advertises `opt`.
    pub fn supports_option(&self, opt: OptionType) -> bool {
        self.supported_options
            .as_deref()
            .is_some_and(|opts| opts.contains(&(opt as u16)))
    }

    /// True when the supported-algorithms set advertises `algorithm`.
    pub fn supports_algorithm(&self, algorithm: DecisionAlgorithm) -> bool {
        self.supported_decision_algorithms
            .as_deref()
            .is_some_and(|algos| algos.contains(&(algorithm as u16)))
    }
}

/// Decode a complete frame (header and payload). Unknown options are
/// ignored; a repeated option overrides the earlier occurrence.
pub fn decode_message(frame: &[u8]) -> Result<DecodedMessage, DecodeError> {
    if frame.len() < HEADER_LEN {
        return Err(DecodeError::InconsistentLength);
    }
    let mut msg = DecodedMessage {
        msg_type: MsgType::from_u16(u16::from_be_bytes([frame[0], frame[1]])),
        ..DecodedMessage::default()
    };

    for item in TlvIter::new(&frame[HEADER_LEN..]) {
        let (opt_type, value) = item?;
        let Some(opt_type) = OptionType::from_u16(opt_type) else {
            // Unknown options are accepted and ignored.
            continue;
        };
        match opt_type {
            OptionType::MsgSeqNumber => msg.seq_number = Some(options::decode_u32(value)?),
            OptionType::ClusterName => msg.cluster_name = Some(options::decode_string(value)?),
            OptionType::TlsSupported => {
                msg.tls_supported = Some(
                    TlsSupported::from_u8(options::decode_u8(value)?)
                        .ok_or(DecodeError::InvalidOptionValue)?,
                );
            }
            OptionType::TlsClientCertRequired => {
                msg.tls_client_cert_required = Some(options::decode_u8(value)? != 0);
            }
            OptionType::SupportedMessages => {
                msg.supported_messages = Some(options::decode_u16_array(value)?);
            }
            OptionType::SupportedOptions => {
                msg.supported_options = Some(options::decode_u16_array(value)?);
            }
            OptionType::ReplyErrorCode => {
                msg.reply_error_code = Some(
                    ReplyErrorCode::from_u16(options::decode_u16(value)?)
                        .ok_or(DecodeError::InvalidOptionValue)?,
                );
            }
            OptionType::ServerMaximumRequestSize => {
                msg.server_maximum_request_size = Some(options::decode_u32(value)?);
            }
            OptionType::ServerMaximumReplySize => {
                msg.server_maximum_reply_size = Some(options::decode_u32(value)?);
            }
            OptionType::NodeId => msg.node_id = Some(options::decode_u32(value)?),
            OptionType::SupportedDecisionAlgorithms => {
                msg.supported_decision_algorithms = Some(options::decode_u16_array(value)?);
            }
            OptionType::DecisionAlgorithm => {
                msg.decision_algorithm = Some(
                    DecisionAlgorithm::from_u16(options::decode_u16(value)?)
                        .ok_or(DecodeError::InvalidOptionValue)?,
                );
            }
            OptionType::HeartbeatInterval => {
                msg.heartbeat_interval = Some(options::decode_u32(value)?);
            }
            OptionType::RingId => msg.ring_id = Some(options::decode_ring_id(value)?),
            OptionType::ConfigVersion => msg.config_version = Some(options::decode_u64(value)?),
            OptionType::DataCenterId | OptionType::NodeState => {
                // Only meaningful nested inside a node info.
            }
            OptionType::NodeInfo => {
                msg.nodes
                    .try_reserve(1)
                    .map_err(|_| DecodeError::OutOfMemory)?;
                msg.nodes.push(options::decode_node_info(value)?);
            }
            OptionType::NodeListType => {
                msg.node_list_type = Some(
                    NodeListType::from_u8(options::decode_u8(value)?)
                        .ok_or(DecodeError::InvalidOptionValue)?,
                );
            }
            OptionType::Vote => {
                msg.vote = Some(
                    Vote::from_u8(options::decode_u8(value)?)
                        .ok_or(DecodeError::InvalidOptionValue)?,
                );
            }
            OptionType::Quorate => {
                msg.quorate = Some(
                    Quorate::from_u8(options::decode_u8(value)?)
                        .ok_or(DecodeError::InvalidOptionValue)?,
                );
            }
            OptionType::TieBreaker => {
                msg.tie_breaker = Some(options::decode_tie_breaker(value)?);
            }
            OptionType::Heuristics => {
                msg.heuristics = Heuristics::from_u8(options::decode_u8(value)?)
                    .ok_or(DecodeError::InvalidOptionValue)?;
            }
        }
    }

    Ok(msg)
}

/// The full supported-message set as raw wire values.
pub fn supported_messages_raw() -> Vec<u16> {
    SUPPORTED_MESSAGES.iter().map(|m| *m as u16).collect()
}

/// The full supported-option set as raw wire values.
pub fn supported_options_raw() -> Vec<u16> {
    SUPPORTED_OPTIONS.iter().map(|o| *o as u16).collect()
}

/// The full supported-algorithm set as raw wire values.
pub fn supported_algorithms_raw() -> Vec<u16> {
    SUPPORTED_DECISION_ALGORITHMS.iter().map(|a| *a as u16).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeState;

    const MAX: usize = 1 << 15;

    #[test]
    fn init_round_trip() {
        let msg = Message::Init {
            seq_number: Some(2),
            supported_messages: SUPPORTED_MESSAGES.to_vec(),
            supported_options: SUPPORTED_OPTIONS.to_vec(),
            node_id: 7,
            decision_algorithm: DecisionAlgorithm::Ffsplit,
            heartbeat_interval: 8000,
            tie_breaker: TieBreaker::NodeId(2),
            ring_id: RingId::new(1, 0x10),
        };
        let frame = msg.encode(MAX).unwrap();
        let decoded = decode_message(&frame).unwrap();

        assert_eq!(decoded.msg_type, Some(MsgType::Init));
        assert_eq!(decoded.seq_number, Some(2));
        assert_eq!(decoded.node_id, Some(7));
        assert_eq!(decoded.decision_algorithm, Some(DecisionAlgorithm::Ffsplit));
        assert_eq!(decoded.heartbeat_interval, Some(8000));
        assert_eq!(decoded.tie_breaker, Some(TieBreaker::NodeId(2)));
        assert_eq!(decoded.ring_id, Some(RingId::new(1, 0x10)));
        assert_eq!(decoded.supported_messages, Some(supported_messages_raw()));
        assert_eq!(decoded.supported_options, Some(supported_options_raw()));
    }

    #[test]
    fn init_reply_round_trip() {
        let msg = Message::InitReply {
            reply_error_code: ReplyErrorCode::NoError,
            supported_messages: SUPPORTED_MESSAGES.to_vec(),
            supported_options: SUPPORTED_OPTIONS.to_vec(),
            seq_number: Some(2),
            server_maximum_request_size: 1 << 15,
            server_maximum_reply_size: 1 << 15,
            supported_decision_algorithms: SUPPORTED_DECISION_ALGORITHMS.to_vec(),
        };
        let frame = msg.encode(MAX).unwrap();
        let decoded = decode_message(&frame).unwrap();

        assert_eq!(decoded.reply_error_code, Some(ReplyErrorCode::NoError));
        assert_eq!(decoded.server_maximum_request_size, Some(1 << 15));
        assert_eq!(decoded.server_maximum_reply_size, Some(1 << 15));
        assert!(decoded.supports_algorithm(DecisionAlgorithm::Lms));
        assert!(decoded.supports_option(OptionType::Heuristics));
    }

    #[test]
    fn node_list_round_trip() {
        let msg = Message::NodeList {
            seq_number: 9,
            list_type: NodeListType::Membership,
            ring_id: Some(RingId::new(1, 4)),
            config_version: None,
            quorate: None,
            heuristics: Heuristics::Pass,
            nodes: vec![
                NodeInfo::new(1),
                NodeInfo {
                    node_id: 2,
                    data_center_id: 0,
                    node_state: NodeState::Member,
                },
            ],
        };
        let frame = msg.encode(MAX).unwrap();
        let decoded = decode_message(&frame).unwrap();

        assert_eq!(decoded.msg_type, Some(MsgType::NodeList));
        assert_eq!(decoded.node_list_type, Some(NodeListType::Membership));
        assert_eq!(decoded.ring_id, Some(RingId::new(1, 4)));
        assert_eq!(decoded.heuristics, Heuristics::Pass);
        assert_eq!(decoded.nodes.len(), 2);
        assert_eq!(decoded.nodes[1].node_state, NodeState::Member);
        assert_eq!(decoded.quorate, None);
        assert_eq!(decoded.config_version, None);
    }

    #[test]
    fn undefined_heuristics_is_omitted_from_node_list() {
        let msg = Message::NodeList {
            seq_number: 1,
            list_type: NodeListType::InitialConfig,
            ring_id: None,
            config_version: Some(44),
            quorate: None,
            heuristics: Heuristics::Undefined,
            nodes: vec![NodeInfo::new(1)],
        };
        let frame = msg.encode(MAX).unwrap();
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded.heuristics, Heuristics::Undefined);
        assert_eq!(decoded.config_version, Some(44));
    }

    #[test]
    fn vote_info_round_trip() {
        let msg = Message::VoteInfo {
            seq_number: 3,
            ring_id: RingId::new(2, 8),
            vote: Vote::Nack,
        };
        let frame = msg.encode(MAX).unwrap();
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded.msg_type, Some(MsgType::VoteInfo));
        assert_eq!(decoded.vote, Some(Vote::Nack));
        assert_eq!(decoded.ring_id, Some(RingId::new(2, 8)));
    }

    #[test]
    fn echo_reply_differs_only_in_type() {
        let request = Message::EchoRequest {
            seq_number: Some(17),
        }
        .encode(MAX)
        .unwrap();
        let reply = encode_echo_reply(&request, MAX).unwrap();

        assert_eq!(reply.len(), request.len());
        assert_eq!(&reply[..2], &(MsgType::EchoReply as u16).to_be_bytes());
        assert_eq!(&reply[2..], &request[2..]);

        let decoded = decode_message(&reply).unwrap();
        assert_eq!(decoded.msg_type, Some(MsgType::EchoReply));
        assert_eq!(decoded.seq_number, Some(17));
    }

    #[test]
    fn duplicate_option_overrides() {
        // Hand-build a preinit frame carrying the seq number twice.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MsgType::Preinit as u16).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let mut w = TlvWriter::new(&mut buf, MAX);
        w.add_u32(OptionType::MsgSeqNumber, 1).unwrap();
        w.add_u32(OptionType::MsgSeqNumber, 2).unwrap();
        let len = (buf.len() - HEADER_LEN) as u32;
        buf[2..HEADER_LEN].copy_from_slice(&len.to_be_bytes());

        let decoded = decode_message(&buf).unwrap();
        assert_eq!(decoded.seq_number, Some(2));
    }

    #[test]
    fn unknown_option_is_skipped() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MsgType::EchoRequest as u16).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        // Option type 999 does not exist; it must be ignored.
        buf.extend_from_slice(&999u16.to_be_bytes());
        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.extend_from_slice(&[0xab, 0xcd]);
        let mut w = TlvWriter::new(&mut buf, MAX);
        w.add_u32(OptionType::MsgSeqNumber, 5).unwrap();
        let len = (buf.len() - HEADER_LEN) as u32;
        buf[2..HEADER_LEN].copy_from_slice(&len.to_be_bytes());

        let decoded = decode_message(&buf).unwrap();
        assert_eq!(decoded.seq_number, Some(5));
    }

    #[test]
    fn option_past_end_is_inconsistent() {
        let frame = Message::EchoRequest { seq_number: Some(1) }
            .encode(MAX)
            .unwrap();
        let truncated = &frame[..frame.len() - 1];
        assert_eq!(
            decode_message(truncated),
            Err(DecodeError::InconsistentLength)
        );
    }

    #[test]
    fn invalid_vote_byte_is_invalid_value() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MsgType::VoteInfo as u16).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let mut w = TlvWriter::new(&mut buf, MAX);
        w.add_u8(OptionType::Vote, 9).unwrap();
        let len = (buf.len() - HEADER_LEN) as u32;
        buf[2..HEADER_LEN].copy_from_slice(&len.to_be_bytes());

        assert_eq!(decode_message(&buf), Err(DecodeError::InvalidOptionValue));
    }

    #[test]
    fn encode_respects_max_size() {
        let msg = Message::Preinit {
            seq_number: Some(1),
            cluster_name: "alpha".into(),
        };
        assert!(matches!(
            msg.encode(12),
            Err(EncodeError::TooLarge { max: 12 })
        ));
        msg.encode(64).unwrap();
    }
}

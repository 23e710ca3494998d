//! Wire protocol of the quorum arbiter.
//!
//! Every exchange between an arbiter server and its clients is a
//! length-prefixed message whose payload is a sequence of typed TLV
//! options. This crate owns the option codec ([`options`]), whole-message
//! encode/decode ([`message`]), the shared value types ([`types`]) and a
//! [`tokio_util::codec`]-based framer ([`frame`]) with the protocol's
//! skip-oversized-frames semantics.

pub mod frame;
pub mod message;
pub mod options;
pub mod types;

pub use frame::{FrameCodec, InboundFrame, SkipReason, DEFAULT_MAX_FRAME_SIZE};
pub use message::{
    decode_message, encode_echo_reply, frame_msg_type, DecodedMessage, Message, MsgType,
    HEADER_LEN, SUPPORTED_MESSAGES,
};
pub use options::{DecodeError, EncodeError, OptionType, SUPPORTED_OPTIONS};
pub use types::{
    DecisionAlgorithm, Heuristics, NodeInfo, NodeListType, NodeState, Quorate, ReplyErrorCode,
    RingId, TieBreaker, TlsSupported, Vote, SUPPORTED_DECISION_ALGORITHMS,
};

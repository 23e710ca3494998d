//! TLV option encoding and iteration.
//!
//! Every message payload is a concatenation of options, each framed as
//! `opt_type: u16be ‖ opt_len: u16be ‖ value[opt_len]`. Integers inside
//! option values are big-endian. Unknown option types are skipped by
//! receivers; an option occurring twice overrides the earlier occurrence.

use bytes::{BufMut, BytesMut};

use crate::types::{
    Heuristics, NodeInfo, NodeState, RingId, TieBreaker,
};

/// Size of the `opt_type` field.
pub const OPT_TYPE_LEN: usize = 2;
/// Size of the `opt_len` field.
pub const OPT_LENGTH_LEN: usize = 2;

/// Numeric option identifiers (0–22).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OptionType {
    /// Request/reply correlation number.
    MsgSeqNumber = 0,
    /// Cluster name string, not NUL-terminated on the wire.
    ClusterName = 1,
    /// TLS capability byte.
    TlsSupported = 2,
    /// Whether the server insists on a client certificate.
    TlsClientCertRequired = 3,
    /// Array of supported message types.
    SupportedMessages = 4,
    /// Array of supported option types.
    SupportedOptions = 5,
    /// Typed error code of a reply.
    ReplyErrorCode = 6,
    /// Largest request the server accepts.
    ServerMaximumRequestSize = 7,
    /// Largest reply the server may send.
    ServerMaximumReplySize = 8,
    /// Node id.
    NodeId = 9,
    /// Array of decision algorithms the server offers.
    SupportedDecisionAlgorithms = 10,
    /// Decision algorithm requested by the client.
    DecisionAlgorithm = 11,
    /// Heartbeat interval in milliseconds.
    HeartbeatInterval = 12,
    /// Membership epoch identifier, 12 bytes.
    RingId = 13,
    /// Configuration file version.
    ConfigVersion = 14,
    /// Data center id inside a node info.
    DataCenterId = 15,
    /// Node state inside a node info.
    NodeState = 16,
    /// Nested TLV describing one node.
    NodeInfo = 17,
    /// Which node list a NodeList message carries.
    NodeListType = 18,
    /// Vote byte.
    Vote = 19,
    /// Quorate byte.
    Quorate = 20,
    /// Tie-breaker, 5 bytes.
    TieBreaker = 21,
    /// Heuristics result byte.
    Heuristics = 22,
}

/// Every option type this implementation understands, in wire order.
pub const SUPPORTED_OPTIONS: [OptionType; 23] = [
    OptionType::MsgSeqNumber,
    OptionType::ClusterName,
    OptionType::TlsSupported,
    OptionType::TlsClientCertRequired,
    OptionType::SupportedMessages,
    OptionType::SupportedOptions,
    OptionType::ReplyErrorCode,
    OptionType::ServerMaximumRequestSize,
    OptionType::ServerMaximumReplySize,
    OptionType::NodeId,
    OptionType::SupportedDecisionAlgorithms,
    OptionType::DecisionAlgorithm,
    OptionType::HeartbeatInterval,
    OptionType::RingId,
    OptionType::ConfigVersion,
    OptionType::DataCenterId,
    OptionType::NodeState,
    OptionType::NodeInfo,
    OptionType::NodeListType,
    OptionType::Vote,
    OptionType::Quorate,
    OptionType::TieBreaker,
    OptionType::Heuristics,
];

impl OptionType {
    /// Parse the two-byte wire value; unknown values are skipped by callers.
    pub fn from_u16(value: u16) -> Option<Self> {
        SUPPORTED_OPTIONS.get(value as usize).copied()
    }
}

/// Failure while encoding a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// The message would exceed the negotiated send limit.
    #[error("message would exceed the {max} byte send limit")]
    TooLarge {
        /// The limit that would be violated.
        max: usize,
    },
    /// An option value does not fit the 16-bit TLV length field.
    #[error("option value of {len} bytes does not fit a TLV length")]
    OversizedOption {
        /// Actual value length.
        len: usize,
    },
    /// `Heuristics::Undefined` is expressed by omission, never encoded.
    #[error("undefined heuristics result is never put on the wire")]
    UndefinedHeuristics,
}

/// Failure while decoding a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// A typed option's length does not match its declared shape.
    #[error("option length does not match its declared shape")]
    InvalidOptionLength,
    /// Memory for a decoded value could not be reserved.
    #[error("out of memory while decoding message")]
    OutOfMemory,
    /// An option's length would run past the end of the message.
    #[error("option length runs past the end of the message")]
    InconsistentLength,
    /// An option carries a value outside its valid range.
    #[error("option carries a value outside its valid range")]
    InvalidOptionValue,
}

/// Appends TLV options to a message under construction, enforcing the
/// maximum message size.
pub struct TlvWriter<'a> {
    buf: &'a mut BytesMut,
    max_size: usize,
}

impl<'a> TlvWriter<'a> {
    /// Wrap `buf`; the writer refuses to let it grow past `max_size`.
    pub fn new(buf: &'a mut BytesMut, max_size: usize) -> Self {
        TlvWriter { buf, max_size }
    }

    fn add(&mut self, opt_type: OptionType, value: &[u8]) -> Result<(), EncodeError> {
        if value.len() > u16::MAX as usize {
            return Err(EncodeError::OversizedOption { len: value.len() });
        }
        if self.buf.len() + OPT_TYPE_LEN + OPT_LENGTH_LEN + value.len() > self.max_size {
            return Err(EncodeError::TooLarge { max: self.max_size });
        }
        self.buf.put_u16(opt_type as u16);
        self.buf.put_u16(value.len() as u16);
        self.buf.put_slice(value);
        Ok(())
    }

    /// Append a one-byte option.
    pub fn add_u8(&mut self, opt_type: OptionType, value: u8) -> Result<(), EncodeError> {
        self.add(opt_type, &[value])
    }

    /// Append a two-byte big-endian option.
    pub fn add_u16(&mut self, opt_type: OptionType, value: u16) -> Result<(), EncodeError> {
        self.add(opt_type, &value.to_be_bytes())
    }

    /// Append a four-byte big-endian option.
    pub fn add_u32(&mut self, opt_type: OptionType, value: u32) -> Result<(), EncodeError> {
        self.add(opt_type, &value.to_be_bytes())
    }

    /// Append an eight-byte big-endian option.
    pub fn add_u64(&mut self, opt_type: OptionType, value: u64) -> Result<(), EncodeError> {
        self.add(opt_type, &value.to_be_bytes())
    }

    /// Append a string option; the length lives in the option header.
    pub fn add_string(&mut self, opt_type: OptionType, value: &str) -> Result<(), EncodeError> {
        self.add(opt_type, value.as_bytes())
    }

    /// Append an array of big-endian u16 values as one option.
    pub fn add_u16_array(
        &mut self,
        opt_type: OptionType,
        values: impl IntoIterator<Item = u16>,
    ) -> Result<(), EncodeError> {
        let mut raw = Vec::new();
        for value in values {
            raw.extend_from_slice(&value.to_be_bytes());
        }
        self.add(opt_type, &raw)
    }

    /// Append a 12-byte ring id option (`u32be ‖ u64be`).
    pub fn add_ring_id(&mut self, ring_id: &RingId) -> Result<(), EncodeError> {
        let mut raw = [0u8; 12];
        raw[..4].copy_from_slice(&ring_id.node_id.to_be_bytes());
        raw[4..].copy_from_slice(&ring_id.seq.to_be_bytes());
        self.add(OptionType::RingId, &raw)
    }

    /// Append a 5-byte tie-breaker option (mode byte, then a u32 that is
    /// zero unless the mode is a fixed node id).
    pub fn add_tie_breaker(&mut self, tie_breaker: TieBreaker) -> Result<(), EncodeError> {
        let mut raw = [0u8; 5];
        raw[0] = tie_breaker.mode();
        raw[1..].copy_from_slice(&tie_breaker.node_id().to_be_bytes());
        self.add(OptionType::TieBreaker, &raw)
    }

    /// Append a heuristics option; `Undefined` is never encoded.
    pub fn add_heuristics(&mut self, heuristics: Heuristics) -> Result<(), EncodeError> {
        if heuristics == Heuristics::Undefined {
            return Err(EncodeError::UndefinedHeuristics);
        }
        self.add_u8(OptionType::Heuristics, heuristics as u8)
    }

    /// Append a node info as a nested TLV sub-payload. The data center id
    /// and node state are carried only when set.
    pub fn add_node_info(&mut self, node_info: &NodeInfo) -> Result<(), EncodeError> {
        let mut nested = BytesMut::new();
        {
            let mut sub = TlvWriter::new(&mut nested, usize::MAX);
            sub.add_u32(OptionType::NodeId, node_info.node_id)?;
            if node_info.data_center_id != 0 {
                sub.add_u32(OptionType::DataCenterId, node_info.data_center_id)?;
            }
            if node_info.node_state != NodeState::NotSet {
                sub.add_u8(OptionType::NodeState, node_info.node_state as u8)?;
            }
        }
        self.add(OptionType::NodeInfo, &nested)
    }
}

/// Iterates the options of an already-framed payload, yielding the raw
/// option type and its value slice.
pub struct TlvIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TlvIter<'a> {
    /// Iterate over `data`, which must start at the first option header.
    pub fn new(data: &'a [u8]) -> Self {
        TlvIter { data, pos: 0 }
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Result<(u16, &'a [u8]), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.data.len() {
            return None;
        }
        if self.data.len() - self.pos < OPT_TYPE_LEN + OPT_LENGTH_LEN {
            self.pos = self.data.len();
            return Some(Err(DecodeError::InconsistentLength));
        }
        let opt_type = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        let opt_len =
            u16::from_be_bytes([self.data[self.pos + 2], self.data[self.pos + 3]]) as usize;
        let value_start = self.pos + OPT_TYPE_LEN + OPT_LENGTH_LEN;
        if value_start + opt_len > self.data.len() {
            self.pos = self.data.len();
            return Some(Err(DecodeError::InconsistentLength));
        }
        self.pos = value_start + opt_len;
        Some(Ok((opt_type, &self.data[value_start..value_start + opt_len])))
    }
}

/// Decode a one-byte option value.
pub fn decode_u8(value: &[u8]) -> Result<u8, DecodeError> {
    match value {
        [byte] => Ok(*byte),
        _ => Err(DecodeError::InvalidOptionLength),
    }
}

/// Decode a two-byte big-endian option value.
pub fn decode_u16(value: &[u8]) -> Result<u16, DecodeError> {
    let raw: [u8; 2] = value
        .try_into()
        .map_err(|_| DecodeError::InvalidOptionLength)?;
    Ok(u16::from_be_bytes(raw))
}

/// Decode a four-byte big-endian option value.
pub fn decode_u32(value: &[u8]) -> Result<u32, DecodeError> {
    let raw: [u8; 4] = value
        .try_into()
        .map_err(|_| DecodeError::InvalidOptionLength)?;
    Ok(u32::from_be_bytes(raw))
}

/// Decode an eight-byte big-endian option value.
pub fn decode_u64(value: &[u8]) -> Result<u64, DecodeError> {
    let raw: [u8; 8] = value
        .try_into()
        .map_err(|_| DecodeError::InvalidOptionLength)?;
    Ok(u64::from_be_bytes(raw))
}

/// Decode a string option value.
pub fn decode_string(value: &[u8]) -> Result<String, DecodeError> {
    let mut out = String::new();
    out.try_reserve_exact(value.len())
        .map_err(|_| DecodeError::OutOfMemory)?;
    let text = std::str::from_utf8(value).map_err(|_| DecodeError::InvalidOptionValue)?;
    out.push_str(text);
    Ok(out)
}

/// Decode an array of big-endian u16 values.
pub fn decode_u16_array(value: &[u8]) -> Result<Vec<u16>, DecodeError> {
    if value.len() % 2 != 0 {
        return Err(DecodeError::InvalidOptionLength);
    }
    let mut out = Vec::new();
    out.try_reserve_exact(value.len() / 2)
        .map_err(|_| DecodeError::OutOfMemory)?;
    for pair in value.chunks_exact(2) {
        out.push(u16::from_be_bytes([pair[0], pair[1]]));
    }
    Ok(out)
}

/// Decode a 12-byte ring id option value.
pub fn decode_ring_id(value: &[u8]) -> Result<RingId, DecodeError> {
    if value.len() != 12 {
        return Err(DecodeError::InvalidOptionLength);
    }
    Ok(RingId {
        node_id: decode_u32(&value[..4])?,
        seq: decode_u64(&value[4..])?,
    })
}

/// Decode a 5-byte tie-breaker option value.
pub fn decode_tie_breaker(value: &[u8]) -> Result<TieBreaker, DecodeError> {
    if value.len() != 5 {
        return Err(DecodeError::InvalidOptionLength);
    }
    let node_id = decode_u32(&value[1..])?;
    TieBreaker::from_wire(value[0], node_id).ok_or(DecodeError::InvalidOptionValue)
}

/// Decode a nested node-info option value. The node id is mandatory and
/// must be nonzero; unknown nested options are ignored.
pub fn decode_node_info(value: &[u8]) -> Result<NodeInfo, DecodeError> {
    let mut node_info = NodeInfo::new(0);
    for item in TlvIter::new(value) {
        let (opt_type, opt_value) = item?;
        match OptionType::from_u16(opt_type) {
            Some(OptionType::NodeId) => node_info.node_id = decode_u32(opt_value)?,
            Some(OptionType::DataCenterId) => {
                node_info.data_center_id = decode_u32(opt_value)?;
            }
            Some(OptionType::NodeState) => {
                node_info.node_state = NodeState::from_u8(decode_u8(opt_value)?)
                    .ok_or(DecodeError::InvalidOptionValue)?;
            }
            _ => {}
        }
    }
    if node_info.node_id == 0 {
        return Err(DecodeError::InvalidOptionValue);
    }
    Ok(node_info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Heuristics;

    fn write_one(f: impl FnOnce(&mut TlvWriter)) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut writer = TlvWriter::new(&mut buf, 1 << 15);
        f(&mut writer);
        buf
    }

    #[test]
    fn ring_id_round_trip() {
        let ring_id = RingId::new(3, 0xdead_beef_1234);
        let buf = write_one(|w| w.add_ring_id(&ring_id).unwrap());
        let (opt_type, value) = TlvIter::new(&buf).next().unwrap().unwrap();
        assert_eq!(opt_type, OptionType::RingId as u16);
        assert_eq!(value.len(), 12);
        assert_eq!(decode_ring_id(value).unwrap(), ring_id);
    }

    #[test]
    fn tie_breaker_round_trip() {
        for tb in [
            TieBreaker::Lowest,
            TieBreaker::Highest,
            TieBreaker::NodeId(99),
        ] {
            let buf = write_one(|w| w.add_tie_breaker(tb).unwrap());
            let (_, value) = TlvIter::new(&buf).next().unwrap().unwrap();
            assert_eq!(value.len(), 5);
            assert_eq!(decode_tie_breaker(value).unwrap(), tb);
        }
    }

    #[test]
    fn node_info_round_trip() {
        let full = NodeInfo {
            node_id: 8,
            data_center_id: 2,
            node_state: NodeState::Member,
        };
        let buf = write_one(|w| w.add_node_info(&full).unwrap());
        let (_, value) = TlvIter::new(&buf).next().unwrap().unwrap();
        assert_eq!(decode_node_info(value).unwrap(), full);

        // Unset fields are omitted from the sub-payload entirely.
        let bare = NodeInfo::new(8);
        let buf = write_one(|w| w.add_node_info(&bare).unwrap());
        let (_, value) = TlvIter::new(&buf).next().unwrap().unwrap();
        assert_eq!(value.len(), OPT_TYPE_LEN + OPT_LENGTH_LEN + 4);
        assert_eq!(decode_node_info(value).unwrap(), bare);
    }

    #[test]
    fn node_info_requires_node_id() {
        let err = decode_node_info(&[]).unwrap_err();
        assert_eq!(err, DecodeError::InvalidOptionValue);
    }

    #[test]
    fn undefined_heuristics_is_refused() {
        let mut buf = BytesMut::new();
        let mut writer = TlvWriter::new(&mut buf, 1 << 15);
        assert_eq!(
            writer.add_heuristics(Heuristics::Undefined),
            Err(EncodeError::UndefinedHeuristics)
        );
        writer.add_heuristics(Heuristics::Pass).unwrap();
    }

    #[test]
    fn writer_enforces_max_size() {
        let mut buf = BytesMut::new();
        let mut writer = TlvWriter::new(&mut buf, 8);
        writer.add_u32(OptionType::NodeId, 1).unwrap();
        assert_eq!(
            writer.add_u32(OptionType::NodeId, 2),
            Err(EncodeError::TooLarge { max: 8 })
        );
    }

    #[test]
    fn truncated_option_is_inconsistent() {
        let buf = write_one(|w| w.add_u32(OptionType::NodeId, 1).unwrap());
        let truncated = &buf[..buf.len() - 1];
        let err = TlvIter::new(truncated).next().unwrap().unwrap_err();
        assert_eq!(err, DecodeError::InconsistentLength);
    }

    #[test]
    fn odd_u16_array_is_invalid_length() {
        assert_eq!(
            decode_u16_array(&[0, 1, 2]),
            Err(DecodeError::InvalidOptionLength)
        );
        assert_eq!(decode_u16_array(&[0, 1, 0, 2]).unwrap(), vec![1, 2]);
    }
}

//! Wire-level value types shared by every message of the arbiter protocol.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Identifier of one membership epoch.
///
/// Produced by the local cluster runtime on every membership change and
/// compared exactly on both fields; a reply carrying a ring id that no
/// longer matches the sender's latest one is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RingId {
    /// Node that originated this ring.
    pub node_id: u32,
    /// Epoch sequence number.
    pub seq: u64,
}

impl RingId {
    /// Create a ring id from its two wire fields.
    pub fn new(node_id: u32, seq: u64) -> Self {
        RingId { node_id, seq }
    }
}

impl fmt::Display for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{:x}", self.node_id, self.seq)
    }
}

/// TLS capability advertised during the preinit exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TlsSupported {
    /// Endpoint cannot speak TLS.
    Unsupported = 0,
    /// Endpoint can speak TLS but does not insist on it.
    Supported = 1,
    /// Endpoint refuses to continue without TLS.
    Required = 2,
}

impl TlsSupported {
    /// Parse the one-byte wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TlsSupported::Unsupported),
            1 => Some(TlsSupported::Supported),
            2 => Some(TlsSupported::Required),
            _ => None,
        }
    }
}

impl fmt::Display for TlsSupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TlsSupported::Unsupported => "Unsupported",
            TlsSupported::Supported => "Supported",
            TlsSupported::Required => "Required",
        };
        write!(f, "{}", name)
    }
}

/// Vote handed to a client, or the sentinels steering its cast-vote timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Vote {
    /// No decision has been produced yet.
    #[default]
    Undefined = 0,
    /// Keep voting; the client asserts one vote to its quorum subsystem.
    Ack = 1,
    /// Lose the vote; the client asserts zero votes.
    Nack = 2,
    /// Client should ask again later (via AskForVote).
    AskLater = 3,
    /// Client stops its cast-vote timer until a later message arrives.
    WaitForReply = 4,
    /// Leave the cast-vote timer exactly as it is.
    NoChange = 5,
}

impl Vote {
    /// Parse the one-byte wire value. `Undefined` is never valid on the wire.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Vote::Ack),
            2 => Some(Vote::Nack),
            3 => Some(Vote::AskLater),
            4 => Some(Vote::WaitForReply),
            5 => Some(Vote::NoChange),
            _ => None,
        }
    }

    /// True for the two votes that are remembered as a granted/denied state.
    pub fn is_ack_or_nack(self) -> bool {
        matches!(self, Vote::Ack | Vote::Nack)
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Vote::Undefined => "Undefined",
            Vote::Ack => "ACK",
            Vote::Nack => "NACK",
            Vote::AskLater => "Ask later",
            Vote::WaitForReply => "Wait for reply",
            Vote::NoChange => "No change",
        };
        write!(f, "{}", name)
    }
}

/// State of a node as reported inside a node-info option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum NodeState {
    /// State was not reported.
    #[default]
    NotSet = 0,
    /// Node is a member of the reported list.
    Member = 1,
    /// Node is known dead.
    Dead = 2,
    /// Node is leaving the membership.
    Leaving = 3,
}

impl NodeState {
    /// Parse the one-byte wire value. `NotSet` is expressed by omission.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(NodeState::Member),
            2 => Some(NodeState::Dead),
            3 => Some(NodeState::Leaving),
            _ => None,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::NotSet => "not set",
            NodeState::Member => "member",
            NodeState::Dead => "dead",
            NodeState::Leaving => "leaving",
        };
        write!(f, "{}", name)
    }
}

/// Which of the four node lists a NodeList message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeListType {
    /// Configured node list sent right after init.
    InitialConfig = 0,
    /// Configured node list after a configuration change.
    ChangedConfig = 1,
    /// Current membership, tied to a ring id.
    Membership = 2,
    /// Quorum view as computed by the local runtime.
    Quorum = 3,
}

impl NodeListType {
    /// Parse the one-byte wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(NodeListType::InitialConfig),
            1 => Some(NodeListType::ChangedConfig),
            2 => Some(NodeListType::Membership),
            3 => Some(NodeListType::Quorum),
            _ => None,
        }
    }

    /// True for the two configuration list flavours.
    pub fn is_config(self) -> bool {
        matches!(self, NodeListType::InitialConfig | NodeListType::ChangedConfig)
    }
}

impl fmt::Display for NodeListType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeListType::InitialConfig => "initial config",
            NodeListType::ChangedConfig => "changed config",
            NodeListType::Membership => "membership",
            NodeListType::Quorum => "quorum",
        };
        write!(f, "{}", name)
    }
}

/// Whether the reporting partition currently holds quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Quorate {
    /// Partition does not hold quorum.
    Inquorate = 0,
    /// Partition holds quorum.
    Quorate = 1,
}

impl Quorate {
    /// Parse the one-byte wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Quorate::Inquorate),
            1 => Some(Quorate::Quorate),
            _ => None,
        }
    }
}

/// Deterministic rule breaking otherwise balanced decisions.
///
/// All clients of one cluster must agree on the tie-breaker; a mismatch is
/// rejected at init time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreaker {
    /// The partition containing the lowest configured node id wins.
    Lowest,
    /// The partition containing the highest configured node id wins.
    Highest,
    /// The partition containing this fixed node id wins.
    NodeId(u32),
}

impl TieBreaker {
    /// The wire mode byte.
    pub fn mode(self) -> u8 {
        match self {
            TieBreaker::Lowest => 1,
            TieBreaker::Highest => 2,
            TieBreaker::NodeId(_) => 3,
        }
    }

    /// The wire node id field; zero unless the mode is `NodeId`.
    pub fn node_id(self) -> u32 {
        match self {
            TieBreaker::NodeId(id) => id,
            _ => 0,
        }
    }

    /// Reassemble from the wire mode byte and node id field.
    pub fn from_wire(mode: u8, node_id: u32) -> Option<Self> {
        match mode {
            1 => Some(TieBreaker::Lowest),
            2 => Some(TieBreaker::Highest),
            3 => Some(TieBreaker::NodeId(node_id)),
            _ => None,
        }
    }
}

impl FromStr for TieBreaker {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lowest" => Ok(TieBreaker::Lowest),
            "highest" => Ok(TieBreaker::Highest),
            other => other
                .parse::<u32>()
                .map(TieBreaker::NodeId)
                .map_err(|_| format!("invalid tie breaker {:?}", other)),
        }
    }
}

impl fmt::Display for TieBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TieBreaker::Lowest => write!(f, "lowest"),
            TieBreaker::Highest => write!(f, "highest"),
            TieBreaker::NodeId(id) => write!(f, "{}", id),
        }
    }
}

/// Result of the external fitness probes run on a client node.
///
/// Ordered for comparison as `Fail < Undefined < Pass`, which differs from
/// the wire encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Heuristics {
    /// Probes are disabled or have not produced a result.
    #[default]
    Undefined = 0,
    /// All probes passed.
    Pass = 1,
    /// At least one probe failed.
    Fail = 2,
}

impl Heuristics {
    /// Parse the one-byte wire value. `Undefined` is expressed by omission.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Heuristics::Pass),
            2 => Some(Heuristics::Fail),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Heuristics::Fail => 0,
            Heuristics::Undefined => 1,
            Heuristics::Pass => 2,
        }
    }
}

impl PartialOrd for Heuristics {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Heuristics {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Heuristics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Heuristics::Undefined => "Undefined",
            Heuristics::Pass => "Pass",
            Heuristics::Fail => "Fail",
        };
        write!(f, "{}", name)
    }
}

/// One entry of a node list, itself carried as a nested TLV payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node id; never zero on the wire.
    pub node_id: u32,
    /// Data center id; zero means not set.
    pub data_center_id: u32,
    /// Reported node state.
    pub node_state: NodeState,
}

impl NodeInfo {
    /// A node info carrying only the id.
    pub fn new(node_id: u32) -> Self {
        NodeInfo {
            node_id,
            data_center_id: 0,
            node_state: NodeState::NotSet,
        }
    }
}

/// Pluggable vote-decision strategy negotiated at init time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DecisionAlgorithm {
    /// Unconditional ACK; testing only.
    Test = 0,
    /// Fifty-fifty split resolver; the common case.
    Ffsplit = 1,
    /// Last-man-standing for exactly two nodes.
    TwoNodeLms = 2,
    /// Generalized last-man-standing.
    Lms = 3,
}

/// Every algorithm the server can run, in wire order.
pub const SUPPORTED_DECISION_ALGORITHMS: [DecisionAlgorithm; 4] = [
    DecisionAlgorithm::Test,
    DecisionAlgorithm::Ffsplit,
    DecisionAlgorithm::TwoNodeLms,
    DecisionAlgorithm::Lms,
];

impl DecisionAlgorithm {
    /// Parse the two-byte wire value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(DecisionAlgorithm::Test),
            1 => Some(DecisionAlgorithm::Ffsplit),
            2 => Some(DecisionAlgorithm::TwoNodeLms),
            3 => Some(DecisionAlgorithm::Lms),
            _ => None,
        }
    }
}

impl FromStr for DecisionAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test" => Ok(DecisionAlgorithm::Test),
            "ffsplit" => Ok(DecisionAlgorithm::Ffsplit),
            "2nodelms" => Ok(DecisionAlgorithm::TwoNodeLms),
            "lms" => Ok(DecisionAlgorithm::Lms),
            other => Err(format!("unknown decision algorithm {:?}", other)),
        }
    }
}

impl fmt::Display for DecisionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecisionAlgorithm::Test => "Test",
            DecisionAlgorithm::Ffsplit => "Fifty-Fifty split",
            DecisionAlgorithm::TwoNodeLms => "2 Node LMS",
            DecisionAlgorithm::Lms => "LMS",
        };
        write!(f, "{}", name)
    }
}

/// Typed error code carried by every error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReplyErrorCode {
    /// Success path of InitReply and friends.
    NoError = 0,
    /// Peer needs a message type this endpoint does not implement.
    UnsupportedNeededMessage = 1,
    /// Peer needs an option type this endpoint does not implement.
    UnsupportedNeededOption = 2,
    /// Server requires TLS but the client offered none.
    TlsRequired = 3,
    /// Message type outside the supported set.
    UnsupportedMessage = 4,
    /// Payload exceeded the receiver's maximum message size.
    MessageTooLong = 5,
    /// Message arrived before the preinit exchange finished.
    PreinitRequired = 6,
    /// A mandatory option was missing.
    DoesntContainRequiredOption = 7,
    /// Message is legal on the wire but not from this peer in this state.
    UnexpectedMessage = 8,
    /// TLV decoding of the payload failed.
    ErrorDecodingMsg = 9,
    /// Allocation or invariant failure inside the receiver.
    InternalError = 10,
    /// Message arrived before init finished.
    InitRequired = 11,
    /// Requested decision algorithm is not available.
    UnsupportedDecisionAlgorithm = 12,
    /// Requested heartbeat interval is outside the permitted window.
    InvalidHeartbeatInterval = 13,
    /// The active algorithm does not implement this message type.
    UnsupportedDecisionAlgorithmMessage = 14,
    /// Tie-breaker differs from the cluster's other members.
    TieBreakerDiffersFromOtherNodes = 15,
    /// Algorithm differs from the cluster's other members.
    AlgorithmDiffersFromOtherNodes = 16,
    /// Another member of the cluster already uses this node id.
    DuplicateNodeId = 17,
    /// Config node list was empty or missing the sender.
    InvalidConfigNodeList = 18,
    /// Membership node list was empty or missing the sender.
    InvalidMembershipNodeList = 19,
}

impl ReplyErrorCode {
    /// Parse the two-byte wire value.
    pub fn from_u16(value: u16) -> Option<Self> {
        use ReplyErrorCode::*;
        match value {
            0 => Some(NoError),
            1 => Some(UnsupportedNeededMessage),
            2 => Some(UnsupportedNeededOption),
            3 => Some(TlsRequired),
            4 => Some(UnsupportedMessage),
            5 => Some(MessageTooLong),
            6 => Some(PreinitRequired),
            7 => Some(DoesntContainRequiredOption),
            8 => Some(UnexpectedMessage),
            9 => Some(ErrorDecodingMsg),
            10 => Some(InternalError),
            11 => Some(InitRequired),
            12 => Some(UnsupportedDecisionAlgorithm),
            13 => Some(InvalidHeartbeatInterval),
            14 => Some(UnsupportedDecisionAlgorithmMessage),
            15 => Some(TieBreakerDiffersFromOtherNodes),
            16 => Some(AlgorithmDiffersFromOtherNodes),
            17 => Some(DuplicateNodeId),
            18 => Some(InvalidConfigNodeList),
            19 => Some(InvalidMembershipNodeList),
            _ => None,
        }
    }
}

impl fmt::Display for ReplyErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristics_total_order() {
        assert!(Heuristics::Fail < Heuristics::Undefined);
        assert!(Heuristics::Undefined < Heuristics::Pass);
        assert!(Heuristics::Fail < Heuristics::Pass);
        for h in [Heuristics::Fail, Heuristics::Undefined, Heuristics::Pass] {
            assert_eq!(h.cmp(&h), Ordering::Equal);
        }
    }

    #[test]
    fn tie_breaker_wire_round_trip() {
        for tb in [
            TieBreaker::Lowest,
            TieBreaker::Highest,
            TieBreaker::NodeId(42),
        ] {
            assert_eq!(TieBreaker::from_wire(tb.mode(), tb.node_id()), Some(tb));
        }
        assert_eq!(TieBreaker::from_wire(0, 0), None);
        assert_eq!(TieBreaker::from_wire(4, 0), None);
    }

    #[test]
    fn tie_breaker_node_id_zeroed_for_fixed_modes() {
        assert_eq!(TieBreaker::Lowest.node_id(), 0);
        assert_eq!(TieBreaker::Highest.node_id(), 0);
        assert_eq!(TieBreaker::NodeId(7).node_id(), 7);
    }

    #[test]
    fn vote_rejects_undefined_on_wire() {
        assert_eq!(Vote::from_u8(0), None);
        assert_eq!(Vote::from_u8(1), Some(Vote::Ack));
        assert_eq!(Vote::from_u8(6), None);
    }

    #[test]
    fn algorithm_names_parse() {
        assert_eq!("ffsplit".parse(), Ok(DecisionAlgorithm::Ffsplit));
        assert_eq!("2nodelms".parse(), Ok(DecisionAlgorithm::TwoNodeLms));
        assert_eq!("lms".parse(), Ok(DecisionAlgorithm::Lms));
        assert_eq!("test".parse(), Ok(DecisionAlgorithm::Test));
        assert!("majority".parse::<DecisionAlgorithm>().is_err());
    }

    #[test]
    fn reply_error_code_covers_wire_range() {
        for value in 0..=19u16 {
            let code = ReplyErrorCode::from_u16(value).unwrap();
            assert_eq!(code as u16, value);
        }
        assert_eq!(ReplyErrorCode::from_u16(20), None);
    }
}

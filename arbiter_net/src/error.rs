//! Why a client connection ended, and what that implies for reconnecting.

use std::fmt;

/// Reason the agent's connection to the server was torn down.
///
/// Most reasons imply a retry after a jittered delay; a few are terminal
/// because the local environment, not the network, went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Connect-plus-handshake budget expired before steady state.
    CantConnectToTheServer,
    /// Neither side's TLS policy is acceptable to the other.
    IncompatibleTls,
    /// Server's advertised sizes do not envelope this client's bounds.
    IncompatibleMsgSize,
    /// A message arrived that is illegal in the current state.
    UnexpectedMsg,
    /// A reply was missing a mandatory option or carried a wrong seq.
    RequiredOptionMissing,
    /// TLV decoding of a reply failed.
    MsgDecodeError,
    /// Server answered with an error reply.
    ServerSentError,
    /// Server reports this node id is already connected; usually the old
    /// connection's drop has not been noticed yet.
    ServerSentDuplicateNodeId,
    /// Server reports a tie-breaker mismatch within the cluster.
    ServerSentTieBreakerDiffers,
    /// Server reports an algorithm mismatch within the cluster.
    ServerSentAlgorithmDiffers,
    /// Server does not offer the configured decision algorithm.
    ServerDoesntSupportRequiredAlgorithm,
    /// Server does not advertise an option this configuration requires.
    ServerDoesntSupportRequiredOption,
    /// Server closed the connection or the transport failed.
    ServerClosedConnection,
    /// Outbound queue overflowed or a frame could not be encoded.
    SendBufferFull,
    /// TLS layer could not be established.
    TlsHandshakeFailed,
    /// The echo-reply deadline passed and the algorithm chose to drop.
    EchoReplyNotReceived,
    /// An algorithm hook reported an unrecoverable error.
    AlgorithmError,
    /// The heuristics worker went away.
    HeuristicsWorkerClosed,
    /// The local cluster runtime closed its side; there is nothing to
    /// arbitrate for any more.
    LocalRuntimeClosed,
}

impl DisconnectReason {
    /// Whether the agent should try connecting again.
    pub fn try_reconnect(self) -> bool {
        !matches!(
            self,
            DisconnectReason::LocalRuntimeClosed | DisconnectReason::HeuristicsWorkerClosed
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::CantConnectToTheServer => "can't connect to the server",
            DisconnectReason::IncompatibleTls => "incompatible TLS configuration",
            DisconnectReason::IncompatibleMsgSize => "incompatible message size limits",
            DisconnectReason::UnexpectedMsg => "unexpected message",
            DisconnectReason::RequiredOptionMissing => "required option missing",
            DisconnectReason::MsgDecodeError => "message decode error",
            DisconnectReason::ServerSentError => "server sent error",
            DisconnectReason::ServerSentDuplicateNodeId => "server sent duplicate node id error",
            DisconnectReason::ServerSentTieBreakerDiffers => {
                "server sent tie-breaker differs error"
            }
            DisconnectReason::ServerSentAlgorithmDiffers => "server sent algorithm differs error",
            DisconnectReason::ServerDoesntSupportRequiredAlgorithm => {
                "server doesn't support required algorithm"
            }
            DisconnectReason::ServerDoesntSupportRequiredOption => {
                "server doesn't support required option"
            }
            DisconnectReason::ServerClosedConnection => "server closed connection",
            DisconnectReason::SendBufferFull => "send buffer full",
            DisconnectReason::TlsHandshakeFailed => "TLS handshake failed",
            DisconnectReason::EchoReplyNotReceived => "echo reply not received",
            DisconnectReason::AlgorithmError => "algorithm returned error",
            DisconnectReason::HeuristicsWorkerClosed => "heuristics worker closed",
            DisconnectReason::LocalRuntimeClosed => "local cluster runtime closed",
        };
        write!(f, "{}", text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_closure_is_terminal() {
        assert!(!DisconnectReason::LocalRuntimeClosed.try_reconnect());
        assert!(!DisconnectReason::HeuristicsWorkerClosed.try_reconnect());
        assert!(DisconnectReason::ServerClosedConnection.try_reconnect());
        assert!(DisconnectReason::ServerSentDuplicateNodeId.try_reconnect());
        assert!(DisconnectReason::IncompatibleTls.try_reconnect());
    }
}

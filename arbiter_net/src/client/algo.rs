//! Client-side algorithm hooks.
//!
//! These are thin: the heavy decisions happen on the server. The client
//! hooks steer reconnect behavior, the reaction to lost echo replies and
//! the handling of replies carrying stale ring ids. Replies whose ring id
//! no longer matches the last one sent collapse to `NoChange` so a stale
//! vote can never reach the cast-vote timer.

use arbiter_proto::{Heuristics, NodeInfo, Quorate, RingId, Vote};
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::DisconnectReason;

use super::LocalView;

/// Callback set mirroring the server events from the client's side.
/// Defaults implement the safe behavior; algorithms override what they
/// must.
pub(crate) trait NetAlgorithm: Send {
    /// One-time setup; may validate configuration prerequisites.
    fn init(&mut self, _config: &AgentConfig) -> Result<(), String> {
        Ok(())
    }

    /// Steady state reached; the cached view is about to be published.
    fn connected(
        &mut self,
        _view: &LocalView,
        _heuristics: &mut Heuristics,
        _vote: &mut Vote,
    ) -> Result<(), ()> {
        Ok(())
    }

    /// The configured node list changed locally.
    fn config_node_list_changed(
        &mut self,
        _nodes: &[NodeInfo],
        _config_version: Option<u64>,
        _send_node_list: &mut bool,
        _vote: &mut Vote,
    ) -> Result<(), ()> {
        Ok(())
    }

    /// The local runtime reported a new membership.
    fn votequorum_node_list_notify(
        &mut self,
        _ring_id: RingId,
        _nodes: &[u32],
        _pause_cast_vote_timer: &mut bool,
        _vote: &mut Vote,
    ) -> Result<(), ()> {
        Ok(())
    }

    /// Heuristics finished for a new membership; the list is about to be
    /// sent to the server.
    fn votequorum_node_list_heuristics_notify(
        &mut self,
        _ring_id: RingId,
        _nodes: &[u32],
        _send_node_list: &mut bool,
        _vote: &mut Vote,
        _heuristics: &mut Heuristics,
    ) -> Result<(), ()> {
        Ok(())
    }

    /// The local runtime reported a new quorum view.
    fn votequorum_quorum_notify(
        &mut self,
        _quorate: Quorate,
        _nodes: &[NodeInfo],
        _send_node_list: &mut bool,
        _vote: &mut Vote,
    ) -> Result<(), ()> {
        Ok(())
    }

    /// The local expected-votes figure changed.
    fn votequorum_expected_votes_notify(
        &mut self,
        _expected_votes: u32,
        _vote: &mut Vote,
    ) -> Result<(), ()> {
        Ok(())
    }

    /// Reply to a configuration node list.
    fn config_node_list_reply_received(
        &mut self,
        _seq: u32,
        _initial: bool,
        _ring_id: &RingId,
        ring_id_is_valid: bool,
        vote: &mut Vote,
    ) -> Result<(), ()> {
        if !ring_id_is_valid {
            *vote = Vote::NoChange;
        }
        Ok(())
    }

    /// Reply to a membership node list.
    fn membership_node_list_reply_received(
        &mut self,
        _seq: u32,
        _ring_id: &RingId,
        ring_id_is_valid: bool,
        vote: &mut Vote,
    ) -> Result<(), ()> {
        if !ring_id_is_valid {
            *vote = Vote::NoChange;
        }
        Ok(())
    }

    /// Reply to a quorum node list.
    fn quorum_node_list_reply_received(
        &mut self,
        _seq: u32,
        _ring_id: &RingId,
        ring_id_is_valid: bool,
        vote: &mut Vote,
    ) -> Result<(), ()> {
        if !ring_id_is_valid {
            *vote = Vote::NoChange;
        }
        Ok(())
    }

    /// Reply to an AskForVote.
    fn ask_for_vote_reply_received(
        &mut self,
        _seq: u32,
        _ring_id: &RingId,
        ring_id_is_valid: bool,
        vote: &mut Vote,
    ) -> Result<(), ()> {
        if !ring_id_is_valid {
            *vote = Vote::NoChange;
        }
        Ok(())
    }

    /// Unsolicited VoteInfo from the server.
    fn vote_info_received(
        &mut self,
        _seq: u32,
        _ring_id: &RingId,
        ring_id_is_valid: bool,
        vote: &mut Vote,
    ) -> Result<(), ()> {
        if !ring_id_is_valid {
            *vote = Vote::NoChange;
        }
        Ok(())
    }

    /// An echo reply arrived; an unexpected seq means replies were lost.
    fn echo_reply_received(&mut self, _seq: u32, is_expected: bool) -> Result<(), ()> {
        if is_expected {
            Ok(())
        } else {
            Err(())
        }
    }

    /// The echo deadline passed with no reply. `Err` drops the link.
    fn echo_reply_not_received(&mut self) -> Result<(), ()> {
        Err(())
    }

    /// A regular heuristics run finished.
    fn heuristics_change(
        &mut self,
        _heuristics: &mut Heuristics,
        _send_msg: &mut bool,
        _vote: &mut Vote,
    ) -> Result<(), ()> {
        Ok(())
    }

    /// Reply to a HeuristicsChange.
    fn heuristics_change_reply_received(
        &mut self,
        _seq: u32,
        _ring_id: &RingId,
        ring_id_is_valid: bool,
        _heuristics: Heuristics,
        vote: &mut Vote,
    ) -> Result<(), ()> {
        if !ring_id_is_valid {
            *vote = Vote::NoChange;
        }
        Ok(())
    }

    /// The connection ended. A stale ACK must never be honored on a
    /// dropped link, so the default flips the cast vote to NACK.
    fn disconnected(
        &mut self,
        _reason: DisconnectReason,
        _try_reconnect: &mut bool,
        vote: &mut Vote,
    ) -> Result<(), ()> {
        *vote = Vote::Nack;
        Ok(())
    }
}

/// Build the client hooks for the configured algorithm.
pub(crate) fn net_algorithm(config: &AgentConfig) -> Box<dyn NetAlgorithm> {
    match config.algorithm {
        arbiter_proto::DecisionAlgorithm::Test => Box::new(TestNetAlgorithm),
        arbiter_proto::DecisionAlgorithm::Ffsplit => Box::new(FfsplitNetAlgorithm),
        arbiter_proto::DecisionAlgorithm::TwoNodeLms => Box::new(TwoNodeLmsNetAlgorithm),
        arbiter_proto::DecisionAlgorithm::Lms => Box::new(LmsNetAlgorithm::default()),
    }
}

/// Hooks for the test algorithm: everything on defaults except that a
/// disconnect leaves the cast-vote timer alone.
struct TestNetAlgorithm;

impl NetAlgorithm for TestNetAlgorithm {
    fn disconnected(
        &mut self,
        _reason: DisconnectReason,
        _try_reconnect: &mut bool,
        _vote: &mut Vote,
    ) -> Result<(), ()> {
        Ok(())
    }
}

/// Hooks for ffsplit.
struct FfsplitNetAlgorithm;

impl NetAlgorithm for FfsplitNetAlgorithm {
    fn disconnected(
        &mut self,
        _reason: DisconnectReason,
        _try_reconnect: &mut bool,
        vote: &mut Vote,
    ) -> Result<(), ()> {
        // Keeping an old ACK could create two quorate halves: a 2:2 split
        // where the ACKed half drops off would let the other half get
        // ACKed as well.
        *vote = Vote::Nack;
        Ok(())
    }
}

/// Hooks for 2nodelms: a dropped server link changes nothing locally,
/// the peer node keeps arbitrating through the cluster itself.
struct TwoNodeLmsNetAlgorithm;

impl NetAlgorithm for TwoNodeLmsNetAlgorithm {
    fn disconnected(
        &mut self,
        _reason: DisconnectReason,
        _try_reconnect: &mut bool,
        _vote: &mut Vote,
    ) -> Result<(), ()> {
        Ok(())
    }
}

/// Hooks for lms: tracks the local quorate flag and `wait_for_all`; with
/// both set, losing the server does not take the vote away.
#[derive(Default)]
struct LmsNetAlgorithm {
    quorate: bool,
    have_wfa: bool,
}

impl NetAlgorithm for LmsNetAlgorithm {
    fn init(&mut self, config: &AgentConfig) -> Result<(), String> {
        self.have_wfa = config.wait_for_all;
        debug!(wait_for_all = self.have_wfa, "lms hooks initialised");
        Ok(())
    }

    fn votequorum_quorum_notify(
        &mut self,
        quorate: Quorate,
        _nodes: &[NodeInfo],
        _send_node_list: &mut bool,
        _vote: &mut Vote,
    ) -> Result<(), ()> {
        self.quorate = quorate == Quorate::Quorate;
        debug!(quorate = self.quorate, "lms: quorum notify");
        Ok(())
    }

    fn echo_reply_not_received(&mut self) -> Result<(), ()> {
        // With wait_for_all the vote persists without the arbiter until
        // the local runtime says otherwise.
        if self.quorate && self.have_wfa {
            Ok(())
        } else {
            Err(())
        }
    }

    fn disconnected(
        &mut self,
        _reason: DisconnectReason,
        _try_reconnect: &mut bool,
        vote: &mut Vote,
    ) -> Result<(), ()> {
        if !(self.quorate && self.have_wfa) {
            *vote = Vote::Nack;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ring_check_collapses_stale_votes() {
        struct Plain;
        impl NetAlgorithm for Plain {}

        let mut algo = Plain;
        let mut vote = Vote::Ack;
        algo.membership_node_list_reply_received(1, &RingId::new(1, 2), false, &mut vote)
            .unwrap();
        assert_eq!(vote, Vote::NoChange);

        let mut vote = Vote::Ack;
        algo.membership_node_list_reply_received(1, &RingId::new(1, 2), true, &mut vote)
            .unwrap();
        assert_eq!(vote, Vote::Ack);
    }

    #[test]
    fn lms_keeps_vote_with_wfa_and_quorum() {
        let mut algo = LmsNetAlgorithm {
            quorate: true,
            have_wfa: true,
        };
        assert!(algo.echo_reply_not_received().is_ok());

        let mut vote = Vote::NoChange;
        let mut try_reconnect = true;
        algo.disconnected(
            DisconnectReason::ServerClosedConnection,
            &mut try_reconnect,
            &mut vote,
        )
        .unwrap();
        assert_eq!(vote, Vote::NoChange);

        algo.quorate = false;
        assert!(algo.echo_reply_not_received().is_err());
        let mut vote = Vote::NoChange;
        algo.disconnected(
            DisconnectReason::ServerClosedConnection,
            &mut try_reconnect,
            &mut vote,
        )
        .unwrap();
        assert_eq!(vote, Vote::Nack);
    }

    #[test]
    fn ffsplit_drops_vote_on_disconnect() {
        let mut algo = FfsplitNetAlgorithm;
        let mut vote = Vote::NoChange;
        let mut try_reconnect = true;
        algo.disconnected(
            DisconnectReason::ServerClosedConnection,
            &mut try_reconnect,
            &mut vote,
        )
        .unwrap();
        assert_eq!(vote, Vote::Nack);
        assert!(try_reconnect);
    }
}

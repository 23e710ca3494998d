//! The cast-vote timer: periodic self-assertion of the granted vote.
//!
//! Once the server grants (or denies) the vote, the agent keeps telling
//! the local cluster runtime about it on every tick, so a silent agent is
//! indistinguishable from a dead one. The timer survives reconnects; a
//! `paused` bit suspends ticking while heuristics run against a new
//! membership.

use std::time::Duration;

use arbiter_proto::Vote;
use tokio::sync::mpsc;
use tracing::debug;

use crate::timer::{TimerKey, TimerWheel};

use super::TimerEvent;

/// The timer's state; the wheel delivering its ticks lives in the agent's
/// poll loop.
#[derive(Debug)]
pub(crate) struct CastVoteTimer {
    vote: Vote,
    paused: bool,
    timer: Option<TimerKey>,
    interval: Duration,
}

impl CastVoteTimer {
    /// A stopped timer ticking every `interval_ms` once started.
    pub(crate) fn new(interval_ms: u32) -> Self {
        CastVoteTimer {
            vote: Vote::Undefined,
            paused: false,
            timer: None,
            interval: Duration::from_millis(interval_ms as u64),
        }
    }

    /// The vote currently asserted on each tick.
    pub(crate) fn vote(&self) -> Vote {
        self.vote
    }

    /// Apply a vote from a server reply. `Ack`/`Nack` (re)start the timer
    /// and assert immediately; `WaitForReply`/`AskLater` stop it;
    /// `NoChange` leaves everything alone. Fails when the vote sink is
    /// gone.
    pub(crate) fn update(
        &mut self,
        wheel: &mut TimerWheel<TimerEvent>,
        votes: &mpsc::UnboundedSender<bool>,
        vote: Vote,
    ) -> Result<(), ()> {
        let run = match vote {
            Vote::NoChange => return Ok(()),
            Vote::Ack | Vote::Nack => true,
            Vote::WaitForReply | Vote::AskLater => false,
            Vote::Undefined => unreachable!("undefined vote reached the cast-vote timer"),
        };

        self.vote = vote;

        if run {
            if self.timer.is_none() {
                self.timer = Some(wheel.schedule(TimerEvent::CastVoteTick, self.interval));
                debug!(interval = ?self.interval, vote = %self.vote, "cast vote timer is now scheduled");
            }
            // Assert the new value right away instead of waiting a tick.
            self.cast(votes)?;
        } else if let Some(timer) = self.timer.take() {
            wheel.cancel(timer);
            debug!("cast vote timer is now stopped");
        }

        Ok(())
    }

    /// Suspend or resume ticking without touching the vote.
    pub(crate) fn set_paused(&mut self, paused: bool) {
        if self.paused != paused {
            self.paused = paused;
            debug!(paused, "cast vote timer pause state changed");
        }
    }

    /// A tick fired: assert the vote (unless paused) and re-arm.
    pub(crate) fn tick(
        &mut self,
        wheel: &mut TimerWheel<TimerEvent>,
        votes: &mpsc::UnboundedSender<bool>,
    ) -> Result<(), ()> {
        self.timer = Some(wheel.schedule(TimerEvent::CastVoteTick, self.interval));
        if self.paused {
            return Ok(());
        }
        self.cast(votes)
    }

    fn cast(&self, votes: &mpsc::UnboundedSender<bool>) -> Result<(), ()> {
        let cast_vote = match self.vote {
            Vote::Ack => true,
            Vote::Nack => false,
            // Only Ack/Nack keep the timer running.
            _ => return Ok(()),
        };
        votes.send(cast_vote).map_err(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (
        TimerWheel<TimerEvent>,
        mpsc::UnboundedSender<bool>,
        mpsc::UnboundedReceiver<bool>,
        CastVoteTimer,
    ) {
        let wheel = TimerWheel::new();
        let (tx, rx) = mpsc::unbounded_channel();
        (wheel, tx, rx, CastVoteTimer::new(5_000))
    }

    #[tokio::test]
    async fn ack_starts_timer_and_casts_immediately() {
        let (mut wheel, tx, mut rx, mut timer) = setup();
        timer.update(&mut wheel, &tx, Vote::Ack).unwrap();
        assert_eq!(rx.recv().await, Some(true));
        assert_eq!(wheel.len(), 1);

        timer.update(&mut wheel, &tx, Vote::Nack).unwrap();
        assert_eq!(rx.recv().await, Some(false));
        // Still a single pending tick.
        assert_eq!(wheel.len(), 1);
    }

    #[tokio::test]
    async fn wait_for_reply_stops_timer() {
        let (mut wheel, tx, mut rx, mut timer) = setup();
        timer.update(&mut wheel, &tx, Vote::Ack).unwrap();
        assert_eq!(rx.recv().await, Some(true));

        timer.update(&mut wheel, &tx, Vote::WaitForReply).unwrap();
        assert!(wheel.is_empty());

        // NoChange leaves the stopped timer stopped.
        timer.update(&mut wheel, &tx, Vote::NoChange).unwrap();
        assert!(wheel.is_empty());
    }

    #[tokio::test]
    async fn paused_tick_reschedules_without_casting() {
        let (mut wheel, tx, mut rx, mut timer) = setup();
        timer.update(&mut wheel, &tx, Vote::Ack).unwrap();
        assert_eq!(rx.recv().await, Some(true));

        timer.set_paused(true);
        timer.tick(&mut wheel, &tx).unwrap();
        assert!(rx.try_recv().is_err());
        assert!(!wheel.is_empty());

        timer.set_paused(false);
        timer.tick(&mut wheel, &tx).unwrap();
        assert_eq!(rx.recv().await, Some(true));
    }
}

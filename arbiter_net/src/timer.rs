//! Monotonic one-shot timers shared by every component.
//!
//! A thin wrapper over [`DelayQueue`] whose `expired()` future never
//! resolves while the wheel is empty, so it can sit in a `select!` arm
//! next to socket and channel events. Periodic behavior is expressed by
//! rescheduling from the expiry handler.

use std::time::Duration;

use tokio_util::time::delay_queue::Key;
use tokio_util::time::DelayQueue;

/// Handle to one scheduled timer, used to cancel it.
pub type TimerKey = Key;

/// A set of pending one-shot timers delivering values of type `E`.
#[derive(Debug)]
pub struct TimerWheel<E> {
    queue: DelayQueue<E>,
}

impl<E> TimerWheel<E> {
    /// An empty wheel.
    pub fn new() -> Self {
        TimerWheel {
            queue: DelayQueue::new(),
        }
    }

    /// Deliver `event` after `after` elapses.
    pub fn schedule(&mut self, event: E, after: Duration) -> TimerKey {
        self.queue.insert(event, after)
    }

    /// Cancel a pending timer, returning its event when it had not fired.
    pub fn cancel(&mut self, key: TimerKey) -> Option<E> {
        self.queue.try_remove(&key).map(|expired| expired.into_inner())
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The next expired event. Pends forever while the wheel is empty, so
    /// it is safe to keep in a `select!` whose other arms refill the wheel.
    pub async fn expired(&mut self) -> E {
        match futures::future::poll_fn(|cx| self.queue.poll_expired(cx)).await {
            Some(expired) => expired.into_inner(),
            None => std::future::pending().await,
        }
    }
}

impl<E> Default for TimerWheel<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        wheel.schedule("slow", Duration::from_millis(50));
        wheel.schedule("fast", Duration::from_millis(10));

        assert_eq!(wheel.expired().await, "fast");
        assert_eq!(wheel.expired().await, "slow");
        assert!(wheel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_returns_the_event() {
        let mut wheel = TimerWheel::new();
        let key = wheel.schedule(7u32, Duration::from_secs(60));
        assert_eq!(wheel.cancel(key), Some(7));
        assert!(wheel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_wheel_pends() {
        let mut wheel = TimerWheel::<u32>::new();
        let expired = tokio::time::timeout(Duration::from_secs(1), wheel.expired()).await;
        assert!(expired.is_err());
    }
}

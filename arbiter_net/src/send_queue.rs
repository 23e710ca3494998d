//! Per-connection outbound FIFO.
//!
//! Frames are encoded up front and queued whole; the framed transport
//! owns the partial-write cursor. The queue is bounded: a writer that
//! cannot keep a peer drained within `max_entries` frames loses the
//! connection rather than the process losing memory.

use std::collections::VecDeque;

use bytes::Bytes;

/// Action to run once an entry has been fully written to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfterSend {
    /// Nothing.
    #[default]
    None,
    /// Install the TLS layer over the socket; used for the StartTls frame,
    /// which must be flushed in the clear before the handshake begins.
    StartTlsUpgrade,
}

/// One queued frame.
#[derive(Debug, Clone)]
pub struct SendEntry {
    /// The encoded frame, header included.
    pub frame: Bytes,
    /// What to do after the frame has been written out.
    pub after_send: AfterSend,
}

/// The queue hit its entry cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("send queue is full ({max} buffers)")]
pub struct SendQueueFull {
    /// The cap that was hit.
    pub max: usize,
}

/// Bounded FIFO of outbound frames.
#[derive(Debug)]
pub struct SendQueue {
    entries: VecDeque<SendEntry>,
    max_entries: usize,
}

impl SendQueue {
    /// An empty queue capped at `max_entries` frames.
    pub fn new(max_entries: usize) -> Self {
        SendQueue {
            entries: VecDeque::new(),
            max_entries,
        }
    }

    /// Queue a frame with no completion action.
    pub fn push(&mut self, frame: Bytes) -> Result<(), SendQueueFull> {
        self.push_with(frame, AfterSend::None)
    }

    /// Queue a frame with a completion action.
    pub fn push_with(&mut self, frame: Bytes, after_send: AfterSend) -> Result<(), SendQueueFull> {
        if self.entries.len() >= self.max_entries {
            return Err(SendQueueFull {
                max: self.max_entries,
            });
        }
        self.entries.push_back(SendEntry { frame, after_send });
        Ok(())
    }

    /// Take the oldest queued frame.
    pub fn pop(&mut self) -> Option<SendEntry> {
        self.entries.pop_front()
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything, e.g. when the connection is being abandoned.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_cap() {
        let mut queue = SendQueue::new(2);
        queue.push(Bytes::from_static(b"a")).unwrap();
        queue
            .push_with(Bytes::from_static(b"b"), AfterSend::StartTlsUpgrade)
            .unwrap();
        assert_eq!(
            queue.push(Bytes::from_static(b"c")),
            Err(SendQueueFull { max: 2 })
        );

        let first = queue.pop().unwrap();
        assert_eq!(&first.frame[..], b"a");
        assert_eq!(first.after_send, AfterSend::None);

        let second = queue.pop().unwrap();
        assert_eq!(&second.frame[..], b"b");
        assert_eq!(second.after_send, AfterSend::StartTlsUpgrade);

        assert!(queue.pop().is_none());
        // Room again after draining.
        queue.push(Bytes::from_static(b"c")).unwrap();
    }
}

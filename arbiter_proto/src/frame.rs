//! Length-prefixed frame codec with skip-oversized semantics.
//!
//! The decoder assembles one message at a time from the 6-byte header.
//! A frame whose declared size exceeds the receive cap, or whose type is
//! unknown, is drained without buffering and surfaced as a
//! [`InboundFrame::Skipped`] item so the endpoint can answer with a typed
//! error instead of dropping the connection.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{MsgType, HEADER_LEN};

/// Default cap on a single message, header included.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 15;

/// One decoder item: either a complete frame or a note that a frame was
/// skipped in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A complete frame, header included.
    Frame(Bytes),
    /// A frame that was drained without buffering.
    Skipped(SkipReason),
}

/// Why an inbound frame was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The header named a message type outside the supported set.
    UnknownType(u16),
    /// The declared size exceeded the receive cap.
    TooLong {
        /// Declared total size, header included.
        declared: usize,
        /// The receive cap in force.
        max: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodecState {
    Header,
    Payload { frame_len: usize },
    Skipping { remaining: usize, reason: SkipReason },
}

/// Codec turning a byte stream into [`InboundFrame`]s and pre-encoded
/// frames back into bytes.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    state: CodecState,
}

impl FrameCodec {
    /// Create a codec with the given receive cap (header included).
    pub fn new(max_frame_size: usize) -> Self {
        FrameCodec {
            max_frame_size,
            state: CodecState::Header,
        }
    }

    /// Adjust the receive cap after size negotiation.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    /// The receive cap currently in force.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = InboundFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                CodecState::Header => {
                    if src.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let msg_type = u16::from_be_bytes([src[0], src[1]]);
                    let payload_len =
                        u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
                    let frame_len = HEADER_LEN + payload_len;

                    if MsgType::from_u16(msg_type).is_none() {
                        src.advance(HEADER_LEN);
                        self.state = CodecState::Skipping {
                            remaining: payload_len,
                            reason: SkipReason::UnknownType(msg_type),
                        };
                    } else if frame_len > self.max_frame_size {
                        src.advance(HEADER_LEN);
                        self.state = CodecState::Skipping {
                            remaining: payload_len,
                            reason: SkipReason::TooLong {
                                declared: frame_len,
                                max: self.max_frame_size,
                            },
                        };
                    } else {
                        self.state = CodecState::Payload { frame_len };
                    }
                }
                CodecState::Payload { frame_len } => {
                    if src.len() < frame_len {
                        src.reserve(frame_len - src.len());
                        return Ok(None);
                    }
                    self.state = CodecState::Header;
                    return Ok(Some(InboundFrame::Frame(src.split_to(frame_len).freeze())));
                }
                CodecState::Skipping { remaining, reason } => {
                    let drained = remaining.min(src.len());
                    src.advance(drained);
                    if drained == remaining {
                        self.state = CodecState::Header;
                        return Ok(Some(InboundFrame::Skipped(reason)));
                    }
                    self.state = CodecState::Skipping {
                        remaining: remaining - drained,
                        reason,
                    };
                    return Ok(None);
                }
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{decode_message, Message};

    fn encode(msg: &Message) -> Bytes {
        msg.encode(DEFAULT_MAX_FRAME_SIZE).unwrap()
    }

    #[test]
    fn decodes_frames_across_partial_reads() {
        let frame = encode(&Message::EchoRequest { seq_number: Some(4) });
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();

        // Feed one byte at a time; nothing is produced until complete.
        for &byte in &frame[..frame.len() - 1] {
            buf.extend_from_slice(&[byte]);
            assert_eq!(codec.decode(&mut buf).unwrap(), None);
        }
        buf.extend_from_slice(&frame[frame.len() - 1..]);
        let item = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(item, InboundFrame::Frame(frame));
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let first = encode(&Message::EchoRequest { seq_number: Some(1) });
        let second = encode(&Message::EchoRequest { seq_number: Some(2) });
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(InboundFrame::Frame(first))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(InboundFrame::Frame(second))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_frame_is_skipped_not_fatal() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();

        // Declared payload of 64 bytes against a 16-byte cap.
        buf.extend_from_slice(&(MsgType::NodeList as u16).to_be_bytes());
        buf.extend_from_slice(&64u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 40]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[0u8; 24]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(InboundFrame::Skipped(SkipReason::TooLong {
                declared: HEADER_LEN + 64,
                max: 16,
            }))
        );

        // The codec resynchronizes on the next frame.
        let next = Message::EchoRequest { seq_number: Some(3) }.encode(16).unwrap();
        buf.extend_from_slice(&next);
        let item = codec.decode(&mut buf).unwrap().unwrap();
        let InboundFrame::Frame(frame) = item else {
            panic!("expected frame, got {:?}", item);
        };
        assert_eq!(decode_message(&frame).unwrap().seq_number, Some(3));
    }

    #[test]
    fn unknown_type_is_skipped() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&4242u16.to_be_bytes());
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(InboundFrame::Skipped(SkipReason::UnknownType(4242)))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload_skip_resolves_immediately() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&999u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(InboundFrame::Skipped(SkipReason::UnknownType(999)))
        );
    }
}

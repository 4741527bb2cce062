//! Frame encoder and byte-at-a-time decoder.
//!
//! # Decoder state machine
//!
//! ```text
//!          START            2 bytes          1 byte         LEN bytes
//! ┌──────┐ ────> ┌───────────────┐ ────> ┌────────────┐ ────> ┌────────────────┐
//! │ Idle │       │ ReadingLength │       │ ReadingTag │       │ ReadingPayload │
//! └──────┘       └───────────────┘       └────────────┘       └────────────────┘
//!    ^                   │ LEN > max            │ LEN == 0             │
//!    │                   ↓                      ↓                      ↓
//!    │   discard     ┌──────┐              ┌─────────────────┐ <───────┘
//!    └───────────────│ Idle │              │ ReadingChecksum │
//!    └───────────────┴──────┘ <─ 4 bytes ──└─────────────────┘
//! ```
//!
//! An unescaped START in any state abandons the frame in progress and begins
//! a new one. Escape sequences are undone before a byte reaches the state
//! machine, so the length, tag, payload and checksum states only ever see
//! logical bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    errors::{FrameError, Result},
    frame::{CHECKSUM_SIZE, ESCAPE, ESCAPE_XOR, Frame, LEN_SIZE, MAX_FRAME_LEN, START, Tag},
};

/// Decoder position within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Waiting for a start marker
    Idle,
    /// Collecting the two length bytes
    ReadingLength,
    /// Waiting for the tag byte
    ReadingTag,
    /// Collecting payload bytes
    ReadingPayload,
    /// Collecting the four checksum bytes
    ReadingChecksum,
}

/// Link quality counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecStats {
    /// Frames that passed length and checksum validation
    pub frames_decoded: u64,
    /// Frames abandoned because of a bad length, bad checksum or restart
    pub frames_dropped: u64,
}

/// Bidirectional frame codec.
///
/// Encoding is stateless. Decoding keeps exactly one partially received frame
/// and never buffers more than `max_payload` payload bytes.
#[derive(Debug)]
pub struct FrameCodec {
    max_payload: usize,
    state: DecodeState,
    escaped: bool,
    header: [u8; LEN_SIZE],
    header_read: usize,
    length: usize,
    tag: Tag,
    payload: BytesMut,
    checksum: [u8; CHECKSUM_SIZE],
    checksum_read: usize,
    stats: CodecStats,
}

impl FrameCodec {
    /// Codec accepting payloads up to [`MAX_FRAME_LEN`].
    pub fn new() -> Self {
        Self::with_max_payload(MAX_FRAME_LEN)
    }

    /// Codec with a smaller payload limit, e.g. to match a device's receive
    /// buffer. Limits above [`MAX_FRAME_LEN`] are clamped.
    pub fn with_max_payload(max_payload: usize) -> Self {
        let max_payload = max_payload.min(MAX_FRAME_LEN);
        Self {
            max_payload,
            state: DecodeState::Idle,
            escaped: false,
            header: [0; LEN_SIZE],
            header_read: 0,
            length: 0,
            tag: 0,
            payload: BytesMut::with_capacity(max_payload),
            checksum: [0; CHECKSUM_SIZE],
            checksum_read: 0,
            stats: CodecStats::default(),
        }
    }

    /// Largest payload this codec encodes or accepts.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Current decoder state.
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Decoder counters.
    pub fn stats(&self) -> CodecStats {
        self.stats
    }

    /// Encode a frame into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] if the payload exceeds
    /// [`Self::max_payload`].
    pub fn encode(&self, tag: Tag, payload: &[u8]) -> Result<Bytes> {
        let len = match u16::try_from(payload.len()) {
            Ok(len) if payload.len() <= self.max_payload => len,
            _ => {
                return Err(FrameError::PayloadTooLarge {
                    len: payload.len(),
                    max: self.max_payload,
                });
            },
        };

        let len_bytes = len.to_le_bytes();
        let crc = checksum(len_bytes, tag, payload).to_le_bytes();

        // Worst case every body byte is escaped
        let body_len = LEN_SIZE + 1 + payload.len() + CHECKSUM_SIZE;
        let mut out = BytesMut::with_capacity(1 + body_len * 2);
        out.put_u8(START);
        stuff(&mut out, &len_bytes);
        stuff(&mut out, &[tag]);
        stuff(&mut out, payload);
        stuff(&mut out, &crc);

        Ok(out.freeze())
    }

    /// Feed one received byte into the decoder.
    ///
    /// Returns a frame when `byte` completes a valid one. Corrupt or oversized
    /// frames are dropped silently and the decoder returns to
    /// [`DecodeState::Idle`].
    pub fn feed(&mut self, byte: u8) -> Option<Frame> {
        if byte == START {
            if self.state != DecodeState::Idle {
                self.drop_frame("restarted by start marker");
            }
            self.begin_frame();
            return None;
        }

        // Noise between frames
        if self.state == DecodeState::Idle {
            return None;
        }

        let byte = if self.escaped {
            self.escaped = false;
            byte ^ ESCAPE_XOR
        } else if byte == ESCAPE {
            self.escaped = true;
            return None;
        } else {
            byte
        };

        self.consume(byte)
    }

    /// Feed a slice of received bytes, collecting every completed frame.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        data.iter().filter_map(|&byte| self.feed(byte)).collect()
    }

    /// Abandon any partially received frame.
    pub fn reset(&mut self) {
        self.state = DecodeState::Idle;
        self.escaped = false;
        self.payload.clear();
    }

    fn begin_frame(&mut self) {
        self.state = DecodeState::ReadingLength;
        self.escaped = false;
        self.header_read = 0;
        self.checksum_read = 0;
        self.length = 0;
        self.payload.clear();
    }

    fn drop_frame(&mut self, reason: &'static str) {
        tracing::trace!(reason, state = ?self.state, "dropping frame");
        self.stats.frames_dropped += 1;
        self.reset();
    }

    fn consume(&mut self, byte: u8) -> Option<Frame> {
        match self.state {
            DecodeState::Idle => None,
            DecodeState::ReadingLength => {
                self.header[self.header_read] = byte;
                self.header_read += 1;
                if self.header_read == LEN_SIZE {
                    let length = u16::from_le_bytes(self.header) as usize;
                    if length > self.max_payload {
                        self.drop_frame("length exceeds maximum");
                        return None;
                    }
                    self.length = length;
                    self.state = DecodeState::ReadingTag;
                }
                None
            },
            DecodeState::ReadingTag => {
                self.tag = byte;
                self.state = if self.length == 0 {
                    DecodeState::ReadingChecksum
                } else {
                    DecodeState::ReadingPayload
                };
                None
            },
            DecodeState::ReadingPayload => {
                self.payload.put_u8(byte);
                if self.payload.len() == self.length {
                    self.state = DecodeState::ReadingChecksum;
                }
                None
            },
            DecodeState::ReadingChecksum => {
                self.checksum[self.checksum_read] = byte;
                self.checksum_read += 1;
                if self.checksum_read < CHECKSUM_SIZE {
                    return None;
                }

                let expected = u32::from_le_bytes(self.checksum);
                let actual = checksum(self.header, self.tag, &self.payload);
                if expected != actual {
                    self.drop_frame("checksum mismatch");
                    return None;
                }

                self.state = DecodeState::Idle;
                self.stats.frames_decoded += 1;
                Some(Frame::new(self.tag, self.payload.split().freeze()))
            },
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn checksum(len: [u8; LEN_SIZE], tag: Tag, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len);
    hasher.update(&[tag]);
    hasher.update(payload);
    hasher.finalize()
}

fn stuff(out: &mut BytesMut, data: &[u8]) {
    for &byte in data {
        if byte == START || byte == ESCAPE {
            out.put_u8(ESCAPE);
            out.put_u8(byte ^ ESCAPE_XOR);
        } else {
            out.put_u8(byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use proptest::prelude::*;

    use super::*;

    fn feed_all(codec: &mut FrameCodec, wire: &[u8]) -> Vec<Frame> {
        wire.iter().filter_map(|&b| codec.feed(b)).collect()
    }

    #[test]
    fn encodes_known_handshake_frame() {
        let codec = FrameCodec::new();
        let wire = codec.encode(3, &[0xBE, 0xEF]).unwrap();
        assert_eq!(&wire[..], &hex!("7e 02 00 03 be ef fb 66 57 f4"));
    }

    #[test]
    fn escapes_markers_in_body() {
        let codec = FrameCodec::new();
        let wire = codec.encode(1, &[START, ESCAPE, 0x01]).unwrap();
        assert_eq!(&wire[..], &hex!("7e 03 00 01 7d 5e 7d 5d 01 1f c6 13 3c"));
        assert_eq!(wire.iter().filter(|&&b| b == START).count(), 1);
    }

    #[test]
    fn empty_payload_round_trips() {
        let mut codec = FrameCodec::new();
        let wire = codec.encode(9, &[]).unwrap();
        assert_eq!(&wire[..], &hex!("7e 00 00 09 b6 61 9d 86"));

        let frames = feed_all(&mut codec, &wire);
        assert_eq!(frames, vec![Frame::new(9, Bytes::new())]);
    }

    #[test]
    fn rejects_oversized_payload() {
        let codec = FrameCodec::with_max_payload(300);
        let result = codec.encode(1, &[0u8; 301]);
        assert_eq!(result, Err(FrameError::PayloadTooLarge { len: 301, max: 300 }));
        assert!(codec.encode(1, &[0u8; 300]).is_ok());
    }

    #[test]
    fn clamps_limit_to_hard_ceiling() {
        let codec = FrameCodec::with_max_payload(MAX_FRAME_LEN * 4);
        assert_eq!(codec.max_payload(), MAX_FRAME_LEN);
    }

    #[test]
    fn walks_through_every_state() {
        let mut codec = FrameCodec::new();
        let wire = codec.encode(7, b"ab").unwrap();

        assert_eq!(codec.state(), DecodeState::Idle);
        codec.feed(wire[0]);
        assert_eq!(codec.state(), DecodeState::ReadingLength);
        codec.feed(wire[1]);
        codec.feed(wire[2]);
        assert_eq!(codec.state(), DecodeState::ReadingTag);
        codec.feed(wire[3]);
        assert_eq!(codec.state(), DecodeState::ReadingPayload);
        codec.feed(wire[4]);
        codec.feed(wire[5]);
        assert_eq!(codec.state(), DecodeState::ReadingChecksum);

        let frames = feed_all(&mut codec, &wire[6..]);
        assert_eq!(frames, vec![Frame::new(7, &b"ab"[..])]);
        assert_eq!(codec.state(), DecodeState::Idle);
    }

    #[test]
    fn ignores_noise_before_frame() {
        let mut codec = FrameCodec::new();
        let mut wire = vec![0x00, 0xFF, ESCAPE, 0x13];
        wire.extend_from_slice(&codec.encode(2, b"hello").unwrap());

        let frames = codec.push(&wire);
        assert_eq!(frames, vec![Frame::new(2, &b"hello"[..])]);
        assert_eq!(codec.stats().frames_dropped, 0);
    }

    #[test]
    fn drops_frame_with_oversized_length() {
        let mut codec = FrameCodec::with_max_payload(4);
        // Declares 0x0010 bytes of payload
        let frames = codec.push(&[START, 0x10, 0x00]);
        assert!(frames.is_empty());
        assert_eq!(codec.state(), DecodeState::Idle);
        assert_eq!(codec.stats().frames_dropped, 1);
    }

    #[test]
    fn drops_frame_with_bad_checksum() {
        let mut codec = FrameCodec::new();
        let mut wire = codec.encode(3, &[1, 2, 3]).unwrap().to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        assert!(codec.push(&wire).is_empty());
        assert_eq!(codec.stats(), CodecStats { frames_decoded: 0, frames_dropped: 1 });
    }

    #[test]
    fn truncated_frame_is_abandoned_by_next_start() {
        let mut codec = FrameCodec::new();
        let first = codec.encode(1, b"first").unwrap();
        let second = codec.encode(2, b"second").unwrap();

        let mut wire = first[..first.len() - 3].to_vec();
        wire.extend_from_slice(&second);

        let frames = codec.push(&wire);
        assert_eq!(frames, vec![Frame::new(2, &b"second"[..])]);
        assert_eq!(codec.stats().frames_dropped, 1);
    }

    #[test]
    fn back_to_back_frames() {
        let mut codec = FrameCodec::new();
        let mut wire = Vec::new();
        for tag in 0..5u8 {
            wire.extend_from_slice(&codec.encode(tag, &[tag; 3]).unwrap());
        }

        let frames = codec.push(&wire);
        assert_eq!(frames.len(), 5);
        for (tag, frame) in frames.iter().enumerate() {
            assert_eq!(frame.tag, tag as u8);
            assert_eq!(&frame.payload[..], &[tag as u8; 3]);
        }
    }

    proptest! {
        #[test]
        fn round_trip_yields_exactly_one_frame(
            tag in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..=MAX_FRAME_LEN),
        ) {
            let mut codec = FrameCodec::new();
            let wire = codec.encode(tag, &payload).unwrap();

            let frames = feed_all(&mut codec, &wire);
            prop_assert_eq!(frames, vec![Frame::new(tag, payload)]);
            prop_assert_eq!(codec.state(), DecodeState::Idle);
        }

        #[test]
        fn single_corruption_only_loses_that_frame(
            tag in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
            position in any::<prop::sample::Index>(),
            flip in 1..=255u8,
        ) {
            let mut codec = FrameCodec::new();
            let mut damaged = codec.encode(tag, &payload).unwrap().to_vec();
            let index = position.index(damaged.len());
            damaged[index] ^= flip;

            let follow_up = codec.encode(0xA5, b"next").unwrap();
            damaged.extend_from_slice(&follow_up);

            let frames = feed_all(&mut codec, &damaged);
            prop_assert_eq!(frames, vec![Frame::new(0xA5, &b"next"[..])]);
        }
    }
}

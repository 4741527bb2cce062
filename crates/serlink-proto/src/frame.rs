//! Decoded frame and wire constants.

use bytes::Bytes;

/// Type tag identifying the logical meaning of a frame.
///
/// Tags are opaque to the link layer. The application decides which value
/// means "handshake", "file size" and so on.
pub type Tag = u8;

/// Start-of-frame marker. Never appears unescaped inside a frame body.
pub const START: u8 = 0x7E;

/// Escape marker. The byte following it is XORed with [`ESCAPE_XOR`].
pub const ESCAPE: u8 = 0x7D;

/// Value XORed into an escaped byte.
pub const ESCAPE_XOR: u8 = 0x20;

/// Hard ceiling on payload length, in bytes.
///
/// Codecs may be configured with a smaller limit but never a larger one.
pub const MAX_FRAME_LEN: usize = 512;

/// Size of the length field on the wire (before stuffing).
pub(crate) const LEN_SIZE: usize = 2;

/// Size of the checksum field on the wire (before stuffing).
pub(crate) const CHECKSUM_SIZE: usize = 4;

/// A verified frame: tag plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Logical message type
    pub tag: Tag,
    /// Frame payload, at most the codec's maximum length
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from a tag and payload.
    pub fn new(tag: Tag, payload: impl Into<Bytes>) -> Self {
        Self { tag, payload: payload.into() }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

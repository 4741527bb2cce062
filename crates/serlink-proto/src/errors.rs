//! Error types for frame encoding.
//!
//! Decoding has no error type on purpose: a corrupt frame is dropped and the
//! parser resynchronizes, so the only failures a caller can observe come from
//! asking the encoder for something the wire cannot carry.

use thiserror::Error;

/// Errors raised while building a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Payload does not fit in a single frame.
    #[error("payload of {len} bytes exceeds maximum frame size of {max} bytes")]
    PayloadTooLarge {
        /// Length of the rejected payload
        len: usize,
        /// Maximum payload the codec accepts
        max: usize,
    },
}

/// Result alias for frame operations.
pub type Result<T> = std::result::Result<T, FrameError>;

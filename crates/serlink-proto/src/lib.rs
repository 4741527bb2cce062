//! Wire format for the serlink serial link protocol.
//!
//! A serial line delivers bytes, not messages. Every message therefore travels
//! as a self-delimited frame: a start marker, a little-endian length, a type
//! tag, the payload and a CRC-32 over everything between the marker and the
//! checksum. The body is octet-stuffed so the start marker can only ever mean
//! "a new frame begins here", which is what lets a receiver that joined
//! mid-stream (or lost a byte to line noise) find its footing again.
//!
//! ```text
//! ┌───────┬─────────┬─────┬───────────────┬──────────┐
//! │ START │ LEN u16 │ TAG │ PAYLOAD (LEN) │ CRC32 LE │
//! └───────┴─────────┴─────┴───────────────┴──────────┘
//!   0x7E   └───────────── byte-stuffed ─────────────┘
//! ```
//!
//! Decoding is incremental and strictly one byte at a time; see
//! [`FrameCodec::feed`]. A frame is either delivered whole and verified, or it
//! is dropped. Nothing partial ever leaves the codec.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod errors;
pub mod frame;

pub use codec::{CodecStats, DecodeState, FrameCodec};
pub use errors::{FrameError, Result};
pub use frame::{ESCAPE, ESCAPE_XOR, Frame, MAX_FRAME_LEN, START, Tag};

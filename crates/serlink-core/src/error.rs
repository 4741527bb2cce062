//! Error types

use std::io;

use serlink_proto::FrameError;
use thiserror::Error;

use crate::session::SessionState;

/// Failures reported by a [`crate::ByteTransport`] or by the host on its
/// behalf. Any of these is fatal to the connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Writing to the device failed
    #[error("write failed: {0}")]
    Write(#[from] io::Error),

    /// The link reported an error (device unplugged, framing error, ...)
    #[error("link error: {0}")]
    Link(String),
}

/// Requests the session state machine refuses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Operation not valid in the current state
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        /// State the session was in
        state: SessionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// A transfer is already running
    #[error("a transfer is already in progress")]
    TransferInProgress,

    /// Nothing to send
    #[error("transfer is empty")]
    EmptyTransfer,

    /// The file length does not fit the 32-bit size announcement
    #[error("transfer of {len} bytes exceeds the 4 GiB size field")]
    TransferTooLarge {
        /// Length of the rejected buffer
        len: usize,
    },
}

/// Invalid [`crate::LinkConfig`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Payload limit is zero or above the wire ceiling
    #[error("max payload {value} must be between 1 and {max}")]
    MaxPayload {
        /// Configured value
        value: usize,
        /// Wire ceiling
        max: usize,
    },

    /// Probe payload does not fit in a frame
    #[error("probe payload of {len} bytes does not fit in a frame")]
    ProbePayload {
        /// Probe payload length
        len: usize,
    },

    /// A period that must be positive is zero
    #[error("{field} must be greater than zero")]
    ZeroDuration {
        /// Name of the offending field
        field: &'static str,
    },

    /// Two commands share a tag, so their responses cannot be told apart
    #[error("command tags must be distinct")]
    DuplicateTags,
}

/// Errors surfaced by [`crate::Connection`].
#[derive(Debug, Error)]
pub enum LinkError {
    /// The transport failed; the connection is now closed
    #[error("transport fault: {0}")]
    Transport(#[from] TransportError),

    /// A frame could not be encoded
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The session rejected the request
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The configuration is unusable
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The connection was closed by a fault or an explicit disconnect
    #[error("connection closed")]
    Closed,
}

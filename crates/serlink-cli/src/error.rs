//! CLI errors.

use std::{io, time::Duration};

use serlink_core::LinkError;
use thiserror::Error;

/// Errors that end a CLI run.
#[derive(Debug, Error)]
pub enum CliError {
    /// Socket or file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `send --hex` payload is not valid hex
    #[error("invalid hex payload: {0}")]
    Hex(#[from] hex::FromHexError),

    /// The link failed or refused the request
    #[error(transparent)]
    Link(#[from] LinkError),

    /// The device never answered a probe
    #[error("device did not answer within {0:?}")]
    HandshakeTimeout(Duration),

    /// The device stopped acknowledging the upload
    #[error("transfer failed after {sent} of {total} bytes")]
    TransferFailed {
        /// Bytes acknowledged before the failure
        sent: usize,
        /// Upload size
        total: usize,
    },

    /// The bridge closed the connection
    #[error("serial bridge closed the connection")]
    Disconnected,
}

//! In-memory transport for the host side of a simulated link.

use std::io;

use serlink_core::{ByteTransport, TransportError};

/// Records every write and hands the bytes to whoever plays the device.
///
/// Can be told to fail after a number of writes to simulate an unplugged
/// adapter.
#[derive(Debug, Default)]
pub struct CaptureTransport {
    pending: Vec<u8>,
    writes: usize,
    total: usize,
    fail_after: Option<usize>,
}

impl CaptureTransport {
    /// Transport that never fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that accepts `writes` writes and fails every one after.
    pub fn failing_after(writes: usize) -> Self {
        Self { fail_after: Some(writes), ..Self::default() }
    }

    /// Make writes fail from now on.
    pub fn unplug(&mut self) {
        self.fail_after = Some(self.writes);
    }

    /// Take bytes written since the last call.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Bytes accepted so far.
    pub fn total_bytes(&self) -> usize {
        self.total
    }
}

impl ByteTransport for CaptureTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.fail_after.is_some_and(|limit| self.writes >= limit) {
            return Err(TransportError::Write(io::Error::new(
                io::ErrorKind::NotConnected,
                "simulated adapter unplugged",
            )));
        }
        self.writes += 1;
        self.total += bytes.len();
        self.pending.extend_from_slice(bytes);
        Ok(())
    }
}

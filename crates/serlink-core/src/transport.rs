//! Byte transport abstraction.
//!
//! A serial port, a TCP socket bridged to one, or an in-memory buffer in
//! tests. The core only ever writes; inbound bytes and link errors are pushed
//! in by the host through [`crate::Connection::receive`] and
//! [`crate::Connection::link_error`].

use crate::error::TransportError;

/// Outbound half of a byte-oriented link.
///
/// Writes are synchronous from the core's point of view. An implementation
/// may buffer, but must deliver submitted bytes in order or fail. A partial
/// write reported as complete is fine as long as the rest follows.
pub trait ByteTransport {
    /// Submit bytes for sending.
    ///
    /// # Errors
    ///
    /// Any error is treated as fatal and closes the connection.
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Collects written bytes. Useful as a staging buffer for an async writer.
impl ByteTransport for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

impl<T: ByteTransport + ?Sized> ByteTransport for &mut T {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(bytes)
    }
}

//! Link configuration.

use std::time::Duration;

use bytes::Bytes;
use serlink_proto::{MAX_FRAME_LEN, Tag};

use crate::error::ConfigError;

/// Command tags understood by the device.
///
/// The values are a property of the device firmware, not of the link. The
/// core only compares them for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTags {
    /// Liveness probe; the device echoes it back
    pub handshake: Tag,
    /// One chunk of file content
    pub write_file: Tag,
    /// Total file length, sent before the first chunk
    pub write_file_size: Tag,
}

impl Default for CommandTags {
    fn default() -> Self {
        Self { handshake: 3, write_file: 1, write_file_size: 4 }
    }
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Period between handshake probes
    pub probe_interval: Duration,
    /// How long a single probe waits for its echo
    pub probe_timeout: Duration,
    /// How long the device may take to acknowledge the file size
    pub size_timeout: Duration,
    /// How long the device may take to acknowledge one chunk
    pub chunk_timeout: Duration,
    /// Period the host should call [`crate::Connection::tick`] at
    pub tick_interval: Duration,
    /// Largest frame payload, which is also the chunk size
    pub max_payload: usize,
    /// Payload carried by every handshake probe
    pub probe_payload: Bytes,
    /// Device command tags
    pub tags: CommandTags,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(100),
            size_timeout: Duration::from_secs(10),
            chunk_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(1),
            max_payload: MAX_FRAME_LEN,
            probe_payload: Bytes::from_static(&[0xBE, 0xEF]),
            tags: CommandTags::default(),
        }
    }
}

impl LinkConfig {
    /// Check the configuration for values the link cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload == 0 || self.max_payload > MAX_FRAME_LEN {
            return Err(ConfigError::MaxPayload { value: self.max_payload, max: MAX_FRAME_LEN });
        }
        if self.probe_payload.len() > self.max_payload {
            return Err(ConfigError::ProbePayload { len: self.probe_payload.len() });
        }
        if self.probe_interval.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "probe_interval" });
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "tick_interval" });
        }

        let CommandTags { handshake, write_file, write_file_size } = self.tags;
        if handshake == write_file || handshake == write_file_size || write_file == write_file_size
        {
            return Err(ConfigError::DuplicateTags);
        }

        Ok(())
    }
}

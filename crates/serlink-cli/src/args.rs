//! Command-line arguments.

use std::{path::PathBuf, time::Duration};

use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use serlink_core::{CommandTags, LinkConfig};

/// serlink - talk to a device over a TCP-bridged serial line
#[derive(Parser, Debug)]
#[command(name = "serlink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Address of the serial bridge (e.g. ser2net)
    #[arg(short, long, default_value = "127.0.0.1:4000")]
    pub addr: String,

    /// Log filter, overridden by `RUST_LOG`
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Give up if the device does not answer within this many milliseconds
    #[arg(long, default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    #[command(flatten)]
    pub link: LinkArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// What to do once connected.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Handshake with the device and exit
    Probe,

    /// Upload a file
    Upload {
        /// File to send
        file: PathBuf,
    },

    /// Send one frame and log what the device sends back
    Send {
        /// Frame tag
        #[arg(long)]
        tag: u8,

        /// Parse DATA as hex instead of text
        #[arg(long)]
        hex: bool,

        /// How long to log replies for
        #[arg(long, default_value_t = 500)]
        listen_ms: u64,

        /// Payload
        data: String,
    },
}

/// Frame payload for `send`: the text as UTF-8, or decoded hex.
pub fn send_payload(data: &str, hex: bool) -> Result<Bytes, hex::FromHexError> {
    if hex {
        let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
        Ok(Bytes::from(hex::decode(compact)?))
    } else {
        Ok(Bytes::copy_from_slice(data.as_bytes()))
    }
}

/// Link tuning. Defaults match the device firmware.
#[derive(Args, Debug, Clone)]
pub struct LinkArgs {
    /// Period between handshake probes
    #[arg(long, default_value_t = 100)]
    pub probe_interval_ms: u64,

    /// How long a probe waits for its echo
    #[arg(long, default_value_t = 100)]
    pub probe_timeout_ms: u64,

    /// How long the device may take to acknowledge the file size
    #[arg(long, default_value_t = 10_000)]
    pub size_timeout_ms: u64,

    /// How long the device may take to acknowledge one chunk
    #[arg(long, default_value_t = 5000)]
    pub chunk_timeout_ms: u64,

    /// Tick period
    #[arg(long, default_value_t = 1)]
    pub tick_ms: u64,

    /// Largest frame payload, which is also the chunk size
    #[arg(long, default_value_t = 512)]
    pub max_payload: usize,

    /// Handshake command tag
    #[arg(long, default_value_t = 3)]
    pub tag_handshake: u8,

    /// File chunk command tag
    #[arg(long, default_value_t = 1)]
    pub tag_write_file: u8,

    /// File size command tag
    #[arg(long, default_value_t = 4)]
    pub tag_write_file_size: u8,
}

impl LinkArgs {
    /// Build the link configuration. Validation happens when the link opens.
    pub fn to_config(&self) -> LinkConfig {
        LinkConfig {
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            size_timeout: Duration::from_millis(self.size_timeout_ms),
            chunk_timeout: Duration::from_millis(self.chunk_timeout_ms),
            tick_interval: Duration::from_millis(self.tick_ms),
            max_payload: self.max_payload,
            tags: CommandTags {
                handshake: self.tag_handshake,
                write_file: self.tag_write_file,
                write_file_size: self.tag_write_file_size,
            },
            ..LinkConfig::default()
        }
    }
}

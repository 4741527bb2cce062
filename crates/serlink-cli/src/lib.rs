//! Host tool for devices behind a TCP-bridged serial line.
//!
//! Connects to the bridge, performs the handshake, then uploads a file or
//! sends a single frame if asked. Link logic lives in `serlink-core`; this
//! crate only supplies the socket, the clock, and the command line.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod args;
pub mod driver;
pub mod error;

use std::time::Duration;

use args::{Cli, Command, send_payload};
use bytes::Bytes;
use driver::{Driver, UploadReport};
use error::CliError;
use tokio::net::TcpStream;
use tracing::info;

/// What a successful run accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The device answered a probe
    Connected,
    /// The file was uploaded
    Uploaded(UploadReport),
    /// A frame was sent; carries the number of frames received back
    Sent(usize),
}

/// Work to do once connected, prepared before touching the device.
enum Job {
    Probe,
    Upload(Vec<u8>),
    Send { tag: u8, payload: Bytes, listen: Duration },
}

/// Execute the parsed command line.
pub async fn run(cli: Cli) -> Result<Outcome, CliError> {
    let config = cli.link.to_config();
    let connect_timeout = Duration::from_millis(cli.connect_timeout_ms);

    // Prepare the payload before touching the device
    let job = match &cli.command {
        Command::Probe => Job::Probe,
        Command::Upload { file } => Job::Upload(tokio::fs::read(file).await?),
        Command::Send { tag, hex, listen_ms, data } => Job::Send {
            tag: *tag,
            payload: send_payload(data, *hex)?,
            listen: Duration::from_millis(*listen_ms),
        },
    };

    let stream = TcpStream::connect(&cli.addr).await?;
    stream.set_nodelay(true)?;
    info!(addr = %cli.addr, "bridge connected");

    let mut driver = Driver::open(stream, config).await?;
    driver.wait_connected(connect_timeout).await?;

    let outcome = match job {
        Job::Probe => Outcome::Connected,
        Job::Send { tag, payload, listen } => Outcome::Sent(driver.send(tag, payload, listen).await?),
        Job::Upload(data) => {
            info!(bytes = data.len(), "uploading");
            let report = driver.upload(data).await?;
            info!(
                bytes = report.bytes,
                chunks = report.chunks,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "upload complete"
            );
            Outcome::Uploaded(report)
        },
    };

    driver.disconnect();
    Ok(outcome)
}

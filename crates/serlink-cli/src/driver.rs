//! Async driver: runs a [`Connection`] over a byte stream.
//!
//! The connection is sans-IO, so the driver owns the clock and the socket.
//! It multiplexes two sources onto one loop: bytes read from the stream and a
//! tick interval. After every call into the connection, bytes staged in the
//! connection's `Vec<u8>` transport are written to the stream. A socket
//! error is reported to the connection as a link fault before it is returned,
//! so the session always ends in `Disconnected` with its final events queued.

use std::{
    io,
    time::{Duration, Instant},
};

use bytes::Bytes;
use serlink_core::{Connection, LinkConfig, LinkStats, SessionEvent, SessionState};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::{self, Interval, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::error::CliError;

/// Summary of a finished upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    /// Bytes uploaded
    pub bytes: usize,
    /// Chunks acknowledged
    pub chunks: usize,
    /// Wall time from size announcement to last acknowledgment
    pub elapsed: Duration,
}

/// Drives one device link over `S`.
#[derive(Debug)]
pub struct Driver<S> {
    stream: S,
    connection: Connection<Vec<u8>>,
    ticker: Interval,
    read_buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Driver<S> {
    /// Open a link over `stream` and send the first probe.
    pub async fn open(stream: S, config: LinkConfig) -> Result<Self, CliError> {
        let mut ticker = time::interval(config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let read_buf = vec![0u8; 4096];

        let connection = Connection::open(Vec::new(), config, Instant::now())?;
        let mut driver = Self { stream, connection, ticker, read_buf };
        driver.flush().await?;
        Ok(driver)
    }

    /// Link counters.
    pub fn stats(&self) -> LinkStats {
        self.connection.stats()
    }

    /// Session state.
    pub fn state(&self) -> SessionState {
        self.connection.state()
    }

    /// Whether the link was closed by a fault or a disconnect.
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Drain session events not yet consumed by [`Self::wait_connected`] or
    /// [`Self::upload`], e.g. the final ones after a fault.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.connection.drain_events()
    }

    /// Wait for the device to answer a probe.
    ///
    /// On timeout the handshake is cancelled.
    pub async fn wait_connected(&mut self, timeout: Duration) -> Result<(), CliError> {
        let deadline = Instant::now() + timeout;

        loop {
            for event in self.step().await? {
                if event == SessionEvent::DeviceConnected(true) {
                    info!(probes = self.connection.session().probes_sent(), "device connected");
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                self.connection.cancel(Instant::now())?;
                return Err(CliError::HandshakeTimeout(timeout));
            }
        }
    }

    /// Upload `data` and wait for the last acknowledgment.
    pub async fn upload(&mut self, data: impl Into<Bytes>) -> Result<UploadReport, CliError> {
        let data = data.into();
        let total = data.len();
        let started = Instant::now();

        self.connection.start_transfer(data, started)?;
        self.flush().await?;

        let mut sent = 0;
        let mut chunks = 0;
        loop {
            for event in self.step().await? {
                match event {
                    SessionEvent::TransferProgress { sent: acked, total, .. } => {
                        sent = acked;
                        chunks += 1;
                        debug!(sent, total, "chunk acknowledged");
                    },
                    SessionEvent::TransferComplete { success: true } => {
                        return Ok(UploadReport { bytes: total, chunks, elapsed: started.elapsed() });
                    },
                    SessionEvent::TransferComplete { success: false } => {
                        return Err(CliError::TransferFailed { sent, total });
                    },
                    SessionEvent::DeviceConnected(false) => return Err(CliError::Disconnected),
                    SessionEvent::DeviceConnected(true) => {},
                }
            }
        }
    }

    /// Send one frame, then log whatever the device sends back for `listen`.
    ///
    /// Returns the number of unclaimed frames received.
    pub async fn send(&mut self, tag: u8, payload: impl Into<Bytes>, listen: Duration) -> Result<usize, CliError> {
        let payload = payload.into();
        info!(tag, len = payload.len(), "sending frame");
        self.connection.send(tag, payload, Instant::now())?;
        self.flush().await?;

        let deadline = Instant::now() + listen;
        let mut received = 0;
        while Instant::now() < deadline {
            for event in self.step().await? {
                debug!(?event, "session event");
            }
            received += self.log_unclaimed();
        }
        Ok(received)
    }

    /// Close the link.
    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }

    /// Wait for bytes or a tick, feed the connection, write its output.
    async fn step(&mut self) -> Result<Vec<SessionEvent>, CliError> {
        tokio::select! {
            read = self.stream.read(&mut self.read_buf) => {
                let n = read.map_err(|e| self.fault(e))?;
                if n == 0 {
                    self.connection.link_error("bridge closed the stream");
                    return Err(CliError::Disconnected);
                }
                self.connection.receive(&self.read_buf[..n], Instant::now())?;
            }
            _ = self.ticker.tick() => {
                self.connection.tick(Instant::now())?;
            }
        }

        self.flush().await?;
        Ok(self.connection.drain_events())
    }

    async fn flush(&mut self) -> Result<(), CliError> {
        let staged = std::mem::take(self.connection.transport_mut());
        if staged.is_empty() {
            return Ok(());
        }
        let written = match self.stream.write_all(&staged).await {
            Ok(()) => self.stream.flush().await,
            Err(e) => Err(e),
        };
        written.map_err(|e| self.fault(e))
    }

    /// Close the link on a socket error and hand the error back.
    fn fault(&mut self, error: io::Error) -> CliError {
        self.connection.link_error(error.to_string());
        CliError::Io(error)
    }

    fn log_unclaimed(&mut self) -> usize {
        let frames = self.connection.drain_unclaimed();
        for frame in &frames {
            match std::str::from_utf8(&frame.payload) {
                Ok(text) => info!(tag = frame.tag, len = frame.len(), text, "frame received"),
                Err(_) => info!(tag = frame.tag, len = frame.len(), payload = ?frame.payload, "frame received"),
            }
        }
        frames.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    use serlink_harness::{DeviceFaults, SimDevice};
    use tokio::io::{DuplexStream, ReadBuf, duplex};

    use super::*;

    /// Reads never complete; every write fails.
    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenPipe {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Writes succeed; every read fails.
    struct ResetOnRead;

    impl AsyncRead for ResetOnRead {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
        }
    }

    impl AsyncWrite for ResetOnRead {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// A link that has already completed the handshake, over `stream`.
    fn connected_driver<S>(stream: S) -> Driver<S> {
        let now = Instant::now();
        let mut connection = Connection::open(Vec::new(), LinkConfig::default(), now).unwrap();
        let mut device = SimDevice::new(LinkConfig::default().tags);
        device.receive(&std::mem::take(connection.transport_mut()));
        connection.receive(&device.take_output(), now).unwrap();
        assert_eq!(connection.drain_events(), vec![SessionEvent::DeviceConnected(true)]);

        Driver {
            stream,
            connection,
            ticker: time::interval(Duration::from_millis(1)),
            read_buf: vec![0u8; 64],
        }
    }

    /// Run a simulated device on the far end of an in-memory pipe.
    fn spawn_device(mut stream: DuplexStream, faults: DeviceFaults) -> tokio::task::JoinHandle<SimDevice> {
        tokio::spawn(async move {
            let mut device = SimDevice::with_faults(LinkConfig::default().tags, faults, 7);
            let mut buf = [0u8; 1024];
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return device,
                    Ok(n) => n,
                };
                device.receive(&buf[..n]);
                let reply = device.take_output();
                if !reply.is_empty() && stream.write_all(&reply).await.is_err() {
                    return device;
                }
            }
        })
    }

    #[tokio::test]
    async fn probes_and_uploads() {
        let (host, device_end) = duplex(8192);
        let device = spawn_device(device_end, DeviceFaults::default());
        let config = LinkConfig { max_payload: 200, ..Default::default() };

        let mut driver = Driver::open(host, config).await.unwrap();
        driver.wait_connected(Duration::from_secs(5)).await.unwrap();

        let data: Vec<u8> = (0..1500u32).map(|i| (i % 256) as u8).collect();
        let report = driver.upload(data.clone()).await.unwrap();
        assert_eq!(report.bytes, 1500);
        assert_eq!(report.chunks, 8);
        assert!(driver.stats().bytes_written > 1500);

        drop(driver);
        let device = device.await.unwrap();
        assert_eq!(device.file(), &data[..]);
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let (host, device_end) = duplex(8192);
        let _device =
            spawn_device(device_end, DeviceFaults { ignore_probes: u64::MAX, ..Default::default() });

        let mut driver = Driver::open(host, LinkConfig::default()).await.unwrap();
        let result = driver.wait_connected(Duration::from_millis(250)).await;

        assert!(matches!(result, Err(CliError::HandshakeTimeout(_))));
    }

    #[tokio::test]
    async fn closed_stream_is_reported() {
        let (host, device_end) = duplex(8192);
        drop(device_end);

        // First probe may or may not make it into the pipe buffer
        let Ok(mut driver) = Driver::open(host, LinkConfig::default()).await else {
            return;
        };
        let result = driver.wait_connected(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CliError::Disconnected | CliError::Io(_))));
    }

    #[tokio::test]
    async fn write_error_fails_transfer_and_closes_link() {
        let mut driver = connected_driver(BrokenPipe);

        let result = driver.upload(vec![0u8; 1000]).await;

        assert!(matches!(result, Err(CliError::Io(ref e)) if e.kind() == io::ErrorKind::BrokenPipe));
        assert!(driver.is_closed());
        assert_eq!(driver.state(), SessionState::Disconnected);
        assert_eq!(
            driver.drain_events(),
            vec![SessionEvent::TransferComplete { success: false }, SessionEvent::DeviceConnected(false)]
        );
    }

    #[tokio::test]
    async fn read_error_closes_link() {
        let mut driver = Driver::open(ResetOnRead, LinkConfig::default()).await.unwrap();

        let result = driver.wait_connected(Duration::from_secs(1)).await;

        assert!(matches!(result, Err(CliError::Io(ref e)) if e.kind() == io::ErrorKind::ConnectionReset));
        assert!(driver.is_closed());
        assert_eq!(driver.state(), SessionState::Disconnected);
        // Never connected, so nothing to report
        assert!(driver.drain_events().is_empty());
    }

    #[tokio::test]
    async fn send_logs_device_reply() {
        let (host, device_end) = duplex(8192);
        let device = spawn_device(device_end, DeviceFaults::default());

        let mut driver = Driver::open(host, LinkConfig::default()).await.unwrap();
        driver.wait_connected(Duration::from_secs(5)).await.unwrap();
        let received = driver.send(9, &b"ping"[..], Duration::from_millis(200)).await.unwrap();

        assert_eq!(received, 1);
        assert_eq!(driver.state(), SessionState::Connected);

        drop(driver);
        let device = device.await.unwrap();
        assert_eq!(device.stats().messages, 1);
        assert_eq!(&device.messages()[0].payload[..], b"ping");
    }
}

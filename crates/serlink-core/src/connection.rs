//! Connection: one device link.
//!
//! Owns the transport, codec, query engine and session, and is the only place
//! they meet. The host drives it from a single loop:
//!
//! - [`Connection::receive`] when bytes arrive
//! - [`Connection::tick`] every `tick_interval`
//! - [`Connection::link_error`] when the port reports a fault
//!
//! After each call the host drains [`Connection::drain_events`], and
//! [`Connection::drain_unclaimed`] for frames no query or listener wanted.
//!
//! Every entry point ends with a pump: ready callbacks are flushed, the
//! session's requests are applied to the engine (which may make more
//! callbacks ready), and finally queued frames are encoded and written. A
//! write failure closes the connection for good.

use std::{collections::VecDeque, time::Instant};

use bytes::Bytes;
use serlink_proto::{CodecStats, Frame, FrameCodec, Tag};
use tracing::{debug, trace, warn};

use crate::{
    config::LinkConfig,
    error::{LinkError, TransportError},
    query::{Dispatch, QueryEngine, QueryStats},
    session::{Session, SessionEvent, SessionRequest, SessionState},
    transport::ByteTransport,
};

/// Link counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Bytes handed to the transport
    pub bytes_written: u64,
    /// Bytes pushed in by the host
    pub bytes_received: u64,
    /// Frames written to the transport
    pub frames_sent: u64,
    /// Decoder counters
    pub codec: CodecStats,
    /// Query engine counters
    pub queries: QueryStats,
}

/// Unclaimed frames kept for the host; older ones are discarded first.
pub const MAX_UNCLAIMED: usize = 64;

/// A device link.
#[derive(Debug)]
pub struct Connection<T: ByteTransport> {
    session: Session,
    engine: QueryEngine<Session>,
    codec: FrameCodec,
    transport: T,
    config: LinkConfig,
    unclaimed: VecDeque<Frame>,
    closed: bool,
    bytes_written: u64,
    bytes_received: u64,
    frames_sent: u64,
}

impl<T: ByteTransport> Connection<T> {
    /// Open a link over `transport` and start probing for the device.
    ///
    /// The first probe is written before this returns.
    ///
    /// # Errors
    ///
    /// - `Config` if the configuration is unusable
    /// - `Transport` if the first probe cannot be written
    pub fn open(transport: T, config: LinkConfig, now: Instant) -> Result<Self, LinkError> {
        config.validate()?;

        let mut connection = Self {
            session: Session::new(config.clone()),
            engine: QueryEngine::new(config.max_payload),
            codec: FrameCodec::with_max_payload(config.max_payload),
            transport,
            config,
            unclaimed: VecDeque::new(),
            closed: false,
            bytes_written: 0,
            bytes_received: 0,
            frames_sent: 0,
        };

        debug!(max_payload = connection.config.max_payload, "link opened");
        connection.session.start_handshake(now)?;
        connection.tick(now)?;
        Ok(connection)
    }

    /// Session state.
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Whether the device has answered and no fault has occurred since.
    pub fn is_connected(&self) -> bool {
        !self.closed && self.session.is_connected()
    }

    /// Whether the link was closed by a fault or [`Self::disconnect`].
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read access to the session state machine.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Configuration the link was opened with.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Counters.
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            bytes_written: self.bytes_written,
            bytes_received: self.bytes_received,
            frames_sent: self.frames_sent,
            codec: self.codec.stats(),
            queries: self.engine.stats(),
        }
    }

    /// Drain queued session notifications.
    ///
    /// Still works after the link closed, so the host sees the final
    /// `DeviceConnected(false)`.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.session.drain_events()
    }

    /// Drain inbound frames that no query or listener claimed, oldest first.
    ///
    /// At most [`MAX_UNCLAIMED`] are kept between calls.
    pub fn drain_unclaimed(&mut self) -> Vec<Frame> {
        self.unclaimed.drain(..).collect()
    }

    /// Push bytes read from the device.
    ///
    /// # Errors
    ///
    /// `Closed` after a fault, `Transport` if a reply cannot be written.
    pub fn receive(&mut self, bytes: &[u8], now: Instant) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.bytes_received += bytes.len() as u64;

        for &byte in bytes {
            if let Some(frame) = self.codec.feed(byte) {
                trace!(tag = frame.tag, len = frame.len(), "frame received");
                let copy = frame.clone();
                let dispatch = self.engine.on_frame_received(frame, &mut self.session);
                trace!(?dispatch, "frame dispatched");
                if dispatch == Dispatch::Unhandled {
                    self.keep_unclaimed(copy);
                }
                self.pump(now)?;
            }
        }
        Ok(())
    }

    /// Periodic tick: expires queries and sends due probes.
    ///
    /// # Errors
    ///
    /// `Closed` after a fault, `Transport` if a frame cannot be written.
    pub fn tick(&mut self, now: Instant) -> Result<(), LinkError> {
        self.ensure_open()?;

        // Expire first so a probe that is due now never supersedes the one
        // timing out now
        self.engine.tick(now, &mut self.session);
        self.session.tick(now);
        self.pump(now)
    }

    /// Restart probing after a cancelled handshake.
    ///
    /// # Errors
    ///
    /// `Closed` after a fault, `Session` unless `Disconnected`.
    pub fn start_handshake(&mut self, now: Instant) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.session.start_handshake(now)?;
        self.session.tick(now);
        self.pump(now)
    }

    /// Upload `data` to the device.
    ///
    /// Progress and completion arrive as [`SessionEvent`]s.
    ///
    /// # Errors
    ///
    /// - `Closed` after a fault
    /// - `Session` if not connected, busy, or `data` is empty or too large
    /// - `Transport` if the size announcement cannot be written
    pub fn start_transfer(&mut self, data: impl Into<Bytes>, now: Instant) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.session.start_transfer(data.into())?;
        self.pump(now)
    }

    /// Send a frame without waiting for an answer.
    ///
    /// Works in any session state; a reply, if the device sends one, shows up
    /// in [`Self::drain_unclaimed`].
    ///
    /// # Errors
    ///
    /// - `Closed` after a fault
    /// - `Frame` if the payload exceeds the frame limit
    /// - `Transport` if the frame cannot be written
    pub fn send(&mut self, tag: Tag, payload: impl Into<Bytes>, now: Instant) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.engine.send(tag, payload)?;
        self.pump(now)
    }

    /// Abort a transfer or a handshake in progress.
    ///
    /// A no-op on a closed link or an idle session.
    ///
    /// # Errors
    ///
    /// `Transport` if cleanup cannot be written.
    pub fn cancel(&mut self, now: Instant) -> Result<(), LinkError> {
        if self.closed {
            return Ok(());
        }
        self.session.cancel();
        self.pump(now)
    }

    /// Host-reported link fault. Closes the link.
    pub fn link_error(&mut self, reason: impl Into<String>) {
        if self.closed {
            return;
        }
        let error = TransportError::Link(reason.into());
        warn!(%error, "link fault");
        self.close();
    }

    /// Close the link from any state.
    pub fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        debug!("link disconnected by host");
        self.close();
    }

    fn keep_unclaimed(&mut self, frame: Frame) {
        if self.unclaimed.len() == MAX_UNCLAIMED {
            self.unclaimed.pop_front();
        }
        self.unclaimed.push_back(frame);
    }

    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.closed { Err(LinkError::Closed) } else { Ok(()) }
    }

    fn close(&mut self) {
        self.session.disconnect();
        self.closed = true;
    }

    fn pump(&mut self, now: Instant) -> Result<(), LinkError> {
        loop {
            self.engine.flush(&mut self.session);
            if !self.session.has_requests() {
                break;
            }
            for request in self.session.drain_requests() {
                self.apply(request, now)?;
            }
        }
        self.write_outbound()
    }

    fn apply(&mut self, request: SessionRequest, now: Instant) -> Result<(), LinkError> {
        match request {
            SessionRequest::Query { kind, tag, payload, timeout } => {
                self.engine.query(tag, payload, timeout, now, move |session: &mut Session, outcome| {
                    session.on_query_result(kind, outcome);
                })?;
            },
            SessionRequest::ListenForHandshake => {
                let id = self
                    .engine
                    .add_type_listener(self.config.tags.handshake, |session: &mut Session, frame: &Frame| {
                        session.on_handshake_frame(frame)
                    });
                self.session.set_handshake_listener(id);
            },
            SessionRequest::StopListening(id) => {
                self.engine.remove_listener(id);
            },
        }
        Ok(())
    }

    fn write_outbound(&mut self) -> Result<(), LinkError> {
        for frame in self.engine.take_outbound() {
            let bytes = self.codec.encode(frame.tag, &frame.payload)?;
            if let Err(error) = self.transport.write(&bytes) {
                warn!(%error, tag = frame.tag, "transport write failed");
                self.close();
                return Err(LinkError::Transport(error));
            }
            trace!(tag = frame.tag, bytes = bytes.len(), "bytes written");
            self.bytes_written += bytes.len() as u64;
            self.frames_sent += 1;
        }
        Ok(())
    }
}

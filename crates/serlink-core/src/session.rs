//! Session state machine: handshake and file upload.
//!
//! # State Machine
//!
//! ```text
//!                 start_handshake            probe echoed
//! ┌──────────────┐ ──────────> ┌─────────────┐ ──────────> ┌───────────┐
//! │ Disconnected │             │ Handshaking │             │ Connected │ <─┐
//! └──────────────┘ <────────── └─────────────┘             └───────────┘   │
//!        ^            cancel      │  ^   probe timed out         │         │ done / timeout
//!        │                        └──┘                           │ start   │ / cancel
//!        │                                                       ↓         │
//!        │                  disconnect (any state)       ┌──────────────┐  │
//!        └───────────────────────────────────────────────│ Transferring │──┘
//!                                                        └──────────────┘
//! ```
//!
//! # Handshake
//!
//! While handshaking the session probes the device every `probe_interval`.
//! Each probe is a query with `probe_timeout`; a timed-out probe changes
//! nothing and the next interval probes again, forever, until the device
//! answers or the host gives up with [`Session::cancel`]. A type listener on
//! the handshake tag catches an echo that arrives after its own probe expired.
//!
//! # Upload
//!
//! 1. Announce the length (`write_file_size`, 4 bytes little-endian).
//! 2. Once acknowledged, send chunk 0 (`write_file`).
//! 3. Each acknowledged chunk emits progress and sends the next one.
//! 4. After the last acknowledgment the upload completes.
//!
//! Any timeout aborts the whole upload and the session returns to
//! `Connected`. There is no per-chunk retry.
//!
//! # Stale results
//!
//! Query callbacks can outlive the state that issued them: a cancelled upload
//! still has a chunk query in flight. Every upload gets a fresh generation and
//! every upload query carries it in its [`QueryKind`]; results whose generation
//! is not the live one are ignored.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use bytes::Bytes;
use serlink_proto::{Frame, Tag};
use tracing::{debug, info, trace, warn};

use crate::{
    config::LinkConfig,
    error::SessionError,
    query::{ListenerId, ListenerResult, QueryOutcome},
    transfer::Transfer,
};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device session
    Disconnected,
    /// Probing for the device
    Handshaking,
    /// Device answered; idle
    Connected,
    /// Upload in progress
    Transferring,
}

/// Notifications for the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Device reachability changed
    DeviceConnected(bool),
    /// One chunk was acknowledged
    TransferProgress {
        /// Size of the acknowledged chunk
        chunk_len: usize,
        /// Bytes acknowledged so far
        sent: usize,
        /// Total upload size
        total: usize,
    },
    /// Upload finished, successfully or not
    TransferComplete {
        /// Whether every chunk was acknowledged
        success: bool,
    },
}

/// Identifies which step a query result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Handshake probe
    Probe,
    /// File size announcement
    FileSize {
        /// Upload generation
        generation: u64,
    },
    /// File chunk
    Chunk {
        /// Upload generation
        generation: u64,
        /// Chunk index
        index: usize,
    },
}

/// Work the session asks its owner to perform on the query engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    /// Issue a query and route its outcome to [`Session::on_query_result`]
    Query {
        /// Step the result belongs to
        kind: QueryKind,
        /// Frame tag
        tag: Tag,
        /// Frame payload
        payload: Bytes,
        /// Response deadline
        timeout: Duration,
    },
    /// Register the handshake type listener and report its id through
    /// [`Session::set_handshake_listener`]
    ListenForHandshake,
    /// Remove a type listener
    StopListening(ListenerId),
}

/// Handshake and upload state machine.
///
/// Pure state: the session never talks to the engine. It queues
/// [`SessionRequest`]s and [`SessionEvent`]s for its owner to drain.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    config: LinkConfig,
    next_probe: Option<Instant>,
    handshake_listener: Option<ListenerId>,
    device_reported: bool,
    transfer: Option<Transfer>,
    generation: u64,
    probes_sent: u64,
    requests: Vec<SessionRequest>,
    events: VecDeque<SessionEvent>,
}

impl Session {
    /// Create a session in `Disconnected`.
    pub fn new(config: LinkConfig) -> Self {
        Self {
            state: SessionState::Disconnected,
            config,
            next_probe: None,
            handshake_listener: None,
            device_reported: false,
            transfer: None,
            generation: 0,
            probes_sent: 0,
            requests: Vec::new(),
            events: VecDeque::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the device has answered and the session is usable.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected | SessionState::Transferring)
    }

    /// Upload in progress, if any.
    pub fn transfer(&self) -> Option<&Transfer> {
        self.transfer.as_ref()
    }

    /// Handshake probes issued since creation.
    pub fn probes_sent(&self) -> u64 {
        self.probes_sent
    }

    /// Handshake listener currently registered, if any.
    pub fn handshake_listener(&self) -> Option<ListenerId> {
        self.handshake_listener
    }

    /// Begin probing for the device. The first probe goes out on the next
    /// [`Self::tick`].
    ///
    /// # Errors
    ///
    /// `InvalidState` unless `Disconnected`.
    pub fn start_handshake(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "start_handshake",
            });
        }

        debug!("handshake started");
        self.state = SessionState::Handshaking;
        self.next_probe = Some(now);
        self.requests.push(SessionRequest::ListenForHandshake);
        Ok(())
    }

    /// Record the id of the handshake listener the owner registered.
    pub fn set_handshake_listener(&mut self, id: ListenerId) {
        if self.state == SessionState::Handshaking {
            self.handshake_listener = Some(id);
        } else {
            // Handshake ended before the listener was installed
            self.requests.push(SessionRequest::StopListening(id));
        }
    }

    /// Periodic tick: issues a probe when one is due.
    pub fn tick(&mut self, now: Instant) {
        if self.state != SessionState::Handshaking {
            return;
        }
        let Some(due) = self.next_probe else {
            return;
        };
        if now < due {
            return;
        }

        self.probes_sent += 1;
        trace!(probe = self.probes_sent, "sending handshake probe");
        self.requests.push(SessionRequest::Query {
            kind: QueryKind::Probe,
            tag: self.config.tags.handshake,
            payload: self.config.probe_payload.clone(),
            timeout: self.config.probe_timeout,
        });
        self.next_probe = Some(now + self.config.probe_interval);
    }

    /// Begin uploading `data`.
    ///
    /// # Errors
    ///
    /// - `TransferInProgress` if an upload is running
    /// - `InvalidState` unless `Connected`
    /// - `EmptyTransfer` for an empty buffer
    /// - `TransferTooLarge` if the length does not fit in 32 bits
    pub fn start_transfer(&mut self, data: Bytes) -> Result<(), SessionError> {
        match self.state {
            SessionState::Connected => {},
            SessionState::Transferring => return Err(SessionError::TransferInProgress),
            state => {
                return Err(SessionError::InvalidState {
                    state,
                    operation: "start_transfer",
                });
            },
        }
        if data.is_empty() {
            return Err(SessionError::EmptyTransfer);
        }
        let Ok(total) = u32::try_from(data.len()) else {
            return Err(SessionError::TransferTooLarge { len: data.len() });
        };

        self.generation += 1;
        let transfer = Transfer::new(data, self.config.max_payload, self.generation);
        info!(
            bytes = transfer.total_len(),
            chunks = transfer.chunk_count(),
            generation = self.generation,
            "transfer started"
        );

        self.transfer = Some(transfer);
        self.state = SessionState::Transferring;
        self.requests.push(SessionRequest::Query {
            kind: QueryKind::FileSize { generation: self.generation },
            tag: self.config.tags.write_file_size,
            payload: Bytes::copy_from_slice(&total.to_le_bytes()),
            timeout: self.config.size_timeout,
        });
        Ok(())
    }

    /// Stop whatever is in progress without dropping the device session.
    ///
    /// Transferring returns to `Connected` and reports a failed transfer.
    /// Handshaking stops probing and returns to `Disconnected`. Anything else
    /// is a no-op, so repeated calls are harmless.
    pub fn cancel(&mut self) {
        match self.state {
            SessionState::Transferring => self.abort_transfer("cancelled"),
            SessionState::Handshaking => {
                debug!(probes = self.probes_sent, "handshake cancelled");
                self.stop_handshake();
                self.state = SessionState::Disconnected;
            },
            SessionState::Connected | SessionState::Disconnected => {},
        }
    }

    /// Tear the session down from any state.
    pub fn disconnect(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }

        debug!(state = ?self.state, "session disconnected");
        if self.transfer.take().is_some() {
            self.events.push_back(SessionEvent::TransferComplete { success: false });
        }
        // Invalidate anything still in flight
        self.generation += 1;
        self.stop_handshake();
        if self.device_reported {
            self.device_reported = false;
            self.events.push_back(SessionEvent::DeviceConnected(false));
        }
        self.state = SessionState::Disconnected;
    }

    /// Route a query outcome to the step that issued it.
    pub fn on_query_result(&mut self, kind: QueryKind, outcome: QueryOutcome) {
        match kind {
            QueryKind::Probe => self.on_probe_result(outcome),
            QueryKind::FileSize { generation } => {
                if !self.is_live(generation) {
                    trace!(generation, "stale file size result ignored");
                    return;
                }
                if outcome.is_response() {
                    debug!("file size acknowledged");
                    self.send_current_chunk();
                } else {
                    self.abort_transfer("file size not acknowledged");
                }
            },
            QueryKind::Chunk { generation, index } => {
                let current = self.transfer.as_ref().map(Transfer::next_index);
                if !self.is_live(generation) || current != Some(index) {
                    trace!(generation, index, "stale chunk result ignored");
                    return;
                }
                if outcome.is_response() {
                    self.on_chunk_acknowledged();
                } else {
                    self.abort_transfer("chunk not acknowledged");
                }
            },
        }
    }

    /// Type listener for the handshake tag.
    pub fn on_handshake_frame(&mut self, frame: &Frame) -> ListenerResult {
        if self.state != SessionState::Handshaking {
            return ListenerResult::Close;
        }
        trace!(len = frame.len(), "late handshake echo");
        // Listener is closed by the engine on return
        self.handshake_listener = None;
        self.complete_handshake();
        ListenerResult::Close
    }

    /// Drain queued engine requests.
    pub fn drain_requests(&mut self) -> Vec<SessionRequest> {
        std::mem::take(&mut self.requests)
    }

    /// Whether engine requests are queued.
    pub fn has_requests(&self) -> bool {
        !self.requests.is_empty()
    }

    /// Drain queued notifications.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    fn on_probe_result(&mut self, outcome: QueryOutcome) {
        if self.state != SessionState::Handshaking {
            return;
        }
        match outcome {
            QueryOutcome::Response(_) => self.complete_handshake(),
            other => trace!(outcome = ?other, "probe unanswered"),
        }
    }

    fn complete_handshake(&mut self) {
        info!(probes = self.probes_sent, "device connected");
        self.stop_handshake();
        self.state = SessionState::Connected;
        self.device_reported = true;
        self.events.push_back(SessionEvent::DeviceConnected(true));
    }

    fn stop_handshake(&mut self) {
        self.next_probe = None;
        if let Some(id) = self.handshake_listener.take() {
            self.requests.push(SessionRequest::StopListening(id));
        }
    }

    fn is_live(&self, generation: u64) -> bool {
        self.state == SessionState::Transferring
            && self.transfer.as_ref().is_some_and(|t| t.generation() == generation)
    }

    fn send_current_chunk(&mut self) {
        let Some(transfer) = self.transfer.as_ref() else {
            return;
        };
        let index = transfer.next_index();
        let Some(chunk) = transfer.chunk(index) else {
            return;
        };

        trace!(index, len = chunk.len(), "sending chunk");
        self.requests.push(SessionRequest::Query {
            kind: QueryKind::Chunk { generation: transfer.generation(), index },
            tag: self.config.tags.write_file,
            payload: chunk,
            timeout: self.config.chunk_timeout,
        });
    }

    fn on_chunk_acknowledged(&mut self) {
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };
        let chunk_len = transfer.chunk(transfer.next_index()).map_or(0, |c| c.len());
        let done = transfer.advance();
        self.events.push_back(SessionEvent::TransferProgress {
            chunk_len,
            sent: transfer.acknowledged(),
            total: transfer.total_len(),
        });

        if done {
            info!(bytes = transfer.total_len(), "transfer complete");
            self.transfer = None;
            self.state = SessionState::Connected;
            self.events.push_back(SessionEvent::TransferComplete { success: true });
        } else {
            self.send_current_chunk();
        }
    }

    fn abort_transfer(&mut self, reason: &'static str) {
        let index = self.transfer.as_ref().map(Transfer::next_index);
        warn!(reason, chunk = ?index, "transfer aborted");
        self.transfer = None;
        self.state = SessionState::Connected;
        self.events.push_back(SessionEvent::TransferComplete { success: false });
    }
}

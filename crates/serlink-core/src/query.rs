//! Query/correlation engine.
//!
//! Turns "send and wait for the answer" into non-blocking callback dispatch.
//! A query is a frame sent with a tag plus an expectation that a frame with
//! the same tag comes back before a deadline. The engine guarantees that every
//! issued query's callback runs exactly once, with one of the outcomes in
//! [`QueryOutcome`].
//!
//! # Dispatch order
//!
//! For each inbound frame:
//!
//! 1. If a query is pending on the frame's tag, it is satisfied and removed.
//! 2. Otherwise type listeners for the tag are offered the frame in
//!    registration order until one claims it ([`ListenerResult::Stay`] or
//!    [`ListenerResult::Close`]).
//! 3. Otherwise the frame is dropped.
//!
//! # Context
//!
//! The engine is generic over a context `C`. Callbacks and listeners receive
//! `&mut C`, never the engine itself, so they cannot issue queries or run the
//! tick from inside dispatch. A callback that wants a follow-up records it in
//! the context and the owner applies it afterwards.
//!
//! Outbound frames are queued rather than written; the owner drains them with
//! [`QueryEngine::take_outbound`] and pushes them through the codec and
//! transport.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    time::{Duration, Instant},
};

use bytes::Bytes;
use serlink_proto::{Frame, FrameError, Tag};
use tracing::{debug, trace};

/// One-shot completion for a query.
pub type QueryCallback<C> = Box<dyn FnOnce(&mut C, QueryOutcome)>;

/// Standing handler for every frame of one tag.
pub type ListenerFn<C> = Box<dyn FnMut(&mut C, &Frame) -> ListenerResult>;

/// How a query ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// A frame with the query's tag arrived; carries its payload
    Response(Bytes),
    /// The deadline passed without a response
    TimedOut,
    /// A newer query with the same tag replaced this one before it resolved
    Superseded,
    /// Issued with a zero timeout, so no response was awaited
    Unacknowledged,
}

impl QueryOutcome {
    /// Whether the device answered.
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response(_))
    }
}

/// What a type listener wants after seeing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerResult {
    /// Handled; keep the listener registered
    Stay,
    /// Handled; remove the listener
    Close,
    /// Not handled; offer the frame to the next listener of this tag
    Next,
}

/// Handle to a registered type listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Who consumed an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A pending query
    Query,
    /// A type listener
    Listener(ListenerId),
    /// Nobody; the frame was dropped
    Unhandled,
}

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Frames queued for sending (queries included)
    pub frames_sent: u64,
    /// Queries issued
    pub queries: u64,
    /// Queries satisfied by a response
    pub responses: u64,
    /// Queries that expired
    pub timeouts: u64,
    /// Queries replaced by a newer query of the same tag
    pub superseded: u64,
    /// Frames consumed by a type listener
    pub listener_hits: u64,
    /// Frames nobody claimed
    pub unhandled: u64,
}

struct PendingQuery<C> {
    issued: Instant,
    deadline: Instant,
    callback: QueryCallback<C>,
}

struct TypeListener<C> {
    id: ListenerId,
    tag: Tag,
    handler: ListenerFn<C>,
}

/// Correlates outbound queries with inbound frames.
pub struct QueryEngine<C> {
    max_payload: usize,
    pending: HashMap<Tag, PendingQuery<C>>,
    listeners: Vec<TypeListener<C>>,
    ready: VecDeque<(QueryCallback<C>, QueryOutcome)>,
    outbound: VecDeque<Frame>,
    next_listener: u64,
    stats: QueryStats,
}

impl<C> QueryEngine<C> {
    /// Create an engine that refuses payloads above `max_payload`.
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            pending: HashMap::new(),
            listeners: Vec::new(),
            ready: VecDeque::new(),
            outbound: VecDeque::new(),
            next_listener: 0,
            stats: QueryStats::default(),
        }
    }

    /// Queue a frame without expecting an answer.
    ///
    /// # Errors
    ///
    /// [`FrameError::PayloadTooLarge`] if the payload cannot fit in a frame.
    pub fn send(&mut self, tag: Tag, payload: impl Into<Bytes>) -> Result<(), FrameError> {
        let payload = payload.into();
        if payload.len() > self.max_payload {
            return Err(FrameError::PayloadTooLarge { len: payload.len(), max: self.max_payload });
        }

        trace!(tag, len = payload.len(), "frame queued");
        self.stats.frames_sent += 1;
        self.outbound.push_back(Frame::new(tag, payload));
        Ok(())
    }

    /// Queue a frame and wait up to `timeout` for a frame with the same tag.
    ///
    /// `on_result` runs exactly once. A zero `timeout` means no answer is
    /// awaited: the callback gets [`QueryOutcome::Unacknowledged`] on the next
    /// [`Self::flush`]. If a query with the same tag is already pending, that
    /// older query resolves as [`QueryOutcome::Superseded`] and the new
    /// deadline takes over.
    ///
    /// # Errors
    ///
    /// [`FrameError::PayloadTooLarge`] if the payload cannot fit in a frame.
    /// Nothing is registered in that case.
    pub fn query<F>(
        &mut self,
        tag: Tag,
        payload: impl Into<Bytes>,
        timeout: Duration,
        now: Instant,
        on_result: F,
    ) -> Result<(), FrameError>
    where
        F: FnOnce(&mut C, QueryOutcome) + 'static,
    {
        self.send(tag, payload)?;
        self.stats.queries += 1;

        let callback: QueryCallback<C> = Box::new(on_result);
        if timeout.is_zero() {
            self.ready.push_back((callback, QueryOutcome::Unacknowledged));
            return Ok(());
        }

        let query = PendingQuery { issued: now, deadline: now + timeout, callback };
        if let Some(previous) = self.pending.insert(tag, query) {
            debug!(tag, "query superseded");
            self.stats.superseded += 1;
            self.ready.push_back((previous.callback, QueryOutcome::Superseded));
        }
        Ok(())
    }

    /// Register a standing handler for `tag`.
    pub fn add_type_listener<F>(&mut self, tag: Tag, handler: F) -> ListenerId
    where
        F: FnMut(&mut C, &Frame) -> ListenerResult + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push(TypeListener { id, tag, handler: Box::new(handler) });
        id
    }

    /// Unregister a listener. Returns `false` if it was already gone.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|listener| listener.id != id);
        self.listeners.len() != before
    }

    /// Whether a listener is still registered.
    pub fn has_listener(&self, id: ListenerId) -> bool {
        self.listeners.iter().any(|listener| listener.id == id)
    }

    /// Dispatch a decoded frame.
    pub fn on_frame_received(&mut self, frame: Frame, ctx: &mut C) -> Dispatch {
        self.flush(ctx);

        if let Some(query) = self.pending.remove(&frame.tag) {
            trace!(tag = frame.tag, len = frame.len(), "query answered");
            self.stats.responses += 1;
            (query.callback)(ctx, QueryOutcome::Response(frame.payload));
            return Dispatch::Query;
        }

        let mut claimed = None;
        for (index, listener) in self.listeners.iter_mut().enumerate() {
            if listener.tag != frame.tag {
                continue;
            }
            match (listener.handler)(ctx, &frame) {
                ListenerResult::Stay => {
                    claimed = Some((listener.id, None));
                    break;
                },
                ListenerResult::Close => {
                    claimed = Some((listener.id, Some(index)));
                    break;
                },
                ListenerResult::Next => {},
            }
        }

        match claimed {
            Some((id, close)) => {
                if let Some(index) = close {
                    self.listeners.remove(index);
                }
                self.stats.listener_hits += 1;
                Dispatch::Listener(id)
            },
            None => {
                trace!(tag = frame.tag, len = frame.len(), "unclaimed frame dropped");
                self.stats.unhandled += 1;
                Dispatch::Unhandled
            },
        }
    }

    /// Expire every pending query whose deadline is at or before `now`.
    ///
    /// Returns the number of queries that timed out. Expiry runs in deadline
    /// order.
    pub fn tick(&mut self, now: Instant, ctx: &mut C) -> usize {
        self.flush(ctx);

        let mut due: Vec<(Instant, Tag)> = self
            .pending
            .iter()
            .filter(|(_, query)| query.deadline <= now)
            .map(|(&tag, query)| (query.deadline, tag))
            .collect();
        due.sort_unstable();

        for &(_, tag) in &due {
            if let Some(query) = self.pending.remove(&tag) {
                debug!(tag, waited = ?now.duration_since(query.issued), "query timed out");
                self.stats.timeouts += 1;
                (query.callback)(ctx, QueryOutcome::TimedOut);
            }
        }

        due.len()
    }

    /// Run callbacks that resolved without a frame or a deadline
    /// (superseded and zero-timeout queries).
    pub fn flush(&mut self, ctx: &mut C) -> usize {
        let mut fired = 0;
        while let Some((callback, outcome)) = self.ready.pop_front() {
            callback(ctx, outcome);
            fired += 1;
        }
        fired
    }

    /// Whether callbacks are waiting for [`Self::flush`].
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Drain frames queued for the wire, oldest first.
    pub fn take_outbound(&mut self) -> Vec<Frame> {
        self.outbound.drain(..).collect()
    }

    /// Whether a query is waiting on `tag`.
    pub fn is_pending(&self, tag: Tag) -> bool {
        self.pending.contains_key(&tag)
    }

    /// Number of pending queries.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Engine counters.
    pub fn stats(&self) -> QueryStats {
        self.stats
    }
}

impl<C> fmt::Debug for QueryEngine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEngine")
            .field("max_payload", &self.max_payload)
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners.len())
            .field("ready", &self.ready.len())
            .field("outbound", &self.outbound.len())
            .field("stats", &self.stats)
            .finish()
    }
}

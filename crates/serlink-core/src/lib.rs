//! serlink protocol core logic
//!
//! Pure state machine logic for talking to a device over a serial line,
//! decoupled from I/O and from the clock.
//!
//! # Architecture
//!
//! Nothing in this crate reads a port, sleeps or looks at the wall clock.
//! Time is passed in as an [`std::time::Instant`], inbound bytes are pushed in
//! by the host, and outbound bytes leave through the [`ByteTransport`] the
//! host hands to [`Connection`]. Everything runs on one logical thread: the
//! host serializes "bytes arrived", "link failed" and the periodic tick onto a
//! single loop and calls into the connection from there.
//!
//! The layers, leaf first:
//!
//! ```text
//!  Session ──requests──> QueryEngine ──frames──> FrameCodec ──bytes──> ByteTransport
//!     ^                      │                       ^
//!     └──── callbacks ───────┘ <──── frames ─────────┘ <──── bytes ──── host
//! ```
//!
//! Query callbacks receive the [`Session`] mutably but never the engine, so a
//! callback cannot re-enter dispatch. Follow-up queries are queued as
//! [`SessionRequest`]s and applied by the [`Connection`] once the callback
//! returns.
//!
//! # Components
//!
//! - [`query`]: Query/correlation engine (pending queries, type listeners)
//! - [`session`]: Handshake and file-transfer state machine
//! - [`transfer`]: Chunk partitioning of an upload
//! - [`connection`]: Owner of transport, codec, engine and session
//! - [`config`]: Timeouts, tags and limits
//! - [`transport`]: Byte transport abstraction
//! - [`error`]: Error types

pub mod config;
pub mod connection;
pub mod error;
pub mod query;
pub mod session;
pub mod transfer;
pub mod transport;

pub use config::{CommandTags, LinkConfig};
pub use connection::{Connection, LinkStats, MAX_UNCLAIMED};
pub use error::{ConfigError, LinkError, SessionError, TransportError};
pub use query::{Dispatch, ListenerId, ListenerResult, QueryEngine, QueryOutcome, QueryStats};
pub use session::{QueryKind, Session, SessionEvent, SessionRequest, SessionState};
pub use transfer::Transfer;
pub use transport::ByteTransport;

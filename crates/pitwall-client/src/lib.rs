//! Live timing client: negotiation, streaming transport, and the
//! reconnection controller.
//!
//! # Architecture
//!
//! ```text
//! Negotiator --> Transport --> IngestSession (Sequencer --> Aggregator --> observers)
//!      ^             |                              |
//!      |             v                              +--> PersistenceBuffer
//!      +------ Controller (state machine, backoff, resubscribe)
//! ```
//!
//! # Modules
//!
//! - [`negotiate`] -- Negotiation handshake over HTTPS
//! - [`transport`] -- Transport seam and the WebSocket implementation
//! - [`session`] -- Frame ingest path from sequencer to persistence
//! - [`controller`] -- Connection state machine and [`ClientHandle`]
//! - [`error`] -- Client error types

pub mod controller;
pub mod error;
pub mod negotiate;
pub mod session;
pub mod transport;

pub use controller::{ClientHandle, FeedClient, FeedEvent};
pub use error::{ClientError, ConnectionError, NegotiationError};
pub use negotiate::Negotiator;
pub use session::IngestSession;
pub use transport::{EventSink, FeedTransport, Link, LinkCommand, TransportEvent, WebSocketTransport};

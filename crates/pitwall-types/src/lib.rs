//! Shared type definitions for the pitwall live timing client.
//!
//! Every crate in the workspace speaks in these types: the transport hands
//! raw frames to the sequencer, the sequencer produces [`Envelope`]s, the
//! aggregator merges their [`SubMessage`]s, and the store persists
//! [`FrameRecord`]s.
//!
//! # Modules
//!
//! - [`envelope`] -- Envelopes, sub-messages, and their persisted form
//! - [`wire`] -- Inbound frame parsing and the outbound `Subscribe` invocation
//! - [`session`] -- Negotiated credentials and the connection state machine states
//! - [`report`] -- Non-fatal error reports delivered to observers

pub mod envelope;
pub mod report;
pub mod session;
pub mod wire;

// Re-export all public types at crate root for convenience.
pub use envelope::{Envelope, FrameRecord, SubMessage};
pub use report::{ErrorKind, ErrorReport};
pub use session::{ConnectionState, Credentials};
pub use wire::{FrameError, InboundFrame, SubscribeRequest};

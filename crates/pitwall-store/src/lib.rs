//! Durable history for the pitwall live timing client.
//!
//! Released envelopes and malformed frames are recorded into an in-memory
//! [`PersistenceBuffer`] and flushed periodically to a [`Journal`] of three
//! JSON files.
//!
//! ```text
//! record() --> pending entries
//!                 |
//!                 +-- take_batch() --> FlushBatch::write() --> raw file      (append log, every entry)
//!                                            |                 live file     (latest entry + counters)
//!                                            |                 snapshot file (whole merged snapshot)
//!                                            v
//!                                        complete()
//! ```
//!
//! `write()` is blocking and can run on another thread while new entries
//! keep being recorded.
//!
//! # Modules
//!
//! - [`journal`] -- File layout and atomic JSON writes
//! - [`buffer`] -- Accumulation and flush
//! - [`error`] -- Shared error types

pub mod buffer;
pub mod error;
pub mod journal;

pub use buffer::{FlushBatch, PersistenceBuffer};
pub use error::StoreError;
pub use journal::{AppendLog, Journal, LatestRecord};

//! Ingestion core of the pitwall live timing client.
//!
//! Everything here is synchronous and single-writer: the client's
//! controller task feeds raw frames through the [`sequencer`], hands each
//! released envelope to the [`aggregator`], and the aggregator is the only
//! code that mutates the [`snapshot`].
//!
//! # Modules
//!
//! - [`config`] -- YAML configuration with defaults and env overrides
//! - [`sequencer`] -- Reorders envelopes by delivery id
//! - [`merge`] -- Topic to merge-rule dispatch table
//! - [`snapshot`] -- The reconstructed live state
//! - [`aggregator`] -- Applies envelopes to the snapshot and notifies observers
//! - [`observer`] -- Callback seam for topic, snapshot, and error notifications

pub mod aggregator;
pub mod config;
pub mod merge;
pub mod observer;
pub mod sequencer;
pub mod snapshot;

pub use aggregator::Aggregator;
pub use config::{ConfigError, FeedConfig};
pub use merge::{MergeRule, MergeTable};
pub use observer::{FeedObserver, NoOpObserver};
pub use sequencer::{FrameOutcome, Gap, Sequencer};
pub use snapshot::{EntryLog, LogEntry, Snapshot, TopicState};

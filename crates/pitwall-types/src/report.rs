//! Non-fatal error reports.
//!
//! Parse failures, persistence failures, sequencing gaps, and failed
//! negotiation or connect attempts never stop ingestion. They are logged
//! and delivered to observers as an [`ErrorReport`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The negotiation handshake failed.
    Negotiation,
    /// Opening or keeping the streaming socket failed.
    Connection,
    /// A frame could not be parsed.
    Parse,
    /// Flushing the durable history failed.
    Persistence,
    /// The sequencer skipped a delivery gap.
    SequencingGap,
}

/// A failure reported to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// When the failure was observed.
    pub at: DateTime<Utc>,
}

impl ErrorReport {
    /// Create a report stamped with the current time.
    pub fn now(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

//! Notification seam between the ingestion core and its consumers.
//!
//! The aggregator calls [`FeedObserver::on_topic`] once per applied
//! sub-message and [`FeedObserver::on_snapshot`] once per envelope. The
//! client bridges these calls onto its event channel.

use std::sync::Arc;

use pitwall_types::{Envelope, ErrorReport};
use serde_json::Value;

use crate::snapshot::Snapshot;

/// Receives notifications from the ingestion core.
///
/// Implementations must not block: they run on the single task that owns
/// the snapshot.
pub trait FeedObserver: Send {
    /// Called after a sub-message has been merged into `topic`.
    ///
    /// `payload` is the merged view of the topic, or the appended entry for
    /// append-only topics.
    fn on_topic(&mut self, topic: &str, payload: &Value);

    /// Called once after every sub-message of `envelope` has been merged.
    fn on_snapshot(&mut self, snapshot: &Arc<Snapshot>, envelope: &Arc<Envelope>);

    /// Called for failures that do not stop ingestion.
    fn on_error(&mut self, _report: &ErrorReport) {}
}

/// An observer that ignores every notification.
pub struct NoOpObserver;

impl FeedObserver for NoOpObserver {
    fn on_topic(&mut self, _topic: &str, _payload: &Value) {}

    fn on_snapshot(&mut self, _snapshot: &Arc<Snapshot>, _envelope: &Arc<Envelope>) {}
}

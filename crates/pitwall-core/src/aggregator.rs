//! Applies released envelopes to the snapshot.
//!
//! The [`Aggregator`] is the single writer of the [`Snapshot`]. Observers
//! receive `Arc<Snapshot>` handles; when one of them still holds the
//! previous snapshot, the next mutation copies it first, so every handle an
//! observer keeps is a stable point-in-time view. The copy shares every
//! topic the envelope does not touch.

use std::sync::Arc;

use pitwall_types::Envelope;
use tracing::debug;

use crate::merge::MergeTable;
use crate::observer::FeedObserver;
use crate::snapshot::Snapshot;

/// Merges envelopes into the snapshot and notifies observers.
#[derive(Debug)]
pub struct Aggregator {
    snapshot: Arc<Snapshot>,
    table: MergeTable,
}

impl Aggregator {
    /// Create an aggregator with an empty snapshot.
    pub fn new(table: MergeTable) -> Self {
        Self {
            snapshot: Arc::new(Snapshot::new()),
            table,
        }
    }

    /// The current snapshot.
    pub const fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    /// Apply every sub-message of `envelope` in order.
    ///
    /// Emits one topic notification per sub-message, then exactly one
    /// snapshot notification, even when the envelope carries no updates.
    pub fn apply(&mut self, envelope: &Arc<Envelope>, observer: &mut dyn FeedObserver) {
        let snapshot = Arc::make_mut(&mut self.snapshot);
        let mut notifications = Vec::with_capacity(envelope.sub_messages().len());

        for sub in envelope.sub_messages() {
            let rule = self.table.rule_for(&sub.topic);
            let view = snapshot.merge(&sub.topic, rule, &sub.payload, envelope.received_at());
            debug!(
                delivery_id = envelope.delivery_id(),
                topic = %sub.topic,
                ?rule,
                "merged sub-message"
            );
            notifications.push((sub.topic.as_str(), view));
        }
        snapshot.mark_applied(envelope.delivery_id(), envelope.received_at());

        for (topic, view) in &notifications {
            observer.on_topic(topic, view);
        }
        observer.on_snapshot(&self.snapshot, envelope);
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(MergeTable::default())
    }
}

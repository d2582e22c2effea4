//! Envelope sequencing.
//!
//! The transport delivers frames in whatever order the network produces.
//! The [`Sequencer`] parses each frame into an [`Envelope`], parks it in a
//! pending queue keyed by delivery id, and releases envelopes strictly in
//! id order: while the queue holds `last_released + 1`, that envelope is
//! removed and released.
//!
//! Invariants:
//! - every pending key is strictly greater than `last_released`
//! - released ids are contiguous and strictly increasing
//! - a malformed frame never consumes a delivery id
//!
//! A delivery id that never arrives stalls every later envelope. The
//! optional limits in [`SequencerConfig`] skip such a gap; both are off by
//! default.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pitwall_types::{Envelope, FrameRecord, InboundFrame};
use tracing::{debug, warn};

use crate::config::SequencerConfig;

/// A run of delivery ids that were never received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// First missing id.
    pub from: u64,
    /// Last missing id.
    pub to: u64,
}

impl Gap {
    /// Number of missing ids.
    pub const fn missing(&self) -> u64 {
        self.to.saturating_sub(self.from).saturating_add(1)
    }
}

/// What a single frame produced.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    /// Envelopes released by this frame, in delivery order.
    pub released: Vec<Envelope>,
    /// History entry for a frame that failed to parse.
    pub malformed: Option<FrameRecord>,
    /// Gap skipped by the configured escape hatch.
    pub skipped: Option<Gap>,
    /// The envelope repeated an id already released or pending.
    pub duplicate: bool,
}

/// Reorders envelopes by delivery id.
#[derive(Debug)]
pub struct Sequencer {
    /// Highest id released so far (0 before the first release).
    last_released: u64,
    /// Envelopes waiting for their predecessors.
    pending: BTreeMap<u64, Envelope>,
    /// Highest id seen or assigned, used for frames without a `MessageId`.
    highest_assigned: u64,
    /// Gap escape hatch limits.
    config: SequencerConfig,
    /// Frames handed to [`Sequencer::on_frame`].
    frames_received: u64,
    /// Envelopes dropped because their id was already released or pending.
    duplicates_dropped: u64,
    /// Frames that failed to parse.
    malformed_frames: u64,
    /// Gaps skipped by the escape hatch.
    gaps_skipped: u64,
}

impl Sequencer {
    /// Create a sequencer that has released nothing yet.
    pub fn new(config: SequencerConfig) -> Self {
        debug!(
            max_pending = ?config.max_pending,
            gap_timeout_ms = ?config.gap_timeout_ms,
            "sequencer initialized"
        );
        Self {
            last_released: 0,
            pending: BTreeMap::new(),
            highest_assigned: 0,
            config,
            frames_received: 0,
            duplicates_dropped: 0,
            malformed_frames: 0,
            gaps_skipped: 0,
        }
    }

    /// Create a sequencer with no gap escape hatch.
    pub fn with_defaults() -> Self {
        Self::new(SequencerConfig::default())
    }

    /// Parse a raw frame and sequence it.
    ///
    /// The delivery id comes from the frame's `MessageId` when present,
    /// otherwise from a local counter that continues past the highest id
    /// seen. A frame that fails to parse is returned as a malformed history
    /// entry and leaves the sequence untouched.
    pub fn on_frame(&mut self, raw: &str, received_at: DateTime<Utc>) -> FrameOutcome {
        self.frames_received = self.frames_received.saturating_add(1);

        let frame = match InboundFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.malformed_frames = self.malformed_frames.saturating_add(1);
                warn!(
                    receipt = self.frames_received,
                    error = %e,
                    "malformed frame recorded"
                );
                return FrameOutcome {
                    malformed: Some(FrameRecord::Malformed {
                        timestamp: received_at,
                        message_id: self.frames_received,
                        error: e.to_string(),
                        raw: raw.to_owned(),
                    }),
                    ..FrameOutcome::default()
                };
            }
        };

        let delivery_id = self.assign_id(frame.message_id);
        self.push(Envelope::new(
            delivery_id,
            received_at,
            frame.sub_messages,
            frame.body,
        ))
    }

    /// Sequence an already-built envelope.
    pub fn push(&mut self, envelope: Envelope) -> FrameOutcome {
        let id = envelope.delivery_id();
        self.highest_assigned = self.highest_assigned.max(id);

        if id <= self.last_released || self.pending.contains_key(&id) {
            self.duplicates_dropped = self.duplicates_dropped.saturating_add(1);
            debug!(
                delivery_id = id,
                last_released = self.last_released,
                "dropping duplicate envelope"
            );
            return FrameOutcome {
                duplicate: true,
                ..FrameOutcome::default()
            };
        }

        let received_at = envelope.received_at();
        self.pending.insert(id, envelope);

        let mut outcome = FrameOutcome::default();
        self.drain(&mut outcome.released);

        if let Some(gap) = self.gap_to_skip(received_at) {
            self.gaps_skipped = self.gaps_skipped.saturating_add(1);
            warn!(
                from = gap.from,
                to = gap.to,
                missing = gap.missing(),
                pending = self.pending.len(),
                "skipping delivery gap"
            );
            self.last_released = gap.to;
            self.drain(&mut outcome.released);
            outcome.skipped = Some(gap);
        }

        if let Some(gap) = self.stalled_gap() {
            debug!(
                from = gap.from,
                to = gap.to,
                pending = self.pending.len(),
                "waiting for missing delivery ids"
            );
        }

        outcome
    }

    /// The ids currently blocking release, if any envelope is waiting.
    pub fn stalled_gap(&self) -> Option<Gap> {
        let (&first_pending, _) = self.pending.first_key_value()?;
        Some(Gap {
            from: self.last_released.saturating_add(1),
            to: first_pending.saturating_sub(1),
        })
    }

    /// Highest released delivery id (0 before the first release).
    pub const fn last_released(&self) -> u64 {
        self.last_released
    }

    /// Number of envelopes waiting for a missing predecessor.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Frames received since creation.
    pub const fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Duplicate envelopes dropped since creation.
    pub const fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped
    }

    /// Malformed frames seen since creation.
    pub const fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }

    /// Gaps skipped by the escape hatch since creation.
    pub const fn gaps_skipped(&self) -> u64 {
        self.gaps_skipped
    }

    /// Pick the delivery id for a parsed frame.
    fn assign_id(&mut self, feed_id: Option<u64>) -> u64 {
        let id = feed_id.unwrap_or_else(|| self.highest_assigned.saturating_add(1));
        self.highest_assigned = self.highest_assigned.max(id);
        id
    }

    /// Release every contiguous envelope after `last_released`.
    fn drain(&mut self, released: &mut Vec<Envelope>) {
        while let Some(next) = self.last_released.checked_add(1) {
            let Some(envelope) = self.pending.remove(&next) else {
                break;
            };
            self.last_released = next;
            released.push(envelope);
        }
    }

    /// Decide whether the configured limits call for skipping the gap.
    fn gap_to_skip(&self, now: DateTime<Utc>) -> Option<Gap> {
        let gap = self.stalled_gap()?;

        let over_capacity = self
            .config
            .max_pending
            .is_some_and(|max| self.pending.len() > max);

        let timed_out = self.config.gap_timeout_ms.is_some_and(|timeout_ms| {
            let limit = i64::try_from(timeout_ms).unwrap_or(i64::MAX);
            self.pending
                .values()
                .map(Envelope::received_at)
                .min()
                .is_some_and(|oldest| now.signed_duration_since(oldest).num_milliseconds() > limit)
        });

        (over_capacity || timed_out).then_some(gap)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn frame_with_id(id: u64) -> String {
        json!({
            "MessageId": id,
            "M": [{"H": "Streaming", "M": "LapCount", "A": [{"CurrentLap": id}]}]
        })
        .to_string()
    }

    fn released_ids(outcome: &FrameOutcome) -> Vec<u64> {
        outcome.released.iter().map(Envelope::delivery_id).collect()
    }

    /// All orderings of `items` (Heap's algorithm).
    fn permutations(items: &mut Vec<u64>, k: usize, out: &mut Vec<Vec<u64>>) {
        if k <= 1 {
            out.push(items.clone());
            return;
        }
        let last = k.saturating_sub(1);
        permutations(items, last, out);
        for i in 0..last {
            if k % 2 == 0 {
                items.swap(i, last);
            } else {
                items.swap(0, last);
            }
            permutations(items, last, out);
        }
    }

    #[test]
    fn out_of_order_arrival_releases_in_order() {
        let mut sequencer = Sequencer::with_defaults();
        let now = Utc::now();

        let first = sequencer.on_frame(&frame_with_id(2), now);
        assert!(first.released.is_empty());
        assert_eq!(sequencer.pending_len(), 1);

        let second = sequencer.on_frame(&frame_with_id(1), now);
        assert_eq!(released_ids(&second), vec![1, 2]);

        let third = sequencer.on_frame(&frame_with_id(3), now);
        assert_eq!(released_ids(&third), vec![3]);
        assert_eq!(sequencer.last_released(), 3);
        assert_eq!(sequencer.pending_len(), 0);
    }

    #[test]
    fn every_permutation_of_a_contiguous_range_is_released_in_order() {
        let mut all = Vec::new();
        permutations(&mut vec![1, 2, 3, 4, 5], 5, &mut all);
        assert_eq!(all.len(), 120);

        for order in all {
            let mut sequencer = Sequencer::with_defaults();
            let mut released = Vec::new();
            for id in &order {
                let outcome = sequencer.on_frame(&frame_with_id(*id), Utc::now());
                released.extend(released_ids(&outcome));
            }
            assert_eq!(released, vec![1, 2, 3, 4, 5], "arrival order {order:?}");
        }
    }

    #[test]
    fn missing_id_stalls_everything_after_it() {
        let mut sequencer = Sequencer::with_defaults();
        let now = Utc::now();

        assert_eq!(released_ids(&sequencer.on_frame(&frame_with_id(1), now)), vec![1]);
        for id in 3..=50 {
            let outcome = sequencer.on_frame(&frame_with_id(id), now);
            assert!(outcome.released.is_empty(), "id {id} released past the gap");
            assert!(outcome.skipped.is_none());
        }

        assert_eq!(sequencer.last_released(), 1);
        assert_eq!(sequencer.pending_len(), 48);
        assert_eq!(sequencer.stalled_gap(), Some(Gap { from: 2, to: 2 }));
    }

    #[test]
    fn late_arrival_of_missing_id_drains_the_backlog() {
        let mut sequencer = Sequencer::with_defaults();
        let now = Utc::now();
        for id in [1, 3, 4, 5] {
            sequencer.on_frame(&frame_with_id(id), now);
        }
        let outcome = sequencer.on_frame(&frame_with_id(2), now);
        assert_eq!(released_ids(&outcome), vec![2, 3, 4, 5]);
        assert_eq!(sequencer.stalled_gap(), None);
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut sequencer = Sequencer::with_defaults();
        let now = Utc::now();
        sequencer.on_frame(&frame_with_id(1), now);
        sequencer.on_frame(&frame_with_id(3), now);

        let released_again = sequencer.on_frame(&frame_with_id(1), now);
        assert!(released_again.duplicate);
        let pending_again = sequencer.on_frame(&frame_with_id(3), now);
        assert!(pending_again.duplicate);

        assert_eq!(sequencer.duplicates_dropped(), 2);
        assert_eq!(sequencer.pending_len(), 1);
    }

    #[test]
    fn frames_without_message_id_get_local_ids() {
        let mut sequencer = Sequencer::with_defaults();
        let now = Utc::now();
        let frame = r#"{"M": [{"H": "Streaming", "M": "Heartbeat", "A": [{"Utc": "x"}]}]}"#;

        let a = sequencer.on_frame(frame, now);
        let b = sequencer.on_frame(frame, now);
        let c = sequencer.on_frame(frame, now);

        assert_eq!(released_ids(&a), vec![1]);
        assert_eq!(released_ids(&b), vec![2]);
        assert_eq!(released_ids(&c), vec![3]);
    }

    #[test]
    fn malformed_frame_is_recorded_without_consuming_an_id() {
        let mut sequencer = Sequencer::with_defaults();
        let now = Utc::now();

        let bad = sequencer.on_frame("{\"M\": [", now);
        assert!(bad.released.is_empty());
        let record = bad.malformed.unwrap();
        assert!(record.is_malformed());
        assert_eq!(record.message_id(), 1);
        assert_eq!(sequencer.last_released(), 0);

        let good = sequencer.on_frame(r#"{"M": []}"#, now);
        assert_eq!(released_ids(&good), vec![1]);
        assert_eq!(sequencer.malformed_frames(), 1);
        assert_eq!(sequencer.frames_received(), 2);
    }

    #[test]
    fn max_pending_skips_the_gap() {
        let mut sequencer = Sequencer::new(SequencerConfig {
            max_pending: Some(3),
            gap_timeout_ms: None,
        });
        let now = Utc::now();
        sequencer.on_frame(&frame_with_id(1), now);
        for id in [4, 5, 6] {
            assert!(sequencer.on_frame(&frame_with_id(id), now).released.is_empty());
        }

        let outcome = sequencer.on_frame(&frame_with_id(7), now);
        assert_eq!(outcome.skipped, Some(Gap { from: 2, to: 3 }));
        assert_eq!(outcome.skipped.as_ref().map(Gap::missing), Some(2));
        assert_eq!(released_ids(&outcome), vec![4, 5, 6, 7]);
        assert_eq!(sequencer.gaps_skipped(), 1);

        // The skipped ids are now behind last_released and count as duplicates.
        assert!(sequencer.on_frame(&frame_with_id(2), now).duplicate);
    }

    #[test]
    fn gap_timeout_skips_the_gap() {
        let mut sequencer = Sequencer::new(SequencerConfig {
            max_pending: None,
            gap_timeout_ms: Some(1_000),
        });
        let start = Utc::now();
        sequencer.on_frame(&frame_with_id(1), start);
        assert!(sequencer.on_frame(&frame_with_id(3), start).released.is_empty());

        let still_waiting = sequencer.on_frame(&frame_with_id(4), start + Duration::milliseconds(500));
        assert!(still_waiting.skipped.is_none());

        let outcome = sequencer.on_frame(&frame_with_id(5), start + Duration::milliseconds(1_500));
        assert_eq!(outcome.skipped, Some(Gap { from: 2, to: 2 }));
        assert_eq!(released_ids(&outcome), vec![3, 4, 5]);
    }

    #[test]
    fn released_envelopes_keep_their_sub_messages() {
        let mut sequencer = Sequencer::with_defaults();
        let outcome = sequencer.on_frame(&frame_with_id(1), Utc::now());
        let envelope = &outcome.released[0];
        assert_eq!(envelope.sub_messages().len(), 1);
        assert_eq!(envelope.sub_messages()[0].topic, "LapCount");
        assert_eq!(envelope.frame()["MessageId"], 1);
    }
}

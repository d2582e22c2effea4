//! The ingest path from raw frame to snapshot and history.
//!
//! ```text
//! frame text --> Sequencer --> released envelopes --> Aggregator --> observer
//!                    |                   |
//!                    +-- malformed ------+--> PersistenceBuffer --> Journal
//! ```
//!
//! Everything here runs synchronously on the controller task.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pitwall_core::{Aggregator, FeedConfig, FeedObserver, MergeTable, Sequencer, Snapshot};
use pitwall_store::{FlushBatch, PersistenceBuffer, StoreError};
use pitwall_types::{ErrorKind, ErrorReport, FrameRecord};
use tracing::{info, warn};

/// Sequencer, aggregator, and persistence buffer for one client.
#[derive(Debug)]
pub struct IngestSession {
    sequencer: Sequencer,
    aggregator: Aggregator,
    buffer: PersistenceBuffer,
    progress_every: u64,
}

impl IngestSession {
    /// Create a session writing its history to `buffer`.
    pub fn new(config: &FeedConfig, buffer: PersistenceBuffer) -> Self {
        Self {
            sequencer: Sequencer::new(config.sequencer.clone()),
            aggregator: Aggregator::new(MergeTable::default()),
            buffer,
            progress_every: config.logging.progress_every,
        }
    }

    /// Sequence one frame and apply whatever it releases.
    pub fn ingest(&mut self, text: &str, received_at: DateTime<Utc>, observer: &mut dyn FeedObserver) {
        let outcome = self.sequencer.on_frame(text, received_at);

        if let Some(record) = outcome.malformed {
            let report = match &record {
                FrameRecord::Malformed { message_id, error, .. } => ErrorReport::now(
                    ErrorKind::Parse,
                    format!("frame {message_id} could not be parsed: {error}"),
                ),
                FrameRecord::Accepted { .. } => ErrorReport::now(ErrorKind::Parse, "frame could not be parsed"),
            };
            self.buffer.record(record);
            observer.on_error(&report);
        }

        if let Some(gap) = outcome.skipped {
            observer.on_error(&ErrorReport::now(
                ErrorKind::SequencingGap,
                format!("skipped {} missing delivery ids ({}..={})", gap.missing(), gap.from, gap.to),
            ));
        }

        for envelope in outcome.released {
            let envelope = Arc::new(envelope);
            self.buffer.record(envelope.to_record());
            self.aggregator.apply(&envelope, observer);
        }

        let frames = self.sequencer.frames_received();
        if self.progress_every > 0 && frames.checked_rem(self.progress_every) == Some(0) {
            info!(
                frames,
                last_released = self.sequencer.last_released(),
                pending = self.sequencer.pending_len(),
                duplicates = self.sequencer.duplicates_dropped(),
                malformed = self.sequencer.malformed_frames(),
                "ingest progress"
            );
        }
    }

    /// Take the pending history entries and the current snapshot for a
    /// flush, or `None` when nothing is pending.
    pub fn begin_flush(&mut self) -> Option<FlushBatch> {
        let snapshot = Arc::clone(self.aggregator.snapshot());
        self.buffer.take_batch(Some(snapshot))
    }

    /// Settle a written batch. A failure is reported to `observer`; entries
    /// that never reached the append log are queued for the next flush.
    pub fn finish_flush(
        &mut self,
        batch: FlushBatch,
        result: Result<usize, StoreError>,
        observer: &mut dyn FeedObserver,
    ) {
        if let Err(e) = self.buffer.complete(batch, result) {
            warn!(error = %e, pending = self.buffer.pending_len(), "flush failed");
            observer.on_error(&ErrorReport::now(ErrorKind::Persistence, e.to_string()));
        }
    }

    /// The current snapshot.
    pub const fn snapshot(&self) -> &Arc<Snapshot> {
        self.aggregator.snapshot()
    }

    /// The sequencer, for diagnostics.
    pub const fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// The persistence buffer, for diagnostics.
    pub const fn buffer(&self) -> &PersistenceBuffer {
        &self.buffer
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use pitwall_store::Journal;
    use pitwall_types::Envelope;
    use serde_json::{Value, json};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        topics: Vec<String>,
        snapshots: Vec<u64>,
        errors: Vec<ErrorKind>,
    }

    impl FeedObserver for Recorder {
        fn on_topic(&mut self, topic: &str, _payload: &Value) {
            self.topics.push(topic.to_owned());
        }

        fn on_snapshot(&mut self, _snapshot: &Arc<Snapshot>, envelope: &Arc<Envelope>) {
            self.snapshots.push(envelope.delivery_id());
        }

        fn on_error(&mut self, report: &ErrorReport) {
            self.errors.push(report.kind);
        }
    }

    fn session_in(dir: &std::path::Path) -> IngestSession {
        let buffer = PersistenceBuffer::open(Journal::new(
            dir.join("raw.json"),
            dir.join("live.json"),
            dir.join("snapshot.json"),
        ))
        .unwrap();
        IngestSession::new(&FeedConfig::default(), buffer)
    }

    fn flush(session: &mut IngestSession, observer: &mut dyn FeedObserver) {
        if let Some(mut batch) = session.begin_flush() {
            let result = batch.write();
            session.finish_flush(batch, result, observer);
        }
    }

    fn frame(id: u64, lap: u64) -> String {
        json!({
            "MessageId": id,
            "M": [{"H": "Streaming", "M": "LapCount", "A": [{"CurrentLap": lap}]}]
        })
        .to_string()
    }

    #[test]
    fn out_of_order_frames_reach_the_snapshot_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(dir.path());
        let mut recorder = Recorder::default();

        for (id, lap) in [(2, 2), (1, 1), (3, 3)] {
            session.ingest(&frame(id, lap), Utc::now(), &mut recorder);
        }

        assert_eq!(recorder.snapshots, vec![1, 2, 3]);
        assert_eq!(session.snapshot().value("LapCount").unwrap()["CurrentLap"], 3);
        assert_eq!(session.buffer().pending_len(), 3);
    }

    #[test]
    fn weather_and_lap_count_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(dir.path());
        let mut recorder = Recorder::default();

        let text = json!({"M": [
            {"H": "Streaming", "M": "WeatherData", "A": [{"AirTemp": 27}]},
            {"H": "Streaming", "M": "LapCount", "A": [{"CurrentLap": 5}]}
        ]})
        .to_string();
        session.ingest(&text, Utc::now(), &mut recorder);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.value("WeatherData").unwrap()["AirTemp"], 27);
        assert_eq!(snapshot.value("LapCount").unwrap()["CurrentLap"], 5);
        assert_eq!(recorder.topics, vec!["WeatherData", "LapCount"]);
        assert_eq!(recorder.snapshots.len(), 1);
    }

    #[test]
    fn malformed_frame_is_reported_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(dir.path());
        let mut recorder = Recorder::default();

        session.ingest("not json", Utc::now(), &mut recorder);
        assert_eq!(recorder.errors, vec![ErrorKind::Parse]);
        assert!(recorder.snapshots.is_empty());
        assert_eq!(session.buffer().pending_len(), 1);

        flush(&mut session, &mut recorder);
        let log = session.buffer().journal().read_log().unwrap().unwrap();
        assert!(log.messages[0].is_malformed());
    }

    #[test]
    fn flush_persists_released_envelopes_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(dir.path());
        let mut recorder = Recorder::default();

        session.ingest(&frame(1, 1), Utc::now(), &mut recorder);
        session.ingest(&frame(3, 3), Utc::now(), &mut recorder);
        flush(&mut session, &mut recorder);
        flush(&mut session, &mut recorder);

        // Envelope 3 is still waiting for 2 and is not persisted yet.
        let log = session.buffer().journal().read_log().unwrap().unwrap();
        let ids: Vec<u64> = log.messages.iter().map(FrameRecord::message_id).collect();
        assert_eq!(ids, vec![1]);
        assert!(recorder.errors.is_empty());
    }

    #[test]
    fn failed_flush_is_reported_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(dir.path());
        let mut recorder = Recorder::default();
        session.ingest(&frame(1, 1), Utc::now(), &mut recorder);

        let raw = session.buffer().journal().raw_path().to_path_buf();
        std::fs::remove_file(&raw).unwrap();
        std::fs::create_dir(&raw).unwrap();
        flush(&mut session, &mut recorder);
        assert_eq!(recorder.errors, vec![ErrorKind::Persistence]);
        assert_eq!(session.buffer().pending_len(), 1);

        std::fs::remove_dir(&raw).unwrap();
        flush(&mut session, &mut recorder);
        assert_eq!(session.buffer().pending_len(), 0);
        assert_eq!(session.buffer().total_flushed(), 1);
    }
}

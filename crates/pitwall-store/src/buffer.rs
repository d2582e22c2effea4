//! In-memory accumulation of history entries between flushes.

use std::sync::Arc;

use chrono::Utc;
use pitwall_core::Snapshot;
use pitwall_types::FrameRecord;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::journal::Journal;

/// Accumulates entries and flushes them to the [`Journal`].
///
/// A flush takes the pending entries as a [`FlushBatch`]. A batch whose
/// append fails is put back, so the next flush retries it together with
/// whatever was recorded in between.
#[derive(Debug)]
pub struct PersistenceBuffer {
    journal: Journal,
    pending: Vec<FrameRecord>,
    total_recorded: u64,
    total_flushed: u64,
}

impl PersistenceBuffer {
    /// Start a fresh session on `journal`, overwriting any previous files.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the journal files cannot be initialized.
    pub fn open(journal: Journal) -> Result<Self, StoreError> {
        journal.initialize(Utc::now())?;
        info!(
            raw = %journal.raw_path().display(),
            live = %journal.live_path().display(),
            "data files initialized"
        );
        Ok(Self {
            journal,
            pending: Vec::new(),
            total_recorded: 0,
            total_flushed: 0,
        })
    }

    /// Queue an entry for the next flush.
    pub fn record(&mut self, record: FrameRecord) {
        self.total_recorded = self.total_recorded.saturating_add(1);
        self.pending.push(record);
    }

    /// Entries waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Entries recorded since the buffer was opened.
    pub const fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    /// Entries written to the append log since the buffer was opened.
    pub const fn total_flushed(&self) -> u64 {
        self.total_flushed
    }

    /// The journal being written.
    pub const fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Take every pending entry for a flush, together with the snapshot to
    /// write alongside it. Returns `None` when nothing is pending, so
    /// repeated flushes never duplicate entries.
    ///
    /// Entries recorded while the batch is being written are queued behind
    /// it. Hand the batch back with [`PersistenceBuffer::complete`].
    pub fn take_batch(&mut self, snapshot: Option<Arc<Snapshot>>) -> Option<FlushBatch> {
        if self.pending.is_empty() {
            debug!("nothing to flush");
            return None;
        }
        Some(FlushBatch {
            journal: self.journal.clone(),
            entries: std::mem::take(&mut self.pending),
            total_recorded: self.total_recorded,
            snapshot,
            appended: false,
        })
    }

    /// Settle a batch after [`FlushBatch::write`].
    ///
    /// If the append log was not written, the batch's entries go back to the
    /// front of the queue and are retried by the next flush. Once the append
    /// log has been written they are gone, even if updating the latest
    /// record or the snapshot file failed afterwards.
    ///
    /// # Errors
    ///
    /// Returns the write error unchanged.
    pub fn complete(
        &mut self,
        batch: FlushBatch,
        result: Result<usize, StoreError>,
    ) -> Result<usize, StoreError> {
        if batch.appended {
            let flushed = u64::try_from(batch.entries.len()).unwrap_or(u64::MAX);
            self.total_flushed = self.total_flushed.saturating_add(flushed);
        } else {
            let mut entries = batch.entries;
            entries.append(&mut self.pending);
            self.pending = entries;
        }

        if let Ok(saved) = result {
            info!(saved, total = self.total_recorded, "saved messages");
        }
        result
    }
}

/// Entries taken out of a [`PersistenceBuffer`] for one flush.
///
/// Writing is blocking file I/O, so async callers run
/// [`FlushBatch::write`] on a blocking thread.
#[derive(Debug)]
pub struct FlushBatch {
    journal: Journal,
    entries: Vec<FrameRecord>,
    total_recorded: u64,
    snapshot: Option<Arc<Snapshot>>,
    appended: bool,
}

impl FlushBatch {
    /// Entries in the batch.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Append the entries to the log, then overwrite the latest record and
    /// the snapshot file. Returns how many entries were appended.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any journal file cannot be written.
    pub fn write(&mut self) -> Result<usize, StoreError> {
        let Some(last) = self.entries.last() else {
            return Ok(0);
        };

        let now = Utc::now();
        self.journal.append(&self.entries, self.total_recorded, now)?;
        self.appended = true;

        self.journal.write_latest(last, self.total_recorded, now)?;
        if let Some(snapshot) = &self.snapshot {
            self.journal.write_snapshot(&snapshot.to_json())?;
        }
        Ok(self.entries.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::fs;
    use std::path::Path;

    use serde_json::{Value, json};

    use super::*;

    fn open_in(dir: &Path) -> PersistenceBuffer {
        PersistenceBuffer::open(Journal::new(
            dir.join("raw.json"),
            dir.join("live.json"),
            dir.join("snapshot.json"),
        ))
        .unwrap()
    }

    fn flush(buffer: &mut PersistenceBuffer, snapshot: Option<Arc<Snapshot>>) -> Result<usize, StoreError> {
        match buffer.take_batch(snapshot) {
            Some(mut batch) => {
                let result = batch.write();
                buffer.complete(batch, result)
            }
            None => Ok(0),
        }
    }

    fn accepted(id: u64) -> FrameRecord {
        FrameRecord::Accepted {
            timestamp: Utc::now(),
            message_id: id,
            data: json!({"MessageId": id}),
        }
    }

    #[test]
    fn flush_writes_pending_entries_and_clears_them() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = open_in(dir.path());
        buffer.record(accepted(1));
        buffer.record(accepted(2));

        assert_eq!(flush(&mut buffer, None).unwrap(), 2);
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.total_flushed(), 2);

        let log = buffer.journal().read_log().unwrap().unwrap();
        assert_eq!(log.messages.len(), 2);
        assert_eq!(log.total_messages, 2);

        let latest = buffer.journal().read_latest().unwrap().unwrap();
        assert_eq!(latest.current.unwrap().message_id(), 2);
        assert_eq!(latest.message_count, Some(2));
    }

    #[test]
    fn flushing_twice_without_new_entries_adds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = open_in(dir.path());
        buffer.record(accepted(1));

        assert_eq!(flush(&mut buffer, None).unwrap(), 1);
        assert_eq!(flush(&mut buffer, None).unwrap(), 0);

        let log = buffer.journal().read_log().unwrap().unwrap();
        assert_eq!(log.messages.len(), 1);
    }

    #[test]
    fn empty_buffer_leaves_files_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = open_in(dir.path());
        assert_eq!(flush(&mut buffer, Some(Arc::new(Snapshot::new()))).unwrap(), 0);
        assert!(!buffer.journal().snapshot_path().exists());

        let live: Value =
            serde_json::from_slice(&fs::read(buffer.journal().live_path()).unwrap()).unwrap();
        assert_eq!(live, json!({"current": null}));
    }

    #[test]
    fn flush_writes_the_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = open_in(dir.path());
        buffer.record(accepted(1));
        flush(&mut buffer, Some(Arc::new(Snapshot::new()))).unwrap();

        let snapshot: Value =
            serde_json::from_slice(&fs::read(buffer.journal().snapshot_path()).unwrap()).unwrap();
        assert!(snapshot.get("topics").is_some());
    }

    #[test]
    fn failed_flush_keeps_entries_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = open_in(dir.path());
        buffer.record(accepted(1));

        // A directory where the log should be makes the read fail.
        let raw = buffer.journal().raw_path().to_path_buf();
        fs::remove_file(&raw).unwrap();
        fs::create_dir(&raw).unwrap();
        assert!(flush(&mut buffer, None).is_err());
        assert_eq!(buffer.pending_len(), 1);

        fs::remove_dir(&raw).unwrap();
        buffer.record(accepted(2));
        assert_eq!(flush(&mut buffer, None).unwrap(), 2);

        let log = buffer.journal().read_log().unwrap().unwrap();
        let ids: Vec<u64> = log.messages.iter().map(FrameRecord::message_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn malformed_entries_are_persisted_with_raw_text() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = open_in(dir.path());
        buffer.record(FrameRecord::Malformed {
            timestamp: Utc::now(),
            message_id: 7,
            error: "invalid JSON".to_owned(),
            raw: "{oops".to_owned(),
        });
        flush(&mut buffer, None).unwrap();

        let raw: Value =
            serde_json::from_slice(&fs::read(buffer.journal().raw_path()).unwrap()).unwrap();
        assert_eq!(raw["messages"][0]["raw"], "{oops");
        assert_eq!(raw["messages"][0]["messageId"], 7);
    }

    #[test]
    fn entries_recorded_during_a_failed_write_queue_behind_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = open_in(dir.path());
        buffer.record(accepted(1));

        let mut batch = buffer.take_batch(None).unwrap();
        assert_eq!(batch.entry_count(), 1);
        assert_eq!(buffer.pending_len(), 0);
        buffer.record(accepted(2));

        let raw = buffer.journal().raw_path().to_path_buf();
        fs::remove_file(&raw).unwrap();
        fs::create_dir(&raw).unwrap();
        let result = batch.write();
        assert!(buffer.complete(batch, result).is_err());
        assert_eq!(buffer.total_flushed(), 0);

        fs::remove_dir(&raw).unwrap();
        assert_eq!(flush(&mut buffer, None).unwrap(), 2);
        let log = buffer.journal().read_log().unwrap().unwrap();
        let ids: Vec<u64> = log.messages.iter().map(FrameRecord::message_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn appended_entries_are_not_retried_when_the_snapshot_write_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = open_in(dir.path());
        buffer.record(accepted(1));
        fs::create_dir(buffer.journal().snapshot_path()).unwrap();

        assert!(flush(&mut buffer, Some(Arc::new(Snapshot::new()))).is_err());
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.total_flushed(), 1);
        assert_eq!(buffer.journal().read_log().unwrap().unwrap().messages.len(), 1);
    }
}

//! On-disk layout of the durable history.
//!
//! | File | Content |
//! |------|---------|
//! | raw | [`AppendLog`]: every recorded entry since the session started |
//! | live | [`LatestRecord`]: the most recent entry and the cumulative count |
//! | snapshot | the whole merged snapshot as of the last flush |
//!
//! Every write goes to a temporary sibling first and is then renamed over
//! the target, so a reader never sees a half-written document.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pitwall_core::config::PersistenceConfig;
use pitwall_types::FrameRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// The append log document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendLog {
    /// When the log was started.
    pub start_time: DateTime<Utc>,
    /// Every recorded entry, oldest first.
    pub messages: Vec<FrameRecord>,
    /// When entries were last appended.
    pub last_update: Option<DateTime<Utc>>,
    /// Entries recorded in this session.
    #[serde(default)]
    pub total_messages: u64,
}

impl AppendLog {
    /// An empty log started at `start_time`.
    pub const fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            messages: Vec::new(),
            last_update: None,
            total_messages: 0,
        }
    }
}

/// The latest-record document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestRecord {
    /// The most recently recorded entry, `null` before the first flush.
    pub current: Option<FrameRecord>,
    /// When the record was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Entries recorded in this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u64>,
}

impl LatestRecord {
    /// The record written before anything has been flushed.
    pub const fn empty() -> Self {
        Self {
            current: None,
            timestamp: None,
            message_count: None,
        }
    }
}

/// Paths of the three journal files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Journal {
    raw_path: PathBuf,
    live_path: PathBuf,
    snapshot_path: PathBuf,
}

impl Journal {
    /// A journal over explicit file paths.
    pub const fn new(raw_path: PathBuf, live_path: PathBuf, snapshot_path: PathBuf) -> Self {
        Self {
            raw_path,
            live_path,
            snapshot_path,
        }
    }

    /// A journal laid out as configured.
    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self::new(config.raw_path(), config.live_path(), config.snapshot_path())
    }

    /// Path of the append log.
    pub fn raw_path(&self) -> &Path {
        &self.raw_path
    }

    /// Path of the latest record.
    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    /// Path of the snapshot file.
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Start a fresh session: an empty append log and a `{current: null}`
    /// latest record. Parent directories are created as needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a directory or file cannot be written.
    pub fn initialize(&self, start_time: DateTime<Utc>) -> Result<(), StoreError> {
        for path in [&self.raw_path, &self.live_path, &self.snapshot_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }
        write_json(&self.raw_path, &AppendLog::new(start_time))?;
        write_json(&self.live_path, &LatestRecord::empty())?;
        Ok(())
    }

    /// Read the append log, or `None` if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be read or parsed.
    pub fn read_log(&self) -> Result<Option<AppendLog>, StoreError> {
        read_json(&self.raw_path)
    }

    /// Read the latest record, or `None` if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be read or parsed.
    pub fn read_latest(&self) -> Result<Option<LatestRecord>, StoreError> {
        read_json(&self.live_path)
    }

    /// Append `records` to the log and update its counters.
    ///
    /// A missing log is started over at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the log cannot be read, parsed, or written.
    pub fn append(
        &self,
        records: &[FrameRecord],
        total_messages: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut log = self.read_log()?.unwrap_or_else(|| AppendLog::new(now));
        log.messages.extend_from_slice(records);
        log.last_update = Some(now);
        log.total_messages = total_messages;
        write_json(&self.raw_path, &log)
    }

    /// Overwrite the latest record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be written.
    pub fn write_latest(
        &self,
        current: &FrameRecord,
        message_count: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let record = LatestRecord {
            current: Some(current.clone()),
            timestamp: Some(now),
            message_count: Some(message_count),
        };
        write_json(&self.live_path, &record)
    }

    /// Overwrite the snapshot file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be written.
    pub fn write_snapshot(&self, snapshot: &Value) -> Result<(), StoreError> {
        write_json(&self.snapshot_path, snapshot)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use super::*;

    fn journal_in(dir: &Path) -> Journal {
        Journal::new(
            dir.join("raw.json"),
            dir.join("live.json"),
            dir.join("snapshot.json"),
        )
    }

    fn accepted(id: u64) -> FrameRecord {
        FrameRecord::Accepted {
            timestamp: Utc::now(),
            message_id: id,
            data: json!({"M": []}),
        }
    }

    #[test]
    fn initialize_writes_fresh_documents() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(dir.path());
        journal.initialize(Utc::now()).unwrap();

        let log = journal.read_log().unwrap().unwrap();
        assert!(log.messages.is_empty());
        assert!(log.last_update.is_none());

        let live: Value =
            serde_json::from_slice(&fs::read(journal.live_path()).unwrap()).unwrap();
        assert_eq!(live, json!({"current": null}));
    }

    #[test]
    fn initialize_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(&dir.path().join("nested").join("data"));
        journal.initialize(Utc::now()).unwrap();
        assert!(journal.raw_path().exists());
    }

    #[test]
    fn append_extends_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(dir.path());
        journal.initialize(Utc::now()).unwrap();

        journal.append(&[accepted(1), accepted(2)], 2, Utc::now()).unwrap();
        journal.append(&[accepted(3)], 3, Utc::now()).unwrap();

        let log = journal.read_log().unwrap().unwrap();
        let ids: Vec<u64> = log.messages.iter().map(FrameRecord::message_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(log.total_messages, 3);
        assert!(log.last_update.is_some());
    }

    #[test]
    fn append_restarts_a_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(dir.path());
        journal.append(&[accepted(1)], 1, Utc::now()).unwrap();
        assert_eq!(journal.read_log().unwrap().unwrap().messages.len(), 1);
    }

    #[test]
    fn raw_file_uses_camel_case_fields() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(dir.path());
        journal.initialize(Utc::now()).unwrap();
        journal.append(&[accepted(9)], 1, Utc::now()).unwrap();

        let raw: Value = serde_json::from_slice(&fs::read(journal.raw_path()).unwrap()).unwrap();
        assert!(raw.get("startTime").is_some());
        assert!(raw.get("lastUpdate").is_some());
        assert_eq!(raw["totalMessages"], 1);
        assert_eq!(raw["messages"][0]["messageId"], 9);
    }

    #[test]
    fn latest_record_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(dir.path());
        journal.write_latest(&accepted(4), 4, Utc::now()).unwrap();

        let latest = journal.read_latest().unwrap().unwrap();
        assert_eq!(latest.current.unwrap().message_id(), 4);
        assert_eq!(latest.message_count, Some(4));
    }

    #[test]
    fn corrupt_log_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(dir.path());
        fs::write(journal.raw_path(), b"{ not json").unwrap();
        assert!(matches!(
            journal.read_log(),
            Err(StoreError::Serialization(_))
        ));
    }
}

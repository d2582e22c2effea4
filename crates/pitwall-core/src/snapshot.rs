//! The reconstructed live state.
//!
//! A [`Snapshot`] maps every topic seen so far to its merged state. It
//! survives reconnects: a new baseline from the feed flows through the
//! normal merge rules instead of resetting it.
//!
//! Only the [`Aggregator`](crate::Aggregator) mutates a snapshot; everyone
//! else receives an `Arc<Snapshot>` and reads.
//!
//! Topics are stored behind their own `Arc`, and append-only logs are kept
//! in sealed chunks of [`LOG_CHUNK`] entries. Copying a snapshot that an
//! observer still holds therefore shares every untouched topic and every
//! sealed chunk; only the topic being merged is copied.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::merge::{self, ENTITY_BLOCK, MergeRule};

/// One entry of an append-only topic log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Receipt time of the envelope that carried the entry.
    pub received_at: DateTime<Utc>,
    /// The payload as delivered.
    pub payload: Value,
}

/// Entries per sealed chunk of an [`EntryLog`].
pub const LOG_CHUNK: usize = 64;

/// Append-only log of topic entries, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryLog {
    sealed: Vec<Arc<[LogEntry]>>,
    tail: Vec<LogEntry>,
}

impl EntryLog {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.sealed
            .iter()
            .map(|chunk| chunk.len())
            .sum::<usize>()
            .saturating_add(self.tail.len())
    }

    /// Whether the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.tail.is_empty() && self.sealed.is_empty()
    }

    /// Entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.sealed
            .iter()
            .flat_map(|chunk| chunk.iter())
            .chain(self.tail.iter())
    }

    /// Entry at `index`, counting from the oldest.
    pub fn get(&self, index: usize) -> Option<&LogEntry> {
        self.iter().nth(index)
    }

    /// The newest entry.
    pub fn last(&self) -> Option<&LogEntry> {
        self.tail
            .last()
            .or_else(|| self.sealed.last().and_then(|chunk| chunk.last()))
    }

    fn push(&mut self, entry: LogEntry) {
        self.tail.push(entry);
        if self.tail.len() >= LOG_CHUNK {
            let chunk: Arc<[LogEntry]> = Arc::from(std::mem::take(&mut self.tail));
            self.sealed.push(chunk);
        }
    }
}

/// Stored state of one topic.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicState {
    /// Replace and default topics: the latest payload.
    Value(Value),
    /// Shallow-merge topics: the accumulated object.
    Merged(Map<String, Value>),
    /// Append topics: every entry received, oldest first.
    Log(EntryLog),
    /// Stamped topics: the latest payload and when it was stored.
    Stamped {
        /// The latest payload.
        payload: Value,
        /// When the payload was stored.
        received_at: DateTime<Utc>,
    },
}

impl TopicState {
    /// JSON view of the stored state.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Merged(fields) => Value::Object(fields.clone()),
            Self::Log(entries) => Value::Array(entries.iter().map(log_entry_json).collect()),
            Self::Stamped {
                payload,
                received_at,
            } => serde_json::json!({
                "payload": payload,
                "receivedAt": received_at,
            }),
        }
    }
}

/// Merged state of every topic seen in a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    topics: BTreeMap<String, Arc<TopicState>>,
    envelopes_applied: u64,
    last_delivery_id: Option<u64>,
    updated_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// An empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored state of `topic`.
    pub fn topic(&self, topic: &str) -> Option<&TopicState> {
        self.topics.get(topic).map(Arc::as_ref)
    }

    /// JSON view of `topic`.
    pub fn value(&self, topic: &str) -> Option<Value> {
        self.topics.get(topic).map(|state| state.to_json())
    }

    /// Record of entity `id` in a shallow-merge topic.
    pub fn entity(&self, topic: &str, id: &str) -> Option<&Map<String, Value>> {
        match self.topic(topic)? {
            TopicState::Merged(fields) => fields.get(ENTITY_BLOCK)?.get(id)?.as_object(),
            _ => None,
        }
    }

    /// Entries of an append-only topic.
    pub fn log(&self, topic: &str) -> Option<&EntryLog> {
        match self.topic(topic)? {
            TopicState::Log(entries) => Some(entries),
            _ => None,
        }
    }

    /// Names of every topic stored so far.
    pub fn topic_names(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    /// Number of topics stored.
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Whether no topic has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Envelopes applied since the snapshot was created.
    pub const fn envelopes_applied(&self) -> u64 {
        self.envelopes_applied
    }

    /// Delivery id of the last applied envelope.
    pub const fn last_delivery_id(&self) -> Option<u64> {
        self.last_delivery_id
    }

    /// Receipt time of the last applied envelope.
    pub const fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// The whole snapshot as a JSON document.
    pub fn to_json(&self) -> Value {
        let topics: Map<String, Value> = self
            .topics
            .iter()
            .map(|(name, state)| (name.clone(), state.to_json()))
            .collect();
        serde_json::json!({
            "lastDeliveryId": self.last_delivery_id,
            "envelopesApplied": self.envelopes_applied,
            "updatedAt": self.updated_at,
            "topics": topics,
        })
    }

    /// Merge one payload into `topic` and return what the per-topic
    /// notification carries.
    pub(crate) fn merge(
        &mut self,
        topic: &str,
        rule: MergeRule,
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> Value {
        match rule {
            MergeRule::Replace | MergeRule::Default => {
                self.topics.insert(
                    topic.to_owned(),
                    Arc::new(TopicState::Value(payload.clone())),
                );
                payload.clone()
            }
            MergeRule::Stamped => {
                let state = TopicState::Stamped {
                    payload: payload.clone(),
                    received_at: Utc::now(),
                };
                let view = state.to_json();
                self.topics.insert(topic.to_owned(), Arc::new(state));
                view
            }
            MergeRule::Append => {
                let entry = LogEntry {
                    received_at,
                    payload: payload.clone(),
                };
                let view = log_entry_json(&entry);
                let state = self
                    .topics
                    .entry(topic.to_owned())
                    .or_insert_with(|| Arc::new(TopicState::Log(EntryLog::default())));
                match Arc::make_mut(state) {
                    TopicState::Log(entries) => entries.push(entry),
                    other => {
                        let mut entries = EntryLog::default();
                        entries.push(entry);
                        *other = TopicState::Log(entries);
                    }
                }
                view
            }
            MergeRule::ShallowMerge => self.shallow_merge(topic, payload),
        }
    }

    /// Record that an envelope has been fully applied.
    pub(crate) fn mark_applied(&mut self, delivery_id: u64, received_at: DateTime<Utc>) {
        self.envelopes_applied = self.envelopes_applied.saturating_add(1);
        self.last_delivery_id = Some(delivery_id);
        self.updated_at = Some(received_at);
    }

    fn shallow_merge(&mut self, topic: &str, payload: &Value) -> Value {
        let Value::Object(update) = payload else {
            self.topics.insert(
                topic.to_owned(),
                Arc::new(TopicState::Value(payload.clone())),
            );
            return payload.clone();
        };

        let state = Arc::make_mut(
            self.topics
                .entry(topic.to_owned())
                .or_insert_with(|| Arc::new(TopicState::Merged(Map::new()))),
        );
        if !matches!(state, TopicState::Merged(_)) {
            *state = TopicState::Merged(Map::new());
        }
        match state {
            TopicState::Merged(fields) => {
                merge::shallow_merge(fields, update);
                Value::Object(fields.clone())
            }
            _ => Value::Null,
        }
    }

    /// Shared handle of `topic`'s stored state.
    #[cfg(test)]
    pub(crate) fn topic_handle(&self, topic: &str) -> Option<&Arc<TopicState>> {
        self.topics.get(topic)
    }
}

fn log_entry_json(entry: &LogEntry) -> Value {
    serde_json::to_value(entry).unwrap_or(Value::Null)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::arithmetic_side_effects
)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn replace_overwrites_the_stored_value() {
        let mut snapshot = Snapshot::new();
        let now = Utc::now();
        snapshot.merge("WeatherData", MergeRule::Replace, &json!({"AirTemp": 27, "Rainfall": "0"}), now);
        snapshot.merge("WeatherData", MergeRule::Replace, &json!({"AirTemp": 28}), now);
        assert_eq!(snapshot.value("WeatherData"), Some(json!({"AirTemp": 28})));
    }

    #[test]
    fn shallow_merge_accumulates_fields() {
        let mut snapshot = Snapshot::new();
        let now = Utc::now();
        snapshot.merge("TimingStats", MergeRule::ShallowMerge, &json!({"a": 1}), now);
        let view = snapshot.merge("TimingStats", MergeRule::ShallowMerge, &json!({"b": 2}), now);
        assert_eq!(view, json!({"a": 1, "b": 2}));
        assert_eq!(snapshot.value("TimingStats"), Some(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn entity_lookup_reads_the_entity_block() {
        let mut snapshot = Snapshot::new();
        let now = Utc::now();
        snapshot.merge(
            "TimingData",
            MergeRule::ShallowMerge,
            &json!({"Lines": {"1": {"Position": "1"}, "44": {"Position": "2"}}}),
            now,
        );
        snapshot.merge(
            "TimingData",
            MergeRule::ShallowMerge,
            &json!({"Lines": {"44": {"InPit": true}}}),
            now,
        );

        assert_eq!(snapshot.entity("TimingData", "1").unwrap()["Position"], "1");
        let hamilton = snapshot.entity("TimingData", "44").unwrap();
        assert_eq!(hamilton["Position"], "2");
        assert_eq!(hamilton["InPit"], true);
        assert!(snapshot.entity("TimingData", "99").is_none());
    }

    #[test]
    fn append_never_drops_entries() {
        let mut snapshot = Snapshot::new();
        let now = Utc::now();
        let mut previous = 0;
        for i in 0..10 {
            let view = snapshot.merge("RaceControlMessages", MergeRule::Append, &json!({"Message": i}), now);
            assert_eq!(view["payload"]["Message"], i);
            let len = snapshot.log("RaceControlMessages").unwrap().len();
            assert!(len > previous);
            previous = len;
        }
        let log = snapshot.log("RaceControlMessages").unwrap();
        assert_eq!(log.get(0).unwrap().payload, json!({"Message": 0}));
        assert_eq!(log.last().unwrap().payload, json!({"Message": 9}));
    }

    #[test]
    fn copied_log_shares_sealed_chunks() {
        let mut snapshot = Snapshot::new();
        let now = Utc::now();
        for i in 0..LOG_CHUNK + 3 {
            snapshot.merge("TeamRadio", MergeRule::Append, &json!({"Capture": i}), now);
        }

        let held = snapshot.clone();
        snapshot.merge("TeamRadio", MergeRule::Append, &json!({"Capture": "new"}), now);

        let (Some(TopicState::Log(before)), Some(TopicState::Log(after))) =
            (held.topic("TeamRadio"), snapshot.topic("TeamRadio"))
        else {
            panic!("TeamRadio is not a log");
        };
        assert_eq!(before.len(), LOG_CHUNK + 3);
        assert_eq!(after.len(), LOG_CHUNK + 4);
        assert!(Arc::ptr_eq(&before.sealed[0], &after.sealed[0]));
        assert_eq!(
            after.iter().map(|e| e.payload["Capture"].clone()).nth(LOG_CHUNK),
            Some(json!(LOG_CHUNK))
        );
    }

    #[test]
    fn stamped_value_carries_a_timestamp() {
        let mut snapshot = Snapshot::new();
        let view = snapshot.merge("Heartbeat", MergeRule::Stamped, &json!({"Utc": "x"}), Utc::now());
        assert_eq!(view["payload"], json!({"Utc": "x"}));
        assert!(view["receivedAt"].is_string());
        assert!(matches!(snapshot.topic("Heartbeat"), Some(TopicState::Stamped { .. })));
    }

    #[test]
    fn whole_snapshot_json_lists_topics() {
        let mut snapshot = Snapshot::new();
        let now = Utc::now();
        snapshot.merge("LapCount", MergeRule::Replace, &json!({"CurrentLap": 5}), now);
        snapshot.mark_applied(3, now);

        let json = snapshot.to_json();
        assert_eq!(json["lastDeliveryId"], 3);
        assert_eq!(json["envelopesApplied"], 1);
        assert_eq!(json["topics"]["LapCount"]["CurrentLap"], 5);
        assert_eq!(snapshot.topic_names().collect::<Vec<_>>(), vec!["LapCount"]);
    }
}

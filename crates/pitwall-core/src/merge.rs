//! Topic to merge-rule dispatch.
//!
//! Each topic is merged into the snapshot by one [`MergeRule`]. The
//! [`MergeTable`] maps topic names to rules; topics it does not name fall
//! back to [`MergeRule::Default`].

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Object key that holds per-competitor records in shallow-merge topics.
pub const ENTITY_BLOCK: &str = "Lines";

/// How a topic payload is combined with the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeRule {
    /// The payload replaces the stored value.
    Replace,
    /// Payload fields are merged into the stored object, and each entity in
    /// the [`ENTITY_BLOCK`] is merged into that entity's record.
    ShallowMerge,
    /// The payload is appended to an ordered log with its receipt time.
    Append,
    /// The payload replaces the stored value together with a fresh timestamp.
    Stamped,
    /// Unrecognised topic, stored verbatim.
    Default,
}

/// Mapping from topic name to merge rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTable {
    rules: HashMap<String, MergeRule>,
}

impl MergeTable {
    /// A table with no entries; every topic uses [`MergeRule::Default`].
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Assign `rule` to `topic`, replacing any previous entry.
    pub fn set(&mut self, topic: impl Into<String>, rule: MergeRule) {
        self.rules.insert(topic.into(), rule);
    }

    /// The rule for `topic`.
    pub fn rule_for(&self, topic: &str) -> MergeRule {
        self.rules.get(topic).copied().unwrap_or(MergeRule::Default)
    }
}

impl Default for MergeTable {
    /// Rules for the live timing topics.
    fn default() -> Self {
        let mut table = Self::empty();
        for topic in ["RaceControlMessages", "TeamRadio"] {
            table.set(topic, MergeRule::Append);
        }
        table.set("Heartbeat", MergeRule::Stamped);
        for topic in [
            "WeatherData",
            "TrackStatus",
            "SessionStatus",
            "LapCount",
            "SessionInfo",
            "ExtrapolatedClock",
            "SessionData",
        ] {
            table.set(topic, MergeRule::Replace);
        }
        for topic in [
            "TimingData",
            "TimingAppData",
            "TimingStats",
            "TopThree",
            "DriverList",
        ] {
            table.set(topic, MergeRule::ShallowMerge);
        }
        table
    }
}

/// Merge `update` into `target` field by field, last write wins.
///
/// The [`ENTITY_BLOCK`] field is merged one level deeper: each entity's
/// fields are merged into the stored entity, so fields and entities absent
/// from the update are kept.
pub fn shallow_merge(target: &mut Map<String, Value>, update: &Map<String, Value>) {
    for (key, value) in update {
        match (key.as_str(), value) {
            (ENTITY_BLOCK, Value::Object(entities)) => {
                let block = target
                    .entry(ENTITY_BLOCK)
                    .or_insert_with(|| Value::Object(Map::new()));
                if !block.is_object() {
                    *block = Value::Object(Map::new());
                }
                if let Value::Object(stored) = block {
                    merge_entities(stored, entities);
                }
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Merge each entity update into its stored record.
fn merge_entities(stored: &mut Map<String, Value>, updates: &Map<String, Value>) {
    for (id, update) in updates {
        match (stored.get_mut(id), update) {
            (Some(Value::Object(record)), Value::Object(fields)) => {
                for (field, value) in fields {
                    record.insert(field.clone(), value.clone());
                }
            }
            _ => {
                stored.insert(id.clone(), update.clone());
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn default_table_covers_live_timing_topics() {
        let table = MergeTable::default();
        assert_eq!(table.rule_for("WeatherData"), MergeRule::Replace);
        assert_eq!(table.rule_for("LapCount"), MergeRule::Replace);
        assert_eq!(table.rule_for("TimingData"), MergeRule::ShallowMerge);
        assert_eq!(table.rule_for("RaceControlMessages"), MergeRule::Append);
        assert_eq!(table.rule_for("Heartbeat"), MergeRule::Stamped);
        assert_eq!(table.rule_for("CarData.z"), MergeRule::Default);
        assert_eq!(table.rule_for("SomethingNew"), MergeRule::Default);
    }

    #[test]
    fn table_entries_can_be_overridden() {
        let mut table = MergeTable::empty();
        table.set("WeatherData", MergeRule::Append);
        table.set("WeatherData", MergeRule::Stamped);
        assert_eq!(table.rule_for("WeatherData"), MergeRule::Stamped);
        assert_eq!(table.rule_for("LapCount"), MergeRule::Default);
    }

    #[test]
    fn shallow_merge_keeps_absent_fields() {
        let mut target = object(json!({"a": 1}));
        shallow_merge(&mut target, &object(json!({"b": 2})));
        assert_eq!(Value::Object(target), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn shallow_merge_is_last_write_wins_per_field() {
        let mut target = object(json!({"a": 1, "b": 1}));
        shallow_merge(&mut target, &object(json!({"b": 2})));
        assert_eq!(Value::Object(target), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn entity_update_leaves_other_entities_untouched() {
        let mut target = object(json!({
            "Lines": {
                "1": {"Position": "1", "GapToLeader": ""},
                "44": {"Position": "2", "GapToLeader": "+1.2"}
            }
        }));
        shallow_merge(
            &mut target,
            &object(json!({"Lines": {"44": {"GapToLeader": "+0.9"}}})),
        );

        assert_eq!(
            target["Lines"]["1"],
            json!({"Position": "1", "GapToLeader": ""})
        );
        assert_eq!(
            target["Lines"]["44"],
            json!({"Position": "2", "GapToLeader": "+0.9"})
        );
    }

    #[test]
    fn new_entity_is_inserted() {
        let mut target = object(json!({"Lines": {"1": {"Position": "1"}}}));
        shallow_merge(&mut target, &object(json!({"Lines": {"16": {"Position": "3"}}})));
        assert_eq!(target["Lines"]["16"], json!({"Position": "3"}));
        assert_eq!(target["Lines"]["1"], json!({"Position": "1"}));
    }
}

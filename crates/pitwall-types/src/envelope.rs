//! Envelopes and their persisted form.
//!
//! An [`Envelope`] is one received push frame positioned in the delivery
//! sequence. It is immutable once built: the sequencer owns it while it
//! waits for its turn, then it is shared read-only with the aggregator,
//! observers, and the persistence buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single topic-tagged update carried inside an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubMessage {
    /// Topic name (e.g. `WeatherData`, `TimingData`).
    pub topic: String,
    /// The topic payload exactly as delivered by the feed.
    pub payload: Value,
}

impl SubMessage {
    /// Create a sub-message for `topic` carrying `payload`.
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// One received push frame with its delivery id and topic updates.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Position in the delivery sequence (feed-assigned or local).
    delivery_id: u64,
    /// Wall-clock receipt time.
    received_at: DateTime<Utc>,
    /// Topic updates in the order they appeared in the frame.
    sub_messages: Vec<SubMessage>,
    /// The full parsed frame, kept for the durable history.
    frame: Value,
}

impl Envelope {
    /// Build an envelope from its parts.
    pub const fn new(
        delivery_id: u64,
        received_at: DateTime<Utc>,
        sub_messages: Vec<SubMessage>,
        frame: Value,
    ) -> Self {
        Self {
            delivery_id,
            received_at,
            sub_messages,
            frame,
        }
    }

    /// The delivery sequence number.
    pub const fn delivery_id(&self) -> u64 {
        self.delivery_id
    }

    /// When the frame was received.
    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// The topic updates carried by this envelope.
    pub fn sub_messages(&self) -> &[SubMessage] {
        &self.sub_messages
    }

    /// The full parsed frame.
    pub const fn frame(&self) -> &Value {
        &self.frame
    }

    /// The persisted form of this envelope.
    pub fn to_record(&self) -> FrameRecord {
        FrameRecord::Accepted {
            timestamp: self.received_at,
            message_id: self.delivery_id,
            data: self.frame.clone(),
        }
    }
}

/// One entry of the durable append log.
///
/// Serialized without a tag: accepted frames carry `data`, malformed ones
/// carry `error` and `raw`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameRecord {
    /// A frame that parsed and was released in delivery order.
    Accepted {
        /// Receipt time.
        timestamp: DateTime<Utc>,
        /// Delivery id of the envelope.
        #[serde(rename = "messageId")]
        message_id: u64,
        /// The parsed frame.
        data: Value,
    },
    /// A frame that could not be parsed.
    Malformed {
        /// Receipt time.
        timestamp: DateTime<Utc>,
        /// Receipt counter at the time the frame arrived.
        #[serde(rename = "messageId")]
        message_id: u64,
        /// Why parsing failed.
        error: String,
        /// The frame text as received.
        raw: String,
    },
}

impl FrameRecord {
    /// The `messageId` stored with this entry.
    pub const fn message_id(&self) -> u64 {
        match self {
            Self::Accepted { message_id, .. } | Self::Malformed { message_id, .. } => *message_id,
        }
    }

    /// Whether this entry records a parse failure.
    pub const fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn accepted_record_uses_journal_field_names() {
        let envelope = Envelope::new(
            7,
            Utc::now(),
            vec![SubMessage::new("LapCount", serde_json::json!({"CurrentLap": 5}))],
            serde_json::json!({"M": []}),
        );
        let json = serde_json::to_value(envelope.to_record()).unwrap();
        assert_eq!(json["messageId"], 7);
        assert_eq!(json["data"], serde_json::json!({"M": []}));
        assert!(json.get("timestamp").is_some());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn malformed_record_deserializes_to_malformed_variant() {
        let json = serde_json::json!({
            "timestamp": "2024-03-02T15:00:00Z",
            "messageId": 3,
            "error": "expected value at line 1 column 1",
            "raw": "not json"
        });
        let record: FrameRecord = serde_json::from_value(json).unwrap();
        assert!(record.is_malformed());
        assert_eq!(record.message_id(), 3);
    }
}

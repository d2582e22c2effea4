//! Wire shapes of the streaming hub protocol.
//!
//! Inbound frames are JSON objects. Update frames carry an `M` array of hub
//! invocations, each naming a topic and holding its payload in `A`. The
//! reply to a `Subscribe` invocation carries an `R` object mapping every
//! subscribed topic to its full current value. An optional `MessageId`
//! gives the feed's delivery sequence number.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::envelope::SubMessage;

/// Hub method that multiplexes topics as its first argument.
const MULTIPLEXED_METHOD: &str = "feed";

/// Errors produced while parsing an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is valid JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,
}

/// An inbound frame split into its delivery id and topic updates.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    /// Feed-assigned sequence number, if the frame carried one.
    pub message_id: Option<u64>,
    /// Topic updates in frame order (`M` invocations first, then `R` entries).
    pub sub_messages: Vec<SubMessage>,
    /// The parsed frame body.
    pub body: Value,
}

impl InboundFrame {
    /// Parse frame text.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Json`] if the text is not JSON, or
    /// [`FrameError::NotAnObject`] if it is not a JSON object.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let body: Value = serde_json::from_str(text)?;
        Self::from_value(body)
    }

    /// Split an already-parsed frame body.
    ///
    /// Invocation entries that do not name a topic are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::NotAnObject`] if `body` is not a JSON object.
    pub fn from_value(body: Value) -> Result<Self, FrameError> {
        let Value::Object(fields) = &body else {
            return Err(FrameError::NotAnObject);
        };

        let message_id = fields.get("MessageId").and_then(parse_message_id);

        let mut sub_messages = Vec::new();
        if let Some(Value::Array(invocations)) = fields.get("M") {
            sub_messages.extend(invocations.iter().filter_map(invocation_sub_message));
        }
        if let Some(Value::Object(baseline)) = fields.get("R") {
            sub_messages.extend(baseline_sub_messages(baseline));
        }

        Ok(Self {
            message_id,
            sub_messages,
            body,
        })
    }
}

/// Read a delivery id from a number or a numeric string.
fn parse_message_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Turn one hub invocation into a sub-message.
///
/// Two shapes are accepted: `{M: topic, A: [payload]}` and the multiplexed
/// `{M: "feed", A: [topic, payload, timestamp]}`.
fn invocation_sub_message(invocation: &Value) -> Option<SubMessage> {
    let method = invocation.get("M")?.as_str()?;
    let args = invocation.get("A");

    if method == MULTIPLEXED_METHOD {
        let args = args?.as_array()?;
        let topic = args.first()?.as_str()?;
        let payload = args.get(1).cloned().unwrap_or(Value::Null);
        return Some(SubMessage::new(topic, payload));
    }

    let payload = match args {
        Some(Value::Array(values)) => values.first().cloned().unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    };
    Some(SubMessage::new(method, payload))
}

/// Turn a `Subscribe` reply into one sub-message per topic.
fn baseline_sub_messages(baseline: &Map<String, Value>) -> impl Iterator<Item = SubMessage> + '_ {
    baseline
        .iter()
        .map(|(topic, payload)| SubMessage::new(topic.as_str(), payload.clone()))
}

/// The outbound `Subscribe` invocation.
///
/// Serializes as `{"H": hub, "M": "Subscribe", "A": [[topics...]], "I": id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeRequest {
    /// Hub name.
    #[serde(rename = "H")]
    pub hub: String,
    /// Hub method (always `Subscribe`).
    #[serde(rename = "M")]
    pub method: String,
    /// Invocation arguments: a single array of topic names.
    #[serde(rename = "A")]
    pub args: (Vec<String>,),
    /// Client-side request id.
    #[serde(rename = "I")]
    pub request_id: u64,
}

impl SubscribeRequest {
    /// Build a subscription to `topics` on `hub`.
    pub fn new(hub: impl Into<String>, topics: Vec<String>, request_id: u64) -> Self {
        Self {
            hub: hub.into(),
            method: "Subscribe".to_owned(),
            args: (topics,),
            request_id,
        }
    }

    /// The topics named by this request.
    pub fn topics(&self) -> &[String] {
        &self.args.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn subscribe_request_wire_shape() {
        let request = SubscribeRequest::new(
            "Streaming",
            vec!["Heartbeat".to_owned(), "LapCount".to_owned()],
            1,
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({"H": "Streaming", "M": "Subscribe", "A": [["Heartbeat", "LapCount"]], "I": 1})
        );
    }

    #[test]
    fn parses_update_invocations_in_order() {
        let frame = InboundFrame::parse(
            r#"{"MessageId": 12, "M": [
                {"H": "Streaming", "M": "WeatherData", "A": [{"AirTemp": 27}]},
                {"H": "Streaming", "M": "LapCount", "A": [{"CurrentLap": 5}]}
            ]}"#,
        )
        .unwrap();

        assert_eq!(frame.message_id, Some(12));
        assert_eq!(frame.sub_messages.len(), 2);
        assert_eq!(frame.sub_messages[0].topic, "WeatherData");
        assert_eq!(frame.sub_messages[0].payload, json!({"AirTemp": 27}));
        assert_eq!(frame.sub_messages[1].topic, "LapCount");
    }

    #[test]
    fn parses_multiplexed_feed_invocation() {
        let frame = InboundFrame::parse(
            r#"{"M": [{"H": "Streaming", "M": "feed",
                "A": ["TrackStatus", {"Status": "1", "Message": "AllClear"}, "2024-03-02T15:00:00Z"]}]}"#,
        )
        .unwrap();

        assert_eq!(frame.message_id, None);
        assert_eq!(frame.sub_messages[0].topic, "TrackStatus");
        assert_eq!(frame.sub_messages[0].payload["Message"], "AllClear");
    }

    #[test]
    fn subscribe_reply_becomes_baseline_sub_messages() {
        let frame = InboundFrame::parse(
            r#"{"R": {"LapCount": {"CurrentLap": 1, "TotalLaps": 57}, "Heartbeat": {"Utc": "x"}}, "I": "1"}"#,
        )
        .unwrap();

        let topics: Vec<&str> = frame.sub_messages.iter().map(|s| s.topic.as_str()).collect();
        assert_eq!(topics, vec!["LapCount", "Heartbeat"]);
    }

    #[test]
    fn numeric_string_message_id_is_accepted() {
        let frame = InboundFrame::parse(r#"{"MessageId": "41", "M": []}"#).unwrap();
        assert_eq!(frame.message_id, Some(41));
    }

    #[test]
    fn frame_without_updates_has_no_sub_messages() {
        let frame = InboundFrame::parse(r#"{"C": "d-1", "S": 1, "M": []}"#).unwrap();
        assert!(frame.sub_messages.is_empty());
    }

    #[test]
    fn rejects_invalid_json_and_non_objects() {
        assert!(matches!(InboundFrame::parse("{not json"), Err(FrameError::Json(_))));
        assert!(matches!(InboundFrame::parse("[1, 2]"), Err(FrameError::NotAnObject)));
    }
}

//! Wire framing for the game WebSocket (spec.md §6): server frames are
//! `{"type": <EventName>, "payload": <encoded event>}`; client frames are
//! `{"type":"ping"}`, answered with `{"type":"pong"}`. Grounded on the
//! teacher's `ws/protocol.rs` (`Message{action, data}`, built through
//! `serde_json::to_value`), generalized to split an internally-tagged
//! event into this envelope instead of carrying its own `Action` enum.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
}

pub fn pong_frame() -> Value {
    serde_json::json!({ "type": "pong" })
}

/// Splits an internally `#[serde(tag = "type")]`-tagged event into the
/// `{"type", "payload"}` envelope the WS surface promises. Panics if
/// `event` does not serialize to a JSON object carrying a string `"type"`
/// field, which would be a bug in the event enum, not a runtime condition.
pub fn to_frame<T: Serialize>(event: &T) -> Value {
    let mut value = serde_json::to_value(event).expect("event must be JSON-serializable");
    let object = value.as_object_mut().expect("event must serialize to a JSON object");
    let kind = object.remove("type").expect("event must carry a \"type\" tag");
    serde_json::json!({ "type": kind, "payload": Value::Object(object.clone()) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    #[serde(tag = "type")]
    enum Sample {
        Thing { id: u32, name: String },
    }

    #[test]
    fn to_frame_splits_the_tag_out_into_an_envelope() {
        let frame = to_frame(&Sample::Thing { id: 7, name: "x".into() });
        assert_eq!(frame["type"], "Thing");
        assert_eq!(frame["payload"]["id"], 7);
        assert_eq!(frame["payload"]["name"], "x");
    }
}

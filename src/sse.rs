// Server-sent event frame parsing

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of one frame: parsed JSON when possible, raw text otherwise
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged, from = "Value")]
pub enum SsePayload {
    Json(Value),
    Raw(String),
}

/// A persisted string payload is raw text; anything else was parsed JSON
impl From<Value> for SsePayload {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => SsePayload::Raw(s),
            other => SsePayload::Json(other),
        }
    }
}

impl SsePayload {
    pub fn parse(data: &str) -> Self {
        match serde_json::from_str::<Value>(data) {
            Ok(value) => SsePayload::Json(value),
            Err(_) => SsePayload::Raw(data.to_string()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            SsePayload::Json(value) => Some(value),
            SsePayload::Raw(_) => None,
        }
    }

    /// The payload's `type` field, if it has one
    pub fn event_type(&self) -> Option<&str> {
        self.as_json()
            .and_then(|v| v.get("type"))
            .and_then(|t| t.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SseEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub data: SsePayload,
}

impl SseEvent {
    pub fn new(event: Option<&str>, data: &str) -> Self {
        Self {
            event: event.map(str::to_string),
            data: SsePayload::parse(data),
        }
    }

    /// Rebuild an event from its persisted JSON form.
    /// A bare string or object without `data` is treated as the payload itself.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) if map.contains_key("data") => {
                let event = map.get("event").and_then(|e| e.as_str()).map(str::to_string);
                let data = match map.get("data") {
                    Some(Value::String(s)) => SsePayload::parse(s),
                    Some(other) => SsePayload::Json(other.clone()),
                    None => SsePayload::Raw(String::new()),
                };
                Self { event, data }
            }
            Value::String(s) => Self {
                event: None,
                data: SsePayload::parse(s),
            },
            other => Self {
                event: None,
                data: SsePayload::Json(other.clone()),
            },
        }
    }
}

/// Heuristic used when the content-type header is missing or wrong
pub fn looks_like_event_stream(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with("event:") || trimmed.starts_with("data:")
}

/// Split a complete event-stream body into frames.
///
/// Frames are separated by a blank line. `data:` lines within a frame are joined
/// with `\n`; lines starting with `:` are comments. Frames with no data are dropped.
pub fn parse_frames(body: &str) -> Vec<SseEvent> {
    let normalized = body.replace("\r\n", "\n");
    let mut events = Vec::new();

    for block in normalized.split("\n\n") {
        let mut event_name: Option<&str> = None;
        let mut data_lines: Vec<&str> = Vec::new();

        for line in block.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event_name = Some(value),
                "data" => data_lines.push(value),
                _ => {} // id, retry: not needed for reconstruction
            }
        }

        if data_lines.is_empty() {
            continue;
        }
        events.push(SseEvent::new(event_name, &data_lines.join("\n")));
    }

    events
}

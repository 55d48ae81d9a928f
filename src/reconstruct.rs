// Stream Reconstruction for Anthropic Messages event streams
//
// Folds an ordered sequence of SSE frames into one logical response: usage counts,
// assistant text and tool calls. The same state machine serves live capture and
// replay of persisted event lists.

use crate::sse::SseEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool input: parsed once the block closes, raw text if the JSON never completed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ToolInput {
    Complete(Value),
    Partial(String),
}

impl ToolInput {
    /// Parse accumulated `partial_json` text; an empty buffer means an empty object
    pub fn from_buffer(buffer: &str) -> Self {
        if buffer.trim().is_empty() {
            return ToolInput::Complete(Value::Object(Default::default()));
        }
        match serde_json::from_str::<Value>(buffer) {
            Ok(value) => ToolInput::Complete(value),
            Err(_) => ToolInput::Partial(buffer.to_string()),
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ToolInput::Complete(value) => Some(value),
            ToolInput::Partial(_) => None,
        }
    }
}

/// Represents a single tool call made by the model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: ToolInput,
}

/// Derived view of a streamed response
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    pub assistant_message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thinking: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Started,
    Accumulating,
    Complete,
}

#[derive(Debug)]
struct OpenToolCall {
    id: String,
    name: String,
    buffer: String,
}

impl OpenToolCall {
    fn close(self) -> ToolCallRecord {
        ToolCallRecord {
            input: ToolInput::from_buffer(&self.buffer),
            id: self.id,
            name: self.name,
        }
    }
}

/// Incremental reconstructor; feed frames in arrival order, then `finish`
#[derive(Debug)]
pub struct StreamReconstructor {
    state: StreamState,
    summary: ResponseSummary,
    open_tool: Option<OpenToolCall>,
    skipped_frames: usize,
}

impl Default for StreamReconstructor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamReconstructor {
    pub fn new() -> Self {
        Self {
            state: StreamState::Idle,
            summary: ResponseSummary::default(),
            open_tool: None,
            skipped_frames: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Frames ignored because they were raw, untyped or unrecognized
    pub fn skipped_frames(&self) -> usize {
        self.skipped_frames
    }

    pub fn feed(&mut self, event: &SseEvent) {
        if self.state == StreamState::Complete {
            tracing::debug!("ignoring frame received after message_stop");
            return;
        }

        let Some(json) = event.data.as_json() else {
            self.skipped_frames += 1;
            return;
        };
        let event_type = json.get("type").and_then(|v| v.as_str()).unwrap_or("");

        match event_type {
            "message_start" => self.on_message_start(json),
            "content_block_start" => self.on_block_start(json),
            "content_block_delta" => self.on_block_delta(json),
            "content_block_stop" => self.on_block_stop(),
            "message_delta" => self.on_message_delta(json),
            "message_stop" => {
                self.close_open_tool();
                self.state = StreamState::Complete;
            }
            "error" => {
                if self.summary.error.is_none() {
                    let message = json
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(|m| m.as_str())
                        .unwrap_or("stream error");
                    self.summary.error = Some(message.to_string());
                }
            }
            _ => {
                // ping and anything newer than this parser
                self.skipped_frames += 1;
            }
        }
    }

    /// End of frames. No terminator event is required.
    pub fn finish(mut self) -> ResponseSummary {
        self.close_open_tool();
        self.state = StreamState::Complete;
        self.summary
    }

    /// Snapshot of what has been accumulated so far, without consuming the state
    pub fn partial(&self) -> ResponseSummary {
        let mut summary = self.summary.clone();
        if let Some(open) = &self.open_tool {
            summary.tool_calls.push(ToolCallRecord {
                id: open.id.clone(),
                name: open.name.clone(),
                input: ToolInput::from_buffer(&open.buffer),
            });
        }
        summary
    }

    fn on_message_start(&mut self, json: &Value) {
        let Some(message) = json.get("message") else {
            self.skipped_frames += 1;
            return;
        };
        if let Some(id) = message.get("id").and_then(|v| v.as_str()) {
            self.summary.message_id = Some(id.to_string());
        }
        if let Some(model) = message.get("model").and_then(|v| v.as_str()) {
            self.summary.model = Some(model.to_string());
        }
        if let Some(usage) = message.get("usage") {
            self.summary.input_tokens = token_count(usage, "input_tokens");
            self.summary.output_tokens = token_count(usage, "output_tokens");
            self.summary.cache_read_input_tokens = token_count(usage, "cache_read_input_tokens");
            self.summary.cache_creation_input_tokens =
                token_count(usage, "cache_creation_input_tokens");
        }
        if self.state == StreamState::Idle {
            self.state = StreamState::Started;
        }
    }

    fn on_block_start(&mut self, json: &Value) {
        self.state = StreamState::Accumulating;
        let Some(block) = json.get("content_block") else {
            return;
        };
        if block.get("type").and_then(|v| v.as_str()) != Some("tool_use") {
            return;
        }

        if let Some(previous) = self.open_tool.take() {
            tracing::warn!(
                "tool call '{}' opened while '{}' was still open; closing the previous one",
                block.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                previous.id
            );
            self.summary.tool_calls.push(previous.close());
        }

        let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
        self.open_tool = Some(OpenToolCall {
            id,
            name,
            buffer: String::new(),
        });
    }

    fn on_block_delta(&mut self, json: &Value) {
        self.state = StreamState::Accumulating;
        let Some(delta) = json.get("delta") else {
            self.skipped_frames += 1;
            return;
        };
        let delta_type = delta.get("type").and_then(|v| v.as_str()).unwrap_or("");

        match delta_type {
            "input_json_delta" => {
                let partial = delta.get("partial_json").and_then(|v| v.as_str()).unwrap_or("");
                match self.open_tool.as_mut() {
                    Some(open) => open.buffer.push_str(partial),
                    None => {
                        tracing::debug!("input_json_delta without an open tool call");
                        self.skipped_frames += 1;
                    }
                }
            }
            "thinking_delta" => {
                if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                    self.summary.thinking.push_str(text);
                }
            }
            _ => {
                // text_delta, or older streams that only carry `text`
                if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                    self.summary.assistant_message.push_str(text);
                }
            }
        }
    }

    fn on_block_stop(&mut self) {
        self.close_open_tool();
    }

    fn on_message_delta(&mut self, json: &Value) {
        if let Some(reason) = json
            .get("delta")
            .and_then(|d| d.get("stop_reason"))
            .and_then(|v| v.as_str())
        {
            self.summary.stop_reason = Some(reason.to_string());
        }

        if let Some(usage) = json.get("usage") {
            // message_delta output count supersedes the message_start estimate
            if let Some(output) = token_count(usage, "output_tokens") {
                self.summary.output_tokens = Some(output);
            }
            if self.summary.input_tokens.is_none() {
                self.summary.input_tokens = token_count(usage, "input_tokens");
            }
            if self.summary.cache_read_input_tokens.is_none() {
                self.summary.cache_read_input_tokens =
                    token_count(usage, "cache_read_input_tokens");
            }
            if self.summary.cache_creation_input_tokens.is_none() {
                self.summary.cache_creation_input_tokens =
                    token_count(usage, "cache_creation_input_tokens");
            }
        }
    }

    fn close_open_tool(&mut self) {
        if let Some(open) = self.open_tool.take() {
            self.summary.tool_calls.push(open.close());
        }
    }
}

fn token_count(usage: &Value, field: &str) -> Option<u64> {
    usage.get(field).and_then(|v| v.as_u64())
}

/// Replay a complete frame sequence
pub fn reconstruct(events: &[SseEvent]) -> ResponseSummary {
    let mut reconstructor = StreamReconstructor::new();
    for event in events {
        reconstructor.feed(event);
    }
    let skipped = reconstructor.skipped_frames();
    if skipped > 0 {
        tracing::debug!("skipped {} unrecognized frames during reconstruction", skipped);
    }
    reconstructor.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::parse_frames;
    use serde_json::json;

    fn frame(value: Value) -> SseEvent {
        let name = value["type"].as_str().map(str::to_string);
        SseEvent::new(name.as_deref(), &value.to_string())
    }

    #[test]
    fn test_text_and_usage() {
        let events = vec![
            frame(json!({"type": "message_start", "message": {"usage": {"input_tokens": 10, "output_tokens": 0}}})),
            frame(json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hi"}})),
            frame(json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": " there"}})),
            frame(json!({"type": "message_delta", "usage": {"output_tokens": 2}})),
        ];
        let summary = reconstruct(&events);
        assert_eq!(summary.input_tokens, Some(10));
        assert_eq!(summary.output_tokens, Some(2));
        assert_eq!(summary.assistant_message, "Hi there");
    }

    #[test]
    fn test_tool_call_accumulation() {
        let events = vec![
            frame(json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "t1", "name": "lookup", "input": {}}})),
            frame(json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}})),
            frame(json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "\"x\"}"}})),
            frame(json!({"type": "content_block_stop", "index": 1})),
        ];
        let summary = reconstruct(&events);
        assert_eq!(summary.tool_calls.len(), 1);
        let call = &summary.tool_calls[0];
        assert_eq!(call.id, "t1");
        assert_eq!(call.name, "lookup");
        assert_eq!(call.input, ToolInput::Complete(json!({"q": "x"})));
    }

    #[test]
    fn test_unparsable_tool_input_kept_raw() {
        let events = vec![
            frame(json!({"type": "content_block_start", "content_block": {"type": "tool_use", "id": "t1", "name": "edit"}})),
            frame(json!({"type": "content_block_delta", "delta": {"type": "input_json_delta", "partial_json": "{\"path\": \"a"}})),
            frame(json!({"type": "content_block_stop"})),
        ];
        let summary = reconstruct(&events);
        assert_eq!(summary.tool_calls.len(), 1);
        assert_eq!(
            summary.tool_calls[0].input,
            ToolInput::Partial("{\"path\": \"a".to_string())
        );
    }

    #[test]
    fn test_second_tool_start_closes_first() {
        let events = vec![
            frame(json!({"type": "content_block_start", "content_block": {"type": "tool_use", "id": "a", "name": "one"}})),
            frame(json!({"type": "content_block_delta", "delta": {"type": "input_json_delta", "partial_json": "{}"}})),
            frame(json!({"type": "content_block_start", "content_block": {"type": "tool_use", "id": "b", "name": "two"}})),
            frame(json!({"type": "content_block_stop"})),
        ];
        let summary = reconstruct(&events);
        let ids: Vec<&str> = summary.tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_malformed_frame_does_not_abort() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5,\"output_tokens\":1}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\n\n",
            "event: ping\n",
            "data: {\"type\": \"ping\"}\n\n",
            "data:\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"ok\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":7}}\n\n",
        );
        let summary = reconstruct(&parse_frames(body));
        assert_eq!(summary.input_tokens, Some(5));
        assert_eq!(summary.output_tokens, Some(7));
        assert_eq!(summary.assistant_message, "ok");
        assert_eq!(summary.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn test_state_transitions() {
        let mut reconstructor = StreamReconstructor::new();
        assert_eq!(reconstructor.state(), StreamState::Idle);

        reconstructor.feed(&frame(json!({"type": "message_start", "message": {"model": "claude-sonnet-4", "usage": {"input_tokens": 3, "cache_read_input_tokens": 100}}})));
        assert_eq!(reconstructor.state(), StreamState::Started);

        reconstructor.feed(&frame(json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "a"}})));
        assert_eq!(reconstructor.state(), StreamState::Accumulating);

        reconstructor.feed(&frame(json!({"type": "message_stop"})));
        assert_eq!(reconstructor.state(), StreamState::Complete);

        reconstructor.feed(&frame(json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "late"}})));
        let summary = reconstructor.finish();
        assert_eq!(summary.assistant_message, "a");
        assert_eq!(summary.model.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(summary.cache_read_input_tokens, Some(100));
    }

    #[test]
    fn test_open_tool_closed_at_end_of_stream() {
        let events = vec![
            frame(json!({"type": "content_block_start", "content_block": {"type": "tool_use", "id": "t9", "name": "bash"}})),
            frame(json!({"type": "content_block_delta", "delta": {"type": "input_json_delta", "partial_json": "{\"cmd\":\"ls\"}"}})),
        ];
        let summary = reconstruct(&events);
        assert_eq!(summary.tool_calls.len(), 1);
        assert_eq!(summary.tool_calls[0].input, ToolInput::Complete(json!({"cmd": "ls"})));
    }

    #[test]
    fn test_error_event_and_thinking() {
        let events = vec![
            frame(json!({"type": "content_block_delta", "delta": {"type": "thinking_delta", "thinking": "hmm"}})),
            frame(json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}})),
        ];
        let summary = reconstruct(&events);
        assert_eq!(summary.thinking, "hmm");
        assert_eq!(summary.error.as_deref(), Some("Overloaded"));
        assert!(summary.assistant_message.is_empty());
    }
}

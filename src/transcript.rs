// Transcript Reader
//
// Parses a persisted log back into reviewable entries. Works from raw JSON rather than
// the typed records so files written by older versions still load.

use crate::error::{LoggerError, Result};
use crate::reconstruct::{reconstruct, ResponseSummary, ToolCallRecord, ToolInput};
use crate::sse::{looks_like_event_stream, parse_frames, SseEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

/// One block of message content
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
        cached: bool,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
        cached: bool,
    },
    ToolResult {
        tool_use_id: String,
        text: String,
        is_error: bool,
        cached: bool,
    },
    Other {
        kind: String,
        cached: bool,
    },
}

impl ContentPart {
    pub fn is_cached(&self) -> bool {
        match self {
            ContentPart::Text { cached, .. }
            | ContentPart::ToolUse { cached, .. }
            | ContentPart::ToolResult { cached, .. }
            | ContentPart::Other { cached, .. } => *cached,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageView {
    pub role: String,
    pub parts: Vec<ContentPart>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageView {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
}

/// Display model for one captured exchange
#[derive(Debug, Clone, Default, Serialize)]
pub struct TranscriptEntry {
    pub request_id: Option<String>,
    pub request_time: Option<DateTime<Utc>>,
    pub response_time: Option<DateTime<Utc>>,
    pub latency_ms: Option<i64>,
    pub url: String,
    pub method: String,
    pub model: Option<String>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub streaming: bool,
    pub tools_count: usize,
    pub message_count: usize,
    pub system_prompt: String,
    pub last_user_message: String,
    pub messages: Vec<MessageView>,
    pub status_code: Option<u64>,
    pub usage: UsageView,
    pub response: Option<ResponseSummary>,
    pub error: Option<String>,
}

impl TranscriptEntry {
    pub fn assistant_message(&self) -> &str {
        self.response
            .as_ref()
            .map(|r| r.assistant_message.as_str())
            .unwrap_or("")
    }

    pub fn tool_calls(&self) -> &[ToolCallRecord] {
        self.response
            .as_ref()
            .map(|r| r.tool_calls.as_slice())
            .unwrap_or(&[])
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.response.as_ref().and_then(|r| r.stop_reason.as_deref())
    }

    /// Model from the request, falling back to the one the response reported
    pub fn effective_model(&self) -> Option<&str> {
        self.model
            .as_deref()
            .or_else(|| self.response.as_ref().and_then(|r| r.model.as_deref()))
    }
}

/// Totals across a transcript
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TranscriptSummary {
    pub total_requests: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub models: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pub entries: Vec<TranscriptEntry>,
    /// Lines that were not valid JSON
    pub skipped_lines: usize,
    /// Records for other hosts
    pub excluded: usize,
}

/// First `max_chars` characters, with an ellipsis when truncated
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut out: String = flat.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

impl Transcript {
    pub fn load(path: &Path, target_host: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LoggerError::io("reading log file", path, e))?;
        Ok(Self::parse(&content, target_host))
    }

    /// Parse JSONL or a legacy JSON array, keeping only records sent to `target_host`,
    /// ordered by request time (entries without one first).
    pub fn parse(content: &str, target_host: &str) -> Self {
        let mut transcript = Transcript::default();
        let mut records: Vec<Value> = Vec::new();

        let legacy = if content.trim_start().starts_with('[') {
            serde_json::from_str::<Vec<Value>>(content).ok()
        } else {
            None
        };

        match legacy {
            Some(entries) => records = entries,
            None => {
                for (idx, line) in content.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(line) {
                        Ok(value) => records.push(value),
                        Err(e) => {
                            tracing::warn!("skipping line {}: {}", idx + 1, e);
                            transcript.skipped_lines += 1;
                        }
                    }
                }
            }
        }

        for record in &records {
            let url = record
                .get("request")
                .and_then(|r| r.get("url"))
                .and_then(|u| u.as_str())
                .unwrap_or("");
            if !host_matches(url, target_host) {
                transcript.excluded += 1;
                continue;
            }
            transcript.entries.push(build_entry(record));
        }

        transcript.entries.sort_by_key(|e| e.request_time);
        transcript
    }

    pub fn summary(&self) -> TranscriptSummary {
        let mut summary = TranscriptSummary {
            total_requests: self.entries.len(),
            ..Default::default()
        };
        for entry in &self.entries {
            summary.total_input_tokens += entry.usage.input_tokens.unwrap_or(0);
            summary.total_output_tokens += entry.usage.output_tokens.unwrap_or(0);
            if let Some(model) = entry.effective_model() {
                summary.models.insert(model.to_string());
            }
        }
        summary
    }

    pub fn filter_by_model(&self, model: &str) -> Transcript {
        Transcript {
            entries: self
                .entries
                .iter()
                .filter(|e| e.effective_model() == Some(model))
                .cloned()
                .collect(),
            skipped_lines: self.skipped_lines,
            excluded: self.excluded,
        }
    }

    /// Plain-text rendering with collapsed previews and the summary counters
    pub fn render(&self, preview_chars: usize) -> String {
        let mut out = String::new();

        for entry in &self.entries {
            let when = entry
                .request_time
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "unknown time".to_string());
            let status = entry
                .status_code
                .map(|s| s.to_string())
                .unwrap_or_else(|| "---".to_string());
            let latency = entry
                .latency_ms
                .map(|ms| format!("{} ms", ms))
                .unwrap_or_else(|| "-".to_string());

            let _ = writeln!(
                out,
                "[{}] {} {} {} {}",
                when,
                entry.effective_model().unwrap_or("unknown model"),
                status,
                latency,
                if entry.streaming { "(stream)" } else { "" }
            );
            let _ = writeln!(
                out,
                "  tokens: in={} out={} cache_read={} cache_write={}",
                fmt_count(entry.usage.input_tokens),
                fmt_count(entry.usage.output_tokens),
                fmt_count(entry.usage.cache_read_input_tokens),
                fmt_count(entry.usage.cache_creation_input_tokens)
            );
            if !entry.last_user_message.is_empty() {
                let _ = writeln!(out, "  user: {}", preview(&entry.last_user_message, preview_chars));
            }
            if !entry.assistant_message().is_empty() {
                let _ = writeln!(
                    out,
                    "  assistant: {}",
                    preview(entry.assistant_message(), preview_chars)
                );
            }
            for call in entry.tool_calls() {
                let input = match &call.input {
                    ToolInput::Complete(value) => value.to_string(),
                    ToolInput::Partial(raw) => format!("{} (incomplete)", raw),
                };
                let _ = writeln!(out, "  tool {}: {}", call.name, preview(&input, preview_chars));
            }
            if let Some(error) = &entry.error {
                let _ = writeln!(out, "  error: {}", error);
            }
            out.push('\n');
        }

        let summary = self.summary();
        let _ = writeln!(out, "Requests: {}", summary.total_requests);
        let _ = writeln!(out, "Input tokens: {}", summary.total_input_tokens);
        let _ = writeln!(out, "Output tokens: {}", summary.total_output_tokens);
        let models: Vec<&str> = summary.models.iter().map(String::as_str).collect();
        let _ = writeln!(out, "Models: {}", models.join(", "));
        out
    }
}

fn fmt_count(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn host_matches(url: &str, target_host: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    if host.eq_ignore_ascii_case(target_host) {
        return true;
    }
    // allow an explicit host:port target
    match parsed.port_or_known_default() {
        Some(port) => format!("{}:{}", host, port).eq_ignore_ascii_case(target_host),
        None => false,
    }
}

fn parse_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn is_cached(block: &Value) -> bool {
    block
        .get("cache_control")
        .and_then(|c| c.get("type"))
        .and_then(|t| t.as_str())
        == Some("ephemeral")
}

/// Text of a string-or-blocks field, text blocks joined with a space
fn flatten_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(_) if item.get("type").and_then(|t| t.as_str()) == Some("text") => {
                    item.get("text").and_then(|t| t.as_str()).map(str::to_string)
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

fn content_parts(content: &Value) -> Vec<ContentPart> {
    let blocks = match content {
        Value::String(s) => {
            return vec![ContentPart::Text {
                text: s.clone(),
                cached: false,
            }]
        }
        Value::Array(blocks) => blocks,
        _ => return Vec::new(),
    };

    blocks
        .iter()
        .map(|block| {
            let cached = is_cached(block);
            let str_field = |name: &str| {
                block
                    .get(name)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };
            match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                "text" => ContentPart::Text {
                    text: str_field("text"),
                    cached,
                },
                "tool_use" => ContentPart::ToolUse {
                    id: str_field("id"),
                    name: str_field("name"),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                    cached,
                },
                "tool_result" => ContentPart::ToolResult {
                    tool_use_id: str_field("tool_use_id"),
                    text: block.get("content").map(flatten_text).unwrap_or_default(),
                    is_error: block
                        .get("is_error")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                    cached,
                },
                other => ContentPart::Other {
                    kind: other.to_string(),
                    cached,
                },
            }
        })
        .collect()
}

/// Summary of a non-streaming Messages API body
fn summary_from_message(body: &Value) -> Option<ResponseSummary> {
    let content = body.get("content").and_then(|c| c.as_array());
    let usage = body.get("usage");
    if content.is_none() && usage.is_none() {
        return None;
    }

    let mut summary = ResponseSummary {
        message_id: body.get("id").and_then(|v| v.as_str()).map(str::to_string),
        model: body.get("model").and_then(|v| v.as_str()).map(str::to_string),
        stop_reason: body
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        ..Default::default()
    };

    if let Some(usage) = usage {
        let count = |field: &str| usage.get(field).and_then(|v| v.as_u64());
        summary.input_tokens = count("input_tokens");
        summary.output_tokens = count("output_tokens");
        summary.cache_read_input_tokens = count("cache_read_input_tokens");
        summary.cache_creation_input_tokens = count("cache_creation_input_tokens");
    }

    for block in content.into_iter().flatten() {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    summary.assistant_message.push_str(text);
                }
            }
            Some("thinking") => {
                if let Some(text) = block.get("thinking").and_then(|t| t.as_str()) {
                    summary.thinking.push_str(text);
                }
            }
            Some("tool_use") => summary.tool_calls.push(ToolCallRecord {
                id: block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                name: block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                input: ToolInput::Complete(block.get("input").cloned().unwrap_or(Value::Null)),
            }),
            _ => {}
        }
    }

    Some(summary)
}

/// Derive a summary from whichever response shape is present
fn summary_from_response(response: &Value) -> Option<ResponseSummary> {
    if let Some(summary) = response.get("summary") {
        if let Ok(summary) = serde_json::from_value::<ResponseSummary>(summary.clone()) {
            return Some(summary);
        }
    }

    if let Some(events) = response.get("events").and_then(|e| e.as_array()) {
        let events: Vec<SseEvent> = events.iter().map(SseEvent::from_value).collect();
        return Some(reconstruct(&events));
    }

    match response.get("body") {
        Some(body @ Value::Object(_)) => {
            if let Some(summary) = summary_from_message(body) {
                return Some(summary);
            }
        }
        Some(Value::String(text)) if looks_like_event_stream(text) || text.contains("message_start") => {
            return Some(reconstruct(&parse_frames(text)));
        }
        _ => {}
    }

    response.get("partial").and_then(summary_from_response)
}

fn build_entry(record: &Value) -> TranscriptEntry {
    let null = Value::Null;
    let request = record.get("request").unwrap_or(&null);
    let response = record.get("response").unwrap_or(&null);
    let body = request.get("body").unwrap_or(&null);

    let messages: Vec<MessageView> = body
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|items| {
            items
                .iter()
                .map(|msg| MessageView {
                    role: msg
                        .get("role")
                        .and_then(|r| r.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                    parts: msg.get("content").map(content_parts).unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    let last_user_message = body
        .get("messages")
        .and_then(|m| m.as_array())
        .and_then(|items| {
            items
                .iter()
                .rev()
                .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))
        })
        .and_then(|m| m.get("content"))
        .map(flatten_text)
        .unwrap_or_default();

    let request_time = parse_time(request.get("timestamp"));
    let response_time = parse_time(response.get("timestamp"));
    let latency_ms = match (request_time, response_time) {
        (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
        _ => None,
    };

    let summary = if response.is_null() {
        None
    } else {
        summary_from_response(response)
    };
    let usage = summary
        .as_ref()
        .map(|s| UsageView {
            input_tokens: s.input_tokens,
            output_tokens: s.output_tokens,
            cache_read_input_tokens: s.cache_read_input_tokens,
            cache_creation_input_tokens: s.cache_creation_input_tokens,
        })
        .unwrap_or_default();

    let error = response
        .get("error")
        .and_then(|e| match e {
            Value::String(s) => Some(s.clone()),
            Value::Object(_) => e
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string),
            _ => None,
        })
        .or_else(|| summary.as_ref().and_then(|s| s.error.clone()));

    TranscriptEntry {
        request_id: record
            .get("requestId")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        request_time,
        response_time,
        latency_ms,
        url: request
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        method: request
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        model: body.get("model").and_then(|v| v.as_str()).map(str::to_string),
        max_tokens: body.get("max_tokens").and_then(|v| v.as_u64()),
        temperature: body.get("temperature").and_then(|v| v.as_f64()),
        streaming: body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
        tools_count: body
            .get("tools")
            .and_then(|t| t.as_array())
            .map(|t| t.len())
            .unwrap_or(0),
        message_count: messages.len(),
        system_prompt: body.get("system").map(flatten_text).unwrap_or_default(),
        last_user_message,
        messages,
        status_code: response.get("statusCode").and_then(|v| v.as_u64()),
        usage,
        response: summary,
        error,
    }
}

// Captured Request/Response Records
// These are the shapes written to storage, one LogRecord per exchange

use crate::config::ProjectInfo;
use crate::reconstruct::ResponseSummary;
use crate::sse::SseEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type HeaderMap = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Fetch,
}

impl Protocol {
    /// Derive the protocol from a URL scheme
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("https://") {
            Protocol::Https
        } else {
            Protocol::Http
        }
    }
}

/// Request side of an exchange; finalized when the request body is complete
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HeaderMap,
    /// Parsed JSON when the body is JSON, otherwise the body text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl CapturedRequest {
    /// Whether the request asked for a streamed response (`"stream": true`)
    pub fn wants_stream(&self) -> bool {
        self.body
            .as_ref()
            .and_then(|b| b.get("stream"))
            .and_then(|s| s.as_bool())
            .unwrap_or(false)
    }
}

/// Why a response ended without a normal body
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    StreamError,
    Aborted,
    NoResponse,
}

/// The known response body shapes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseContent {
    Json {
        body: Value,
    },
    Text {
        body: String,
    },
    EventStream {
        events: Vec<SseEvent>,
        summary: ResponseSummary,
    },
    Error {
        error: String,
        cause: ErrorCause,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial: Option<Box<ResponseContent>>,
    },
    #[serde(rename_all = "camelCase")]
    Timeout {
        error: String,
        timeout_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial: Option<Box<ResponseContent>>,
    },
    /// Body could not be decompressed or decoded
    #[serde(rename_all = "camelCase")]
    BodyError {
        body_error: String,
        byte_len: usize,
    },
    Empty,
    #[serde(other)]
    Unknown,
}

impl ResponseContent {
    /// The reconstructed summary, including one carried by a partial body
    pub fn summary(&self) -> Option<&ResponseSummary> {
        match self {
            ResponseContent::EventStream { summary, .. } => Some(summary),
            ResponseContent::Error { partial, .. } | ResponseContent::Timeout { partial, .. } => {
                partial.as_deref().and_then(ResponseContent::summary)
            }
            _ => None,
        }
    }

    pub fn is_terminal_error(&self) -> bool {
        matches!(
            self,
            ResponseContent::Error { .. } | ResponseContent::Timeout { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedResponse {
    pub timestamp: DateTime<Utc>,
    /// Absent when no response head was ever received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(flatten)]
    pub content: ResponseContent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl ProjectMeta {
    pub fn stamp(info: &ProjectInfo, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: info.name.clone(),
            timestamp,
            version: info.version.clone(),
        }
    }
}

/// One request/response exchange. Written once, never edited.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub request_id: String,
    pub request: CapturedRequest,
    pub response: Option<CapturedResponse>,
    pub project: ProjectMeta,
}

impl LogRecord {
    pub fn is_terminal(&self) -> bool {
        self.response.is_some()
    }
}

/// Case-insensitive header lookup
pub fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

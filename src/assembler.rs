// Record Assembly
//
// Turns raw captured bytes into redacted CapturedRequest / CapturedResponse values and
// stamps the final LogRecord. Everything leaving this module has been through the Redactor.

use crate::config::ProjectInfo;
use crate::decode::decode_response_body;
use crate::reconstruct::{reconstruct, ResponseSummary, ToolInput};
use crate::record::{
    header_value, CapturedRequest, CapturedResponse, ErrorCause, HeaderMap, LogRecord,
    ProjectMeta, Protocol, ResponseContent,
};
use crate::redact::Redactor;
use crate::sse::{SseEvent, SsePayload};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct Assembler {
    redactor: Arc<Redactor>,
    project: ProjectInfo,
}

impl Assembler {
    pub fn new(redactor: Arc<Redactor>, project: ProjectInfo) -> Self {
        Self { redactor, project }
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Finalize the request side from its metadata and complete body
    pub fn request(
        &self,
        protocol: Protocol,
        method: &str,
        url: &str,
        headers: &HeaderMap,
        body: &[u8],
        timestamp: DateTime<Utc>,
    ) -> CapturedRequest {
        CapturedRequest {
            timestamp,
            protocol,
            url: self.redactor.redact(url),
            method: method.to_string(),
            headers: self.redactor.redact_headers(headers),
            body: self.request_body(body),
        }
    }

    fn request_body(&self, body: &[u8]) -> Option<Value> {
        if body.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(body);
        match serde_json::from_str::<Value>(&text) {
            Ok(mut value) => {
                self.redactor.redact_value_in_place(&mut value);
                Some(value)
            }
            Err(_) => Some(Value::String(self.redactor.redact(&text))),
        }
    }

    /// Decode and classify a complete response body, then redact it
    pub fn response_content(&self, headers: &HeaderMap, body: &[u8]) -> ResponseContent {
        let content = decode_response_body(
            body,
            header_value(headers, "content-encoding"),
            header_value(headers, "content-type"),
        );
        self.redact_content(content)
    }

    /// Error-terminated response; whatever body arrived is kept as `partial`
    pub fn error_content(
        &self,
        error: impl Into<String>,
        cause: ErrorCause,
        headers: &HeaderMap,
        partial_body: &[u8],
    ) -> ResponseContent {
        ResponseContent::Error {
            error: self.redactor.redact(&error.into()),
            cause,
            partial: self.partial(headers, partial_body),
        }
    }

    pub fn timeout_content(
        &self,
        timeout_ms: u64,
        headers: &HeaderMap,
        partial_body: &[u8],
    ) -> ResponseContent {
        ResponseContent::Timeout {
            error: format!("response did not complete within {} ms", timeout_ms),
            timeout_ms,
            partial: self.partial(headers, partial_body),
        }
    }

    fn partial(&self, headers: &HeaderMap, body: &[u8]) -> Option<Box<ResponseContent>> {
        if body.is_empty() {
            return None;
        }
        Some(Box::new(self.response_content(headers, body)))
    }

    pub fn response(
        &self,
        status_code: Option<u16>,
        headers: &HeaderMap,
        content: ResponseContent,
        timestamp: DateTime<Utc>,
    ) -> CapturedResponse {
        CapturedResponse {
            timestamp,
            status_code,
            headers: self.redactor.redact_headers(headers),
            content,
        }
    }

    pub fn record(
        &self,
        request_id: String,
        request: CapturedRequest,
        response: Option<CapturedResponse>,
    ) -> LogRecord {
        LogRecord {
            request_id,
            request,
            response,
            project: ProjectMeta::stamp(&self.project, Utc::now()),
        }
    }

    fn redact_content(&self, content: ResponseContent) -> ResponseContent {
        match content {
            ResponseContent::Json { mut body } => {
                self.redactor.redact_value_in_place(&mut body);
                ResponseContent::Json { body }
            }
            ResponseContent::Text { body } => ResponseContent::Text {
                body: self.redactor.redact(&body),
            },
            ResponseContent::EventStream { events, .. } => {
                let events: Vec<SseEvent> =
                    events.into_iter().map(|e| self.redact_event(e)).collect();
                // a secret split across deltas only becomes visible once they are joined
                let mut summary = reconstruct(&events);
                self.redact_summary(&mut summary);
                ResponseContent::EventStream { events, summary }
            }
            other => other,
        }
    }

    fn redact_summary(&self, summary: &mut ResponseSummary) {
        summary.assistant_message = self.redactor.redact(&summary.assistant_message);
        summary.thinking = self.redactor.redact(&summary.thinking);
        if let Some(error) = summary.error.as_mut() {
            *error = self.redactor.redact(error);
        }
        for call in &mut summary.tool_calls {
            match &mut call.input {
                ToolInput::Complete(value) => self.redactor.redact_value_in_place(value),
                ToolInput::Partial(buffer) => *buffer = self.redactor.redact(buffer),
            }
        }
    }

    fn redact_event(&self, event: SseEvent) -> SseEvent {
        let data = match event.data {
            SsePayload::Json(mut value) => {
                self.redactor.redact_value_in_place(&mut value);
                SsePayload::Json(value)
            }
            SsePayload::Raw(text) => SsePayload::Raw(self.redactor.redact(&text)),
        };
        SseEvent {
            event: event.event,
            data,
        }
    }
}

// Capture Lifecycle
//
// The boundary a host calls into while traffic flows. Each stage consumes the previous
// one, and every path out of the last live stage (normal end, error, abort, timeout,
// or simply being dropped) writes exactly one terminal record.

use crate::assembler::Assembler;
use crate::config::CaptureConfig;
use crate::record::{header_value, CapturedRequest, ErrorCause, HeaderMap, LogRecord, Protocol};
use crate::writer::DurableWriter;
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How a response body stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    Ended,
    Errored(String),
    Aborted,
}

struct Shared {
    assembler: Assembler,
    writer: Arc<DurableWriter>,
    capture: CaptureConfig,
}

impl Shared {
    fn commit(&self, record: LogRecord) {
        let request_id = record.request_id.clone();
        if let Err(e) = self.writer.enqueue(record) {
            tracing::error!("dropping record {}: {}", request_id, e);
        }
    }

    /// A timeout too large to represent saturates to roughly thirty years out
    fn deadline(&self, streaming: bool, from: Instant) -> Instant {
        from.checked_add(self.capture.timeout_for(streaming))
            .unwrap_or_else(|| far_future(from))
    }
}

fn far_future(from: Instant) -> Instant {
    from + Duration::from_secs(86400 * 365 * 30)
}

/// Entry point: one per process, cloned into every request handler
#[derive(Clone)]
pub struct Recorder {
    shared: Arc<Shared>,
}

impl Recorder {
    pub fn new(assembler: Assembler, writer: Arc<DurableWriter>, capture: CaptureConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                assembler,
                writer,
                capture,
            }),
        }
    }

    pub fn writer(&self) -> &Arc<DurableWriter> {
        &self.shared.writer
    }

    /// Request head received
    pub fn begin(
        &self,
        protocol: Protocol,
        method: &str,
        url: &str,
        headers: HeaderMap,
    ) -> RequestCapture {
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!("[{}] {} {}", request_id, method, url);
        RequestCapture {
            shared: self.shared.clone(),
            request_id,
            protocol,
            method: method.to_string(),
            url: url.to_string(),
            headers,
            body: Vec::new(),
        }
    }
}

/// Collecting the outgoing request body
pub struct RequestCapture {
    shared: Arc<Shared>,
    request_id: String,
    protocol: Protocol,
    method: String,
    url: String,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl RequestCapture {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn write_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    /// Request body complete; the request becomes immutable and the response clock starts
    pub fn end(self) -> PendingResponse {
        let request = self.shared.assembler.request(
            self.protocol,
            &self.method,
            &self.url,
            &self.headers,
            &self.body,
            Utc::now(),
        );
        let streaming = request.wants_stream();
        let sent_at = Instant::now();
        PendingResponse {
            deadline: self.shared.deadline(streaming, sent_at),
            shared: self.shared,
            request_id: self.request_id,
            request: Some(request),
            streaming,
            sent_at,
        }
    }
}

/// Request sent, waiting for the response head
pub struct PendingResponse {
    shared: Arc<Shared>,
    request_id: String,
    /// Taken by whichever path writes the terminal record
    request: Option<CapturedRequest>,
    streaming: bool,
    sent_at: Instant,
    deadline: Instant,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Response head received
    pub fn respond(mut self, status: u16, headers: HeaderMap) -> ResponseCapture {
        let declared_stream = header_value(&headers, "content-type")
            .map(|ct| ct.to_ascii_lowercase().contains("text/event-stream"))
            .unwrap_or(false);
        let streaming = self.streaming || declared_stream;
        let deadline = if streaming && !self.streaming {
            self.shared.deadline(true, self.sent_at)
        } else {
            self.deadline
        };

        ResponseCapture {
            shared: self.shared.clone(),
            request_id: std::mem::take(&mut self.request_id),
            request: self.request.take(),
            status,
            headers,
            body: Vec::new(),
            streaming,
            timeout: self.shared.capture.timeout_for(streaming),
            deadline,
        }
    }

    /// Connection closed before any response head arrived
    pub fn close_without_response(mut self) {
        self.finalize_without_response(
            "request closed without a response".to_string(),
            ErrorCause::NoResponse,
        );
    }

    /// Upstream could not be reached or rejected the request outright
    pub fn fail(mut self, error: impl Display) {
        self.finalize_without_response(error.to_string(), ErrorCause::StreamError);
    }

    /// No response head before the deadline
    pub fn time_out(mut self) {
        let Some(request) = self.request.take() else {
            return;
        };
        let timeout = self.shared.capture.timeout_for(self.streaming);
        let assembler = &self.shared.assembler;
        let content = assembler.timeout_content(timeout.as_millis() as u64, &HeaderMap::new(), &[]);
        let response = assembler.response(None, &HeaderMap::new(), content, Utc::now());
        tracing::warn!("[{}] no response within {:?}", self.request_id, timeout);
        self.shared.commit(assembler.record(
            std::mem::take(&mut self.request_id),
            request,
            Some(response),
        ));
    }

    fn finalize_without_response(&mut self, error: String, cause: ErrorCause) {
        let Some(request) = self.request.take() else {
            return;
        };
        let assembler = &self.shared.assembler;
        let content = assembler.error_content(error, cause, &HeaderMap::new(), &[]);
        let response = assembler.response(None, &HeaderMap::new(), content, Utc::now());
        tracing::debug!("[{}] finished without response ({:?})", self.request_id, cause);
        self.shared.commit(assembler.record(
            std::mem::take(&mut self.request_id),
            request,
            Some(response),
        ));
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.request.is_some() {
            self.finalize_without_response(
                "request dropped before a response arrived".to_string(),
                ErrorCause::NoResponse,
            );
        }
    }
}

/// Collecting the response body
pub struct ResponseCapture {
    shared: Arc<Shared>,
    request_id: String,
    request: Option<CapturedRequest>,
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
    streaming: bool,
    timeout: Duration,
    deadline: Instant,
}

impl ResponseCapture {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// The response must finish before this instant or be finalized as a timeout
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    pub fn finish(mut self, end: StreamEnd) {
        self.finalize(end);
    }

    /// Deadline passed; keep whatever body arrived
    pub fn time_out(mut self) {
        let Some(request) = self.request.take() else {
            return;
        };
        let assembler = &self.shared.assembler;
        let content =
            assembler.timeout_content(self.timeout.as_millis() as u64, &self.headers, &self.body);
        let response = assembler.response(Some(self.status), &self.headers, content, Utc::now());
        tracing::warn!(
            "[{}] response timed out after {:?} with {} bytes received",
            self.request_id,
            self.timeout,
            self.body.len()
        );
        self.shared.commit(assembler.record(
            std::mem::take(&mut self.request_id),
            request,
            Some(response),
        ));
    }

    fn finalize(&mut self, end: StreamEnd) {
        let Some(request) = self.request.take() else {
            return;
        };
        let assembler = &self.shared.assembler;
        let content = match &end {
            StreamEnd::Ended => assembler.response_content(&self.headers, &self.body),
            StreamEnd::Errored(message) => assembler.error_content(
                message.clone(),
                ErrorCause::StreamError,
                &self.headers,
                &self.body,
            ),
            StreamEnd::Aborted => assembler.error_content(
                "connection aborted before the response completed",
                ErrorCause::Aborted,
                &self.headers,
                &self.body,
            ),
        };
        let response = assembler.response(Some(self.status), &self.headers, content, Utc::now());
        tracing::debug!(
            "[{}] response {} finished: {:?} ({} bytes)",
            self.request_id,
            self.status,
            end,
            self.body.len()
        );
        self.shared.commit(assembler.record(
            std::mem::take(&mut self.request_id),
            request,
            Some(response),
        ));
    }
}

impl Drop for ResponseCapture {
    fn drop(&mut self) {
        if self.request.is_some() {
            self.finalize(StreamEnd::Aborted);
        }
    }
}

/// Feed a response body stream into `capture`, suspending per chunk, until it ends,
/// errors or runs past the capture deadline.
pub async fn drive_response<S, B, E>(mut capture: ResponseCapture, stream: S)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let deadline = capture.deadline();
    let mut stream = std::pin::pin!(stream);

    loop {
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(chunk))) => capture.write_chunk(chunk.as_ref()),
            Ok(Some(Err(e))) => return capture.finish(StreamEnd::Errored(e.to_string())),
            Ok(None) => return capture.finish(StreamEnd::Ended),
            Err(_) => return capture.time_out(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProjectInfo, WriterConfig};
    use crate::record::ResponseContent;
    use crate::redact::Redactor;
    use crate::storage::RecordSink;
    use crate::error::Result;
    use parking_lot::Mutex;
    use std::path::{Path, PathBuf};

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<LogRecord>>,
        path: PathBuf,
    }

    impl RecordSink for MemorySink {
        fn append(&self, records: &[LogRecord]) -> Result<()> {
            self.records.lock().extend_from_slice(records);
            Ok(())
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    fn recorder(capture: CaptureConfig) -> (Recorder, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let writer = DurableWriter::open(WriterConfig::default(), sink.clone()).unwrap();
        let assembler = Assembler::new(Arc::new(Redactor::default()), ProjectInfo::default());
        (Recorder::new(assembler, Arc::new(writer), capture), sink)
    }

    async fn persisted(recorder: &Recorder, sink: &MemorySink) -> Vec<LogRecord> {
        recorder.writer().flush().await.unwrap();
        sink.records.lock().clone()
    }

    fn json_headers() -> HeaderMap {
        HeaderMap::from([("content-type".to_string(), "application/json".to_string())])
    }

    fn begin(recorder: &Recorder, body: &[u8]) -> PendingResponse {
        let mut request = recorder.begin(
            Protocol::Https,
            "POST",
            "https://api.anthropic.com/v1/messages",
            HeaderMap::from([("x-api-key".to_string(), "sk-ant-secret".to_string())]),
        );
        request.write_body(body);
        request.end()
    }

    #[tokio::test]
    async fn test_complete_exchange_writes_one_record() {
        let (recorder, sink) = recorder(CaptureConfig::default());
        let pending = begin(&recorder, br#"{"model":"claude-sonnet-4"}"#);
        let mut response = pending.respond(200, json_headers());
        response.write_chunk(br#"{"id":"msg_1","#);
        response.write_chunk(br#""type":"message"}"#);
        response.finish(StreamEnd::Ended);

        let records = persisted(&recorder, &sink).await;
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.request.headers["x-api-key"], crate::redact::REDACTED);
        let response = record.response.as_ref().unwrap();
        assert_eq!(response.status_code, Some(200));
        assert!(matches!(response.content, ResponseContent::Json { .. }));
    }

    #[tokio::test]
    async fn test_dropped_captures_are_finalized() {
        let (recorder, sink) = recorder(CaptureConfig::default());

        drop(begin(&recorder, b"{}"));
        let response = begin(&recorder, b"{}").respond(200, json_headers());
        drop(response);
        begin(&recorder, b"{}").close_without_response();

        let records = persisted(&recorder, &sink).await;
        assert_eq!(records.len(), 3);
        let causes: Vec<ErrorCause> = records
            .iter()
            .map(|r| match &r.response.as_ref().unwrap().content {
                ResponseContent::Error { cause, .. } => *cause,
                other => panic!("expected error content, got {:?}", other),
            })
            .collect();
        assert_eq!(
            causes,
            vec![ErrorCause::NoResponse, ErrorCause::Aborted, ErrorCause::NoResponse]
        );
    }

    #[tokio::test]
    async fn test_streaming_detected_from_request_body() {
        let (recorder, _sink) = recorder(CaptureConfig {
            response_timeout_ms: 10,
            stream_timeout_ms: 10_000,
        });
        let before = Instant::now();
        let pending = begin(&recorder, br#"{"stream": true}"#);
        assert!(pending.deadline() >= before + Duration::from_millis(10_000));
        let response = pending.respond(200, json_headers());
        assert!(response.is_streaming());
        response.finish(StreamEnd::Ended);
    }

    #[tokio::test]
    async fn test_drive_response_reconstructs_stream() {
        let (recorder, sink) = recorder(CaptureConfig::default());
        let response = begin(&recorder, br#"{"stream": true}"#).respond(
            200,
            HeaderMap::from([("content-type".to_string(), "text/event-stream".to_string())]),
        );
        let chunks: Vec<std::result::Result<Vec<u8>, String>> = vec![
            Ok(b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":10,\"output_tokens\":0}}}\n\n".to_vec()),
            Ok(b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n".to_vec()),
            Ok(b"event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":2}}\n\n".to_vec()),
        ];
        drive_response(response, futures::stream::iter(chunks)).await;

        let records = persisted(&recorder, &sink).await;
        let summary = records[0].response.as_ref().unwrap().content.summary().unwrap().clone();
        assert_eq!(summary.input_tokens, Some(10));
        assert_eq!(summary.output_tokens, Some(2));
        assert_eq!(summary.assistant_message, "Hi");
    }

    #[tokio::test]
    async fn test_stream_error_keeps_partial() {
        let (recorder, sink) = recorder(CaptureConfig::default());
        let response = begin(&recorder, b"{}").respond(200, json_headers());
        let chunks: Vec<std::result::Result<Vec<u8>, String>> =
            vec![Ok(b"{\"partial\":".to_vec()), Err("connection reset".to_string())];
        drive_response(response, futures::stream::iter(chunks)).await;

        let records = persisted(&recorder, &sink).await;
        match &records[0].response.as_ref().unwrap().content {
            ResponseContent::Error { error, cause, partial } => {
                assert_eq!(error, "connection reset");
                assert_eq!(*cause, ErrorCause::StreamError);
                assert!(matches!(partial.as_deref(), Some(ResponseContent::Text { .. })));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_response_head_before_deadline() {
        let (recorder, sink) = recorder(CaptureConfig {
            response_timeout_ms: 30,
            stream_timeout_ms: 30,
        });
        let pending = begin(&recorder, b"{}");
        let head = tokio::time::timeout_at(pending.deadline(), futures::future::pending::<()>()).await;
        assert!(head.is_err());
        pending.time_out();

        let records = persisted(&recorder, &sink).await;
        assert_eq!(records.len(), 1);
        let response = records[0].response.as_ref().unwrap();
        assert_eq!(response.status_code, None);
        match &response.content {
            ResponseContent::Timeout { timeout_ms, partial, .. } => {
                assert_eq!(*timeout_ms, 30);
                assert!(partial.is_none());
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_huge_timeout_does_not_overflow_deadline() {
        let (recorder, _sink) = recorder(CaptureConfig {
            response_timeout_ms: u64::MAX,
            stream_timeout_ms: u64::MAX,
        });
        let before = Instant::now();
        let pending = begin(&recorder, br#"{"stream": true}"#);
        assert!(pending.deadline() > before + Duration::from_secs(86400 * 365));
        let response = pending.respond(
            200,
            HeaderMap::from([("content-type".to_string(), "text/event-stream".to_string())]),
        );
        assert!(response.deadline() > before + Duration::from_secs(86400 * 365));
        response.finish(StreamEnd::Ended);
    }

    #[tokio::test]
    async fn test_hung_response_times_out() {
        let (recorder, sink) = recorder(CaptureConfig {
            response_timeout_ms: 50,
            stream_timeout_ms: 50,
        });
        let response = begin(&recorder, b"{}").respond(200, json_headers());
        let hung = futures::stream::iter(vec![Ok::<_, String>(b"{\"a\"".to_vec())])
            .chain(futures::stream::pending());
        drive_response(response, hung).await;

        let records = persisted(&recorder, &sink).await;
        assert_eq!(records.len(), 1);
        match &records[0].response.as_ref().unwrap().content {
            ResponseContent::Timeout { timeout_ms, partial, .. } => {
                assert_eq!(*timeout_ms, 50);
                assert!(partial.is_some());
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}

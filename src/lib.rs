// Agent Traffic Logger - Main Library
//
// Records request/response exchanges between a command-line agent and the model API as
// redacted, structured log records, and reads them back as a reviewable transcript.

pub mod assembler;
pub mod capture;
pub mod config;
pub mod decode;
pub mod error;
pub mod migrate;
pub mod proxy;
pub mod reconstruct;
pub mod record;
pub mod redact;
pub mod sse;
pub mod storage;
pub mod transcript;
pub mod writer;

pub use assembler::Assembler;
pub use capture::{drive_response, PendingResponse, Recorder, RequestCapture, ResponseCapture, StreamEnd};
pub use config::AppConfig;
pub use error::{LoggerError, Result};
pub use reconstruct::{reconstruct, ResponseSummary, StreamReconstructor, ToolCallRecord, ToolInput};
pub use record::{CapturedRequest, CapturedResponse, LogRecord, ResponseContent};
pub use redact::Redactor;
pub use transcript::{Transcript, TranscriptEntry, TranscriptSummary};
pub use writer::{CloseSummary, DurableWriter};

use std::sync::Arc;

/// Install the global tracing subscriber. `RUST_LOG` wins over the debug flag.
pub fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .try_init();
}

/// Wire up the capture pipeline from configuration: redactor, assembler, writer, recorder
pub fn build_recorder(config: &AppConfig) -> Result<Recorder> {
    let redactor = Arc::new(Redactor::new(&config.redaction));
    let assembler = Assembler::new(redactor, config.project.clone());
    let writer = DurableWriter::open(config.writer.clone(), storage::sink_for(&config.writer))?;
    Ok(Recorder::new(assembler, Arc::new(writer), config.capture.clone()))
}

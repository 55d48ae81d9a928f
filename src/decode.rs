// Response Body Decoding
//
// Undo content-encoding, fall back to sniffing gzip when the server did not declare it,
// then classify the text as an event stream, JSON or plain text.

use crate::reconstruct::reconstruct;
use crate::record::ResponseContent;
use crate::sse::{looks_like_event_stream, parse_frames};
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use serde_json::Value;
use std::io::Read;
use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported content-encoding '{0}'")]
    UnsupportedEncoding(String),

    #[error("failed to decode {encoding} body: {source}")]
    Decompress {
        encoding: String,
        #[source]
        source: std::io::Error,
    },

    #[error("body is not valid UTF-8")]
    NotUtf8,
}

fn read_all(mut reader: impl Read, encoding: &str) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .map_err(|source| DecodeError::Decompress {
            encoding: encoding.to_string(),
            source,
        })?;
    Ok(out)
}

fn decode_one(data: &[u8], encoding: &str) -> Result<Vec<u8>, DecodeError> {
    match encoding {
        "gzip" | "x-gzip" => read_all(GzDecoder::new(data), encoding),
        "br" => read_all(brotli::Decompressor::new(data, 4096), encoding),
        // HTTP "deflate" is zlib-wrapped, but raw deflate shows up in the wild
        "deflate" => read_all(ZlibDecoder::new(data), encoding)
            .or_else(|_| read_all(DeflateDecoder::new(data), encoding)),
        "identity" | "" => Ok(data.to_vec()),
        other => Err(DecodeError::UnsupportedEncoding(other.to_string())),
    }
}

/// Undo every declared encoding, last applied first
pub fn decompress(data: &[u8], content_encoding: &str) -> Result<Vec<u8>, DecodeError> {
    let encodings: Vec<String> = content_encoding
        .split(',')
        .map(|e| e.trim().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect();

    let mut current = data.to_vec();
    for encoding in encodings.iter().rev() {
        current = decode_one(&current, encoding)?;
    }
    Ok(current)
}

pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

fn utf8(bytes: Vec<u8>) -> Result<String, DecodeError> {
    String::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)
}

/// Decode a response body to text.
///
/// Tries the declared encoding, then gzip sniffing, then the bytes as-is. The error
/// returned is the first one hit, since it best describes what the server claimed.
pub fn decode_text(data: &[u8], content_encoding: Option<&str>) -> Result<String, DecodeError> {
    let mut first_error: Option<DecodeError> = None;

    if let Some(encoding) = content_encoding.filter(|e| !e.trim().is_empty()) {
        match decompress(data, encoding).and_then(utf8) {
            Ok(text) => return Ok(text),
            Err(e) => {
                tracing::debug!("declared content-encoding '{}' failed: {}", encoding, e);
                first_error = Some(e);
            }
        }
    }

    if is_gzip(data) {
        match read_all(GzDecoder::new(data), "gzip").and_then(utf8) {
            Ok(text) => return Ok(text),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match utf8(data.to_vec()) {
        Ok(text) => Ok(text),
        Err(e) => Err(first_error.unwrap_or(e)),
    }
}

/// Classify decoded text by content-type and shape
pub fn classify(text: String, content_type: Option<&str>) -> ResponseContent {
    if text.trim().is_empty() {
        return ResponseContent::Empty;
    }

    let declared_stream = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false);
    if declared_stream || looks_like_event_stream(&text) {
        let events = parse_frames(&text);
        let summary = reconstruct(&events);
        return ResponseContent::EventStream { events, summary };
    }

    match serde_json::from_str::<Value>(&text) {
        Ok(body) => ResponseContent::Json { body },
        Err(_) => ResponseContent::Text { body: text },
    }
}

/// Full body pipeline: decode, then classify. Never fails; undecodable bodies become
/// a `BodyError` marker.
pub fn decode_response_body(
    data: &[u8],
    content_encoding: Option<&str>,
    content_type: Option<&str>,
) -> ResponseContent {
    if data.is_empty() {
        return ResponseContent::Empty;
    }
    match decode_text(data, content_encoding) {
        Ok(text) => classify(text, content_type),
        Err(e) => {
            tracing::warn!("storing undecodable response body ({} bytes): {}", data.len(), e);
            ResponseContent::BodyError {
                body_error: e.to_string(),
                byte_len: data.len(),
            }
        }
    }
}

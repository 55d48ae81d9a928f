// HTTP Proxy Server and Handler
//
// Recording forwarder for a single upstream. Request and response bytes pass through
// untouched; the response body is teed into a ResponseCapture as it streams, until
// the capture finishes or its deadline passes.

use crate::capture::{Recorder, StreamEnd};
use crate::config::ProxyConfig;
use crate::error::{LoggerError, Result};
use crate::record::{HeaderMap as RecordHeaders, Protocol};

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::StreamExt;
use reqwest::Client;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Convert axum HeaderMap to a record header map; repeated headers are joined
fn headers_to_map(headers: &HeaderMap) -> RecordHeaders {
    let mut map = RecordHeaders::new();
    for (k, v) in headers.iter() {
        let value = v.to_str().unwrap_or("").to_string();
        map.entry(k.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.clone());
    }
    map
}

/// Convert reqwest HeaderMap to a record header map
fn reqwest_headers_to_map(headers: &reqwest::header::HeaderMap) -> RecordHeaders {
    let mut map = RecordHeaders::new();
    for (k, v) in headers.iter() {
        let value = v.to_str().unwrap_or("").to_string();
        map.entry(k.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.clone());
    }
    map
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, message).into_response()
}

#[derive(Clone)]
struct ProxyState {
    client: Client,
    upstream: String,
    recorder: Recorder,
}

async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "application/json")],
        r#"{"status":"healthy"}"#,
    )
}

async fn proxy_handler(State(state): State<ProxyState>, req: Request) -> Response {
    let method = req.method().clone();
    let full_path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = req.headers().clone();
    let target_url = format!("{}{}", state.upstream.trim_end_matches('/'), full_path);

    let body_bytes = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Failed to read request body: {}", e),
            );
        }
    };

    let mut capture = state.recorder.begin(
        Protocol::from_url(&target_url),
        method.as_str(),
        &target_url,
        headers_to_map(&headers),
    );
    capture.write_body(&body_bytes);
    let pending = capture.end();
    let request_id = pending.request_id().to_string();

    let mut upstream_req = state.client.request(method, &target_url);

    // Skip headers that we need to recalculate or that shouldn't be forwarded
    let skip_request_headers = ["host", "content-length", "connection"];
    for (name, value) in headers.iter() {
        if !skip_request_headers.contains(&name.as_str()) {
            if let Ok(header_name) = reqwest::header::HeaderName::from_bytes(name.as_ref()) {
                if let Ok(header_value) = reqwest::header::HeaderValue::from_bytes(value.as_bytes())
                {
                    upstream_req = upstream_req.header(header_name, header_value);
                }
            }
        }
    }
    if !body_bytes.is_empty() {
        upstream_req = upstream_req.body(body_bytes);
    }

    tracing::debug!("[{}] forwarding to {}", request_id, target_url);
    // The deadline bounds the record, not the exchange: once it passes the capture is
    // finalized as a timeout and the client keeps waiting on the upstream.
    let deadline = pending.deadline();
    let mut send = std::pin::pin!(upstream_req.send());
    let head = tokio::time::timeout_at(deadline, send.as_mut()).await;
    let (sent, pending) = match head {
        Ok(sent) => (sent, Some(pending)),
        Err(_) => {
            pending.time_out();
            (send.await, None)
        }
    };
    let response = match sent {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!("[{}] upstream error: {}", request_id, e);
            let message = format!("Proxy error: {}", e);
            if let Some(pending) = pending {
                pending.fail(&e);
            }
            return error_response(StatusCode::BAD_GATEWAY, message);
        }
    };

    let status = response.status();
    let resp_headers = response.headers().clone();
    tracing::debug!("[{}] upstream responded {}", request_id, status);

    let mut response_capture =
        pending.map(|p| p.respond(status.as_u16(), reqwest_headers_to_map(&resp_headers)));

    let mut response_headers = HeaderMap::new();
    let skip_headers = ["content-length", "transfer-encoding", "connection"];
    for (name, value) in resp_headers.iter() {
        if !skip_headers.contains(&name.as_str()) {
            if let Ok(header_name) = axum::http::header::HeaderName::from_bytes(name.as_ref()) {
                if let Ok(header_value) = HeaderValue::from_bytes(value.as_bytes()) {
                    response_headers.append(header_name, header_value);
                }
            }
        }
    }

    let upstream_stream = response.bytes_stream();
    let logged_stream = async_stream::stream! {
        let mut inner = std::pin::pin!(upstream_stream);
        let mut chunk_count = 0usize;
        loop {
            let next = match response_capture.as_ref().map(|c| c.deadline()) {
                Some(deadline) => match tokio::time::timeout_at(deadline, inner.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        if let Some(capture) = response_capture.take() {
                            capture.time_out();
                        }
                        tracing::debug!("[{}] capture closed, forwarding the rest unrecorded", request_id);
                        continue;
                    }
                },
                None => inner.next().await,
            };
            match next {
                Some(Ok(bytes)) => {
                    chunk_count += 1;
                    if let Some(capture) = response_capture.as_mut() {
                        capture.write_chunk(&bytes);
                    }
                    yield Ok::<Bytes, std::io::Error>(bytes);
                }
                Some(Err(e)) => {
                    let message = e.to_string();
                    tracing::warn!("upstream stream error after {} chunks: {}", chunk_count, message);
                    if let Some(capture) = response_capture.take() {
                        capture.finish(StreamEnd::Errored(message.clone()));
                    }
                    yield Err(std::io::Error::new(std::io::ErrorKind::Other, message));
                    break;
                }
                None => {
                    tracing::debug!("stream completed, {} chunks", chunk_count);
                    if let Some(capture) = response_capture.take() {
                        capture.finish(StreamEnd::Ended);
                    }
                    break;
                }
            }
        }
    };

    // If the client disconnects, the stream and its capture are dropped and the record
    // is finalized as aborted.
    let mut resp = Response::new(Body::from_stream(logged_stream));
    *resp.status_mut() = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK);
    *resp.headers_mut() = response_headers;
    resp
}

pub fn router(upstream: &str, recorder: Recorder) -> Router {
    let state = ProxyState {
        client: Client::new(),
        upstream: upstream.to_string(),
        recorder,
    };
    Router::new()
        .route("/", get(health_handler))
        .fallback(proxy_handler)
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` flips to true
pub async fn serve(
    listener: TcpListener,
    upstream: &str,
    recorder: Recorder,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = router(upstream, recorder);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    tracing::info!("shutting down proxy server");
                    break;
                }
            }
        })
        .await
        .map_err(|e| LoggerError::Server(e.to_string()))
}

pub async fn run_proxy(
    config: &ProxyConfig,
    recorder: Recorder,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| LoggerError::Server(format!("failed to bind to port {}: {}", config.port, e)))?;
    tracing::info!(
        "proxy running on http://{} -> {}",
        addr,
        config.upstream_url
    );
    serve(listener, &config.upstream_url, recorder, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/plain"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        headers.insert("x-api-key", HeaderValue::from_static("secret"));

        let map = headers_to_map(&headers);
        assert_eq!(map["accept"], "text/plain, application/json");
        assert_eq!(map["x-api-key"], "secret");
    }
}

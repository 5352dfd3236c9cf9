use axum::{body::Body, http::StatusCode, response::Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tracing::warn;

use crate::proxy::handlers::errors::stream_error_frame;

pub type BytesResultStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

/// Waits for the first non-empty chunk so response headers are flushed only
/// once the upstream has actually started talking. An error, an empty
/// stream, or a timeout here lets the caller fall back to a JSON error (or a
/// retry) instead of an already-committed empty stream.
pub async fn peek_first_chunk(
    stream: &mut BytesResultStream,
    timeout: Duration,
) -> Result<Bytes, String> {
    loop {
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(Ok(bytes))) => {
                if bytes.is_empty() {
                    continue;
                }
                return Ok(bytes);
            }
            Ok(Some(Err(e))) => return Err(format!("Stream error before first chunk: {e}")),
            Ok(None) => return Err("Empty response stream".to_string()),
            Err(_) => return Err("Timeout waiting for first upstream chunk".to_string()),
        }
    }
}

/// Streaming passthrough response. Chunks flow to the client in arrival
/// order; the previously peeked first chunk is put back in front. An
/// upstream failure after this point cannot change the status line anymore,
/// so it becomes a final `stream_error` data event and the stream closes.
pub fn build_stream_response(
    first_chunk: Bytes,
    rest: BytesResultStream,
    content_type: Option<&str>,
    upstream_request_id: Option<&str>,
) -> Response {
    let guarded = rest.scan(false, |errored, item| {
        let next = if *errored {
            None
        } else {
            match item {
                Ok(bytes) => Some(Ok(bytes)),
                Err(e) => {
                    *errored = true;
                    warn!("[Gateway] Upstream stream failed mid-response: {}", e);
                    Some(Ok::<Bytes, String>(stream_error_frame(&e)))
                }
            }
        };
        futures::future::ready(next)
    });
    let combined = futures::stream::once(async move { Ok::<Bytes, String>(first_chunk) })
        .chain(guarded);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", content_type.unwrap_or("text/event-stream"))
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no");
    if let Some(id) = upstream_request_id {
        builder = builder.header("X-Request-Id", id);
    }

    builder
        .body(Body::from_stream(combined))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Non-streaming passthrough: upstream status and body verbatim.
pub fn build_json_passthrough_response(
    status: StatusCode,
    body: Bytes,
    content_type: Option<&str>,
    upstream_request_id: Option<&str>,
) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", content_type.unwrap_or("application/json"));
    if let Some(id) = upstream_request_id {
        builder = builder.header("X-Request-Id", id);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

use axum::{
    extract::{Request, State},
    response::Response,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::constants::MAX_BODY_BYTES;
use crate::proxy::handlers::errors::{
    internal_error_response, invalid_json_response, payload_too_large_response,
    request_aborted_response,
};
use crate::proxy::state::AppState;

/// `POST /api/proxy/chat/completions`. The body is forwarded verbatim; the
/// only field the relay reads is `stream`.
pub async fn chat_completions(State(state): State<AppState>, request: Request) -> Response {
    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            if is_length_limit_error(&e) {
                return payload_too_large_response();
            }
            // The client went away mid-upload; not worth a log line above
            // debug.
            debug!("[Gateway] Body receive aborted: {}", e);
            return request_aborted_response();
        }
    };

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => return invalid_json_response(&e.to_string()),
    };
    let want_stream = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let trace_id = format!("req_{}", Uuid::new_v4().simple());
    debug!("[Gateway] {} accepted (stream={})", trace_id, want_stream);

    // The engine runs detached so a client disconnect cancels it through the
    // token instead of tearing the task down mid-transaction. Dropping this
    // handler future (hyper does that when the socket closes) fires the
    // guard.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let engine = state.engine.clone();
    let task = tokio::spawn(async move {
        engine.forward(body, want_stream, &trace_id, cancel).await
    });

    let result = task.await;
    // Normal completion: a late socket close must not read as a disconnect.
    let _token = guard.disarm();
    match result {
        Ok(response) => response,
        Err(e) => internal_error_response(&format!("engine task failed: {e}")),
    }
}

fn is_length_limit_error(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
            return true;
        }
        source = e.source();
    }
    false
}

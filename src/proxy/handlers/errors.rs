use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde_json::{json, Value};

use crate::modules::persistence::block_db::BlockRecord;

/// Every client-visible error uses the same envelope:
/// `{"error": {"message", "type", ...}}`.
pub fn error_response(status: StatusCode, error_type: &str, message: impl Into<String>) -> Response {
    error_response_with(status, error_type, message, Vec::new())
}

pub fn error_response_with(
    status: StatusCode,
    error_type: &str,
    message: impl Into<String>,
    extra: Vec<(&'static str, Value)>,
) -> Response {
    let mut error = json!({
        "message": message.into(),
        "type": error_type,
    });
    if let Some(obj) = error.as_object_mut() {
        for (key, value) in extra {
            obj.insert(key.to_string(), value);
        }
    }
    (status, Json(json!({ "error": error }))).into_response()
}

pub fn ip_blocked_response(record: &BlockRecord) -> Response {
    let remaining = record.remaining_minutes();
    error_response_with(
        StatusCode::SERVICE_UNAVAILABLE,
        "ip_blocked",
        format!(
            "Upstream has rate limited this server's IP; retry in {} minutes",
            remaining
        ),
        vec![
            ("reason", json!(record.reason)),
            ("unblock_at", json!(record.unblock_at)),
            ("remaining_minutes", json!(remaining)),
        ],
    )
}

pub fn service_unavailable_response(reason: &str) -> Response {
    error_response_with(
        StatusCode::SERVICE_UNAVAILABLE,
        "service_unavailable",
        "No upstream credential could serve this request",
        vec![("reason", json!(reason))],
    )
}

pub fn unauthorized_response() -> Response {
    error_response(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "Missing or invalid bearer token",
    )
}

pub fn invalid_json_response(detail: &str) -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        "invalid_json",
        format!("Request body is not valid JSON: {detail}"),
    )
}

pub fn payload_too_large_response() -> Response {
    error_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        "payload_too_large",
        "Request body exceeds the 100 MB limit",
    )
}

/// The client is gone; nobody will read this. Exists so the handler has a
/// value to return without logging noise.
pub fn request_aborted_response() -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        "request_aborted",
        "Client closed the connection",
    )
}

/// SSE frame injected when the upstream stream dies after headers are
/// already committed to the client; the status line cannot change at that
/// point, so the error travels as a final data event before the stream
/// closes.
pub fn stream_error_frame(detail: &str) -> Bytes {
    let payload = json!({
        "error": {
            "message": format!("Upstream stream failed: {detail}"),
            "type": "stream_error",
        }
    });
    Bytes::from(format!("data: {payload}\n\n"))
}

pub fn gateway_timeout_response() -> Response {
    error_response(
        StatusCode::GATEWAY_TIMEOUT,
        "gateway_timeout",
        "Timed out before the upstream produced a response",
    )
}

pub fn internal_error_response(detail: &str) -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        format!("Internal error: {detail}"),
    )
}

pub fn app_error_response(err: &crate::error::AppError) -> Response {
    use crate::error::AppError;
    match err {
        AppError::Conflict(msg) => error_response(StatusCode::CONFLICT, "conflict", msg.clone()),
        AppError::NotFound(msg) => error_response(StatusCode::NOT_FOUND, "not_found", msg.clone()),
        other => internal_error_response(&other.to_string()),
    }
}

use axum::{extract::State, response::IntoResponse, response::Response, Json};
use serde_json::json;

use crate::proxy::handlers::errors::internal_error_response;
use crate::proxy::state::AppState;

/// `GET /api/proxy/health`.
pub async fn health(State(state): State<AppState>) -> Response {
    match state.store.active_block_record() {
        Ok(record) => Json(json!({
            "status": "ok",
            "ip_blocked": record.is_some(),
            "block_info": record.map(|r| json!({
                "blocked_at": r.blocked_at,
                "unblock_at": r.unblock_at,
                "reason": r.reason,
                "remaining_minutes": r.remaining_minutes(),
            })),
        }))
        .into_response(),
        Err(e) => internal_error_response(&e.to_string()),
    }
}

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::modules::persistence::credential_db::Credential;
use crate::modules::persistence::proxy_db::ProxyScheme;
use crate::proxy::handlers::errors::{app_error_response, error_response};
use crate::proxy::state::AppState;

fn credential_view(credential: &Credential, mask: bool) -> Value {
    json!({
        "id": credential.id,
        "secret": if mask { credential.masked_secret() } else { credential.secret.clone() },
        "status": credential.status,
        "available": credential.available,
        "balance": credential.balance,
        "balance_checked_at": credential.balance_checked_at,
        "call_count": credential.call_count,
        "created_at": credential.created_at,
        "last_used_at": credential.last_used_at,
        "error_count": credential.error_count,
        "last_error": credential.last_error,
    })
}

/// `GET /api/keys` — masked listing.
pub async fn list_keys(State(state): State<AppState>) -> Response {
    match state.store.list_credentials() {
        Ok(credentials) => Json(
            credentials
                .iter()
                .map(|c| credential_view(c, true))
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => app_error_response(&e),
    }
}

/// `GET /api/keys/export` — the one path that returns full secrets.
pub async fn export_keys(State(state): State<AppState>) -> Response {
    match state.store.list_credentials() {
        Ok(credentials) => Json(
            credentials
                .iter()
                .map(|c| credential_view(c, false))
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => app_error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct AddKeyRequest {
    pub secret: String,
}

/// `POST /api/keys`.
pub async fn add_key(
    State(state): State<AppState>,
    Json(request): Json<AddKeyRequest>,
) -> Response {
    let secret = request.secret.trim();
    if secret.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "secret must not be empty",
        );
    }
    match state.store.add_credential(secret) {
        Ok(id) => {
            state.selector.mark_dirty();
            info!("[Admin] Added key {}", id);
            (StatusCode::CREATED, Json(json!({"id": id}))).into_response()
        }
        Err(e) => app_error_response(&e),
    }
}

/// `DELETE /api/keys/{id}`.
pub async fn delete_key(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.delete_credential(id) {
        Ok(()) => {
            let _ = state.selector.refresh();
            info!("[Admin] Deleted key {}", id);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => app_error_response(&e),
    }
}

/// `POST /api/keys/{id}/toggle` — manual availability override.
pub async fn toggle_key(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.availability.manual_toggle(id) {
        Ok(credential) => {
            info!(
                "[Admin] Toggled key {} (available={})",
                id, credential.available
            );
            Json(credential_view(&credential, true)).into_response()
        }
        Err(e) => app_error_response(&e),
    }
}

/// `POST /api/keys/{id}/check-balance` — on-demand probe.
pub async fn check_key_balance(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let credential = match state.store.get_credential(id) {
        Ok(Some(c)) => c,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, "not_found", format!("credential {id}"))
        }
        Err(e) => return app_error_response(&e),
    };

    let probe = state.upstream.probe_balance(&credential.secret).await;
    if let Err(e) = state.availability.apply_balance_probe(id, &probe) {
        return app_error_response(&e);
    }
    if let Err(e) = state.availability.recheck(id) {
        return app_error_response(&e);
    }
    Json(json!({
        "ok": probe.ok,
        "balance": probe.balance,
        "message": probe.message,
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct LogQuery {
    #[serde(default = "default_log_limit")]
    pub limit: u32,
}

fn default_log_limit() -> u32 {
    50
}

/// `GET /api/keys/{id}/log` — most recent attempts, newest first.
pub async fn key_log(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<LogQuery>,
) -> Response {
    match state.store.recent_usage(id, query.limit.min(500)) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => app_error_response(&e),
    }
}

/// `GET /api/proxies`.
pub async fn list_proxies(State(state): State<AppState>) -> Response {
    let proxies = match state.store.list_proxies() {
        Ok(proxies) => proxies,
        Err(e) => return app_error_response(&e),
    };
    let pin = state.store.get_proxy_pin().ok().flatten();
    let enabled = state.store.outbound_enabled().unwrap_or(false);
    Json(json!({
        "enabled": enabled,
        "pinned": pin,
        "proxies": proxies.iter().map(|p| json!({
            "id": p.id,
            "scheme": p.scheme,
            "host": p.host,
            "port": p.port,
            "has_auth": p.username.is_some(),
            "order_index": p.order_index,
            "verified": p.verified,
            "last_ip": p.last_ip,
            "last_location": p.last_location,
            "last_latency_ms": p.last_latency_ms,
        })).collect::<Vec<_>>(),
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct AddProxyRequest {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub order_index: i64,
}

/// `POST /api/proxies`. The proxy is verified right away; an unreachable one
/// is still kept, flagged unverified.
pub async fn add_proxy(
    State(state): State<AppState>,
    Json(request): Json<AddProxyRequest>,
) -> Response {
    let scheme: ProxyScheme = match request.scheme.parse() {
        Ok(scheme) => scheme,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_request", e),
    };
    if request.host.trim().is_empty() || request.port == 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "host and port are required",
        );
    }
    let id = match state.store.add_proxy(
        scheme,
        request.host.trim(),
        request.port,
        request.username.as_deref(),
        request.password.as_deref(),
        request.order_index,
    ) {
        Ok(id) => id,
        Err(e) => return app_error_response(&e),
    };
    info!("[Admin] Added outbound proxy {}", id);

    let verification = match state.outbound.verify(id).await {
        Ok(v) => v,
        Err(e) => return app_error_response(&e),
    };
    (StatusCode::CREATED, Json(json!({"id": id, "verification": verification}))).into_response()
}

/// `DELETE /api/proxies/{id}`.
pub async fn delete_proxy(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.delete_proxy(id) {
        Ok(()) => {
            state.outbound.invalidate_client(id);
            info!("[Admin] Deleted outbound proxy {}", id);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => app_error_response(&e),
    }
}

/// `POST /api/proxies/{id}/verify`.
pub async fn verify_proxy(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.outbound.verify(id).await {
        Ok(verification) => Json(verification).into_response(),
        Err(e) => app_error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct ProxyModeRequest {
    pub enabled: bool,
}

/// `POST /api/proxies/mode` — flips outbound-proxy mode globally.
pub async fn set_proxy_mode(
    State(state): State<AppState>,
    Json(request): Json<ProxyModeRequest>,
) -> Response {
    match state.store.set_outbound_enabled(request.enabled) {
        Ok(()) => {
            info!("[Admin] Outbound proxy mode set to {}", request.enabled);
            Json(json!({"enabled": request.enabled})).into_response()
        }
        Err(e) => app_error_response(&e),
    }
}

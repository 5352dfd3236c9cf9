use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::modules::system::config::AppConfig;
use crate::proxy::handlers::errors::gateway_timeout_response;

/// Bounds the time until response headers are produced, so a wedged upstream
/// cannot hold a client socket forever. Streaming bodies are intentionally
/// not bounded: once headers are out, a long answer may take as long as it
/// takes.
pub async fn client_timeout_middleware(
    State(config): State<Arc<AppConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    match tokio::time::timeout(config.client_socket_timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(
                "[Gateway] Request to {} exceeded client socket timeout ({:?})",
                path, config.client_socket_timeout
            );
            gateway_timeout_response()
        }
    }
}

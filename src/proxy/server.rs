use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::error::AppResult;
use crate::proxy::handlers::{admin, chat, health};
use crate::proxy::middleware::auth::auth_middleware;
use crate::proxy::middleware::timeout::client_timeout_middleware;
use crate::proxy::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let open = Router::new().route("/api/proxy/health", get(health::health));

    let protected = Router::new()
        .route("/api/proxy/chat/completions", post(chat::chat_completions))
        .route("/api/keys", get(admin::list_keys).post(admin::add_key))
        .route("/api/keys/export", get(admin::export_keys))
        .route("/api/keys/{id}", delete(admin::delete_key))
        .route("/api/keys/{id}/toggle", post(admin::toggle_key))
        .route("/api/keys/{id}/check-balance", post(admin::check_key_balance))
        .route("/api/keys/{id}/log", get(admin::key_log))
        .route("/api/proxies", get(admin::list_proxies).post(admin::add_proxy))
        .route("/api/proxies/mode", post(admin::set_proxy_mode))
        .route("/api/proxies/{id}", delete(admin::delete_proxy))
        .route("/api/proxies/{id}/verify", post(admin::verify_proxy))
        .layer(middleware::from_fn_with_state(
            state.config.clone(),
            auth_middleware,
        ));

    open.merge(protected)
        .layer(middleware::from_fn_with_state(
            state.config.clone(),
            client_timeout_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState) -> AppResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Relay listening on {}", addr);

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}

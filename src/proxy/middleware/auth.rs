use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::modules::system::config::AppConfig;
use crate::proxy::handlers::errors::unauthorized_response;

fn constant_time_str_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let max_len = left_bytes.len().max(right_bytes.len());
    let mut diff = left_bytes.len() ^ right_bytes.len();

    for i in 0..max_len {
        let l = left_bytes.get(i).copied().unwrap_or(0);
        let r = right_bytes.get(i).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }

    diff == 0
}

fn extract_bearer(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").or(Some(s)))
}

fn is_authorized(config: &AppConfig, provided: Option<&str>) -> bool {
    if !config.auth_enabled() {
        return true;
    }
    provided
        .map(|candidate| constant_time_str_eq(candidate, &config.admin_password))
        .unwrap_or(false)
}

/// Shared bearer gate for the client and admin endpoints. An empty
/// `ADMIN_PASSWORD` disables the check entirely.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == axum::http::Method::OPTIONS {
        return next.run(request).await;
    }
    if is_authorized(&config, extract_bearer(&request)) {
        next.run(request).await
    } else {
        unauthorized_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_password(password: &str) -> AppConfig {
        AppConfig {
            admin_password: password.to_string(),
            ..AppConfig::default()
        }
    }

    #[test]
    fn constant_time_compare_matches_and_rejects() {
        assert!(constant_time_str_eq("abc123", "abc123"));
        assert!(!constant_time_str_eq("abc123", "abc124"));
        assert!(!constant_time_str_eq("abc123", "abc1234"));
        assert!(!constant_time_str_eq("", "abc"));
    }

    #[test]
    fn empty_password_disables_auth() {
        let config = config_with_password("");
        assert!(is_authorized(&config, None));
        assert!(is_authorized(&config, Some("anything")));
    }

    #[test]
    fn configured_password_is_enforced() {
        let config = config_with_password("hunter2");
        assert!(is_authorized(&config, Some("hunter2")));
        assert!(!is_authorized(&config, Some("wrong")));
        assert!(!is_authorized(&config, None));
    }
}

use reqwest::StatusCode;
use serde_json::Value;

use super::client::UpstreamClient;
use crate::constants;

/// Outcome of a balance probe. Probes never fail hard: transport and parse
/// faults collapse into `ok = false` with a diagnostic message, leaving the
/// balance unknown so the caller cannot demote on a mere probe hiccup.
#[derive(Debug, Clone)]
pub struct BalanceProbe {
    pub ok: bool,
    pub balance: Option<f64>,
    pub message: String,
}

impl BalanceProbe {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            balance: None,
            message: message.into(),
        }
    }
}

impl UpstreamClient {
    /// Queries `/user/info` for the account behind `secret` and parses the
    /// remaining balance.
    pub async fn probe_balance(&self, secret: &str) -> BalanceProbe {
        let url = format!("{}{}", self.base_url(), constants::USER_INFO_PATH);
        let response = match self
            .probe_client()
            .get(&url)
            .bearer_auth(secret)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return BalanceProbe::failed(format!("Balance probe failed: {e}")),
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return BalanceProbe {
                ok: true,
                balance: Some(0.0),
                message: format!("Key invalid or out of funds (HTTP {})", status.as_u16()),
            };
        }
        if !status.is_success() {
            return BalanceProbe::failed(format!("Balance endpoint returned HTTP {}", status));
        }

        let envelope: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => return BalanceProbe::failed(format!("Balance response unreadable: {e}")),
        };
        match extract_balance(&envelope) {
            Some(balance) => BalanceProbe {
                ok: true,
                balance: Some(balance),
                message: format!("Balance: {balance}"),
            },
            None => BalanceProbe::failed("Balance field missing from user info response"),
        }
    }
}

/// The documented envelope nests the fields under `data`; `balance` is
/// preferred, `totalBalance` is the fallback. Both arrive as numbers or as
/// numeric strings depending on upstream version.
fn extract_balance(envelope: &Value) -> Option<f64> {
    let scope = envelope.get("data").unwrap_or(envelope);
    scope
        .get("balance")
        .and_then(as_number)
        .or_else(|| scope.get("totalBalance").and_then(as_number))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
    use std::time::Duration;

    #[test]
    fn balance_parsing_handles_strings_and_fallback() {
        let v: Value = serde_json::json!({
            "code": 20000,
            "data": {"balance": "0.88", "totalBalance": "90.5"}
        });
        assert_eq!(extract_balance(&v), Some(0.88));

        let v: Value = serde_json::json!({"data": {"totalBalance": 42.0}});
        assert_eq!(extract_balance(&v), Some(42.0));

        let v: Value = serde_json::json!({"balance": 7});
        assert_eq!(extract_balance(&v), Some(7.0));

        let v: Value = serde_json::json!({"data": {"balance": "not-a-number"}});
        assert_eq!(extract_balance(&v), None);
    }

    async fn start_mock(responder: fn() -> axum::response::Response) -> (String, tokio::task::JoinHandle<()>) {
        let app = Router::new().route("/v1/user/info", get(move || async move { responder() }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock upstream");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock");
        });
        (format!("http://{}/v1", addr), server)
    }

    fn probe_target(base: &str) -> UpstreamClient {
        UpstreamClient::with_base_url(base, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn probe_parses_documented_envelope() {
        let (base, server) = start_mock(|| {
            Json(serde_json::json!({
                "code": 20000,
                "message": "OK",
                "status": true,
                "data": {"balance": "3.25", "totalBalance": "10"}
            }))
            .into_response()
        })
        .await;

        let probe = probe_target(&base).probe_balance("sk-x").await;
        server.abort();
        assert!(probe.ok);
        assert_eq!(probe.balance, Some(3.25));
    }

    #[tokio::test]
    async fn probe_maps_unauthorized_to_zero_balance() {
        let (base, server) = start_mock(|| {
            (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
        })
        .await;

        let probe = probe_target(&base).probe_balance("sk-x").await;
        server.abort();
        assert!(probe.ok);
        assert_eq!(probe.balance, Some(0.0));
        assert!(probe.message.contains("401"));
    }

    #[tokio::test]
    async fn probe_leaves_balance_unknown_on_server_error() {
        let (base, server) = start_mock(|| {
            (StatusCode::BAD_GATEWAY, "upstream down").into_response()
        })
        .await;

        let probe = probe_target(&base).probe_balance("sk-x").await;
        server.abort();
        assert!(!probe.ok);
        assert_eq!(probe.balance, None);
    }

    #[tokio::test]
    async fn probe_leaves_balance_unknown_on_garbage_body() {
        let (base, server) = start_mock(|| "not json at all".into_response()).await;

        let probe = probe_target(&base).probe_balance("sk-x").await;
        server.abort();
        assert!(!probe.ok);
        assert_eq!(probe.balance, None);
    }

    #[tokio::test]
    async fn probe_collapses_transport_errors() {
        // Nothing listens on this port.
        let client = probe_target("http://127.0.0.1:1/v1");
        let probe = client.probe_balance("sk-x").await;
        assert!(!probe.ok);
        assert_eq!(probe.balance, None);
        assert!(probe.message.contains("Balance probe failed"));
    }
}

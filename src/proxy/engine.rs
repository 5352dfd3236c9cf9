use axum::http::StatusCode;
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{MAX_KEY_SWITCHES, MAX_RETRIES_PER_KEY, MIN_USABLE_BALANCE, RETRY_POLL_INTERVAL, RETRY_WAIT};
use crate::modules::persistence::credential_db::Credential;
use crate::modules::persistence::store::Store;
use crate::modules::system::config::AppConfig;
use crate::proxy::block::{is_soft_block, record_soft_block};
use crate::proxy::credential::availability::AvailabilityController;
use crate::proxy::credential::selector::KeySelector;
use crate::proxy::handlers::errors::{
    internal_error_response, ip_blocked_response, request_aborted_response,
    service_unavailable_response,
};
use crate::proxy::handlers::streaming::{
    build_json_passthrough_response, build_stream_response, peek_first_chunk, BytesResultStream,
};
use crate::proxy::outbound::{OutboundPool, Route};
use crate::proxy::upstream::client::UpstreamClient;

/// Orchestrates one client request: key selection, dispatch, retry and
/// rotation, proxy failover, streaming passthrough, cancellation. One
/// instance is shared; each call owns its own loop state.
pub struct Engine {
    store: Store,
    config: Arc<AppConfig>,
    selector: Arc<KeySelector>,
    availability: Arc<AvailabilityController>,
    outbound: Arc<OutboundPool>,
    upstream: Arc<UpstreamClient>,
    pub(crate) retry_wait: std::time::Duration,
    pub(crate) retry_poll: std::time::Duration,
}

enum Attempt {
    Success(reqwest::Response),
    SoftBlock(String),
    Failure {
        status: Option<StatusCode>,
        text: String,
    },
}

impl Engine {
    pub fn new(
        store: Store,
        config: Arc<AppConfig>,
        selector: Arc<KeySelector>,
        availability: Arc<AvailabilityController>,
        outbound: Arc<OutboundPool>,
        upstream: Arc<UpstreamClient>,
    ) -> Self {
        Self {
            store,
            config,
            selector,
            availability,
            outbound,
            upstream,
            retry_wait: RETRY_WAIT,
            retry_poll: RETRY_POLL_INTERVAL,
        }
    }

    /// Forwards one client request. `cancel` fires when the client socket
    /// closes; after that the engine performs no further upstream work and
    /// records nothing for the in-flight attempt.
    pub async fn forward(
        &self,
        body: Bytes,
        want_stream: bool,
        trace_id: &str,
        cancel: CancellationToken,
    ) -> Response {
        if cancel.is_cancelled() {
            return request_aborted_response();
        }

        match self.store.active_block_record() {
            Ok(Some(record)) => {
                debug!("[Engine] {} rejected: IP block active until {}", trace_id, record.unblock_at);
                return ip_blocked_response(&record);
            }
            Ok(None) => {}
            Err(e) => return internal_error_response(&e.to_string()),
        }

        let mut credential = match self.selector.current() {
            Ok(Some(c)) => c,
            Ok(None) => return service_unavailable_response("no usable credentials"),
            Err(e) => return internal_error_response(&e.to_string()),
        };

        let mut last_error = String::from("no usable credentials");
        let mut previously_failed: Option<i64> = None;

        for _switch in 0..MAX_KEY_SWITCHES {
            let mut attempt_no = 0usize;
            'attempts: loop {
                if cancel.is_cancelled() {
                    return request_aborted_response();
                }

                let route = self.outbound.route();
                let pinned_id = match &route {
                    Route::Direct => None,
                    Route::Pinned { proxy_id, .. } => Some(*proxy_id),
                };
                debug!(
                    "[Engine] {} key {} attempt {} route {}",
                    trace_id,
                    credential.id,
                    attempt_no + 1,
                    pinned_id.map_or("direct".to_string(), |id| format!("proxy {id}")),
                );

                let via = match &route {
                    Route::Direct => None,
                    Route::Pinned { client, .. } => Some(client),
                };
                let result = self
                    .upstream
                    .dispatch_chat(via, &credential.secret, body.clone())
                    .await;

                if cancel.is_cancelled() {
                    // Disconnected while the attempt was in flight: it never
                    // completed, so nothing is recorded.
                    return request_aborted_response();
                }

                let (failed_status, failed_text) = match self.classify(result).await {
                    Attempt::Success(response) => {
                        match self
                            .complete_success(
                                &credential,
                                response,
                                want_stream,
                                previously_failed,
                                trace_id,
                                &cancel,
                            )
                            .await
                        {
                            Ok(client_response) => return client_response,
                            // Upstream said 200 but died before the first
                            // byte; treat as a transport failure.
                            Err(stream_error) => (None, stream_error),
                        }
                    }
                    Attempt::SoftBlock(text) => {
                        let reason = truncate(&text, 200).into_owned();
                        let _ = self.store.append_usage(
                            credential.id,
                            false,
                            &failure_detail(Some(StatusCode::SERVICE_UNAVAILABLE), &text),
                        );
                        // Retrying or rotating would only extend the block.
                        return match record_soft_block(&self.store, &reason) {
                            Ok(record) => ip_blocked_response(&record),
                            Err(e) => internal_error_response(&e.to_string()),
                        };
                    }
                    Attempt::Failure { status, text } => (status, text),
                };

                last_error = match failed_status {
                    Some(status) => {
                        format!("HTTP {}: {}", status.as_u16(), truncate(&failed_text, 200))
                    }
                    None => truncate(&failed_text, 200).into_owned(),
                };
                warn!(
                    "[Engine] {} key {} attempt {} failed: {}",
                    trace_id,
                    credential.id,
                    attempt_no + 1,
                    last_error
                );
                let _ = self
                    .store
                    .append_usage(credential.id, false, &failure_detail(failed_status, &failed_text));
                if let Err(e) = self.availability.on_failure(credential.id, &last_error) {
                    warn!("[Engine] {} failed to record key failure: {}", trace_id, e);
                }
                if let Some(proxy_id) = pinned_id {
                    self.outbound.note_pin_failure(proxy_id);
                }

                // First failure of a network/IP flavor: see whether any
                // outbound proxy can get the same request through.
                if attempt_no == 0 && is_network_class(failed_status) && self.outbound.enabled() {
                    match self.fan_out_attempt(&credential, &body).await {
                        Ok(Some((response, proxy_id))) => {
                            if cancel.is_cancelled() {
                                return request_aborted_response();
                            }
                            match self
                                .complete_success(
                                    &credential,
                                    response,
                                    want_stream,
                                    previously_failed,
                                    trace_id,
                                    &cancel,
                                )
                                .await
                            {
                                Ok(client_response) => return client_response,
                                Err(stream_error) => {
                                    last_error = stream_error;
                                    self.outbound.note_pin_failure(proxy_id);
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("[Engine] {} fan-out errored: {}", trace_id, e)
                        }
                    }
                }

                if cancel.is_cancelled() {
                    return request_aborted_response();
                }
                let probe = self.upstream.probe_balance(&credential.secret).await;
                match self.availability.apply_balance_probe(credential.id, &probe) {
                    Ok(Some(balance)) if balance < MIN_USABLE_BALANCE => {
                        info!(
                            "[Engine] {} key {} out of funds ({:.2}), rotating",
                            trace_id, credential.id, balance
                        );
                        break 'attempts;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("[Engine] {} balance bookkeeping failed: {}", trace_id, e),
                }

                attempt_no += 1;
                if attempt_no > MAX_RETRIES_PER_KEY {
                    debug!(
                        "[Engine] {} retries exhausted for key {}",
                        trace_id, credential.id
                    );
                    break 'attempts;
                }
                if !self.cancellable_wait(&cancel).await {
                    return request_aborted_response();
                }
            }

            previously_failed = Some(credential.id);
            match self.selector.advance() {
                Ok(Some(next)) => credential = next,
                Ok(None) => return service_unavailable_response(&last_error),
                Err(e) => return internal_error_response(&e.to_string()),
            }
        }

        service_unavailable_response(&last_error)
    }

    async fn classify(&self, result: Result<reqwest::Response, reqwest::Error>) -> Attempt {
        match result {
            Ok(response) if response.status().is_success() => Attempt::Success(response),
            Ok(response) => {
                let status = response.status();
                let text = response
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("body unreadable: {e}"));
                if is_soft_block(&text) {
                    Attempt::SoftBlock(text)
                } else {
                    Attempt::Failure {
                        status: Some(status),
                        text,
                    }
                }
            }
            Err(e) => Attempt::Failure {
                status: None,
                text: e.to_string(),
            },
        }
    }

    async fn fan_out_attempt(
        &self,
        credential: &Credential,
        body: &Bytes,
    ) -> crate::error::AppResult<Option<(reqwest::Response, i64)>> {
        let upstream = Arc::clone(&self.upstream);
        let secret = credential.secret.clone();
        let body = body.clone();
        self.outbound
            .fan_out(move |client| {
                let upstream = Arc::clone(&upstream);
                let secret = secret.clone();
                let body = body.clone();
                async move { upstream.dispatch_chat(Some(&client), &secret, body).await }
            })
            .await
    }

    /// Success bookkeeping plus response construction. For streams the
    /// headers are only committed after the first upstream chunk arrived; an
    /// error before that surfaces as `Err` so the retry loop keeps going.
    async fn complete_success(
        &self,
        credential: &Credential,
        response: reqwest::Response,
        want_stream: bool,
        previously_failed: Option<i64>,
        trace_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Response, String> {
        let status = response.status();
        let content_type = header_string(&response, "content-type");
        let request_id = header_string(&response, "x-request-id");

        if want_stream {
            let mut stream: BytesResultStream = Box::pin(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(|e| e.to_string())),
            );
            let first_chunk =
                peek_first_chunk(&mut stream, self.config.upstream_timeout).await?;
            self.record_success(
                credential,
                &json!({"streaming": true, "status": status.as_u16()}),
                trace_id,
            );
            self.restore_previously_failed(previously_failed, credential.id, trace_id, cancel)
                .await;
            Ok(build_stream_response(
                first_chunk,
                stream,
                content_type.as_deref(),
                request_id.as_deref(),
            ))
        } else {
            let body = response
                .bytes()
                .await
                .map_err(|e| format!("Failed to read upstream body: {e}"))?;
            self.record_success(credential, &success_summary(&body), trace_id);
            self.restore_previously_failed(previously_failed, credential.id, trace_id, cancel)
                .await;
            Ok(build_json_passthrough_response(
                status,
                body,
                content_type.as_deref(),
                request_id.as_deref(),
            ))
        }
    }

    fn record_success(&self, credential: &Credential, summary: &Value, trace_id: &str) {
        if let Err(e) = self.store.increment_credential_calls(credential.id) {
            warn!("[Engine] {} failed to count call: {}", trace_id, e);
        }
        if let Err(e) = self.availability.on_success(credential) {
            warn!("[Engine] {} failed to mark success: {}", trace_id, e);
        }
        let _ = self
            .store
            .append_usage(credential.id, true, &summary.to_string());
        self.maybe_spawn_balance_probe(credential.id, trace_id);
    }

    /// `AUTO_QUERY_BALANCE_AFTER_CALLS`: every N successful calls the
    /// balance gets re-checked off the request path.
    fn maybe_spawn_balance_probe(&self, credential_id: i64, trace_id: &str) {
        let every = self.config.auto_query_balance_after_calls;
        if every == 0 {
            return;
        }
        let Ok(Some(credential)) = self.store.get_credential(credential_id) else {
            return;
        };
        if credential.call_count <= 0 || credential.call_count % every as i64 != 0 {
            return;
        }
        debug!(
            "[Engine] {} scheduling balance probe for key {} after {} calls",
            trace_id, credential_id, credential.call_count
        );
        let upstream = Arc::clone(&self.upstream);
        let availability = Arc::clone(&self.availability);
        let store = self.store.clone();
        tokio::spawn(async move {
            let probe = upstream.probe_balance(&credential.secret).await;
            if let Some(balance) = probe.balance {
                if let Err(e) = store.set_credential_balance(credential_id, balance) {
                    warn!("[Engine] auto balance store failed: {}", e);
                }
            }
            if let Err(e) = availability.recheck(credential_id) {
                warn!("[Engine] auto balance recheck failed: {}", e);
            }
        });
    }

    /// When a later credential serves the request, the one that failed
    /// before it gets a single probe: restored if funded, left demoted if
    /// not. Runs inline, never as a background sweep.
    async fn restore_previously_failed(
        &self,
        previously_failed: Option<i64>,
        current_id: i64,
        trace_id: &str,
        cancel: &CancellationToken,
    ) {
        let Some(prev_id) = previously_failed else {
            return;
        };
        if prev_id == current_id || cancel.is_cancelled() {
            return;
        }
        let Ok(Some(previous)) = self.store.get_credential(prev_id) else {
            return;
        };
        let probe = self.upstream.probe_balance(&previous.secret).await;
        match self.availability.restore_if_funded(prev_id, &probe) {
            Ok(true) => info!(
                "[Engine] {} restored previously failing key {}",
                trace_id, prev_id
            ),
            Ok(false) => debug!(
                "[Engine] {} key {} stays demoted (balance {:?})",
                trace_id, prev_id, probe.balance
            ),
            Err(e) => warn!("[Engine] {} restore bookkeeping failed: {}", trace_id, e),
        }
    }

    /// The inter-retry wait, polled in short ticks so a client disconnect is
    /// observed within a second. Returns false when cancelled.
    async fn cancellable_wait(&self, cancel: &CancellationToken) -> bool {
        let deadline = tokio::time::Instant::now() + self.retry_wait;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep(self.retry_poll.min(deadline - now)).await;
        }
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Transport faults and the 5xx/403/429 family suggest the problem sits
/// between this host and the upstream, not with the credential or request.
fn is_network_class(status: Option<StatusCode>) -> bool {
    match status {
        None => true,
        Some(status) => {
            status.is_server_error()
                || status == StatusCode::FORBIDDEN
                || status == StatusCode::TOO_MANY_REQUESTS
        }
    }
}

/// Success summary for the usage log: response metadata only, never the
/// generated message text.
fn success_summary(body: &[u8]) -> Value {
    let Ok(parsed) = serde_json::from_slice::<Value>(body) else {
        return json!({"status": "ok"});
    };
    let finish_reasons: Vec<Value> = parsed
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .map(|c| c.get("finish_reason").cloned().unwrap_or(Value::Null))
                .collect()
        })
        .unwrap_or_default();
    json!({
        "id": parsed.get("id").cloned().unwrap_or(Value::Null),
        "created": parsed.get("created").cloned().unwrap_or(Value::Null),
        "usage": parsed.get("usage").cloned().unwrap_or(Value::Null),
        "finish_reasons": finish_reasons,
    })
}

/// Failure detail for the usage log: upstream status plus the error object
/// with conversational fields stripped and strings truncated.
fn failure_detail(status: Option<StatusCode>, text: &str) -> String {
    let error: Value = match serde_json::from_str::<Value>(text) {
        Ok(parsed) => sanitize_error_value(&parsed, 0),
        Err(_) => Value::String(truncate(text, 200).into_owned()),
    };
    json!({
        "status": status.map(|s| s.as_u16()),
        "error": error,
    })
    .to_string()
}

const STRIPPED_KEYS: [&str; 4] = ["messages", "content", "prompt", "input"];
const SANITIZE_DEPTH: usize = 16;

fn sanitize_error_value(value: &Value, depth: usize) -> Value {
    if depth > SANITIZE_DEPTH {
        return Value::Null;
    }
    match value {
        Value::String(s) => Value::String(truncate(s, 200).into_owned()),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| sanitize_error_value(v, depth + 1))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !STRIPPED_KEYS.contains(&key.as_str()))
                .map(|(key, v)| (key.clone(), sanitize_error_value(v, depth + 1)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn truncate(text: &str, max_chars: usize) -> Cow<'_, str> {
    if text.chars().count() <= max_chars {
        return Cow::Borrowed(text);
    }
    let cut: String = text.chars().take(max_chars).collect();
    Cow::Owned(format!("{cut}..."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_class_covers_transport_and_ip_failures() {
        assert!(is_network_class(None));
        assert!(is_network_class(Some(StatusCode::INTERNAL_SERVER_ERROR)));
        assert!(is_network_class(Some(StatusCode::BAD_GATEWAY)));
        assert!(is_network_class(Some(StatusCode::FORBIDDEN)));
        assert!(is_network_class(Some(StatusCode::TOO_MANY_REQUESTS)));

        assert!(!is_network_class(Some(StatusCode::BAD_REQUEST)));
        assert!(!is_network_class(Some(StatusCode::UNAUTHORIZED)));
        assert!(!is_network_class(Some(StatusCode::NOT_FOUND)));
    }

    #[test]
    fn success_summary_never_contains_message_text() {
        let body = serde_json::to_vec(&json!({
            "id": "chatcmpl-1",
            "created": 1700000000,
            "usage": {"total_tokens": 12},
            "choices": [
                {"message": {"role": "assistant", "content": "the secret answer"}, "finish_reason": "stop"}
            ]
        }))
        .unwrap();

        let summary = success_summary(&body);
        let rendered = summary.to_string();
        assert!(!rendered.contains("the secret answer"));
        assert_eq!(summary["id"], "chatcmpl-1");
        assert_eq!(summary["finish_reasons"][0], "stop");
        assert_eq!(summary["usage"]["total_tokens"], 12);
    }

    #[test]
    fn success_summary_tolerates_unparseable_bodies() {
        assert_eq!(success_summary(b"not json"), json!({"status": "ok"}));
    }

    #[test]
    fn failure_detail_strips_conversational_fields() {
        let upstream = json!({
            "error": {"message": "bad model", "code": 1001},
            "messages": [{"role": "user", "content": "my private prompt"}],
            "prompt": "another secret"
        })
        .to_string();

        let detail = failure_detail(Some(StatusCode::BAD_REQUEST), &upstream);
        assert!(!detail.contains("my private prompt"));
        assert!(!detail.contains("another secret"));
        assert!(detail.contains("bad model"));
        assert!(detail.contains("400"));
    }

    #[test]
    fn failure_detail_truncates_long_strings() {
        let long = "x".repeat(5000);
        let upstream = json!({"error": {"message": long}}).to_string();
        let detail = failure_detail(Some(StatusCode::INTERNAL_SERVER_ERROR), &upstream);
        let parsed: Value = serde_json::from_str(&detail).unwrap();
        let message = parsed["error"]["error"]["message"].as_str().unwrap();
        assert!(message.chars().count() <= 203);
    }

    #[test]
    fn truncate_is_char_boundary_safe() {
        let text = "héllo wörld".repeat(40);
        let cut = truncate(&text, 200);
        assert!(cut.chars().count() <= 203);
        assert_eq!(truncate("short", 200), "short");
    }
}

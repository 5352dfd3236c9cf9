use chrono::Utc;
use dashmap::DashMap;
use reqwest::Client;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::constants;
use crate::error::{AppError, AppResult};
use crate::modules::persistence::proxy_db::OutboundProxy;
use crate::modules::persistence::store::Store;
use crate::proxy::upstream::client::build_transport;

/// How the engine should route the next upstream attempt.
pub enum Route {
    Direct,
    Pinned { proxy_id: i64, client: Client },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyVerification {
    pub ok: bool,
    pub ip: Option<String>,
    pub location: Option<String>,
    pub latency_ms: Option<i64>,
    pub service: Option<String>,
    pub message: String,
}

/// Ordered pool of outbound proxies with a time-bounded sticky pin.
/// Transport clients are built once per proxy and reused.
pub struct OutboundPool {
    store: Store,
    upstream_timeout: Duration,
    clients: DashMap<i64, Client>,
}

impl OutboundPool {
    pub fn new(store: Store, upstream_timeout: Duration) -> Self {
        Self {
            store,
            upstream_timeout,
            clients: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        match self.store.outbound_enabled() {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!("[ProxyPool] Failed to read outbound mode, assuming off: {}", e);
                false
            }
        }
    }

    /// The route for a normal attempt: the pinned proxy while the pin is
    /// valid, direct otherwise.
    pub fn route(&self) -> Route {
        if !self.enabled() {
            return Route::Direct;
        }
        let Ok(Some(pin)) = self.store.get_proxy_pin() else {
            return Route::Direct;
        };
        let proxy = match self.store.get_proxy(pin.proxy_id) {
            Ok(Some(proxy)) => proxy,
            _ => {
                let _ = self.store.clear_proxy_pin();
                return Route::Direct;
            }
        };
        match self.client_for(&proxy) {
            Ok(client) => Route::Pinned {
                proxy_id: proxy.id,
                client,
            },
            Err(e) => {
                warn!("[ProxyPool] Pinned proxy {} unusable: {}", proxy.id, e);
                let _ = self.store.clear_proxy_pin();
                Route::Direct
            }
        }
    }

    /// A failed attempt through the pinned proxy drops the pin.
    pub fn note_pin_failure(&self, proxy_id: i64) {
        info!("[ProxyPool] Clearing pin after failure through proxy {}", proxy_id);
        let _ = self.store.clear_proxy_pin();
    }

    /// Walks the proxy list in ordering-index order, attempting the request
    /// through each. The first proxy that yields a successful upstream
    /// response gets pinned for the sticky window.
    pub async fn fan_out<F, Fut>(&self, attempt: F) -> AppResult<Option<(reqwest::Response, i64)>>
    where
        F: Fn(Client) -> Fut,
        Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let proxies = self.store.list_proxies()?;
        if proxies.is_empty() {
            return Ok(None);
        }
        info!("[ProxyPool] Fan-out across {} proxies", proxies.len());

        for proxy in &proxies {
            let client = match self.client_for(proxy) {
                Ok(client) => client,
                Err(e) => {
                    warn!("[ProxyPool] Skipping proxy {} ({}): {}", proxy.id, proxy.url(), e);
                    continue;
                }
            };
            match attempt(client).await {
                Ok(response) if response.status().is_success() => {
                    let expires_at =
                        Utc::now().timestamp() + constants::PROXY_PIN_MINUTES * 60;
                    self.store.set_proxy_pin(proxy.id, expires_at)?;
                    info!(
                        "[ProxyPool] Proxy {} worked, pinned for {} minutes",
                        proxy.id,
                        constants::PROXY_PIN_MINUTES
                    );
                    return Ok(Some((response, proxy.id)));
                }
                Ok(response) => {
                    debug!(
                        "[ProxyPool] Proxy {} returned HTTP {}, trying next",
                        proxy.id,
                        response.status()
                    );
                }
                Err(e) => {
                    debug!("[ProxyPool] Proxy {} failed: {}", proxy.id, e);
                }
            }
        }

        warn!("[ProxyPool] All {} proxies failed", proxies.len());
        Ok(None)
    }

    pub fn invalidate_client(&self, proxy_id: i64) {
        self.clients.remove(&proxy_id);
    }

    fn client_for(&self, proxy: &OutboundProxy) -> Result<Client, String> {
        if let Some(client) = self.clients.get(&proxy.id) {
            return Ok(client.clone());
        }
        let mut reqwest_proxy = reqwest::Proxy::all(proxy.url())
            .map_err(|e| format!("Invalid proxy URL: {e}"))?;
        if let (Some(user), Some(password)) = (&proxy.username, &proxy.password) {
            reqwest_proxy = reqwest_proxy.basic_auth(user, password);
        }
        let client = build_transport(self.upstream_timeout, Some(reqwest_proxy))
            .map_err(|e| format!("Failed to build proxied client: {e}"))?;
        self.clients.insert(proxy.id, client.clone());
        Ok(client)
    }

    /// Manual verification: hits the IP echo services through the proxy and
    /// records the observed public IP, location, and latency.
    pub async fn verify(&self, proxy_id: i64) -> AppResult<ProxyVerification> {
        let proxy = self
            .store
            .get_proxy(proxy_id)?
            .ok_or_else(|| AppError::NotFound(format!("proxy {proxy_id}")))?;
        let client = match self.client_for(&proxy) {
            Ok(client) => client,
            Err(e) => {
                self.store
                    .set_proxy_verification(proxy_id, false, None, None, None)?;
                return Ok(ProxyVerification {
                    ok: false,
                    ip: None,
                    location: None,
                    latency_ms: None,
                    service: None,
                    message: e,
                });
            }
        };

        let mut last_error = String::new();
        for (index, service) in constants::IP_ECHO_SERVICES.iter().enumerate() {
            let timeout = if index == 0 {
                constants::PROXY_VERIFY_PRIMARY_TIMEOUT
            } else {
                constants::PROXY_VERIFY_FALLBACK_TIMEOUT
            };
            let start = std::time::Instant::now();
            let result = client.get(*service).timeout(timeout).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    let latency_ms = start.elapsed().as_millis() as i64;
                    let body: serde_json::Value = response.json().await.unwrap_or_default();
                    let ip = extract_echo_ip(&body);
                    let location = extract_echo_location(&body);
                    self.store.set_proxy_verification(
                        proxy_id,
                        true,
                        ip.as_deref(),
                        location.as_deref(),
                        Some(latency_ms),
                    )?;
                    info!(
                        "[ProxyPool] Proxy {} verified via {} ({} ms, ip {:?})",
                        proxy_id, service, latency_ms, ip
                    );
                    return Ok(ProxyVerification {
                        ok: true,
                        ip,
                        location,
                        latency_ms: Some(latency_ms),
                        service: Some((*service).to_string()),
                        message: "reachable".to_string(),
                    });
                }
                Ok(response) => {
                    last_error = format!("{} returned HTTP {}", service, response.status());
                }
                Err(e) => {
                    last_error = format!("{} failed: {}", service, e);
                }
            }
            debug!("[ProxyPool] Echo service failed for proxy {}: {}", proxy_id, last_error);
        }

        self.store
            .set_proxy_verification(proxy_id, false, None, None, None)?;
        Ok(ProxyVerification {
            ok: false,
            ip: None,
            location: None,
            latency_ms: None,
            service: None,
            message: last_error,
        })
    }
}

/// The echo services disagree on field names: `ip` (ipinfo, ip.sb) vs
/// `query` (ip-api).
fn extract_echo_ip(body: &serde_json::Value) -> Option<String> {
    body.get("ip")
        .or_else(|| body.get("query"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn extract_echo_location(body: &serde_json::Value) -> Option<String> {
    let city = body.get("city").and_then(|v| v.as_str());
    let country = body
        .get("country")
        .and_then(|v| v.as_str())
        .or_else(|| body.get("country_code").and_then(|v| v.as_str()));
    match (city, country) {
        (Some(city), Some(country)) => Some(format!("{city}, {country}")),
        (Some(city), None) => Some(city.to_string()),
        (None, Some(country)) => Some(country.to_string()),
        (None, None) => None,
    }
}

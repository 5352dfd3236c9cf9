use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;

use crate::constants;

/// HTTP client for the upstream API. One shared direct transport for
/// forwarding, one short-timeout transport for balance probes. Proxied
/// transports are built by the outbound pool with the same tuning.
pub struct UpstreamClient {
    base_url: String,
    direct: Client,
    probe: Client,
}

impl UpstreamClient {
    pub fn new(upstream_timeout: Duration) -> Self {
        Self::with_base_url(constants::UPSTREAM_BASE_URL, upstream_timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, upstream_timeout: Duration) -> Self {
        let direct = build_transport(upstream_timeout, None)
            .expect("Failed to create upstream HTTP client");
        let probe = Client::builder()
            .timeout(constants::BALANCE_PROBE_TIMEOUT)
            .build()
            .expect("Failed to create balance probe client");
        Self {
            base_url: base_url.into(),
            direct,
            probe,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn direct_client(&self) -> &Client {
        &self.direct
    }

    pub(crate) fn probe_client(&self) -> &Client {
        &self.probe
    }

    /// Forwards the client body verbatim to `/chat/completions` under the
    /// given secret, optionally through a caller-supplied (proxied) client.
    pub async fn dispatch_chat(
        &self,
        via: Option<&Client>,
        secret: &str,
        body: Bytes,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let client = via.unwrap_or(&self.direct);
        client
            .post(format!(
                "{}{}",
                self.base_url,
                constants::CHAT_COMPLETIONS_PATH
            ))
            .bearer_auth(secret)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
    }
}

/// Shared transport tuning for direct and proxied upstream clients. The
/// upstream timeout is applied as an idle-read timeout so long streaming
/// answers survive while chunks keep arriving.
pub fn build_transport(
    upstream_timeout: Duration,
    proxy: Option<reqwest::Proxy>,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(20))
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .read_timeout(upstream_timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(proxy);
    }
    builder.build()
}

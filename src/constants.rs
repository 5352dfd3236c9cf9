use std::time::Duration;

/// Upstream API root. The relay speaks the OpenAI-compatible schema this
/// provider exposes; all credential secrets are bearer tokens for it.
pub const UPSTREAM_BASE_URL: &str = "https://api.siliconflow.cn/v1";

pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";
pub const USER_INFO_PATH: &str = "/user/info";

pub const DEFAULT_PORT: u16 = 3838;
pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 240_000;
pub const DEFAULT_CLIENT_SOCKET_TIMEOUT_MS: u64 = 480_000;

/// Ceiling for client request bodies.
pub const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

pub const BALANCE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Credentials with a known balance below this are not worth dispatching to.
pub const MIN_USABLE_BALANCE: f64 = 1.0;

/// Bounds of the engine's main loop: how many distinct credentials one
/// request may touch, and how many retries a single credential gets.
pub const MAX_KEY_SWITCHES: usize = 10;
pub const MAX_RETRIES_PER_KEY: usize = 3;
pub const RETRY_WAIT: Duration = Duration::from_secs(30);
pub const RETRY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Soft-block cooldown after the upstream flags our source IP as busy.
pub const BLOCK_COOLDOWN_MINUTES: i64 = 30;
pub const BLOCK_PURGE_INTERVAL: Duration = Duration::from_secs(300);
/// Numeric code the upstream uses for its "system busy" rejection.
pub const SOFT_BLOCK_CODE: i64 = 50603;

/// Sticky window for an outbound proxy after a successful dispatch.
pub const PROXY_PIN_MINUTES: i64 = 60;
pub const PROXY_VERIFY_PRIMARY_TIMEOUT: Duration = Duration::from_secs(8);
pub const PROXY_VERIFY_FALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// IP echo services used to verify outbound proxies, tried in order.
pub const IP_ECHO_SERVICES: [&str; 3] = [
    "https://ipinfo.io/json",
    "https://api.ip.sb/geoip",
    "http://ip-api.com/json",
];

use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::constants;

/// Runtime configuration, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Shared bearer for the client and admin endpoints. Empty disables auth.
    pub admin_password: String,
    /// After every N successful calls on a credential, probe its balance in
    /// the background. 0 disables.
    pub auto_query_balance_after_calls: u64,
    pub upstream_timeout: Duration,
    pub client_socket_timeout: Duration,
    pub data_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: constants::DEFAULT_PORT,
            admin_password: String::new(),
            auto_query_balance_after_calls: 0,
            upstream_timeout: Duration::from_millis(constants::DEFAULT_UPSTREAM_TIMEOUT_MS),
            client_socket_timeout: Duration::from_millis(
                constants::DEFAULT_CLIENT_SOCKET_TIMEOUT_MS,
            ),
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PORT") {
            let trimmed = port.trim();
            if !trimmed.is_empty() {
                match trimmed.parse::<u16>() {
                    Ok(p) if p > 0 => {
                        config.port = p;
                        info!("Using listen port from environment: {}", p);
                    }
                    _ => warn!("[W-PORT-INVALID] ignoring_invalid_port_value: {}", port),
                }
            }
        }

        if let Ok(password) = std::env::var("ADMIN_PASSWORD") {
            if !password.trim().is_empty() {
                info!("Bearer auth enabled (ADMIN_PASSWORD set)");
                config.admin_password = password;
            }
        }

        if let Some(n) = parse_env_u64("AUTO_QUERY_BALANCE_AFTER_CALLS") {
            config.auto_query_balance_after_calls = n;
            if n > 0 {
                info!("Auto balance probe every {} successful calls", n);
            }
        }

        if let Some(ms) = parse_env_u64("UPSTREAM_TIMEOUT_MS") {
            if ms > 0 {
                config.upstream_timeout = Duration::from_millis(ms);
            } else {
                warn!("[W-UPSTREAM-TIMEOUT-INVALID] ignoring_zero_upstream_timeout");
            }
        }

        if let Some(ms) = parse_env_u64("CLIENT_SOCKET_TIMEOUT_MS") {
            if ms > 0 {
                config.client_socket_timeout = Duration::from_millis(ms);
            } else {
                warn!("[W-CLIENT-TIMEOUT-INVALID] ignoring_zero_client_socket_timeout");
            }
        }

        if let Ok(dir) = std::env::var("DATA_DIR") {
            if !dir.trim().is_empty() {
                config.data_dir = PathBuf::from(dir.trim());
            }
        }

        config
    }

    pub fn auth_enabled(&self) -> bool {
        !self.admin_password.is_empty()
    }
}

fn parse_env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("[W-ENV-INVALID] ignoring_invalid_value for {}: {}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// `from_env` reads process-global state, so these tests serialize and
    /// restore every variable they touch.
    fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    struct EnvGuard {
        key: &'static str,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let original = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, original }
        }

        fn unset(key: &'static str) -> Self {
            let original = std::env::var(key).ok();
            std::env::remove_var(key);
            Self { key, original }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match self.original.take() {
                Some(value) => std::env::set_var(self.key, value),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let _guard = env_lock();
        let _port = EnvGuard::unset("PORT");
        let _pw = EnvGuard::unset("ADMIN_PASSWORD");
        let _auto = EnvGuard::unset("AUTO_QUERY_BALANCE_AFTER_CALLS");
        let _up = EnvGuard::unset("UPSTREAM_TIMEOUT_MS");
        let _cl = EnvGuard::unset("CLIENT_SOCKET_TIMEOUT_MS");

        let config = AppConfig::from_env();
        assert_eq!(config.port, 3838);
        assert!(!config.auth_enabled());
        assert_eq!(config.auto_query_balance_after_calls, 0);
        assert_eq!(config.upstream_timeout, Duration::from_secs(240));
        assert_eq!(config.client_socket_timeout, Duration::from_secs(480));
    }

    #[test]
    fn env_overrides_are_applied() {
        let _guard = env_lock();
        let _port = EnvGuard::set("PORT", "9090");
        let _pw = EnvGuard::set("ADMIN_PASSWORD", "secret");
        let _auto = EnvGuard::set("AUTO_QUERY_BALANCE_AFTER_CALLS", "5");
        let _up = EnvGuard::set("UPSTREAM_TIMEOUT_MS", "1000");
        let _cl = EnvGuard::set("CLIENT_SOCKET_TIMEOUT_MS", "2000");

        let config = AppConfig::from_env();
        assert_eq!(config.port, 9090);
        assert!(config.auth_enabled());
        assert_eq!(config.auto_query_balance_after_calls, 5);
        assert_eq!(config.upstream_timeout, Duration::from_millis(1000));
        assert_eq!(config.client_socket_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let _guard = env_lock();
        let _port = EnvGuard::set("PORT", "not-a-port");
        let _auto = EnvGuard::set("AUTO_QUERY_BALANCE_AFTER_CALLS", "many");
        let _up = EnvGuard::set("UPSTREAM_TIMEOUT_MS", "0");
        let _cl = EnvGuard::unset("CLIENT_SOCKET_TIMEOUT_MS");

        let config = AppConfig::from_env();
        assert_eq!(config.port, 3838);
        assert_eq!(config.auto_query_balance_after_calls, 0);
        assert_eq!(config.upstream_timeout, Duration::from_secs(240));
    }
}

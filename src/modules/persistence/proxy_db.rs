use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::store::Store;
use crate::error::{AppError, AppResult};

const SETTING_OUTBOUND_ENABLED: &str = "outbound_enabled";
const SETTING_PIN_PROXY_ID: &str = "pinned_proxy_id";
const SETTING_PIN_EXPIRES_AT: &str = "pinned_proxy_expires_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Socks5,
    Http,
    Https,
}

impl ProxyScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Socks5 => "socks5",
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl std::str::FromStr for ProxyScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "socks5" => Ok(Self::Socks5),
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(format!("unknown proxy scheme: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundProxy {
    pub id: i64,
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub order_index: i64,
    pub verified: bool,
    pub last_ip: Option<String>,
    pub last_location: Option<String>,
    pub last_latency_ms: Option<i64>,
    pub created_at: i64,
}

impl OutboundProxy {
    /// URL accepted by the transport layer, credentials excluded (those are
    /// passed as proxy basic auth separately).
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// Sticky affinity to one outbound proxy, valid until `expires_at`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProxyPin {
    pub proxy_id: i64,
    pub expires_at: i64,
}

fn proxy_from_row(row: &Row<'_>) -> rusqlite::Result<OutboundProxy> {
    let scheme: String = row.get("scheme")?;
    let port: i64 = row.get("port")?;
    Ok(OutboundProxy {
        id: row.get("id")?,
        scheme: scheme.parse().unwrap_or(ProxyScheme::Http),
        host: row.get("host")?,
        port: port as u16,
        username: row.get("username")?,
        password: row.get("password")?,
        order_index: row.get("order_index")?,
        verified: row.get("verified")?,
        last_ip: row.get("last_ip")?,
        last_location: row.get("last_location")?,
        last_latency_ms: row.get("last_latency_ms")?,
        created_at: row.get("created_at")?,
    })
}

const PROXY_COLUMNS: &str = "id, scheme, host, port, username, password, order_index, verified, \
     last_ip, last_location, last_latency_ms, created_at";

impl Store {
    pub fn add_proxy(
        &self,
        scheme: ProxyScheme,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        order_index: i64,
    ) -> AppResult<i64> {
        let conn = self.connect()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO outbound_proxies (scheme, host, port, username, password, order_index, verified, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![scheme.as_str(), host, port, username, password, order_index, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_proxy(&self, id: i64) -> AppResult<()> {
        let conn = self.connect()?;
        let affected = conn.execute("DELETE FROM outbound_proxies WHERE id = ?1", params![id])?;
        if affected == 0 {
            return Err(AppError::NotFound(format!("proxy {id}")));
        }
        drop(conn);
        // A pin pointing at a deleted proxy must not survive.
        if let Some(pin) = self.get_proxy_pin()? {
            if pin.proxy_id == id {
                self.clear_proxy_pin()?;
            }
        }
        Ok(())
    }

    pub fn get_proxy(&self, id: i64) -> AppResult<Option<OutboundProxy>> {
        let conn = self.connect()?;
        let proxy = conn
            .query_row(
                &format!("SELECT {PROXY_COLUMNS} FROM outbound_proxies WHERE id = ?1"),
                params![id],
                proxy_from_row,
            )
            .optional()?;
        Ok(proxy)
    }

    /// All proxies in the order the fan-out walks them.
    pub fn list_proxies(&self) -> AppResult<Vec<OutboundProxy>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROXY_COLUMNS} FROM outbound_proxies ORDER BY order_index ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], proxy_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn set_proxy_verification(
        &self,
        id: i64,
        verified: bool,
        ip: Option<&str>,
        location: Option<&str>,
        latency_ms: Option<i64>,
    ) -> AppResult<()> {
        let conn = self.connect()?;
        let affected = conn.execute(
            "UPDATE outbound_proxies
             SET verified = ?1, last_ip = ?2, last_location = ?3, last_latency_ms = ?4
             WHERE id = ?5",
            params![verified, ip, location, latency_ms, id],
        )?;
        if affected == 0 {
            return Err(AppError::NotFound(format!("proxy {id}")));
        }
        Ok(())
    }

    pub fn outbound_enabled(&self) -> AppResult<bool> {
        Ok(self
            .get_setting(SETTING_OUTBOUND_ENABLED)?
            .map(|v| v == "1")
            .unwrap_or(false))
    }

    pub fn set_outbound_enabled(&self, enabled: bool) -> AppResult<()> {
        self.set_setting(SETTING_OUTBOUND_ENABLED, if enabled { "1" } else { "0" })
    }

    /// Returns the pin only while it has not expired; an expired pin is
    /// removed on read.
    pub fn get_proxy_pin(&self) -> AppResult<Option<ProxyPin>> {
        let (Some(id_raw), Some(expires_raw)) = (
            self.get_setting(SETTING_PIN_PROXY_ID)?,
            self.get_setting(SETTING_PIN_EXPIRES_AT)?,
        ) else {
            return Ok(None);
        };
        let (Ok(proxy_id), Ok(expires_at)) = (id_raw.parse::<i64>(), expires_raw.parse::<i64>())
        else {
            self.clear_proxy_pin()?;
            return Ok(None);
        };
        if expires_at <= Utc::now().timestamp() {
            self.clear_proxy_pin()?;
            return Ok(None);
        }
        Ok(Some(ProxyPin {
            proxy_id,
            expires_at,
        }))
    }

    pub fn set_proxy_pin(&self, proxy_id: i64, expires_at: i64) -> AppResult<()> {
        self.set_setting(SETTING_PIN_PROXY_ID, &proxy_id.to_string())?;
        self.set_setting(SETTING_PIN_EXPIRES_AT, &expires_at.to_string())
    }

    pub fn clear_proxy_pin(&self) -> AppResult<()> {
        self.delete_setting(SETTING_PIN_PROXY_ID)?;
        self.delete_setting(SETTING_PIN_EXPIRES_AT)
    }
}

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::AppResult;

/// Handle to the embedded database. Every operation opens its own short-lived
/// connection; SQLite's file locking keeps the individual statements atomic.
#[derive(Clone)]
pub struct Store {
    path: Arc<PathBuf>,
}

impl Store {
    pub fn new(data_dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let store = Self {
            path: Arc::new(data_dir.join("sfrelay.db")),
        };
        store.init_db()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn connect(&self) -> AppResult<Connection> {
        let conn = Connection::open(self.path.as_ref())?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(conn)
    }

    fn init_db(&self) -> AppResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                secret TEXT UNIQUE NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                available BOOLEAN NOT NULL DEFAULT 1,
                balance REAL,
                balance_checked_at INTEGER,
                call_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_used_at INTEGER
            )",
            [],
        )?;
        let _ = conn.execute(
            "ALTER TABLE credentials ADD COLUMN error_count INTEGER NOT NULL DEFAULT 0",
            [],
        );
        let _ = conn.execute("ALTER TABLE credentials ADD COLUMN last_error TEXT", []);

        conn.execute(
            "CREATE TABLE IF NOT EXISTS usage_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                credential_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                success BOOLEAN NOT NULL,
                detail TEXT,
                FOREIGN KEY(credential_id) REFERENCES credentials(id) ON DELETE CASCADE
            )",
            [],
        )?;
        let _ = conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_usage_log_credential ON usage_log(credential_id)",
            [],
        );

        conn.execute(
            "CREATE TABLE IF NOT EXISTS outbound_proxies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scheme TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT,
                password TEXT,
                order_index INTEGER NOT NULL DEFAULT 0,
                verified BOOLEAN NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        let _ = conn.execute("ALTER TABLE outbound_proxies ADD COLUMN last_ip TEXT", []);
        let _ = conn.execute(
            "ALTER TABLE outbound_proxies ADD COLUMN last_location TEXT",
            [],
        );
        let _ = conn.execute(
            "ALTER TABLE outbound_proxies ADD COLUMN last_latency_ms INTEGER",
            [],
        );

        conn.execute(
            "CREATE TABLE IF NOT EXISTS block_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                blocked_at INTEGER NOT NULL,
                unblock_at INTEGER NOT NULL,
                reason TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> AppResult<Option<String>> {
        use rusqlite::OptionalExtension;
        let conn = self.connect()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> AppResult<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(())
    }
}

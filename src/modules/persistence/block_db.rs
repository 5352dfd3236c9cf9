use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::store::Store;
use crate::error::AppResult;

/// Record that the upstream has soft-blocked this process's source IP.
#[derive(Debug, Clone, Serialize)]
pub struct BlockRecord {
    pub id: i64,
    pub blocked_at: i64,
    pub unblock_at: i64,
    pub reason: String,
}

impl BlockRecord {
    pub fn remaining_minutes(&self) -> i64 {
        let remaining = self.unblock_at - Utc::now().timestamp();
        (remaining.max(0) + 59) / 60
    }
}

impl Store {
    pub fn insert_block_record(&self, unblock_at: i64, reason: &str) -> AppResult<i64> {
        let conn = self.connect()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO block_records (blocked_at, unblock_at, reason) VALUES (?1, ?2, ?3)",
            params![now, unblock_at, reason],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The single record consulted by the engine: the latest one whose
    /// unblock time is still in the future.
    pub fn active_block_record(&self) -> AppResult<Option<BlockRecord>> {
        let conn = self.connect()?;
        let now = Utc::now().timestamp();
        let record = conn
            .query_row(
                "SELECT id, blocked_at, unblock_at, reason FROM block_records
                 WHERE unblock_at > ?1
                 ORDER BY unblock_at DESC
                 LIMIT 1",
                params![now],
                |row| {
                    Ok(BlockRecord {
                        id: row.get(0)?,
                        blocked_at: row.get(1)?,
                        unblock_at: row.get(2)?,
                        reason: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn purge_expired_block_records(&self) -> AppResult<usize> {
        let conn = self.connect()?;
        let now = Utc::now().timestamp();
        let purged = conn.execute(
            "DELETE FROM block_records WHERE unblock_at <= ?1",
            params![now],
        )?;
        Ok(purged)
    }

    pub fn clear_block_records(&self) -> AppResult<usize> {
        let conn = self.connect()?;
        let purged = conn.execute("DELETE FROM block_records", [])?;
        Ok(purged)
    }
}

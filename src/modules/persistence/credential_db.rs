use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::store::Store;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    Insufficient,
    Error,
}

impl CredentialStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Insufficient => "insufficient",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for CredentialStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "insufficient" => Ok(Self::Insufficient),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown credential status: {other}")),
        }
    }
}

/// One upstream bearer token and its bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct Credential {
    pub id: i64,
    pub secret: String,
    pub status: CredentialStatus,
    pub available: bool,
    pub balance: Option<f64>,
    pub balance_checked_at: Option<i64>,
    pub call_count: i64,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
    pub error_count: i64,
    pub last_error: Option<String>,
}

impl Credential {
    /// Selectable by the key selector: available and in active status.
    pub fn is_usable(&self) -> bool {
        self.available && self.status == CredentialStatus::Active
    }

    /// First 8 + last 4 characters, for listings that must not leak secrets.
    pub fn masked_secret(&self) -> String {
        let chars: Vec<char> = self.secret.chars().collect();
        if chars.len() <= 12 {
            return "*".repeat(chars.len());
        }
        let head: String = chars[..8].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageEntry {
    pub id: i64,
    pub credential_id: i64,
    pub created_at: i64,
    pub success: bool,
    pub detail: Option<String>,
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    let status: String = row.get("status")?;
    Ok(Credential {
        id: row.get("id")?,
        secret: row.get("secret")?,
        status: status.parse().unwrap_or(CredentialStatus::Error),
        available: row.get("available")?,
        balance: row.get("balance")?,
        balance_checked_at: row.get("balance_checked_at")?,
        call_count: row.get("call_count")?,
        created_at: row.get("created_at")?,
        last_used_at: row.get("last_used_at")?,
        error_count: row.get("error_count")?,
        last_error: row.get("last_error")?,
    })
}

const CREDENTIAL_COLUMNS: &str = "id, secret, status, available, balance, balance_checked_at, \
     call_count, created_at, last_used_at, error_count, last_error";

impl Store {
    pub fn add_credential(&self, secret: &str) -> AppResult<i64> {
        let conn = self.connect()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO credentials (secret, status, available, call_count, created_at)
             VALUES (?1, 'active', 1, 0, ?2)",
            params![secret, now],
        )
        .map_err(|e| AppError::from_insert(e, "credential"))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_credential(&self, id: i64) -> AppResult<()> {
        let conn = self.connect()?;
        let affected = conn.execute("DELETE FROM credentials WHERE id = ?1", params![id])?;
        if affected == 0 {
            return Err(AppError::NotFound(format!("credential {id}")));
        }
        conn.execute(
            "DELETE FROM usage_log WHERE credential_id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn get_credential(&self, id: i64) -> AppResult<Option<Credential>> {
        let conn = self.connect()?;
        let cred = conn
            .query_row(
                &format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE id = ?1"),
                params![id],
                credential_from_row,
            )
            .optional()?;
        Ok(cred)
    }

    pub fn list_credentials(&self) -> AppResult<Vec<Credential>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], credential_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Credentials the selector may consider, in creation order.
    pub fn list_available_credentials(&self) -> AppResult<Vec<Credential>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials
             WHERE available = 1
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], credential_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Sets the lifecycle status. A supplied error text increments the
    /// consecutive error count; `None` clears it.
    pub fn set_credential_status(
        &self,
        id: i64,
        status: CredentialStatus,
        error: Option<&str>,
    ) -> AppResult<()> {
        let conn = self.connect()?;
        let affected = match error {
            Some(err) => conn.execute(
                "UPDATE credentials
                 SET status = ?1, error_count = error_count + 1, last_error = ?2
                 WHERE id = ?3",
                params![status.as_str(), err, id],
            )?,
            None => conn.execute(
                "UPDATE credentials
                 SET status = ?1, error_count = 0, last_error = NULL
                 WHERE id = ?2",
                params![status.as_str(), id],
            )?,
        };
        if affected == 0 {
            return Err(AppError::NotFound(format!("credential {id}")));
        }
        Ok(())
    }

    pub fn set_credential_balance(&self, id: i64, balance: f64) -> AppResult<()> {
        let conn = self.connect()?;
        let now = Utc::now().timestamp();
        let affected = conn.execute(
            "UPDATE credentials SET balance = ?1, balance_checked_at = ?2 WHERE id = ?3",
            params![balance, now, id],
        )?;
        if affected == 0 {
            return Err(AppError::NotFound(format!("credential {id}")));
        }
        Ok(())
    }

    pub fn set_credential_availability(&self, id: i64, available: bool) -> AppResult<()> {
        let conn = self.connect()?;
        let affected = conn.execute(
            "UPDATE credentials SET available = ?1 WHERE id = ?2",
            params![available, id],
        )?;
        if affected == 0 {
            return Err(AppError::NotFound(format!("credential {id}")));
        }
        Ok(())
    }

    pub fn increment_credential_calls(&self, id: i64) -> AppResult<()> {
        let conn = self.connect()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "UPDATE credentials SET call_count = call_count + 1, last_used_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    pub fn append_usage(&self, credential_id: i64, success: bool, detail: &str) -> AppResult<()> {
        let conn = self.connect()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO usage_log (credential_id, created_at, success, detail)
             VALUES (?1, ?2, ?3, ?4)",
            params![credential_id, now, success, detail],
        )?;
        Ok(())
    }

    /// Most recent entries for one credential, newest first.
    pub fn recent_usage(&self, credential_id: i64, limit: u32) -> AppResult<Vec<UsageEntry>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, credential_id, created_at, success, detail FROM usage_log
             WHERE credential_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![credential_id, limit], |row| {
            Ok(UsageEntry {
                id: row.get(0)?,
                credential_id: row.get(1)?,
                created_at: row.get(2)?,
                success: row.get(3)?,
                detail: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    #[cfg(test)]
    pub fn count_usage(&self, credential_id: i64) -> AppResult<i64> {
        let conn = self.connect()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM usage_log WHERE credential_id = ?1",
            params![credential_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path()).expect("store");
        (dir, store)
    }

    #[test]
    fn add_and_get_roundtrip() {
        let (_dir, store) = test_store();
        let id = store.add_credential("sk-test-aaaaaaaaaaaaaaaa").unwrap();

        let cred = store.get_credential(id).unwrap().expect("credential");
        assert_eq!(cred.secret, "sk-test-aaaaaaaaaaaaaaaa");
        assert_eq!(cred.status, CredentialStatus::Active);
        assert!(cred.available);
        assert_eq!(cred.balance, None);
        assert_eq!(cred.call_count, 0);
        assert_eq!(cred.error_count, 0);
    }

    #[test]
    fn duplicate_secret_is_a_conflict() {
        let (_dir, store) = test_store();
        store.add_credential("sk-dup").unwrap();
        let err = store.add_credential("sk-dup").unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)), "got {err:?}");
    }

    #[test]
    fn available_listing_is_creation_ordered_and_filtered() {
        let (_dir, store) = test_store();
        let a = store.add_credential("sk-a").unwrap();
        let b = store.add_credential("sk-b").unwrap();
        let c = store.add_credential("sk-c").unwrap();
        store.set_credential_availability(b, false).unwrap();

        let available = store.list_available_credentials().unwrap();
        let ids: Vec<i64> = available.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[test]
    fn status_with_error_increments_count_and_clears_on_reset() {
        let (_dir, store) = test_store();
        let id = store.add_credential("sk-x").unwrap();

        store
            .set_credential_status(id, CredentialStatus::Error, Some("HTTP 500"))
            .unwrap();
        store
            .set_credential_status(id, CredentialStatus::Error, Some("HTTP 502"))
            .unwrap();
        let cred = store.get_credential(id).unwrap().unwrap();
        assert_eq!(cred.error_count, 2);
        assert_eq!(cred.last_error.as_deref(), Some("HTTP 502"));

        store
            .set_credential_status(id, CredentialStatus::Active, None)
            .unwrap();
        let cred = store.get_credential(id).unwrap().unwrap();
        assert_eq!(cred.error_count, 0);
        assert_eq!(cred.last_error, None);
        assert_eq!(cred.status, CredentialStatus::Active);
    }

    #[test]
    fn balance_and_calls_are_stamped() {
        let (_dir, store) = test_store();
        let id = store.add_credential("sk-y").unwrap();

        store.set_credential_balance(id, 4.2).unwrap();
        store.increment_credential_calls(id).unwrap();
        let cred = store.get_credential(id).unwrap().unwrap();
        assert_eq!(cred.balance, Some(4.2));
        assert!(cred.balance_checked_at.is_some());
        assert_eq!(cred.call_count, 1);
        assert!(cred.last_used_at.is_some());
    }

    #[test]
    fn delete_removes_credential_and_usage() {
        let (_dir, store) = test_store();
        let id = store.add_credential("sk-z").unwrap();
        store.append_usage(id, true, "{}").unwrap();

        store.delete_credential(id).unwrap();
        assert!(store.get_credential(id).unwrap().is_none());
        assert_eq!(store.count_usage(id).unwrap(), 0);

        let err = store.delete_credential(id).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn usage_reads_newest_first_with_limit() {
        let (_dir, store) = test_store();
        let id = store.add_credential("sk-u").unwrap();
        for i in 0..5 {
            store
                .append_usage(id, i % 2 == 0, &format!("entry-{i}"))
                .unwrap();
        }

        let entries = store.recent_usage(id, 3).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].detail.as_deref(), Some("entry-4"));
        assert_eq!(entries[2].detail.as_deref(), Some("entry-2"));
    }

    #[test]
    fn masked_secret_keeps_head_and_tail() {
        let cred = Credential {
            id: 1,
            secret: "sk-abcdefghijklmnopqrst".to_string(),
            status: CredentialStatus::Active,
            available: true,
            balance: None,
            balance_checked_at: None,
            call_count: 0,
            created_at: 0,
            last_used_at: None,
            error_count: 0,
            last_error: None,
        };
        assert_eq!(cred.masked_secret(), "sk-abcde...qrst");

        let short = Credential {
            secret: "sk-tiny".to_string(),
            ..cred
        };
        assert_eq!(short.masked_secret(), "*******");
    }
}

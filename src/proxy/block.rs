use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use crate::constants;
use crate::error::AppResult;
use crate::modules::persistence::block_db::BlockRecord;
use crate::modules::persistence::store::Store;

/// Recursion ceiling for the body search. JSON values cannot be cyclic, but
/// a hostile body could nest deeply enough to blow the stack without it.
const MAX_SEARCH_DEPTH: usize = 64;

/// Classifies a failing upstream body as a soft block: the upstream telling
/// us our source IP is rate limited, as opposed to a problem with the key or
/// the request. Signals are the substring "busy" (case-insensitive) anywhere
/// in the body text, or the numeric code 50603.
pub fn is_soft_block(body: &str) -> bool {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => value_has_block_signal(&value, 0),
        Err(_) => {
            let lower = body.to_lowercase();
            lower.contains("busy") || lower.contains(&constants::SOFT_BLOCK_CODE.to_string())
        }
    }
}

fn value_has_block_signal(value: &Value, depth: usize) -> bool {
    if depth > MAX_SEARCH_DEPTH {
        return false;
    }
    match value {
        Value::String(s) => s.to_lowercase().contains("busy"),
        Value::Number(n) => n.as_i64() == Some(constants::SOFT_BLOCK_CODE),
        Value::Array(items) => items.iter().any(|v| value_has_block_signal(v, depth + 1)),
        Value::Object(map) => map.values().any(|v| value_has_block_signal(v, depth + 1)),
        _ => false,
    }
}

/// Inserts the cooldown record. Until it expires every `forward` call is
/// answered with 503 without touching the upstream.
pub fn record_soft_block(store: &Store, reason: &str) -> AppResult<BlockRecord> {
    let blocked_at = Utc::now().timestamp();
    let unblock_at = blocked_at + constants::BLOCK_COOLDOWN_MINUTES * 60;
    let id = store.insert_block_record(unblock_at, reason)?;
    warn!(
        "[BlockDetector] Upstream soft block detected, cooling down {} minutes: {}",
        constants::BLOCK_COOLDOWN_MINUTES, reason
    );
    Ok(BlockRecord {
        id,
        blocked_at,
        unblock_at,
        reason: reason.to_string(),
    })
}

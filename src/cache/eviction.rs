//! Count/age limits applied to a named cache after every write.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::Deserialize;

/// Limits for one named cache.
///
/// After any write to a governed cache, the entry count stays within
/// `max_entries` and no surviving entry is older than `max_age_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EvictionPolicy {
  pub max_entries: u64,
  pub max_age_seconds: i64,
}

/// Delete entries violating the policy. Age expiry runs first, then the
/// oldest remaining entries are dropped until the count fits. Idempotent.
///
/// Runs against an already-locked connection so a caller can keep a
/// write+evict sequence atomic for the cache name.
pub(crate) fn apply(
  conn: &Connection,
  cache_name: &str,
  policy: &EvictionPolicy,
  now: DateTime<Utc>,
) -> Result<usize> {
  let cutoff = (now - chrono::Duration::seconds(policy.max_age_seconds))
    .format("%Y-%m-%d %H:%M:%S")
    .to_string();

  let expired = conn
    .execute(
      "DELETE FROM response_cache WHERE cache_name = ? AND stored_at < ?",
      params![cache_name, cutoff],
    )
    .map_err(|e| eyre!("Failed to expire cache entries: {}", e))?;

  // Oldest-first beyond the count budget; rowid breaks same-second ties.
  let overflow = conn
    .execute(
      "DELETE FROM response_cache WHERE cache_name = ?1 AND rowid IN (
         SELECT rowid FROM response_cache WHERE cache_name = ?1
         ORDER BY stored_at DESC, rowid DESC
         LIMIT -1 OFFSET ?2
       )",
      params![cache_name, policy.max_entries],
    )
    .map_err(|e| eyre!("Failed to trim cache entries: {}", e))?;

  Ok(expired + overflow)
}

//! Cache store trait and SQLite implementation.
//!
//! A store holds response blobs in enumerable named partitions ("caches").
//! Entries are immutable once written; a rewrite is a delete+insert with a
//! fresh timestamp.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::eviction::{self, EvictionPolicy};
use crate::request::ResponsePayload;

/// A cached response together with its write timestamp.
#[derive(Debug, Clone)]
pub struct StoredResponse {
  pub response: ResponsePayload,
  pub stored_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
pub trait CacheStore: Send + Sync {
  /// Look up an entry. Never returns a partially-evicted entry; a read
  /// sees a consistent snapshot.
  fn get(&self, cache_name: &str, key: &str) -> Result<Option<StoredResponse>>;

  /// Write an entry, then enforce the policy (if any) for the cache name.
  /// The write+evict sequence is atomic relative to other writes on the
  /// same name.
  fn put(
    &self,
    cache_name: &str,
    key: &str,
    response: &ResponsePayload,
    policy: Option<&EvictionPolicy>,
  ) -> Result<()>;

  /// Remove a single entry. Returns whether it existed.
  fn delete(&self, cache_name: &str, key: &str) -> Result<bool>;

  /// Apply count/age limits to a cache. Safe to call redundantly.
  fn enforce(&self, cache_name: &str, policy: &EvictionPolicy) -> Result<usize>;

  /// Names of all caches that currently hold at least one entry.
  fn list_caches(&self) -> Result<Vec<String>>;

  /// Drop a whole cache. Returns whether any entries were removed.
  fn delete_cache(&self, cache_name: &str) -> Result<bool>;

  /// Number of entries in a cache.
  fn count(&self, cache_name: &str) -> Result<u64>;
}

/// Store implementation that doesn't cache anything.
/// Used when offline caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl CacheStore for NoopStore {
  fn get(&self, _cache_name: &str, _key: &str) -> Result<Option<StoredResponse>> {
    Ok(None) // Always miss
  }

  fn put(
    &self,
    _cache_name: &str,
    _key: &str,
    _response: &ResponsePayload,
    _policy: Option<&EvictionPolicy>,
  ) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _cache_name: &str, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn enforce(&self, _cache_name: &str, _policy: &EvictionPolicy) -> Result<usize> {
    Ok(0)
  }

  fn list_caches(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_cache(&self, _cache_name: &str) -> Result<bool> {
    Ok(false)
  }

  fn count(&self, _cache_name: &str) -> Result<u64> {
    Ok(0)
  }
}

/// SQLite-based cache store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for the response cache table.
pub(crate) const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS response_cache (
    cache_name TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_response_cache_age
    ON response_cache(cache_name, stored_at);
"#;

impl SqliteStore {
  /// Open (or create) the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// In-memory store, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn put_inner(
    &self,
    cache_name: &str,
    key: &str,
    response: &ResponsePayload,
    policy: Option<&EvictionPolicy>,
    stored_at: DateTime<Utc>,
  ) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let data =
      serde_json::to_vec(response).map_err(|e| eyre!("Failed to serialize response: {}", e))?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // Rewrite is delete+insert; REPLACE gives exactly that in SQLite.
    let write = conn
      .execute(
        "INSERT OR REPLACE INTO response_cache (cache_name, entry_key, data, stored_at)
         VALUES (?, ?, ?, ?)",
        params![
          cache_name,
          key,
          data,
          stored_at.format("%Y-%m-%d %H:%M:%S").to_string()
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e));

    let evict = match (&write, policy) {
      (Ok(_), Some(policy)) => {
        eviction::apply(&conn, cache_name, policy, stored_at).map(|_| ())
      }
      _ => Ok(()),
    };

    if write.is_err() || evict.is_err() {
      let _ = conn.execute("ROLLBACK", []);
      write?;
      evict?;
    }

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  /// Insert an entry with an explicit timestamp. Test hook for aging.
  #[cfg(test)]
  pub(crate) fn put_at(
    &self,
    cache_name: &str,
    key: &str,
    response: &ResponsePayload,
    stored_at: DateTime<Utc>,
  ) -> Result<()> {
    self.put_inner(cache_name, key, response, None, stored_at)
  }
}

impl CacheStore for SqliteStore {
  fn get(&self, cache_name: &str, key: &str) -> Result<Option<StoredResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, stored_at FROM response_cache WHERE cache_name = ? AND entry_key = ?",
        params![cache_name, key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((data, stored_at_str)) => {
        let response: ResponsePayload = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize cache entry: {}", e))?;
        let stored_at = parse_datetime(&stored_at_str)?;
        Ok(Some(StoredResponse {
          response,
          stored_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(
    &self,
    cache_name: &str,
    key: &str,
    response: &ResponsePayload,
    policy: Option<&EvictionPolicy>,
  ) -> Result<()> {
    self.put_inner(cache_name, key, response, policy, Utc::now())
  }

  fn delete(&self, cache_name: &str, key: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute(
        "DELETE FROM response_cache WHERE cache_name = ? AND entry_key = ?",
        params![cache_name, key],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;

    Ok(removed > 0)
  }

  fn enforce(&self, cache_name: &str, policy: &EvictionPolicy) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    eviction::apply(&conn, cache_name, policy, Utc::now())
  }

  fn list_caches(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM response_cache ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare cache listing: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_cache(&self, cache_name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let removed = conn
      .execute(
        "DELETE FROM response_cache WHERE cache_name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))?;

    Ok(removed > 0)
  }

  fn count(&self, cache_name: &str) -> Result<u64> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT COUNT(*) FROM response_cache WHERE cache_name = ?",
        params![cache_name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn resp(body: &[u8]) -> ResponsePayload {
    ResponsePayload {
      status: 200,
      headers: Vec::new(),
      body: body.to_vec(),
    }
  }

  #[test]
  fn test_put_get_roundtrip() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put("articles", "k1", &resp(b"hello"), None).unwrap();

    let hit = store.get("articles", "k1").unwrap().unwrap();
    assert_eq!(hit.response.body, b"hello");
    assert_eq!(hit.response.status, 200);
  }

  #[test]
  fn test_miss_on_other_cache() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put("articles", "k1", &resp(b"hello"), None).unwrap();

    assert!(store.get("scores", "k1").unwrap().is_none());
  }

  #[test]
  fn test_rewrite_replaces_entry() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .put_at("articles", "k1", &resp(b"old"), Utc::now() - Duration::seconds(60))
      .unwrap();
    store.put("articles", "k1", &resp(b"new"), None).unwrap();

    let hit = store.get("articles", "k1").unwrap().unwrap();
    assert_eq!(hit.response.body, b"new");
    assert!(Utc::now() - hit.stored_at < Duration::seconds(5));
    assert_eq!(store.count("articles").unwrap(), 1);
  }

  #[test]
  fn test_put_with_policy_enforces_count() {
    let store = SqliteStore::open_in_memory().unwrap();
    let policy = EvictionPolicy {
      max_entries: 3,
      max_age_seconds: 3600,
    };

    for i in 0..10 {
      store
        .put("scores", &format!("k{}", i), &resp(b"x"), Some(&policy))
        .unwrap();
      assert!(store.count("scores").unwrap() <= 3);
    }
  }

  #[test]
  fn test_put_with_policy_expires_aged_entries() {
    let store = SqliteStore::open_in_memory().unwrap();
    let policy = EvictionPolicy {
      max_entries: 100,
      max_age_seconds: 300,
    };

    store
      .put_at("scores", "stale", &resp(b"x"), Utc::now() - Duration::seconds(600))
      .unwrap();
    store.put("scores", "fresh", &resp(b"y"), Some(&policy)).unwrap();

    assert!(store.get("scores", "stale").unwrap().is_none());
    assert!(store.get("scores", "fresh").unwrap().is_some());
  }

  #[test]
  fn test_list_and_delete_cache() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put("articles::v1", "a", &resp(b"1"), None).unwrap();
    store.put("scores::v1", "b", &resp(b"2"), None).unwrap();

    assert_eq!(
      store.list_caches().unwrap(),
      vec!["articles::v1".to_string(), "scores::v1".to_string()]
    );

    assert!(store.delete_cache("articles::v1").unwrap());
    assert!(!store.delete_cache("articles::v1").unwrap());
    assert_eq!(store.list_caches().unwrap(), vec!["scores::v1".to_string()]);
  }

  #[test]
  fn test_delete_single_entry() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put("articles", "k1", &resp(b"x"), None).unwrap();

    assert!(store.delete("articles", "k1").unwrap());
    assert!(!store.delete("articles", "k1").unwrap());
    assert!(store.get("articles", "k1").unwrap().is_none());
  }

  #[test]
  fn test_noop_store_discards() {
    let store = NoopStore;
    store.put("articles", "k1", &resp(b"x"), None).unwrap();

    assert!(store.get("articles", "k1").unwrap().is_none());
    assert_eq!(store.count("articles").unwrap(), 0);
  }
}

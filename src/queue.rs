//! Durable FIFO of failed mutating requests awaiting replay.
//!
//! Entries are persisted before `enqueue` returns, so a queued request
//! survives process restarts. Replay is at-least-once: an entry is removed
//! only after a successful replay, and a failed replay leaves it at the
//! head of its queue.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::request::{ResponsePayload, SerializedRequest};

/// Retention and retry policy shared by all queues.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QueueConfig {
  /// Entries older than this are dropped instead of replayed
  #[serde(default = "default_retention_hours")]
  pub retention_hours: i64,
  /// Optional cap on replay attempts; unlimited when absent
  #[serde(default)]
  pub max_attempts: Option<u32>,
}

fn default_retention_hours() -> i64 {
  24
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      retention_hours: default_retention_hours(),
      max_attempts: None,
    }
  }
}

/// Outcome of one drain pass over a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
  /// Another drain already holds this queue
  AlreadyDraining,
  /// The pass ran; see the report
  Ran(DrainReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Entries replayed successfully and removed
  pub replayed: usize,
  /// Entries dropped for exceeding retention or the attempt cap
  pub dropped: usize,
  /// Entries still queued when the pass ended
  pub remaining: u64,
  /// Whether the pass stopped on a replay failure
  pub halted: bool,
}

/// SQLite-backed retry queue, partitioned by queue name.
pub struct RetryQueue {
  conn: Mutex<Connection>,
  /// Queue names with a drain in flight; one drain per queue at a time
  active: Arc<Mutex<HashSet<String>>>,
  config: QueueConfig,
}

/// Schema for the retry queue table.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS retry_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_name TEXT NOT NULL,
    position INTEGER NOT NULL,
    request BLOB NOT NULL,
    enqueued_at TEXT NOT NULL DEFAULT (datetime('now')),
    attempts INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_retry_queue_pos
    ON retry_queue(queue_name, position);
"#;

impl RetryQueue {
  /// Open (or create) the queue database at the given path.
  pub fn open(path: &Path, config: QueueConfig) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    let queue = Self {
      conn: Mutex::new(conn),
      active: Arc::new(Mutex::new(HashSet::new())),
      config,
    };
    queue.run_migrations()?;

    Ok(queue)
  }

  /// In-memory queue, used by tests.
  pub fn open_in_memory(config: QueueConfig) -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory queue: {}", e))?;

    let queue = Self {
      conn: Mutex::new(conn),
      active: Arc::new(Mutex::new(HashSet::new())),
      config,
    };
    queue.run_migrations()?;

    Ok(queue)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    Ok(())
  }

  /// Append a request at the tail. Durable before returning.
  pub fn enqueue(&self, queue_name: &str, request: &SerializedRequest) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let data =
      serde_json::to_vec(request).map_err(|e| eyre!("Failed to serialize request: {}", e))?;

    conn
      .execute(
        "INSERT INTO retry_queue (queue_name, position, request, enqueued_at)
         VALUES (
           ?1,
           COALESCE((SELECT MAX(position) + 1 FROM retry_queue WHERE queue_name = ?1), 0),
           ?2,
           ?3
         )",
        params![
          queue_name,
          data,
          Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue request: {}", e))?;

    Ok(())
  }

  /// Number of entries waiting in a queue.
  pub fn len(&self, queue_name: &str) -> Result<u64> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT COUNT(*) FROM retry_queue WHERE queue_name = ?",
        params![queue_name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count queue entries: {}", e))
  }

  /// Queue names that currently hold at least one entry.
  pub fn queue_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT queue_name FROM retry_queue ORDER BY queue_name")
      .map_err(|e| eyre!("Failed to prepare queue listing: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list queues: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  /// Replay queued requests head-first until the queue is empty or a replay
  /// fails. A failed entry keeps its head position for the next trigger.
  ///
  /// Only one drain runs per queue at a time; a second caller gets
  /// `AlreadyDraining` and does nothing.
  pub async fn drain<F, Fut>(&self, queue_name: &str, replay: F) -> Result<DrainOutcome>
  where
    F: Fn(SerializedRequest) -> Fut,
    Fut: Future<Output = Result<ResponsePayload>>,
  {
    let _guard = match DrainGuard::acquire(&self.active, queue_name) {
      Some(guard) => guard,
      None => return Ok(DrainOutcome::AlreadyDraining),
    };

    let mut report = DrainReport {
      dropped: self.drop_expired(queue_name)?,
      ..Default::default()
    };

    loop {
      let head = match self.peek_head(queue_name)? {
        Some(head) => head,
        None => break,
      };

      self.record_attempt(head.id)?;

      match replay(head.request).await {
        Ok(_) => {
          self.remove(head.id)?;
          report.replayed += 1;
        }
        Err(e) => {
          warn!(queue = queue_name, error = %e, "replay failed, halting drain");
          report.halted = true;
          break;
        }
      }
    }

    report.remaining = self.len(queue_name)?;
    Ok(DrainOutcome::Ran(report))
  }

  /// Drop entries past retention or the attempt cap. Returns how many.
  fn drop_expired(&self, queue_name: &str) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let cutoff = (Utc::now() - Duration::hours(self.config.retention_hours))
      .format("%Y-%m-%d %H:%M:%S")
      .to_string();

    let mut dropped = conn
      .execute(
        "DELETE FROM retry_queue WHERE queue_name = ? AND enqueued_at < ?",
        params![queue_name, cutoff],
      )
      .map_err(|e| eyre!("Failed to drop expired queue entries: {}", e))?;

    if let Some(max_attempts) = self.config.max_attempts {
      dropped += conn
        .execute(
          "DELETE FROM retry_queue WHERE queue_name = ? AND attempts >= ?",
          params![queue_name, max_attempts],
        )
        .map_err(|e| eyre!("Failed to drop exhausted queue entries: {}", e))?;
    }

    if dropped > 0 {
      warn!(
        queue = queue_name,
        dropped, "dropped undeliverable queued requests"
      );
    }

    Ok(dropped)
  }

  fn peek_head(&self, queue_name: &str) -> Result<Option<HeadEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(i64, Vec<u8>)> = conn
      .query_row(
        "SELECT id, request FROM retry_queue WHERE queue_name = ?
         ORDER BY position LIMIT 1",
        params![queue_name],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read queue head: {}", e))?;

    match row {
      Some((id, data)) => {
        let request: SerializedRequest = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize queued request: {}", e))?;
        Ok(Some(HeadEntry { id, request }))
      }
      None => Ok(None),
    }
  }

  fn record_attempt(&self, id: i64) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "UPDATE retry_queue SET attempts = attempts + 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to record replay attempt: {}", e))?;

    Ok(())
  }

  fn remove(&self, id: i64) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM retry_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove queue entry: {}", e))?;

    Ok(())
  }
}

struct HeadEntry {
  id: i64,
  request: SerializedRequest,
}

/// Marks a queue as draining; releases the mark on drop so a panicked or
/// errored drain never wedges the queue.
struct DrainGuard {
  active: Arc<Mutex<HashSet<String>>>,
  queue_name: String,
}

impl DrainGuard {
  fn acquire(active: &Arc<Mutex<HashSet<String>>>, queue_name: &str) -> Option<Self> {
    let mut held = active.lock().ok()?;
    if !held.insert(queue_name.to_string()) {
      return None;
    }

    Some(Self {
      active: Arc::clone(active),
      queue_name: queue_name.to_string(),
    })
  }
}

impl Drop for DrainGuard {
  fn drop(&mut self) {
    if let Ok(mut held) = self.active.lock() {
      held.remove(&self.queue_name);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::request::Method;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn request(url: &str) -> SerializedRequest {
    SerializedRequest {
      method: Method::Post,
      url: url.to_string(),
      headers: Vec::new(),
      body: Some(b"payload".to_vec()),
    }
  }

  fn ok_response() -> ResponsePayload {
    ResponsePayload {
      status: 200,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  fn report(outcome: DrainOutcome) -> DrainReport {
    match outcome {
      DrainOutcome::Ran(report) => report,
      DrainOutcome::AlreadyDraining => panic!("expected a drain pass"),
    }
  }

  #[tokio::test]
  async fn test_drain_replays_in_fifo_order() {
    let queue = RetryQueue::open_in_memory(QueueConfig::default()).unwrap();
    for url in ["a", "b", "c"] {
      queue.enqueue("forms", &request(url)).unwrap();
    }

    let replayed = Mutex::new(Vec::new());
    let outcome = queue
      .drain("forms", |req| {
        replayed.lock().unwrap().push(req.url);
        async { Ok(ok_response()) }
      })
      .await
      .unwrap();

    let report = report(outcome);
    assert_eq!(report.replayed, 3);
    assert_eq!(report.remaining, 0);
    assert!(!report.halted);
    assert_eq!(*replayed.lock().unwrap(), vec!["a", "b", "c"]);
  }

  #[tokio::test]
  async fn test_failed_entry_keeps_head_position_and_halts_drain() {
    let queue = RetryQueue::open_in_memory(QueueConfig::default()).unwrap();
    for url in ["a", "b", "c"] {
      queue.enqueue("forms", &request(url)).unwrap();
    }

    let attempted = Mutex::new(Vec::new());
    let outcome = queue
      .drain("forms", |req| {
        attempted.lock().unwrap().push(req.url.clone());
        async move {
          if req.url == "b" {
            Err(eyre!("no connectivity"))
          } else {
            Ok(ok_response())
          }
        }
      })
      .await
      .unwrap();

    let first_pass = report(outcome);
    assert_eq!(first_pass.replayed, 1);
    assert!(first_pass.halted);
    assert_eq!(first_pass.remaining, 2);
    // C was never attempted this cycle
    assert_eq!(*attempted.lock().unwrap(), vec!["a", "b"]);

    // Next pass starts at B, then C: order is preserved
    let attempted = Mutex::new(Vec::new());
    let outcome = queue
      .drain("forms", |req| {
        attempted.lock().unwrap().push(req.url);
        async { Ok(ok_response()) }
      })
      .await
      .unwrap();
    assert_eq!(report(outcome).replayed, 2);
    assert_eq!(*attempted.lock().unwrap(), vec!["b", "c"]);
  }

  #[tokio::test]
  async fn test_attempts_are_persisted() {
    let queue = RetryQueue::open_in_memory(QueueConfig::default()).unwrap();
    queue.enqueue("forms", &request("a")).unwrap();

    for _ in 0..3 {
      let outcome = queue
        .drain("forms", |_| async { Err(eyre!("offline")) })
        .await
        .unwrap();
      assert!(report(outcome).halted);
    }

    let attempts: i64 = queue
      .conn
      .lock()
      .unwrap()
      .query_row("SELECT attempts FROM retry_queue", [], |row| row.get(0))
      .unwrap();
    assert_eq!(attempts, 3);
  }

  #[tokio::test]
  async fn test_attempt_cap_drops_entry() {
    let config = QueueConfig {
      retention_hours: 24,
      max_attempts: Some(2),
    };
    let queue = RetryQueue::open_in_memory(config).unwrap();
    queue.enqueue("forms", &request("a")).unwrap();

    for _ in 0..2 {
      queue
        .drain("forms", |_| async { Err(eyre!("offline")) })
        .await
        .unwrap();
    }

    let outcome = queue
      .drain("forms", |_| async { Ok(ok_response()) })
      .await
      .unwrap();
    let report = report(outcome);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.replayed, 0);
    assert_eq!(queue.len("forms").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_retention_window_drops_stale_entries() {
    let queue = RetryQueue::open_in_memory(QueueConfig {
      retention_hours: 1,
      max_attempts: None,
    })
    .unwrap();
    queue.enqueue("forms", &request("stale")).unwrap();

    // Age the entry past the window
    queue
      .conn
      .lock()
      .unwrap()
      .execute(
        "UPDATE retry_queue SET enqueued_at = ?",
        params![(Utc::now() - Duration::hours(2))
          .format("%Y-%m-%d %H:%M:%S")
          .to_string()],
      )
      .unwrap();

    let outcome = queue
      .drain("forms", |_| async { Ok(ok_response()) })
      .await
      .unwrap();
    let report = report(outcome);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.replayed, 0);
  }

  #[tokio::test]
  async fn test_queues_are_independent() {
    let queue = RetryQueue::open_in_memory(QueueConfig::default()).unwrap();
    queue.enqueue("forms", &request("a")).unwrap();
    queue.enqueue("comments", &request("b")).unwrap();

    let outcome = queue
      .drain("forms", |_| async { Ok(ok_response()) })
      .await
      .unwrap();

    assert_eq!(report(outcome).replayed, 1);
    assert_eq!(queue.len("comments").unwrap(), 1);
    assert_eq!(queue.queue_names().unwrap(), vec!["comments".to_string()]);
  }

  #[tokio::test]
  async fn test_concurrent_drain_is_rejected() {
    let queue = Arc::new(RetryQueue::open_in_memory(QueueConfig::default()).unwrap());
    queue.enqueue("forms", &request("a")).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let release_rx = Mutex::new(Some(release_rx));

    let slow = {
      let queue = Arc::clone(&queue);
      let calls = Arc::clone(&calls);
      tokio::spawn(async move {
        queue
          .drain("forms", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            let rx = release_rx.lock().unwrap().take();
            async move {
              if let Some(rx) = rx {
                let _ = rx.await;
              }
              Ok(ok_response())
            }
          })
          .await
      })
    };

    // Wait until the slow drain is inside its replay
    while calls.load(Ordering::SeqCst) == 0 {
      tokio::task::yield_now().await;
    }

    let second = queue
      .drain("forms", |_| async { Ok(ok_response()) })
      .await
      .unwrap();
    assert_eq!(second, DrainOutcome::AlreadyDraining);

    release_tx.send(()).unwrap();
    let outcome = slow.await.unwrap().unwrap();
    assert_eq!(report(outcome).replayed, 1);
  }
}

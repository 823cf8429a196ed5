//! Durable queue of mutations made while offline.
//!
//! Records are keyed by id and enumerated in enqueue order. A record leaves
//! the queue only when the remote API has accepted it.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;

use crate::db::Database;

/// Which creation endpoint a mutation replays against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Task,
  Note,
}

impl MutationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Task => "task",
      Self::Note => "note",
    }
  }

  fn parse(s: &str) -> Result<Self> {
    match s {
      "task" => Ok(Self::Task),
      "note" => Ok(Self::Note),
      other => Err(eyre!("Unknown mutation kind '{}'", other)),
    }
  }
}

/// A mutation waiting for the remote API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
  pub id: String,
  pub kind: MutationKind,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
}

impl PendingMutation {
  pub fn new(id: impl Into<String>, kind: MutationKind, payload: Value) -> Self {
    Self {
      id: id.into(),
      kind,
      payload,
      enqueued_at: Utc::now(),
    }
  }
}

/// Trait for durable queue backends.
pub trait MutationQueue: Send + Sync {
  /// Append a record. Re-appending an existing id replaces its payload in place.
  fn append(&self, mutation: &PendingMutation) -> Result<()>;

  /// All records of one kind, oldest first.
  fn list(&self, kind: MutationKind) -> Result<Vec<PendingMutation>>;

  /// Remove a record. Returns whether it was present.
  fn remove(&self, id: &str) -> Result<bool>;
}

/// Queue that only lives in process memory.
#[derive(Default)]
pub struct MemoryQueue {
  records: Mutex<Vec<PendingMutation>>,
}

impl MemoryQueue {
  pub fn new() -> Self {
    Self::default()
  }
}

impl MutationQueue for MemoryQueue {
  fn append(&self, mutation: &PendingMutation) -> Result<()> {
    let mut records = self.records.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    match records.iter_mut().find(|r| r.id == mutation.id) {
      Some(existing) => {
        existing.kind = mutation.kind;
        existing.payload = mutation.payload.clone();
      }
      None => records.push(mutation.clone()),
    }
    Ok(())
  }

  fn list(&self, kind: MutationKind) -> Result<Vec<PendingMutation>> {
    let records = self.records.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(records.iter().filter(|r| r.kind == kind).cloned().collect())
  }

  fn remove(&self, id: &str) -> Result<bool> {
    let mut records = self.records.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let before = records.len();
    records.retain(|r| r.id != id);
    Ok(records.len() != before)
  }
}

/// SQLite-backed queue; survives process restarts.
#[derive(Clone)]
pub struct SqliteQueue {
  db: Database,
}

impl SqliteQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

impl MutationQueue for SqliteQueue {
  fn append(&self, mutation: &PendingMutation) -> Result<()> {
    let conn = self.db.conn()?;
    let payload = serde_json::to_string(&mutation.payload)
      .map_err(|e| eyre!("Failed to serialize mutation {}: {}", mutation.id, e))?;

    // Upsert keeps the original seq so the record holds its place in line
    conn
      .execute(
        "INSERT INTO pending_mutations (id, kind, payload, enqueued_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, payload = excluded.payload",
        params![
          mutation.id,
          mutation.kind.as_str(),
          payload,
          mutation.enqueued_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation {}: {}", mutation.id, e))?;

    Ok(())
  }

  fn list(&self, kind: MutationKind) -> Result<Vec<PendingMutation>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, kind, payload, enqueued_at FROM pending_mutations
         WHERE kind = ?
         ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows: Vec<(String, String, String, String)> = stmt
      .query_map(params![kind.as_str()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    rows
      .into_iter()
      .map(|(id, kind, payload, enqueued_at)| -> Result<PendingMutation> {
        let payload = serde_json::from_str(&payload)
          .map_err(|e| eyre!("Corrupt payload for mutation {}: {}", id, e))?;
        let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
          .map(|dt| dt.with_timezone(&Utc))
          .map_err(|e| eyre!("Failed to parse datetime '{}': {}", enqueued_at, e))?;
        Ok(PendingMutation {
          id,
          kind: MutationKind::parse(&kind)?,
          payload,
          enqueued_at,
        })
      })
      .collect()
  }

  fn remove(&self, id: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute("DELETE FROM pending_mutations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove mutation {}: {}", id, e))?;
    Ok(removed > 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn backends() -> Vec<Box<dyn MutationQueue>> {
    vec![
      Box::new(MemoryQueue::new()),
      Box::new(SqliteQueue::new(Database::open_in_memory().unwrap())),
    ]
  }

  fn ids(records: &[PendingMutation]) -> Vec<&str> {
    records.iter().map(|r| r.id.as_str()).collect()
  }

  #[test]
  fn test_list_preserves_enqueue_order_per_kind() {
    for queue in backends() {
      queue.append(&PendingMutation::new("t1", MutationKind::Task, json!({"title": "a"}))).unwrap();
      queue.append(&PendingMutation::new("n1", MutationKind::Note, json!({"text": "b"}))).unwrap();
      queue.append(&PendingMutation::new("t2", MutationKind::Task, json!({"title": "c"}))).unwrap();

      assert_eq!(ids(&queue.list(MutationKind::Task).unwrap()), vec!["t1", "t2"]);
      assert_eq!(ids(&queue.list(MutationKind::Note).unwrap()), vec!["n1"]);
    }
  }

  #[test]
  fn test_reappend_replaces_payload_keeps_position() {
    for queue in backends() {
      queue.append(&PendingMutation::new("a", MutationKind::Task, json!({"v": 1}))).unwrap();
      queue.append(&PendingMutation::new("b", MutationKind::Task, json!({"v": 2}))).unwrap();
      queue.append(&PendingMutation::new("a", MutationKind::Task, json!({"v": 3}))).unwrap();

      let records = queue.list(MutationKind::Task).unwrap();
      assert_eq!(ids(&records), vec!["a", "b"]);
      assert_eq!(records[0].payload, json!({"v": 3}));
    }
  }

  #[test]
  fn test_remove() {
    for queue in backends() {
      queue.append(&PendingMutation::new("a", MutationKind::Note, json!({}))).unwrap();
      assert!(queue.remove("a").unwrap());
      assert!(!queue.remove("a").unwrap());
      assert!(queue.list(MutationKind::Note).unwrap().is_empty());
    }
  }

  #[test]
  fn test_sqlite_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
      let queue = SqliteQueue::new(Database::open(dir.path()).unwrap());
      queue.append(&PendingMutation::new("t1", MutationKind::Task, json!({"title": "offline"}))).unwrap();
      queue.append(&PendingMutation::new("t2", MutationKind::Task, json!({"title": "later"}))).unwrap();
      queue.remove("t2").unwrap();
    }

    let queue = SqliteQueue::new(Database::open(dir.path()).unwrap());
    let records = queue.list(MutationKind::Task).unwrap();
    assert_eq!(ids(&records), vec!["t1"]);
    assert_eq!(records[0].payload, json!({"title": "offline"}));
  }
}

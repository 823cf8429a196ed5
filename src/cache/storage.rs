//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use crate::db::Database;

use super::traits::{CacheEntry, RequestKey};

/// Trait for cache storage backends.
///
/// Individual operations are atomic; nothing is assumed across calls.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the partition if it does not exist yet.
  fn open(&self, partition: &str) -> Result<()>;

  /// Look up one entry.
  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CacheEntry>>;

  /// Store one entry, silently replacing any previous one for the key.
  fn put(&self, partition: &str, key: &RequestKey, entry: &CacheEntry) -> Result<()>;

  /// Store a batch of entries: either all land or none do.
  fn put_all(&self, partition: &str, entries: &[(RequestKey, CacheEntry)]) -> Result<()>;

  /// Drop a partition and everything in it. Returns whether it existed.
  fn delete_partition(&self, partition: &str) -> Result<bool>;

  /// Names of every existing partition.
  fn list_partition_names(&self) -> Result<BTreeSet<String>>;
}

/// Storage that only lives in process memory.
/// Used for ephemeral runs and tests.
#[derive(Default)]
pub struct MemoryStorage {
  partitions: Mutex<BTreeMap<String, HashMap<RequestKey, CacheEntry>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, HashMap<RequestKey, CacheEntry>>>> {
    self
      .partitions
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, partition: &str) -> Result<()> {
    self.lock()?.entry(partition.to_string()).or_default();
    Ok(())
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
    Ok(
      self
        .lock()?
        .get(partition)
        .and_then(|entries| entries.get(key))
        .cloned(),
    )
  }

  fn put(&self, partition: &str, key: &RequestKey, entry: &CacheEntry) -> Result<()> {
    self
      .lock()?
      .entry(partition.to_string())
      .or_default()
      .insert(key.clone(), entry.clone());
    Ok(())
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, CacheEntry)]) -> Result<()> {
    let mut partitions = self.lock()?;
    let target = partitions.entry(partition.to_string()).or_default();
    for (key, entry) in entries {
      target.insert(key.clone(), entry.clone());
    }
    Ok(())
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    Ok(self.lock()?.remove(partition).is_some())
  }

  fn list_partition_names(&self) -> Result<BTreeSet<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

fn open_partition(conn: &rusqlite::Connection, partition: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_partitions (name, created_at) VALUES (?, ?)",
      params![partition, Utc::now().to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;
  Ok(())
}

fn insert_entry(
  conn: &rusqlite::Connection,
  partition: &str,
  key: &RequestKey,
  entry: &CacheEntry,
) -> Result<()> {
  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (partition_name, key_hash, request_url, status, content_type, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        partition,
        key.cache_hash(),
        key.as_str(),
        entry.status,
        entry.content_type,
        entry.body,
        entry.stored_at.to_rfc3339(),
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, partition: &str) -> Result<()> {
    let conn = self.db.conn()?;
    open_partition(&conn, partition)
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self.db.conn()?;

    let row: Option<(u16, Option<String>, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, content_type, body, stored_at FROM cache_entries
         WHERE partition_name = ? AND key_hash = ?",
        params![partition, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    match row {
      Some((status, content_type, body, stored_at)) => Ok(Some(CacheEntry {
        status,
        content_type,
        body,
        stored_at: parse_datetime(&stored_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, partition: &str, key: &RequestKey, entry: &CacheEntry) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    open_partition(&tx, partition)?;
    insert_entry(&tx, partition, key, entry)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn put_all(&self, partition: &str, entries: &[(RequestKey, CacheEntry)]) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    open_partition(&tx, partition)?;
    for (key, entry) in entries {
      insert_entry(&tx, partition, key, entry)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE partition_name = ?",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", partition, e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_partitions WHERE name = ?",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed > 0)
  }

  fn list_partition_names(&self) -> Result<BTreeSet<String>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<BTreeSet<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }
}

/// Parse an RFC 3339 timestamp written by this module.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

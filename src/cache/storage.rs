//! SQLite-backed local store: one partition per resource kind, plus the
//! outbox and asset partitions.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::migrations;
use super::traits::{Cacheable, ListScope, Stored, SyncMarker};
use crate::error::{Error, Result};

/// File name of the store inside the data directory
pub const DATABASE_NAME: &str = "restaurant-reviews.db";

/// Versioned local store shared by the interceptor, the outbox and the sweep.
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct LocalStore {
  conn: Arc<Mutex<Connection>>,
}

impl LocalStore {
  /// Open (creating if absent) the store at `path` and migrate it.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        Error::SyncUnavailable(format!("failed to create store directory: {e}"))
      })?;
    }

    let conn = Connection::open(path)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    Self::from_connection(conn)
  }

  /// Open an in-memory store (useful for testing)
  pub fn open_in_memory() -> Result<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(mut conn: Connection) -> Result<Self> {
    migrations::run(&mut conn)?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("rrsync").join(DATABASE_NAME))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::SyncUnavailable(format!("store lock poisoned: {e}")))
  }

  pub fn version(&self) -> Result<u32> {
    let conn = self.lock()?;
    migrations::stored_version(&conn)
  }

  /// Run `f` against the store without opening a transaction.
  pub fn read<R>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<R>) -> Result<R> {
    let conn = self.lock()?;
    f(&StoreTx { conn: &conn })
  }

  /// Run `f` inside one read-write transaction. Rolled back if `f` fails.
  pub fn transaction<R>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<R>) -> Result<R> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let result = f(&StoreTx { conn: &tx })?;
    tx.commit()?;
    Ok(result)
  }

  pub fn get<T: Cacheable>(&self, id: i64) -> Result<Option<Stored<T>>> {
    self.read(|tx| tx.get(id))
  }

  pub fn get_all<T: Cacheable>(&self) -> Result<Vec<Stored<T>>> {
    self.read(|tx| tx.get_all())
  }

  pub fn put<T: Cacheable>(&self, record: &T, marker: Option<SyncMarker>) -> Result<()> {
    self.read(|tx| tx.put(record, marker))
  }

  pub fn delete<T: Cacheable>(&self, id: i64) -> Result<bool> {
    self.read(|tx| tx.delete::<T>(id))
  }

  /// Upsert a network payload, leaving records with a pending marker alone.
  pub fn refresh<T: Cacheable>(&self, records: &[T]) -> Result<usize> {
    self.transaction(|tx| tx.refresh(records))
  }

  /// Make `scope` match a list payload, in one transaction.
  pub fn replace_scope<T: Cacheable>(&self, scope: ListScope, records: &[T]) -> Result<usize> {
    self.transaction(|tx| tx.replace_scope(scope, records))
  }
}

/// Store primitives bound to one connection or transaction.
pub struct StoreTx<'a> {
  pub(crate) conn: &'a Connection,
}

impl StoreTx<'_> {
  pub fn get<T: Cacheable>(&self, id: i64) -> Result<Option<Stored<T>>> {
    let sql = format!(
      "SELECT data, needs_sync, cached_at FROM {} WHERE id = ?",
      T::kind().partition()
    );

    let row: Option<(String, Option<String>, String)> = self
      .conn
      .query_row(&sql, params![id], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })
      .optional()?;

    row.map(decode_row).transpose()
  }

  /// All records in the partition, ordered by id. Includes tombstones.
  pub fn get_all<T: Cacheable>(&self) -> Result<Vec<Stored<T>>> {
    let sql = format!(
      "SELECT data, needs_sync, cached_at FROM {} ORDER BY id",
      T::kind().partition()
    );

    let mut stmt = self.conn.prepare(&sql)?;
    let rows = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
      match decode_row(row) {
        Ok(stored) => records.push(stored),
        Err(e) => tracing::warn!(partition = T::kind().partition(), "Skipping corrupt record: {e}"),
      }
    }
    Ok(records)
  }

  /// Records carrying any sync marker.
  pub fn marked<T: Cacheable>(&self) -> Result<Vec<Stored<T>>> {
    Ok(
      self
        .get_all::<T>()?
        .into_iter()
        .filter(|stored| stored.marker.is_some())
        .collect(),
    )
  }

  /// Upsert keyed by the record's id.
  pub fn put<T: Cacheable>(&self, record: &T, marker: Option<SyncMarker>) -> Result<()> {
    let sql = format!(
      "INSERT OR REPLACE INTO {} (id, data, needs_sync, cached_at)
       VALUES (?, ?, ?, datetime('now'))",
      T::kind().partition()
    );
    let data = serde_json::to_string(record)?;
    self.conn.execute(
      &sql,
      params![record.id(), data, marker.map(SyncMarker::as_str)],
    )?;
    Ok(())
  }

  pub fn delete<T: Cacheable>(&self, id: i64) -> Result<bool> {
    let sql = format!("DELETE FROM {} WHERE id = ?", T::kind().partition());
    Ok(self.conn.execute(&sql, params![id])? > 0)
  }

  /// Drop the marker on a record, keeping its data.
  pub fn clear_marker<T: Cacheable>(&self, id: i64) -> Result<()> {
    let sql = format!(
      "UPDATE {} SET needs_sync = NULL WHERE id = ?",
      T::kind().partition()
    );
    self.conn.execute(&sql, params![id])?;
    Ok(())
  }

  /// Upsert confirmed records, skipping ids with a pending marker.
  /// Returns how many records were written.
  pub fn refresh<T: Cacheable>(&self, records: &[T]) -> Result<usize> {
    let sql = format!(
      "INSERT INTO {} (id, data, needs_sync, cached_at)
       VALUES (?, ?, NULL, datetime('now'))
       ON CONFLICT(id) DO UPDATE SET data = excluded.data, cached_at = excluded.cached_at
       WHERE needs_sync IS NULL",
      T::kind().partition()
    );

    let mut written = 0;
    for record in records {
      let data = serde_json::to_string(record)?;
      written += self.conn.execute(&sql, params![record.id(), data])?;
    }
    Ok(written)
  }

  /// Upsert a complete list payload for `scope`, then drop confirmed
  /// records in the scope that the payload no longer carries. Marked
  /// records stay either way. Returns how many rows changed.
  pub fn replace_scope<T: Cacheable>(&self, scope: ListScope, records: &[T]) -> Result<usize> {
    let mut changed = self.refresh(records)?;

    let listed: HashSet<i64> = records.iter().map(|record| record.id()).collect();
    let gone: Vec<i64> = self
      .get_all::<T>()?
      .into_iter()
      .filter(|s| s.is_confirmed() && scope.contains(&s.record) && !listed.contains(&s.record.id()))
      .map(|s| s.record.id())
      .collect();
    for id in gone {
      if self.delete::<T>(id)? {
        changed += 1;
      }
    }

    self.conn.execute(
      "INSERT OR REPLACE INTO listings (partition, scope, listed_at)
       VALUES (?, ?, datetime('now'))",
      params![T::kind().partition(), scope.key()],
    )?;
    Ok(changed)
  }

  /// When `scope` was last replaced from the network, if ever.
  pub fn listed_at<T: Cacheable>(&self, scope: ListScope) -> Result<Option<DateTime<Utc>>> {
    let listed: Option<String> = self
      .conn
      .query_row(
        "SELECT listed_at FROM listings WHERE partition = ? AND scope = ?",
        params![T::kind().partition(), scope.key()],
        |row| row.get(0),
      )
      .optional()?;
    listed.as_deref().map(parse_datetime).transpose()
  }

  /// Smallest id in the partition (temporary ids are negative).
  pub fn min_id<T: Cacheable>(&self) -> Result<Option<i64>> {
    let sql = format!("SELECT MIN(id) FROM {}", T::kind().partition());
    Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
  }
}

fn decode_row<T: Cacheable>(
  (data, marker, cached_at): (String, Option<String>, String),
) -> Result<Stored<T>> {
  Ok(Stored {
    record: serde_json::from_str(&data)?,
    marker: marker.as_deref().and_then(SyncMarker::parse),
    cached_at: parse_datetime(&cached_at)?,
  })
}

/// Parse a datetime string from SQLite format.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| Error::InvalidInput(format!("failed to parse datetime '{s}': {e}")))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::{Restaurant, Review};
  use crate::testing::{restaurant, review};
  use pretty_assertions::assert_eq;

  fn setup() -> LocalStore {
    LocalStore::open_in_memory().unwrap()
  }

  #[test]
  fn test_put_and_get() {
    let store = setup();
    store.put(&restaurant(5, false), None).unwrap();

    let stored = store.get::<Restaurant>(5).unwrap().unwrap();
    assert_eq!(stored.record.id, 5);
    assert!(stored.is_confirmed());
    assert!(store.get::<Restaurant>(6).unwrap().is_none());
  }

  #[test]
  fn test_put_is_upsert() {
    let store = setup();
    store.put(&restaurant(5, false), None).unwrap();
    store
      .put(&restaurant(5, true), Some(SyncMarker::Update))
      .unwrap();

    let all = store.get_all::<Restaurant>().unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].record.is_favorite);
    assert_eq!(all[0].marker, Some(SyncMarker::Update));
  }

  #[test]
  fn test_partitions_are_separate() {
    let store = setup();
    store.put(&restaurant(1, false), None).unwrap();
    store.put(&review(1, 1), None).unwrap();

    assert!(store.delete::<Review>(1).unwrap());
    assert!(store.get::<Review>(1).unwrap().is_none());
    assert!(store.get::<Restaurant>(1).unwrap().is_some());
  }

  #[test]
  fn test_refresh_skips_marked_records() {
    let store = setup();
    store
      .put(&restaurant(1, true), Some(SyncMarker::Update))
      .unwrap();
    store.put(&restaurant(2, false), None).unwrap();

    let written = store
      .refresh(&[restaurant(1, false), restaurant(2, true), restaurant(3, true)])
      .unwrap();

    assert_eq!(written, 2);
    let one = store.get::<Restaurant>(1).unwrap().unwrap();
    assert!(one.record.is_favorite);
    assert_eq!(one.marker, Some(SyncMarker::Update));
    assert!(store.get::<Restaurant>(2).unwrap().unwrap().record.is_favorite);
    assert!(store.get::<Restaurant>(3).unwrap().is_some());
  }

  #[test]
  fn test_refresh_last_applied_wins() {
    let store = setup();
    store.refresh(&[restaurant(9, true)]).unwrap();
    store.refresh(&[restaurant(9, false)]).unwrap();

    assert!(!store.get::<Restaurant>(9).unwrap().unwrap().record.is_favorite);
  }

  #[test]
  fn test_replace_scope_drops_records_missing_from_payload() {
    let store = setup();
    store.put(&review(1, 5), None).unwrap();
    store.put(&review(2, 5), None).unwrap();
    store.put(&review(3, 5), Some(SyncMarker::Update)).unwrap();
    store.put(&review(-9, 5), Some(SyncMarker::Create)).unwrap();
    store.put(&review(4, 6), None).unwrap();

    store
      .replace_scope(ListScope::Parent(5), &[review(1, 5)])
      .unwrap();

    let ids: Vec<i64> = store
      .get_all::<Review>()
      .unwrap()
      .iter()
      .map(|s| s.record.id)
      .collect();
    assert_eq!(ids, vec![-9, 1, 3, 4]);
  }

  #[test]
  fn test_replace_scope_records_listing() {
    let store = setup();
    assert_eq!(
      store.read(|tx| tx.listed_at::<Review>(ListScope::Parent(5))).unwrap(),
      None
    );

    store
      .replace_scope::<Review>(ListScope::Parent(5), &[])
      .unwrap();

    assert!(store
      .read(|tx| tx.listed_at::<Review>(ListScope::Parent(5)))
      .unwrap()
      .is_some());
    assert!(store
      .read(|tx| tx.listed_at::<Review>(ListScope::Parent(6)))
      .unwrap()
      .is_none());
    assert!(store
      .read(|tx| tx.listed_at::<Restaurant>(ListScope::Parent(5)))
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_transaction_rolls_back_on_error() {
    let store = setup();
    let result: Result<()> = store.transaction(|tx| {
      tx.put(&restaurant(1, false), None)?;
      Err(Error::InvalidInput("boom".into()))
    });

    assert!(result.is_err());
    assert!(store.get::<Restaurant>(1).unwrap().is_none());
  }

  #[test]
  fn test_open_on_disk_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join(DATABASE_NAME);

    {
      let store = LocalStore::open(&path).unwrap();
      store.put(&review(3, 7), Some(SyncMarker::Delete)).unwrap();
    }

    let store = LocalStore::open(&path).unwrap();
    assert_eq!(store.version().unwrap(), migrations::current_version());
    let stored = store.get::<Review>(3).unwrap().unwrap();
    assert!(stored.is_tombstone());
  }

  #[test]
  fn test_min_id() {
    let store = setup();
    assert_eq!(store.read(|tx| tx.min_id::<Review>()).unwrap(), None);
    store.put(&review(4, 1), None).unwrap();
    store.put(&review(-100, 1), Some(SyncMarker::Create)).unwrap();
    assert_eq!(store.read(|tx| tx.min_id::<Review>()).unwrap(), Some(-100));
  }
}

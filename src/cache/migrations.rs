//! Store schema migrations.
//!
//! Every step is additive: it only creates partitions or indexes. The
//! version lives in `PRAGMA user_version` and steps are applied from the
//! stored version forward.

use rusqlite::Connection;

use crate::error::Result;

/// One additive schema step.
pub struct Migration {
  pub version: u32,
  pub description: &'static str,
  pub sql: &'static str,
}

/// Ordered list of schema steps. Append only.
pub const MIGRATIONS: &[Migration] = &[
  Migration {
    version: 1,
    description: "restaurants partition",
    sql: r#"
CREATE TABLE IF NOT EXISTS restaurants (
    id INTEGER PRIMARY KEY,
    data TEXT NOT NULL,
    needs_sync TEXT,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#,
  },
  Migration {
    version: 2,
    description: "reviews partition",
    sql: r#"
CREATE TABLE IF NOT EXISTS reviews (
    id INTEGER PRIMARY KEY,
    data TEXT NOT NULL,
    needs_sync TEXT,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#,
  },
  Migration {
    version: 3,
    description: "pending mutations outbox",
    sql: r#"
CREATE TABLE IF NOT EXISTS pending_mutations (
    key INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL,
    args TEXT NOT NULL,
    partition TEXT NOT NULL,
    record_id INTEGER NOT NULL,
    temp_id INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_pending_mutations_target
    ON pending_mutations(partition, record_id);
"#,
  },
  Migration {
    version: 4,
    description: "asset cache",
    sql: r#"
CREATE TABLE IF NOT EXISTS assets (
    url_hash TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    cache_version TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#,
  },
  Migration {
    version: 5,
    description: "list scopes fetched from the network",
    sql: r#"
CREATE TABLE IF NOT EXISTS listings (
    partition TEXT NOT NULL,
    scope TEXT NOT NULL,
    listed_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, scope)
);
"#,
  },
];

/// Schema version after all migrations ran
pub fn current_version() -> u32 {
  MIGRATIONS.last().map_or(0, |m| m.version)
}

pub fn stored_version(conn: &Connection) -> Result<u32> {
  let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
  Ok(version)
}

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
  let from = stored_version(conn)?;

  for migration in MIGRATIONS.iter().filter(|m| m.version > from) {
    let tx = conn.transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.pragma_update(None, "user_version", migration.version)?;
    tx.commit()?;

    tracing::info!(
      version = migration.version,
      "Migrated store: {}",
      migration.description
    );
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn table_exists(conn: &Connection, name: &str) -> bool {
    conn
      .query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
        [name],
        |row| row.get::<_, i32>(0),
      )
      .unwrap()
      != 0
  }

  #[test]
  fn test_migrations() {
    let mut conn = Connection::open_in_memory().unwrap();
    run(&mut conn).unwrap();

    assert_eq!(stored_version(&conn).unwrap(), current_version());
    for table in ["restaurants", "reviews", "pending_mutations", "assets", "listings"] {
      assert!(table_exists(&conn, table), "missing {table}");
    }
  }

  #[test]
  fn test_migrations_idempotent() {
    let mut conn = Connection::open_in_memory().unwrap();
    run(&mut conn).unwrap();
    run(&mut conn).unwrap();

    assert_eq!(stored_version(&conn).unwrap(), current_version());
  }

  #[test]
  fn test_upgrade_keeps_existing_partitions() {
    let mut conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(MIGRATIONS[0].sql).unwrap();
    conn.pragma_update(None, "user_version", 1).unwrap();
    conn
      .execute(
        "INSERT INTO restaurants (id, data) VALUES (1, '{\"id\":1}')",
        [],
      )
      .unwrap();

    run(&mut conn).unwrap();

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM restaurants", [], |row| row.get(0))
      .unwrap();
    assert_eq!(count, 1);
    assert!(table_exists(&conn, "pending_mutations"));
  }

  #[test]
  fn test_versions_are_ordered() {
    for pair in MIGRATIONS.windows(2) {
      assert!(pair[0].version < pair[1].version);
    }
  }
}

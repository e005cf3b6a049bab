//! Cache for requests outside the backend origin: the precache manifest
//! and cross-origin font assets.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use url::Url;

use super::storage::{parse_datetime, LocalStore};
use crate::error::Result;

/// Which foreign assets get stored, and under which cache version.
#[derive(Debug, Clone, Default)]
pub struct AssetPolicy {
  pub cache_version: String,
  pub precache: Vec<Url>,
  pub font_hosts: Vec<String>,
}

impl AssetPolicy {
  pub fn should_cache(&self, url: &Url) -> bool {
    if self.precache.iter().any(|entry| entry == url) {
      return true;
    }

    url.host_str().is_some_and(|host| {
      self
        .font_hosts
        .iter()
        .any(|font_host| host.eq_ignore_ascii_case(font_host))
    })
  }
}

/// Asset partition of the local store.
#[derive(Clone)]
pub struct AssetCache {
  store: LocalStore,
  policy: AssetPolicy,
}

impl AssetCache {
  pub fn new(store: LocalStore, policy: AssetPolicy) -> Self {
    Self { store, policy }
  }

  pub fn policy(&self) -> &AssetPolicy {
    &self.policy
  }

  /// Stored body and when it was cached.
  pub fn get(&self, url: &Url) -> Result<Option<(Vec<u8>, DateTime<Utc>)>> {
    let key = asset_key(url);
    let row: Option<(Vec<u8>, String)> = self.store.read(|tx| {
      Ok(
        tx.conn
          .query_row(
            "SELECT body, cached_at FROM assets WHERE url_hash = ?",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?)),
          )
          .optional()?,
      )
    })?;

    match row {
      Some((body, cached_at)) => Ok(Some((body, parse_datetime(&cached_at)?))),
      None => Ok(None),
    }
  }

  pub fn put(&self, url: &Url, body: &[u8]) -> Result<()> {
    let key = asset_key(url);
    self.store.read(|tx| {
      tx.conn.execute(
        "INSERT OR REPLACE INTO assets (url_hash, url, cache_version, body, cached_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        params![key, url.as_str(), self.policy.cache_version, body],
      )?;
      Ok(())
    })
  }

  /// Drop assets cached under any other cache version.
  pub fn prune(&self) -> Result<usize> {
    self.store.read(|tx| {
      Ok(tx.conn.execute(
        "DELETE FROM assets WHERE cache_version != ?",
        params![self.policy.cache_version],
      )?)
    })
  }

  pub fn len(&self) -> Result<usize> {
    self.store.read(|tx| {
      let count: i64 = tx
        .conn
        .query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?;
      Ok(usize::try_from(count).unwrap_or_default())
    })
  }
}

/// SHA256 of the URL for stable, fixed-length keys
fn asset_key(url: &Url) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

//! Core traits and types for the caching system.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::task::JoinHandle;

/// The REST resource kinds the store mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
  Restaurant,
  Review,
}

impl ResourceKind {
  /// Store partition (table) holding records of this kind.
  pub const fn partition(self) -> &'static str {
    match self {
      Self::Restaurant => "restaurants",
      Self::Review => "reviews",
    }
  }

  /// First path segment on the backend.
  pub const fn path_segment(self) -> &'static str {
    self.partition()
  }

  pub fn from_partition(name: &str) -> Option<Self> {
    match name {
      "restaurants" => Some(Self::Restaurant),
      "reviews" => Some(Self::Review),
      _ => None,
    }
  }
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Restaurant => f.write_str("restaurant"),
      Self::Review => f.write_str("review"),
    }
  }
}

/// Trait for entities that can be mirrored in the local store.
///
/// Records are keyed by a numeric id that is unique within their kind.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Primary key within the partition
  fn id(&self) -> i64;

  fn kind() -> ResourceKind;

  /// Owning restaurant, for kinds listed per restaurant
  fn parent_id(&self) -> Option<i64> {
    None
  }
}

/// The slice of a partition that one list request returns in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListScope {
  /// Every record of the kind
  All,
  /// Records owned by one restaurant
  Parent(i64),
}

impl ListScope {
  pub fn contains<T: Cacheable>(self, record: &T) -> bool {
    match self {
      Self::All => true,
      Self::Parent(id) => record.parent_id() == Some(id),
    }
  }

  /// Key of the scope's row in the listings table
  pub fn key(self) -> String {
    match self {
      Self::All => "all".to_string(),
      Self::Parent(id) => format!("parent:{id}"),
    }
  }
}

/// Pending, unconfirmed local mutation attached to a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMarker {
  Create,
  Update,
  /// Tombstone: hidden from reads until the backend confirms the delete
  Delete,
}

impl SyncMarker {
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "create" => Some(Self::Create),
      "update" | "true" => Some(Self::Update),
      "delete" => Some(Self::Delete),
      _ => None,
    }
  }
}

/// A record as it sits in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
  pub record: T,
  /// `None` means the record is confirmed by the backend
  pub marker: Option<SyncMarker>,
  pub cached_at: DateTime<Utc>,
}

impl<T> Stored<T> {
  pub const fn is_confirmed(&self) -> bool {
    self.marker.is_none()
  }

  pub fn is_tombstone(&self) -> bool {
    self.marker == Some(SyncMarker::Delete)
  }
}

/// Background refresh started by a stale-while-revalidate read.
#[derive(Debug)]
pub struct Revalidation(JoinHandle<bool>);

impl Revalidation {
  pub(crate) fn new(handle: JoinHandle<bool>) -> Self {
    Self(handle)
  }

  /// Wait for the refresh; true when the store was updated from the network.
  pub async fn finished(self) -> bool {
    self.0.await.unwrap_or(false)
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Still-running network refresh, when the data came from the store
  pub revalidation: Option<Revalidation>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      revalidation: None,
    }
  }

  /// Last-known-good data from the store, refreshed in the background.
  pub fn from_cache(
    data: T,
    cached_at: DateTime<Utc>,
    revalidation: Option<Revalidation>,
  ) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
      revalidation,
    }
  }

}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Last-known-good data from the store; a network refresh runs alongside
  Cache,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_marker_parse_accepts_legacy_true() {
    assert_eq!(SyncMarker::parse("true"), Some(SyncMarker::Update));
    assert_eq!(SyncMarker::parse("delete"), Some(SyncMarker::Delete));
    assert_eq!(SyncMarker::parse("false"), None);
  }

  #[test]
  fn test_partition_names() {
    assert_eq!(ResourceKind::Restaurant.partition(), "restaurants");
    assert_eq!(
      ResourceKind::from_partition("reviews"),
      Some(ResourceKind::Review)
    );
    assert_eq!(ResourceKind::from_partition("pending_mutations"), None);
  }

  #[derive(Clone, Serialize, Deserialize)]
  struct Child {
    id: i64,
    owner: i64,
  }

  impl Cacheable for Child {
    fn id(&self) -> i64 {
      self.id
    }

    fn kind() -> ResourceKind {
      ResourceKind::Review
    }

    fn parent_id(&self) -> Option<i64> {
      Some(self.owner)
    }
  }

  #[test]
  fn test_list_scope_contains() {
    let child = Child { id: 1, owner: 5 };
    assert!(ListScope::All.contains(&child));
    assert!(ListScope::Parent(5).contains(&child));
    assert!(!ListScope::Parent(6).contains(&child));
    assert_eq!(ListScope::Parent(5).key(), "parent:5");
  }
}

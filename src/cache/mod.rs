//! Local store and caching layer for offline support.
//!
//! This module provides the persistence side of the offline mirror:
//! - A versioned SQLite store with one partition per resource kind
//! - Per-record sync markers for writes the backend has not confirmed
//! - Stale-while-revalidate reads that fall back to the store offline
//! - A small asset cache for foreign-origin requests

mod assets;
mod layer;
pub mod migrations;
mod storage;
mod traits;

pub use assets::{AssetCache, AssetPolicy};
pub use layer::CacheLayer;
pub use storage::{LocalStore, StoreTx, DATABASE_NAME};
pub(crate) use storage::parse_datetime;
pub use traits::{
  CacheResult, CacheSource, Cacheable, ListScope, ResourceKind, Revalidation, Stored, SyncMarker,
};

//! Offline-first client for the restaurant reviews API.
//!
//! Reads are served stale-while-revalidate from a local SQLite mirror and
//! writes that cannot reach the backend are staged in an outbox, then
//! replayed by a sweep once connectivity returns.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use api::RestaurantClient;
pub use config::Config;
pub use error::{Error, Result, TransportError};

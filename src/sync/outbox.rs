//! Durable outbox of writes the backend has not confirmed yet.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use reqwest::Method;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::route::Router;
use crate::api::transport::ApiRequest;
use crate::api::types::{NewReview, Review};
use crate::cache::{LocalStore, ResourceKind, StoreTx};
use crate::error::{Error, Result};

/// A replayable write, stored as operation name plus arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "args", rename_all = "snake_case")]
pub enum Mutation {
  Favorite { restaurant_id: i64 },
  Unfavorite { restaurant_id: i64 },
  AddReview(NewReview),
  UpdateReview { review_id: i64, review: NewReview },
  DeleteReview { review_id: i64 },
}

impl Mutation {
  pub const fn favorite(restaurant_id: i64, is_favorite: bool) -> Self {
    if is_favorite {
      Self::Favorite { restaurant_id }
    } else {
      Self::Unfavorite { restaurant_id }
    }
  }

  pub const fn kind(&self) -> ResourceKind {
    match self {
      Self::Favorite { .. } | Self::Unfavorite { .. } => ResourceKind::Restaurant,
      Self::AddReview(_) | Self::UpdateReview { .. } | Self::DeleteReview { .. } => {
        ResourceKind::Review
      }
    }
  }

  /// Id of the record this write targets. Creates target their temporary id.
  pub const fn target(&self, temp_id: Option<i64>) -> Option<i64> {
    match self {
      Self::Favorite { restaurant_id } | Self::Unfavorite { restaurant_id } => {
        Some(*restaurant_id)
      }
      Self::AddReview(_) => temp_id,
      Self::UpdateReview { review_id, .. } | Self::DeleteReview { review_id } => Some(*review_id),
    }
  }

  /// The backend call that applies this write.
  pub fn request(&self, router: &Router) -> Result<ApiRequest> {
    Ok(match self {
      Self::Favorite { restaurant_id } => {
        ApiRequest::with_json(Method::PUT, router.favorite(*restaurant_id, true), &json!({}))?
      }
      Self::Unfavorite { restaurant_id } => {
        ApiRequest::with_json(Method::PUT, router.favorite(*restaurant_id, false), &json!({}))?
      }
      Self::AddReview(review) => ApiRequest::with_json(
        Method::POST,
        router.collection(ResourceKind::Review),
        review,
      )?,
      Self::UpdateReview { review_id, review } => ApiRequest::with_json(
        Method::PUT,
        router.item(ResourceKind::Review, *review_id),
        review,
      )?,
      Self::DeleteReview { review_id } => {
        ApiRequest::delete(router.item(ResourceKind::Review, *review_id))
      }
    })
  }

  /// Rebuild the write implied by a marked review with no outbox entry.
  pub fn for_marked_review(review: &Review, marker: crate::cache::SyncMarker) -> Self {
    use crate::cache::SyncMarker;

    match marker {
      SyncMarker::Create => Self::AddReview(review.to_new()),
      SyncMarker::Update => Self::UpdateReview {
        review_id: review.id,
        review: review.to_new(),
      },
      SyncMarker::Delete => Self::DeleteReview {
        review_id: review.id,
      },
    }
  }

  fn split(&self) -> Result<(String, String)> {
    let value = serde_json::to_value(self)?;
    let operation = value["operation"].as_str().unwrap_or_default().to_string();
    Ok((operation, value["args"].to_string()))
  }

  fn join(operation: &str, args: &str) -> Result<Self> {
    let args: Value = serde_json::from_str(args)?;
    Ok(serde_json::from_value(
      json!({ "operation": operation, "args": args }),
    )?)
  }
}

/// One outbox entry
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
  pub key: i64,
  pub mutation: Mutation,
  pub kind: ResourceKind,
  pub record_id: i64,
  /// Local id of a review created offline
  pub temp_id: Option<i64>,
  pub attempts: u32,
  pub last_error: Option<String>,
  pub created_at: DateTime<Utc>,
}

const ENTRY_COLUMNS: &str =
  "key, operation, args, partition, record_id, temp_id, attempts, last_error, created_at";

type EntryRow = (i64, String, String, String, i64, Option<i64>, u32, Option<String>, String);

fn entry_row(row: &Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
    row.get(7)?,
    row.get(8)?,
  ))
}

fn decode_entry(row: EntryRow) -> Result<PendingMutation> {
  let (key, operation, args, partition, record_id, temp_id, attempts, last_error, created_at) = row;
  let kind = ResourceKind::from_partition(&partition)
    .ok_or_else(|| Error::InvalidInput(format!("unknown outbox partition '{partition}'")))?;

  Ok(PendingMutation {
    key,
    mutation: Mutation::join(&operation, &args)?,
    kind,
    record_id,
    temp_id,
    attempts,
    last_error,
    created_at: crate::cache::parse_datetime(&created_at)?,
  })
}

impl StoreTx<'_> {
  /// Append a write to the outbox, collapsing it into any entry already
  /// pending for the same record. Returns the key of the surviving entry,
  /// or `None` when the two writes cancel out.
  ///
  /// Collapse rules:
  /// - an update after a pending create rewrites the create's arguments
  /// - a delete after a pending create drops the entry and the local record
  /// - anything else replaces the pending write in place
  pub fn enqueue(&self, mutation: &Mutation, temp_id: Option<i64>) -> Result<Option<i64>> {
    let kind = mutation.kind();
    let record_id = mutation
      .target(temp_id)
      .ok_or_else(|| Error::InvalidInput("a create needs a temporary id".into()))?;

    let Some(existing) = self.pending_for(kind, record_id)? else {
      let (operation, args) = mutation.split()?;
      self.conn.execute(
        "INSERT INTO pending_mutations (operation, args, partition, record_id, temp_id)
         VALUES (?, ?, ?, ?, ?)",
        params![operation, args, kind.partition(), record_id, temp_id],
      )?;
      return Ok(Some(self.conn.last_insert_rowid()));
    };

    let replacement = match (&existing.mutation, mutation) {
      (Mutation::AddReview(_), Mutation::UpdateReview { review, .. }) => {
        Mutation::AddReview(review.clone())
      }
      (Mutation::AddReview(_), Mutation::DeleteReview { review_id }) => {
        self.remove_entry(existing.key)?;
        self.delete::<Review>(*review_id)?;
        tracing::debug!(review_id, "Offline create and delete cancelled out");
        return Ok(None);
      }
      _ => mutation.clone(),
    };

    let (operation, args) = replacement.split()?;
    self.conn.execute(
      "UPDATE pending_mutations
       SET operation = ?, args = ?, attempts = 0, last_error = NULL
       WHERE key = ?",
      params![operation, args, existing.key],
    )?;
    tracing::debug!(key = existing.key, operation, "Collapsed into pending entry");
    Ok(Some(existing.key))
  }

  /// All entries in FIFO order.
  pub fn pending(&self) -> Result<Vec<PendingMutation>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM pending_mutations ORDER BY key");
    let mut stmt = self.conn.prepare(&sql)?;
    let rows = stmt
      .query_map([], entry_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(decode_entry).collect()
  }

  pub fn pending_for(&self, kind: ResourceKind, record_id: i64) -> Result<Option<PendingMutation>> {
    let sql = format!(
      "SELECT {ENTRY_COLUMNS} FROM pending_mutations
       WHERE partition = ? AND record_id = ?
       ORDER BY key LIMIT 1"
    );
    self
      .conn
      .query_row(&sql, params![kind.partition(), record_id], entry_row)
      .optional()?
      .map(decode_entry)
      .transpose()
  }

  pub fn remove_entry(&self, key: i64) -> Result<bool> {
    Ok(
      self
        .conn
        .execute("DELETE FROM pending_mutations WHERE key = ?", params![key])?
        > 0,
    )
  }

  /// Drop whatever is pending for a record, e.g. after a newer write went
  /// through directly.
  pub fn discard_pending(&self, kind: ResourceKind, record_id: i64) -> Result<usize> {
    Ok(self.conn.execute(
      "DELETE FROM pending_mutations WHERE partition = ? AND record_id = ?",
      params![kind.partition(), record_id],
    )?)
  }

  pub fn record_failure(&self, key: i64, error: &str) -> Result<()> {
    self.conn.execute(
      "UPDATE pending_mutations SET attempts = attempts + 1, last_error = ? WHERE key = ?",
      params![error, key],
    )?;
    Ok(())
  }
}

/// Read-side view of the outbox.
#[derive(Clone)]
pub struct Outbox {
  store: LocalStore,
}

impl Outbox {
  pub fn new(store: LocalStore) -> Self {
    Self { store }
  }

  pub fn enqueue(&self, mutation: &Mutation, temp_id: Option<i64>) -> Result<Option<i64>> {
    self.store.transaction(|tx| tx.enqueue(mutation, temp_id))
  }

  pub fn entries(&self) -> Result<Vec<PendingMutation>> {
    self.store.read(|tx| tx.pending())
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.entries()?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

/// Temporary ids for records created offline.
///
/// Ids are strictly negative and strictly decreasing, so they never collide
/// with server ids or with each other.
#[derive(Debug)]
pub struct TempIds {
  last: AtomicI64,
}

impl TempIds {
  /// Start below `floor`, typically the smallest id already in the store.
  pub fn starting_below(floor: Option<i64>) -> Self {
    Self {
      last: AtomicI64::new(floor.unwrap_or(0).min(0)),
    }
  }

  pub fn next(&self) -> i64 {
    let now = -Utc::now().timestamp_micros();
    let mut last = self.last.load(Ordering::Relaxed);
    loop {
      let candidate = now.min(last - 1);
      match self
        .last
        .compare_exchange_weak(last, candidate, Ordering::SeqCst, Ordering::Relaxed)
      {
        Ok(_) => return candidate,
        Err(actual) => last = actual,
      }
    }
  }
}

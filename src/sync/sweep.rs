//! Reconciliation sweep: replays the outbox once the backend is reachable.

use std::collections::HashSet;
use std::fmt;

use super::interceptor::{confirm, confirm_create, Interceptor};
use super::outbox::Mutation;
use crate::api::transport::Transport;
use crate::api::types::{Restaurant, Review};
use crate::cache::{ResourceKind, StoreTx, SyncMarker};
use crate::error::{Error, Result, TransportError};

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
  pub applied: usize,
  pub retried: usize,
  pub rejected: usize,
  /// Another sweep was already running; this one did nothing
  pub coalesced: bool,
}

impl SweepReport {
  pub const fn is_settled(&self) -> bool {
    self.retried == 0 && !self.coalesced
  }
}

impl fmt::Display for SweepReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.coalesced {
      return f.write_str("sweep already running");
    }
    write!(
      f,
      "{} applied, {} retried, {} rejected",
      self.applied, self.retried, self.rejected
    )
  }
}

/// What happened when one pending write was replayed.
#[derive(Debug)]
pub enum ReplayOutcome {
  /// The backend accepted it; carries the response body
  Applied(Vec<u8>),
  /// Transient failure, stays queued
  RetryLater(TransportError),
  /// The backend refused it; dropped so it stops replaying
  Rejected(Error),
}

/// One write to replay: an outbox entry, or a marked record whose entry
/// was lost.
#[derive(Debug, Clone)]
struct WorkItem {
  key: Option<i64>,
  mutation: Mutation,
  record_id: i64,
  temp_id: Option<i64>,
}

impl<T: Transport> Interceptor<T> {
  /// Replay everything pending.
  ///
  /// Each write is replayed on its own; one failure never holds back the
  /// rest. All store changes land in a single transaction at the end.
  pub async fn sweep(&self) -> Result<SweepReport> {
    let Some(cache) = &self.cache else {
      return Err(Error::SyncUnavailable("no local store to replay from".into()));
    };

    let Ok(_sweeping) = self.sweeping.try_lock() else {
      tracing::debug!("Sweep already running, coalescing");
      return Ok(SweepReport {
        coalesced: true,
        ..SweepReport::default()
      });
    };
    let _gate = self.write_gate.lock().await;

    let work = cache.store().read(collect_work)?;
    if work.is_empty() {
      tracing::debug!("Nothing to replay");
      return Ok(SweepReport::default());
    }

    tracing::info!(pending = work.len(), "Replaying pending writes");
    let mut results = Vec::with_capacity(work.len());
    for item in work {
      let outcome = self.replay(&item).await;
      results.push((item, outcome));
    }

    let report = cache.store().transaction(|tx| apply(tx, &results))?;
    tracing::info!(
      applied = report.applied,
      retried = report.retried,
      rejected = report.rejected,
      "Sweep finished"
    );
    Ok(report)
  }

  async fn replay(&self, item: &WorkItem) -> ReplayOutcome {
    let request = match item.mutation.request(&self.router) {
      Ok(request) => request,
      Err(e) => return ReplayOutcome::Rejected(e),
    };

    match self.transport.send(&request).await {
      Ok(body) => ReplayOutcome::Applied(body),
      Err(e) if e.is_not_found() && matches!(item.mutation, Mutation::DeleteReview { .. }) => {
        ReplayOutcome::Applied(Vec::new())
      }
      Err(e) if e.is_retryable() => ReplayOutcome::RetryLater(e),
      Err(e) => ReplayOutcome::Rejected(e.into()),
    }
  }
}

fn collect_work(tx: &StoreTx<'_>) -> Result<Vec<WorkItem>> {
  let entries = tx.pending()?;
  let queued: HashSet<(ResourceKind, i64)> =
    entries.iter().map(|e| (e.kind, e.record_id)).collect();

  let mut work: Vec<WorkItem> = entries
    .into_iter()
    .map(|entry| WorkItem {
      key: Some(entry.key),
      mutation: entry.mutation,
      record_id: entry.record_id,
      temp_id: entry.temp_id,
    })
    .collect();

  for stored in tx.marked::<Restaurant>()? {
    let id = stored.record.id;
    if !queued.contains(&(ResourceKind::Restaurant, id)) {
      work.push(WorkItem {
        key: None,
        mutation: Mutation::favorite(id, stored.record.is_favorite),
        record_id: id,
        temp_id: None,
      });
    }
  }

  for stored in tx.marked::<Review>()? {
    let id = stored.record.id;
    let Some(marker) = stored.marker else {
      continue;
    };
    if !queued.contains(&(ResourceKind::Review, id)) {
      tracing::debug!(id, marker = marker.as_str(), "Replaying marked review without outbox entry");
      work.push(WorkItem {
        key: None,
        mutation: Mutation::for_marked_review(&stored.record, marker),
        record_id: id,
        temp_id: (marker == SyncMarker::Create).then_some(id),
      });
    }
  }

  // Stable, so FIFO order holds within each kind
  work.sort_by_key(|item| item.mutation.kind());
  Ok(work)
}

fn apply(tx: &StoreTx<'_>, results: &[(WorkItem, ReplayOutcome)]) -> Result<SweepReport> {
  let mut report = SweepReport::default();

  for (item, outcome) in results {
    match outcome {
      ReplayOutcome::Applied(body) => {
        report.applied += 1;
        applied(tx, item, body)?;
      }
      ReplayOutcome::RetryLater(e) => {
        report.retried += 1;
        tracing::debug!(record_id = item.record_id, "Replay failed, will retry: {e}");
        if let Some(key) = item.key {
          tx.record_failure(key, &e.to_string())?;
        }
      }
      ReplayOutcome::Rejected(e) => {
        report.rejected += 1;
        tracing::warn!(record_id = item.record_id, "Backend rejected replay, dropping it: {e}");
        rejected(tx, item)?;
      }
    }
  }

  Ok(report)
}

fn applied(tx: &StoreTx<'_>, item: &WorkItem, body: &[u8]) -> Result<()> {
  match &item.mutation {
    Mutation::AddReview(_) => confirm_create(tx, item.temp_id, body)?,
    Mutation::DeleteReview { review_id } => {
      tx.delete::<Review>(*review_id)?;
    }
    mutation => confirm(tx, mutation.kind(), item.record_id, body)?,
  }

  if let Some(key) = item.key {
    tx.remove_entry(key)?;
  }
  Ok(())
}

fn rejected(tx: &StoreTx<'_>, item: &WorkItem) -> Result<()> {
  match &item.mutation {
    // The backend never accepted it, so the local copy has nothing behind it
    Mutation::AddReview(_) => {
      if let Some(temp_id) = item.temp_id {
        tx.delete::<Review>(temp_id)?;
      }
    }
    Mutation::Favorite { .. } | Mutation::Unfavorite { .. } => {
      tx.clear_marker::<Restaurant>(item.record_id)?;
    }
    Mutation::UpdateReview { .. } | Mutation::DeleteReview { .. } => {
      tx.clear_marker::<Review>(item.record_id)?;
    }
  }

  if let Some(key) = item.key {
    tx.remove_entry(key)?;
  }
  Ok(())
}

//! Every backend request goes through [`Interceptor::handle`], which decides
//! whether it is served from the local store, the network, or both.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::outbox::{Mutation, Outbox, TempIds};
use crate::api::route::{Route, Router, Target};
use crate::api::transport::{ApiRequest, Transport};
use crate::api::types::{NewReview, Restaurant, Review};
use crate::cache::{
  AssetCache, AssetPolicy, CacheLayer, CacheResult, Cacheable, ListScope, LocalStore, ResourceKind,
  StoreTx, SyncMarker,
};
use crate::error::{Error, Result, TransportError};

/// Request interceptor with offline fallback.
///
/// Without a store it runs network-only: reads go straight to the network
/// and failed writes surface as [`Error::SyncUnavailable`].
pub struct Interceptor<T> {
  pub(super) transport: Arc<T>,
  pub(super) router: Router,
  pub(super) cache: Option<CacheLayer>,
  assets: Option<AssetCache>,
  temp_ids: Arc<TempIds>,
  /// Serializes writes against each other and against the sweep
  pub(super) write_gate: Arc<tokio::sync::Mutex<()>>,
  pub(super) sweeping: Arc<tokio::sync::Mutex<()>>,
}

impl<T> Clone for Interceptor<T> {
  fn clone(&self) -> Self {
    Self {
      transport: Arc::clone(&self.transport),
      router: self.router.clone(),
      cache: self.cache.clone(),
      assets: self.assets.clone(),
      temp_ids: Arc::clone(&self.temp_ids),
      write_gate: Arc::clone(&self.write_gate),
      sweeping: Arc::clone(&self.sweeping),
    }
  }
}

impl<T: Transport> Interceptor<T> {
  pub fn new(transport: T, router: Router, store: Option<LocalStore>, policy: AssetPolicy) -> Self {
    let floor = store.as_ref().and_then(|store| {
      store.read(|tx| tx.min_id::<Review>()).unwrap_or_else(|e| {
        tracing::warn!("Failed to read review ids: {e}");
        None
      })
    });

    if store.is_none() {
      tracing::warn!("No local store, running network-only");
    }

    Self {
      transport: Arc::new(transport),
      router,
      assets: store.clone().map(|store| AssetCache::new(store, policy)),
      cache: store.map(CacheLayer::new),
      temp_ids: Arc::new(TempIds::starting_below(floor)),
      write_gate: Arc::new(tokio::sync::Mutex::new(())),
      sweeping: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  pub fn router(&self) -> &Router {
    &self.router
  }

  pub fn store(&self) -> Option<&LocalStore> {
    self.cache.as_ref().map(CacheLayer::store)
  }

  pub fn outbox(&self) -> Option<Outbox> {
    self.store().cloned().map(Outbox::new)
  }

  /// Whether the backend answers at all. Error statuses still count as
  /// reachable.
  pub async fn is_reachable(&self) -> bool {
    let request = ApiRequest::get(self.router.collection(ResourceKind::Restaurant));
    !matches!(
      self.transport.send(&request).await,
      Err(TransportError::Unreachable(_))
    )
  }

  /// Serve one request.
  pub async fn handle(&self, request: ApiRequest) -> Result<CacheResult<Vec<u8>>> {
    match self.router.classify(&request.url) {
      Target::Foreign => self.fetch_asset(&request).await,
      Target::Api => self.passthrough(&request).await,
      Target::Resource(route) => match request.method {
        Method::GET => self.read(&request, &route).await,
        Method::POST if route.kind == ResourceKind::Review && route.id.is_none() => {
          self.create_review(&request).await
        }
        Method::PUT => self.update(&request, &route).await,
        Method::DELETE if route.kind == ResourceKind::Review => match route.id {
          Some(id) => self.delete_review(&request, id).await,
          None => self.passthrough(&request).await,
        },
        _ => self.passthrough(&request).await,
      },
    }
  }

  async fn passthrough(&self, request: &ApiRequest) -> Result<CacheResult<Vec<u8>>> {
    Ok(CacheResult::from_network(self.transport.send(request).await?))
  }

  /// Network fetch detached from `self`, for background revalidation.
  fn fetch<D>(&self, request: &ApiRequest) -> impl Future<Output = Result<D>> + Send + 'static
  where
    D: DeserializeOwned + Send + 'static,
  {
    let transport = Arc::clone(&self.transport);
    let request = request.clone();
    async move {
      let body = transport.send(&request).await?;
      Ok(serde_json::from_slice(&body)?)
    }
  }

  async fn read(&self, request: &ApiRequest, route: &Route) -> Result<CacheResult<Vec<u8>>> {
    let Some(cache) = &self.cache else {
      return self.passthrough(request).await;
    };

    match (route.kind, route.id) {
      (ResourceKind::Restaurant, Some(id)) => encode(
        cache
          .fetch_one::<Restaurant, _, _>(id, || self.fetch(request))
          .await?,
      ),
      (ResourceKind::Restaurant, None) => encode(
        cache
          .fetch_list::<Restaurant, _, _>(ListScope::All, || self.fetch(request))
          .await?,
      ),
      (ResourceKind::Review, Some(id)) if id < 0 => {
        // Local-only until the create is replayed
        let stored = cache
          .store()
          .get::<Review>(id)?
          .filter(|stored| !stored.is_tombstone())
          .ok_or_else(|| Error::NotFound(format!("review {id}")))?;
        encode(CacheResult::from_cache(stored.record, stored.cached_at, None))
      }
      (ResourceKind::Review, Some(id)) => encode(
        cache
          .fetch_one::<Review, _, _>(id, || self.fetch(request))
          .await?,
      ),
      (ResourceKind::Review, None) => {
        let scope = route.restaurant_id.map_or(ListScope::All, ListScope::Parent);
        encode(
          cache
            .fetch_list::<Review, _, _>(scope, || self.fetch(request))
            .await?,
        )
      }
    }
  }

  async fn create_review(&self, request: &ApiRequest) -> Result<CacheResult<Vec<u8>>> {
    let new = review_body(request)?;
    let _gate = self.write_gate.lock().await;

    let temp_id = self.temp_ids.next();
    let staged = self.stage(|tx| {
      tx.put(&Review::staged(temp_id, &new, Utc::now()), Some(SyncMarker::Create))?;
      tx.enqueue(&Mutation::AddReview(new.clone()), Some(temp_id))
    });

    match self.transport.send(request).await {
      Ok(body) => {
        self.settle(|tx| {
          if let Some(Some(key)) = staged {
            tx.remove_entry(key)?;
          }
          confirm_create(tx, staged.map(|_| temp_id), &body)
        });
        Ok(CacheResult::from_network(body))
      }
      Err(e) => Err(self.write_failed(
        e,
        ResourceKind::Review,
        staged.map(|_| temp_id),
        |tx| {
          tx.delete::<Review>(temp_id)?;
          tx.discard_pending(ResourceKind::Review, temp_id)?;
          Ok(())
        },
      )),
    }
  }

  async fn update(&self, request: &ApiRequest, route: &Route) -> Result<CacheResult<Vec<u8>>> {
    let (mutation, id) = match (route.kind, route.id, route.is_favorite) {
      (ResourceKind::Restaurant, Some(id), Some(is_favorite)) => {
        (Mutation::favorite(id, is_favorite), id)
      }
      (ResourceKind::Review, Some(id), _) => (
        Mutation::UpdateReview {
          review_id: id,
          review: review_body(request)?,
        },
        id,
      ),
      _ => return self.passthrough(request).await,
    };
    let kind = mutation.kind();
    let _gate = self.write_gate.lock().await;

    if kind == ResourceKind::Review && self.is_pending_deletion(id) {
      return Err(Error::NotFound(format!("review {id} is pending deletion")));
    }

    if kind == ResourceKind::Review && id < 0 && self.cache.is_some() {
      // Folds into the pending create
      return match self.stage(|tx| stage_optimistic(tx, &mutation)) {
        Some(_) => Err(Error::Queued { kind, id }),
        None => Err(Error::SyncUnavailable(format!("could not stage {kind} {id}"))),
      };
    }

    match self.transport.send(request).await {
      Ok(body) => {
        self.settle(|tx| {
          tx.discard_pending(kind, id)?;
          confirm(tx, kind, id, &body)
        });
        Ok(CacheResult::from_network(body))
      }
      Err(e) if !e.is_retryable() => Err(e.into()),
      Err(e) => {
        let staged = self.stage(|tx| stage_optimistic(tx, &mutation));
        Err(self.write_failed(e, kind, staged.map(|_| id), |_| Ok(())))
      }
    }
  }

  async fn delete_review(&self, request: &ApiRequest, id: i64) -> Result<CacheResult<Vec<u8>>> {
    let _gate = self.write_gate.lock().await;

    if id < 0 && self.cache.is_some() {
      // Never reached the backend, so there is nothing to delete remotely
      return match self.stage(|tx| {
        tx.delete::<Review>(id)?;
        tx.discard_pending(ResourceKind::Review, id)
      }) {
        Some(_) => Ok(CacheResult::from_cache(b"{}".to_vec(), Utc::now(), None)),
        None => Err(Error::SyncUnavailable(format!("could not delete review {id}"))),
      };
    }

    let staged = self.stage(|tx| {
      let previous = tx.get::<Review>(id)?;
      if let Some(stored) = &previous {
        tx.put(&stored.record, Some(SyncMarker::Delete))?;
      }
      let key = tx.enqueue(&Mutation::DeleteReview { review_id: id }, None)?;
      Ok((previous, key))
    });
    let staged_id = staged.as_ref().map(|_| id);

    let body = match self.transport.send(request).await {
      Ok(body) => body,
      Err(e) if e.is_not_found() => b"{}".to_vec(),
      Err(e) => {
        return Err(self.write_failed(e, ResourceKind::Review, staged_id, move |tx| {
          let Some((previous, key)) = staged else {
            return Ok(());
          };
          if let Some(key) = key {
            tx.remove_entry(key)?;
          }
          // A restored Update marker is replayed from the record itself
          if let Some(previous) = previous {
            tx.put(&previous.record, previous.marker)?;
          }
          Ok(())
        }))
      }
    };

    self.settle(|tx| {
      tx.delete::<Review>(id)?;
      tx.discard_pending(ResourceKind::Review, id)?;
      Ok(())
    });
    Ok(CacheResult::from_network(body))
  }

  /// Cache-or-network for requests outside the backend origin.
  async fn fetch_asset(&self, request: &ApiRequest) -> Result<CacheResult<Vec<u8>>> {
    let Some(assets) = self.assets.as_ref().filter(|_| request.method == Method::GET) else {
      return self.passthrough(request).await;
    };

    match assets.get(&request.url) {
      Ok(Some((body, cached_at))) => return Ok(CacheResult::from_cache(body, cached_at, None)),
      Ok(None) => {}
      Err(e) => tracing::warn!(url = %request.url, "Asset lookup failed: {e}"),
    }

    let body = self.transport.send(request).await?;
    if assets.policy().should_cache(&request.url) {
      if let Err(e) = assets.put(&request.url, &body) {
        tracing::warn!(url = %request.url, "Failed to cache asset: {e}");
      }
    }
    Ok(CacheResult::from_network(body))
  }

  /// Fetch and store the precache manifest, dropping assets from older
  /// cache versions first. Returns how many assets were stored.
  pub async fn precache(&self) -> Result<usize> {
    let Some(assets) = &self.assets else {
      return Err(Error::SyncUnavailable("no local store to precache into".into()));
    };

    let pruned = self.prune_assets()?;
    let mut stored = 0;
    for url in &assets.policy().precache {
      match self.transport.send(&ApiRequest::get(url.clone())).await {
        Ok(body) => {
          assets.put(url, &body)?;
          stored += 1;
        }
        Err(e) => tracing::warn!(%url, "Failed to precache asset: {e}"),
      }
    }

    tracing::info!(stored, pruned, version = %assets.policy().cache_version, "Precached assets");
    Ok(stored)
  }

  /// Drop assets cached under any version but the configured one.
  pub fn prune_assets(&self) -> Result<usize> {
    match &self.assets {
      Some(assets) => assets.prune(),
      None => Ok(0),
    }
  }

  fn is_pending_deletion(&self, id: i64) -> bool {
    self.store().is_some_and(|store| {
      matches!(store.get::<Review>(id), Ok(Some(stored)) if stored.is_tombstone())
    })
  }

  /// Run a staging step; `None` when there is no store or it failed.
  fn stage<R>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<R>) -> Option<R> {
    let cache = self.cache.as_ref()?;
    cache
      .store()
      .transaction(f)
      .map_err(|e| tracing::warn!("Failed to stage write: {e}"))
      .ok()
  }

  /// Apply a confirmed write to the store. The backend already has it, so a
  /// store failure only costs freshness.
  fn settle(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<()>) {
    if let Some(cache) = &self.cache {
      if let Err(e) = cache.store().transaction(f) {
        tracing::warn!("Failed to record confirmed write: {e}");
      }
    }
  }

  /// Map a failed write to what the caller sees. `staged` carries the
  /// local id when the write is sitting in the outbox.
  fn write_failed(
    &self,
    error: TransportError,
    kind: ResourceKind,
    staged: Option<i64>,
    undo: impl FnOnce(&StoreTx<'_>) -> Result<()>,
  ) -> Error {
    if !error.is_retryable() {
      if staged.is_some() {
        self.settle(undo);
      }
      return error.into();
    }

    match staged {
      Some(id) => {
        tracing::info!(%kind, id, "Backend unreachable, write queued: {error}");
        Error::Queued { kind, id }
      }
      None => Error::SyncUnavailable(format!("{kind} write failed and could not be staged: {error}")),
    }
  }
}

/// Apply a write to the local record and queue it for replay.
fn stage_optimistic(tx: &StoreTx<'_>, mutation: &Mutation) -> Result<Option<i64>> {
  let now = Utc::now();
  match mutation {
    Mutation::Favorite { restaurant_id } | Mutation::Unfavorite { restaurant_id } => {
      if let Some(stored) = tx.get::<Restaurant>(*restaurant_id)? {
        let mut record = stored.record;
        record.is_favorite = matches!(mutation, Mutation::Favorite { .. });
        record.updated_at = Some(now);
        tx.put(&record, Some(SyncMarker::Update))?;
      }
    }
    Mutation::UpdateReview { review_id, review } => {
      if let Some(stored) = tx.get::<Review>(*review_id)? {
        if stored.is_tombstone() {
          return Err(Error::NotFound(format!("review {review_id} is pending deletion")));
        }
        let mut record = stored.record;
        record.name.clone_from(&review.name);
        record.rating = review.rating;
        record.comments.clone_from(&review.comments);
        record.updated_at = Some(now);
        let marker = match stored.marker {
          Some(SyncMarker::Create) => SyncMarker::Create,
          _ => SyncMarker::Update,
        };
        tx.put(&record, Some(marker))?;
      }
    }
    Mutation::AddReview(_) | Mutation::DeleteReview { .. } => {}
  }
  tx.enqueue(mutation, None)
}

/// Store the backend's copy of a confirmed write, or just clear the marker
/// when the response does not carry a usable record.
pub(super) fn confirm(tx: &StoreTx<'_>, kind: ResourceKind, id: i64, body: &[u8]) -> Result<()> {
  match kind {
    ResourceKind::Restaurant => confirm_record::<Restaurant>(tx, id, body),
    ResourceKind::Review => confirm_record::<Review>(tx, id, body),
  }
}

fn confirm_record<R: Cacheable>(tx: &StoreTx<'_>, id: i64, body: &[u8]) -> Result<()> {
  match decode_record::<R>(body) {
    Some(record) if record.id() == id => tx.put(&record, None),
    _ => tx.clear_marker::<R>(id),
  }
}

/// Swap a staged create for the backend's record. A response without a
/// usable record leaves the temporary one in place, confirmed.
pub(super) fn confirm_create(tx: &StoreTx<'_>, temp_id: Option<i64>, body: &[u8]) -> Result<()> {
  let created = decode_record::<Review>(body).filter(|review| review.id > 0);
  match (created, temp_id) {
    (Some(review), temp_id) => {
      if let Some(temp_id) = temp_id {
        tx.delete::<Review>(temp_id)?;
      }
      tx.put(&review, None)
    }
    (None, Some(temp_id)) => {
      tracing::warn!(temp_id, "Create confirmed without a review in the response");
      tx.clear_marker::<Review>(temp_id)
    }
    (None, None) => Ok(()),
  }
}

fn decode_record<R: DeserializeOwned>(body: &[u8]) -> Option<R> {
  serde_json::from_slice(body)
    .map_err(|e| tracing::debug!("Response body is not a record: {e}"))
    .ok()
}

fn review_body(request: &ApiRequest) -> Result<NewReview> {
  let body = request
    .body
    .clone()
    .ok_or_else(|| Error::InvalidInput("review write without a body".into()))?;
  let review: NewReview = serde_json::from_value(body)?;
  review.validate()?;
  Ok(review)
}

fn encode<D: Serialize>(result: CacheResult<D>) -> Result<CacheResult<Vec<u8>>> {
  Ok(CacheResult {
    data: serde_json::to_vec(&result.data)?,
    source: result.source,
    cached_at: result.cached_at,
    revalidation: result.revalidation,
  })
}

/// Decode an intercepted response body.
pub fn decode<D: DeserializeOwned>(result: CacheResult<Vec<u8>>) -> Result<CacheResult<D>> {
  Ok(CacheResult {
    data: serde_json::from_slice(&result.data)?,
    source: result.source,
    cached_at: result.cached_at,
    revalidation: result.revalidation,
  })
}

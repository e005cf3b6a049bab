//! Cache layer that orchestrates stale-while-revalidate reads.

use std::collections::HashSet;
use std::future::Future;

use super::storage::LocalStore;
use super::traits::{CacheResult, Cacheable, ListScope, Revalidation, Stored};
use crate::error::{Error, Result};

/// Cache layer that manages caching logic and network fetching.
///
/// Reads answer from the store when it has something and refresh the
/// store from the network in the background. Store failures never fail a
/// read; they only cost the offline fallback.
#[derive(Clone)]
pub struct CacheLayer {
  store: LocalStore,
}

impl CacheLayer {
  /// Create a new cache layer with the given storage backend.
  pub fn new(store: LocalStore) -> Self {
    Self { store }
  }

  pub fn store(&self) -> &LocalStore {
    &self.store
  }

  /// Fetch a single entity.
  ///
  /// 1. Store hit - return it now, refresh from network in the background
  /// 2. Tombstoned - report not found without touching the network
  /// 3. Miss - wait for the network and store the result
  pub async fn fetch_one<T, F, Fut>(&self, id: i64, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let candidate = self.store.get::<T>(id).unwrap_or_else(|e| {
      tracing::warn!(kind = %T::kind(), id, "Store read failed, going to network: {e}");
      None
    });

    match candidate {
      Some(stored) if stored.is_tombstone() => {
        Err(Error::NotFound(format!("{} {id} is pending deletion", T::kind())))
      }
      Some(stored) => {
        let fetch = fetcher();
        let revalidation =
          self.revalidate(async move { fetch.await.map(|record| vec![record]) }, None);
        Ok(CacheResult::from_cache(
          stored.record,
          stored.cached_at,
          Some(revalidation),
        ))
      }
      None => {
        let data = fetcher().await?;
        self.store_fresh(std::slice::from_ref(&data), None);
        Ok(CacheResult::from_network(data))
      }
    }
  }

  /// Fetch every entity in `scope`.
  ///
  /// The scope counts as cached once it holds any record, tombstones
  /// included, or once a network listing of it was stored, even an empty
  /// one. Tombstoned records never appear in the result, whether it comes
  /// from the store or from the network. A network result replaces the
  /// scope in the store.
  pub async fn fetch_list<T, F, Fut>(
    &self,
    scope: ListScope,
    fetcher: F,
  ) -> Result<CacheResult<Vec<T>>>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    let (stored, listed_at) = self
      .store
      .read(|tx| Ok((tx.get_all::<T>()?, tx.listed_at::<T>(scope)?)))
      .unwrap_or_else(|e| {
        tracing::warn!(kind = %T::kind(), "Store read failed, going to network: {e}");
        (Vec::new(), None)
      });

    let (tombstones, visible): (Vec<Stored<T>>, Vec<Stored<T>>) = stored
      .into_iter()
      .filter(|s| scope.contains(&s.record))
      .partition(Stored::is_tombstone);
    let hidden: HashSet<i64> = tombstones.iter().map(|s| s.record.id()).collect();

    let cached_at = visible
      .iter()
      .chain(&tombstones)
      .map(|s| s.cached_at)
      .min()
      .or(listed_at);

    if let Some(cached_at) = cached_at {
      let revalidation = self.revalidate(fetcher(), Some(scope));
      let records = visible.into_iter().map(|s| s.record).collect();
      return Ok(CacheResult::from_cache(
        records,
        cached_at,
        Some(revalidation),
      ));
    }

    let mut data = fetcher().await?;
    self.store_fresh(&data, Some(scope));
    data.retain(|record| scope.contains(record) && !hidden.contains(&record.id()));
    Ok(CacheResult::from_network(data))
  }

  /// Spawn the network refresh for a store hit. With a scope the payload
  /// replaces it; without one it is only upserted.
  fn revalidate<T, Fut>(&self, fetch: Fut, scope: Option<ListScope>) -> Revalidation
  where
    T: Cacheable,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    let store = self.store.clone();
    Revalidation::new(tokio::spawn(async move {
      match fetch.await {
        Ok(records) => match write_fresh(&store, scope, &records) {
          Ok(written) => {
            tracing::debug!(kind = %T::kind(), written, "Revalidated from network");
            true
          }
          Err(e) => {
            tracing::warn!(kind = %T::kind(), "Failed to store refreshed records: {e}");
            false
          }
        },
        Err(e) => {
          tracing::debug!(kind = %T::kind(), "Revalidation failed, keeping cached data: {e}");
          false
        }
      }
    }))
  }

  fn store_fresh<T: Cacheable>(&self, records: &[T], scope: Option<ListScope>) {
    if let Err(e) = write_fresh(&self.store, scope, records) {
      tracing::warn!(kind = %T::kind(), "Failed to cache network response: {e}");
    }
  }
}

fn write_fresh<T: Cacheable>(
  store: &LocalStore,
  scope: Option<ListScope>,
  records: &[T],
) -> Result<usize> {
  match scope {
    Some(scope) => store.replace_scope(scope, records),
    None => store.refresh(records),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::{Restaurant, Review};
  use crate::cache::{CacheSource, SyncMarker};
  use crate::error::TransportError;
  use crate::testing::{restaurant, review};

  fn setup() -> CacheLayer {
    CacheLayer::new(LocalStore::open_in_memory().unwrap())
  }

  fn offline<T>() -> impl Future<Output = Result<T>> + Send + 'static {
    async { Err(TransportError::Unreachable("offline".into()).into()) }
  }

  #[tokio::test]
  async fn test_fetch_one_serves_store_and_revalidates() {
    let cache = setup();
    cache.store().put(&restaurant(5, false), None).unwrap();

    let result = cache
      .fetch_one::<Restaurant, _, _>(5, || async { Ok(restaurant(5, true)) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert!(!result.data.is_favorite);
    assert!(result.revalidation.unwrap().finished().await);
    let stored = cache.store().get::<Restaurant>(5).unwrap().unwrap();
    assert!(stored.record.is_favorite);
  }

  #[tokio::test]
  async fn test_fetch_one_keeps_store_when_offline() {
    let cache = setup();
    cache.store().put(&restaurant(5, true), None).unwrap();

    let result = cache
      .fetch_one::<Restaurant, _, _>(5, offline::<Restaurant>)
      .await
      .unwrap();

    assert!(result.data.is_favorite);
    assert!(!result.revalidation.unwrap().finished().await);
    assert!(cache.store().get::<Restaurant>(5).unwrap().unwrap().record.is_favorite);
  }

  #[tokio::test]
  async fn test_fetch_one_miss_uses_network() {
    let cache = setup();

    let result = cache
      .fetch_one::<Restaurant, _, _>(8, || async { Ok(restaurant(8, false)) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert!(result.revalidation.is_none());
    assert!(cache.store().get::<Restaurant>(8).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_fetch_one_miss_offline_propagates() {
    let cache = setup();
    let err = cache
      .fetch_one::<Restaurant, _, _>(8, offline::<Restaurant>)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Network(_)));
  }

  #[tokio::test]
  async fn test_fetch_list_hides_tombstones() {
    let cache = setup();
    cache.store().put(&review(1, 5), None).unwrap();
    cache
      .store()
      .put(&review(2, 5), Some(SyncMarker::Delete))
      .unwrap();
    cache.store().put(&review(3, 6), None).unwrap();

    let result = cache
      .fetch_list::<Review, _, _>(ListScope::Parent(5), offline::<Vec<Review>>)
      .await
      .unwrap();

    let ids: Vec<i64> = result.data.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1]);
  }

  #[tokio::test]
  async fn test_fetch_list_network_result_hides_tombstones() {
    let cache = setup();
    cache
      .store()
      .put(&review(2, 5), Some(SyncMarker::Delete))
      .unwrap();

    let result = cache
      .fetch_list::<Review, _, _>(ListScope::Parent(5), || async {
        Ok(vec![review(2, 5), review(4, 5)])
      })
      .await
      .unwrap();

    let ids: Vec<i64> = result.data.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![4]);
    // The tombstone is still physically present until the sweep confirms it
    assert!(cache.store().get::<Review>(2).unwrap().unwrap().is_tombstone());
  }

  #[tokio::test]
  async fn test_fetch_list_revalidation_drops_records_gone_from_backend() {
    let cache = setup();
    cache.store().put(&review(1, 5), None).unwrap();
    cache.store().put(&review(2, 5), None).unwrap();
    cache
      .store()
      .put(&review(3, 5), Some(SyncMarker::Update))
      .unwrap();
    cache.store().put(&review(4, 6), None).unwrap();

    let result = cache
      .fetch_list::<Review, _, _>(ListScope::Parent(5), || async {
        Ok(vec![review(1, 5)])
      })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Cache);
    assert!(result.revalidation.unwrap().finished().await);

    let ids: Vec<i64> = cache
      .store()
      .get_all::<Review>()
      .unwrap()
      .iter()
      .map(|s| s.record.id)
      .collect();
    // 3 is still pending, 4 belongs to another restaurant
    assert_eq!(ids, vec![1, 3, 4]);
  }

  #[tokio::test]
  async fn test_fetch_list_empty_listing_is_served_offline() {
    let cache = setup();

    let first = cache
      .fetch_list::<Review, _, _>(ListScope::Parent(5), || async { Ok(Vec::new()) })
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = cache
      .fetch_list::<Review, _, _>(ListScope::Parent(5), offline::<Vec<Review>>)
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert!(second.data.is_empty());
    assert!(!second.revalidation.unwrap().finished().await);

    // A scope never listed is still a miss
    let err = cache
      .fetch_list::<Review, _, _>(ListScope::Parent(6), offline::<Vec<Review>>)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Network(_)));
  }

  #[tokio::test]
  async fn test_fetch_list_only_tombstones_counts_as_cached() {
    let cache = setup();
    cache
      .store()
      .put(&review(2, 5), Some(SyncMarker::Delete))
      .unwrap();

    let result = cache
      .fetch_list::<Review, _, _>(ListScope::Parent(5), offline::<Vec<Review>>)
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert!(result.data.is_empty());
  }
}

//! Restaurant client: the data access API callers use.
//!
//! Every call is a plain backend request routed through the [`Interceptor`],
//! so callers get offline fallback and write staging without knowing about
//! either.

use std::cmp::Reverse;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::route::Router;
use super::transport::{ApiRequest, HttpTransport, Transport};
use super::types::{ImageUrls, NewReview, Restaurant, RestaurantDetails, Review};
use crate::cache::{CacheResult, CacheSource, LocalStore, ResourceKind, Revalidation};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::sync::{decode, Interceptor, PendingMutation, SweepReport};

/// Filter value that matches every cuisine or neighborhood.
pub const ALL: &str = "all";

/// Restaurant reviews client with offline support.
pub struct RestaurantClient<T = HttpTransport> {
  interceptor: Interceptor<T>,
}

impl<T> Clone for RestaurantClient<T> {
  fn clone(&self) -> Self {
    Self {
      interceptor: self.interceptor.clone(),
    }
  }
}

impl RestaurantClient<HttpTransport> {
  /// Create a client from configuration.
  ///
  /// A store that fails to open is logged and the client runs
  /// network-only.
  pub fn new(config: &Config) -> Result<Self> {
    let transport = HttpTransport::new(config.request_timeout())?;

    let store = match config.store_path() {
      Some(path) => LocalStore::open(&path)
        .map_err(|e| tracing::warn!(path = %path.display(), "Failed to open local store: {e}"))
        .ok(),
      None => {
        tracing::warn!("No data directory for the local store");
        None
      }
    };

    Ok(Self::with_transport(
      transport,
      Router::new(config.api_url.clone()),
      store,
      config.assets.policy(),
    ))
  }
}

impl<T: Transport> RestaurantClient<T> {
  pub fn with_transport(
    transport: T,
    router: Router,
    store: Option<LocalStore>,
    policy: crate::cache::AssetPolicy,
  ) -> Self {
    Self {
      interceptor: Interceptor::new(transport, router, store, policy),
    }
  }

  pub fn interceptor(&self) -> &Interceptor<T> {
    &self.interceptor
  }

  fn router(&self) -> &Router {
    self.interceptor.router()
  }

  async fn get<D: DeserializeOwned>(&self, url: url::Url) -> Result<CacheResult<D>> {
    decode(self.interceptor.handle(ApiRequest::get(url)).await?)
  }

  async fn write<D: DeserializeOwned>(&self, request: ApiRequest) -> Result<D> {
    Ok(decode(self.interceptor.handle(request).await?)?.data)
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  pub async fn fetch_all(&self) -> Result<CacheResult<Vec<Restaurant>>> {
    self
      .get(self.router().collection(ResourceKind::Restaurant))
      .await
  }

  /// A restaurant together with its reviews, newest first.
  pub async fn fetch_by_id(&self, id: i64) -> Result<CacheResult<RestaurantDetails>> {
    let (restaurant, reviews) = futures::try_join!(
      self.get::<Restaurant>(self.router().item(ResourceKind::Restaurant, id)),
      self.fetch_reviews(id),
    )?;

    let source = match (restaurant.source, reviews.source) {
      (CacheSource::Network, CacheSource::Network) => CacheSource::Network,
      _ => CacheSource::Cache,
    };
    let cached_at = match (restaurant.cached_at, reviews.cached_at) {
      (Some(a), Some(b)) => Some(a.min(b)),
      (a, b) => a.or(b),
    };

    Ok(CacheResult {
      data: RestaurantDetails {
        restaurant: restaurant.data,
        reviews: reviews.data,
      },
      source,
      cached_at,
      revalidation: join_revalidations(restaurant.revalidation, reviews.revalidation),
    })
  }

  /// Reviews of one restaurant, newest first.
  pub async fn fetch_reviews(&self, restaurant_id: i64) -> Result<CacheResult<Vec<Review>>> {
    let mut result = self
      .get::<Vec<Review>>(self.router().reviews_for(restaurant_id))
      .await?;
    result
      .data
      .sort_by_key(|review| Reverse(review.updated_at.or(review.created_at)));
    Ok(result)
  }

  pub async fn fetch_review(&self, id: i64) -> Result<CacheResult<Review>> {
    self.get(self.router().item(ResourceKind::Review, id)).await
  }

  pub async fn fetch_by_cuisine(&self, cuisine: &str) -> Result<CacheResult<Vec<Restaurant>>> {
    self.fetch_by_cuisine_and_neighborhood(cuisine, ALL).await
  }

  pub async fn fetch_by_neighborhood(
    &self,
    neighborhood: &str,
  ) -> Result<CacheResult<Vec<Restaurant>>> {
    self.fetch_by_cuisine_and_neighborhood(ALL, neighborhood).await
  }

  /// Restaurants matching both filters; [`ALL`] matches everything.
  pub async fn fetch_by_cuisine_and_neighborhood(
    &self,
    cuisine: &str,
    neighborhood: &str,
  ) -> Result<CacheResult<Vec<Restaurant>>> {
    let mut result = self.fetch_all().await?;
    result.data.retain(|r| {
      (cuisine == ALL || r.cuisine_type == cuisine)
        && (neighborhood == ALL || r.neighborhood == neighborhood)
    });
    Ok(result)
  }

  /// Distinct neighborhoods, in the order they first appear.
  pub async fn fetch_neighborhoods(&self) -> Result<Vec<String>> {
    let restaurants = self.fetch_all().await?.data;
    Ok(distinct(restaurants.into_iter().map(|r| r.neighborhood)))
  }

  /// Distinct cuisines, in the order they first appear.
  pub async fn fetch_cuisines(&self) -> Result<Vec<String>> {
    let restaurants = self.fetch_all().await?.data;
    Ok(distinct(restaurants.into_iter().map(|r| r.cuisine_type)))
  }

  // ==========================================================================
  // Writes
  //
  // A write that could not reach the backend but was staged returns
  // `Error::Queued`; the local store already shows its effect.
  // ==========================================================================

  pub async fn favorite(&self, id: i64) -> Result<Restaurant> {
    self.set_favorite(id, true).await
  }

  pub async fn unfavorite(&self, id: i64) -> Result<Restaurant> {
    self.set_favorite(id, false).await
  }

  async fn set_favorite(&self, id: i64, is_favorite: bool) -> Result<Restaurant> {
    let request =
      ApiRequest::with_json(Method::PUT, self.router().favorite(id, is_favorite), &json!({}))?;
    self.write(request).await
  }

  pub async fn add_review(
    &self,
    restaurant_id: i64,
    name: &str,
    rating: u8,
    comments: &str,
  ) -> Result<Review> {
    let review = NewReview::new(restaurant_id, name, rating, comments)?;
    let request = ApiRequest::with_json(
      Method::POST,
      self.router().collection(ResourceKind::Review),
      &review,
    )?;
    self.write(request).await
  }

  pub async fn update_review(&self, review: &Review) -> Result<Review> {
    let body = review.to_new();
    body.validate()?;
    let request = ApiRequest::with_json(
      Method::PUT,
      self.router().item(ResourceKind::Review, review.id),
      &body,
    )?;
    self.write(request).await
  }

  pub async fn delete_review(&self, id: i64) -> Result<()> {
    let request = ApiRequest::delete(self.router().item(ResourceKind::Review, id));
    self.interceptor.handle(request).await?;
    Ok(())
  }

  // ==========================================================================
  // Sync
  // ==========================================================================

  /// Replay pending writes now.
  pub async fn sync(&self) -> Result<SweepReport> {
    self.interceptor.sweep().await
  }

  /// Writes waiting for the backend, oldest first.
  pub fn pending(&self) -> Result<Vec<PendingMutation>> {
    self
      .interceptor
      .outbox()
      .ok_or_else(|| Error::SyncUnavailable("no local store".into()))?
      .entries()
  }
}

/// Relative page URL for a restaurant.
pub fn url_for_restaurant(restaurant: &Restaurant) -> String {
  format!("restaurant.html?id={}", restaurant.id)
}

/// Relative image URLs for a restaurant; restaurants without a photograph
/// get the placeholder.
pub fn image_urls_for_restaurant(restaurant: &Restaurant) -> ImageUrls {
  let photograph = restaurant.photograph.as_deref().unwrap_or("placeholder");
  ImageUrls {
    x1: format!("img/{photograph}_1x.jpg"),
    x2: format!("img/{photograph}_2x.jpg"),
  }
}

fn distinct(values: impl Iterator<Item = String>) -> Vec<String> {
  let mut seen = Vec::new();
  for value in values {
    if !seen.contains(&value) {
      seen.push(value);
    }
  }
  seen
}

fn join_revalidations(a: Option<Revalidation>, b: Option<Revalidation>) -> Option<Revalidation> {
  match (a, b) {
    (Some(a), Some(b)) => Some(Revalidation::new(tokio::spawn(async move {
      let (a, b) = tokio::join!(a.finished(), b.finished());
      a && b
    }))),
    (a, b) => a.or(b),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{AssetPolicy, SyncMarker};
  use crate::testing::{restaurant, review, router, FakeTransport};
  use chrono::{TimeZone, Utc};
  use pretty_assertions::assert_eq;

  fn setup(transport: &FakeTransport) -> (RestaurantClient<FakeTransport>, LocalStore) {
    let store = LocalStore::open_in_memory().unwrap();
    let client = RestaurantClient::with_transport(
      transport.clone(),
      router(),
      Some(store.clone()),
      AssetPolicy::default(),
    );
    (client, store)
  }

  fn listed(id: i64, cuisine: &str, neighborhood: &str) -> Restaurant {
    let mut r = restaurant(id, false);
    r.cuisine_type = cuisine.to_string();
    r.neighborhood = neighborhood.to_string();
    r
  }

  fn seed_listing(transport: &FakeTransport) {
    transport.respond(
      "GET /restaurants",
      serde_json::json!([
        listed(1, "Pizza", "Manhattan"),
        listed(2, "Asian", "Queens"),
        listed(3, "Pizza", "Brooklyn"),
        listed(4, "Mexican", "Manhattan"),
      ]),
    );
  }

  #[tokio::test]
  async fn test_filters_and_distinct_lists() {
    let transport = FakeTransport::new();
    seed_listing(&transport);
    let (client, _) = setup(&transport);

    let ids = |rs: Vec<Restaurant>| rs.into_iter().map(|r| r.id).collect::<Vec<_>>();
    assert_eq!(ids(client.fetch_by_cuisine("Pizza").await.unwrap().data), vec![1, 3]);
    assert_eq!(
      ids(client.fetch_by_neighborhood("Manhattan").await.unwrap().data),
      vec![1, 4]
    );
    assert_eq!(
      ids(
        client
          .fetch_by_cuisine_and_neighborhood("Pizza", "Brooklyn")
          .await
          .unwrap()
          .data
      ),
      vec![3]
    );
    assert_eq!(
      ids(client.fetch_by_cuisine_and_neighborhood(ALL, ALL).await.unwrap().data).len(),
      4
    );
    assert_eq!(
      client.fetch_neighborhoods().await.unwrap(),
      vec!["Manhattan", "Queens", "Brooklyn"]
    );
    assert_eq!(
      client.fetch_cuisines().await.unwrap(),
      vec!["Pizza", "Asian", "Mexican"]
    );
  }

  #[tokio::test]
  async fn test_fetch_by_id_sorts_reviews_newest_first() {
    let transport = FakeTransport::new();
    let at = |secs| Utc.timestamp_opt(secs, 0).single();
    let mut old = review(1, 5);
    old.updated_at = at(1_000);
    let mut new = review(2, 5);
    new.updated_at = at(2_000);
    transport.respond("GET /restaurants/5", serde_json::json!(restaurant(5, false)));
    transport.respond("GET /reviews/?restaurant_id=5", serde_json::json!([old, new]));
    let (client, _) = setup(&transport);

    let details = client.fetch_by_id(5).await.unwrap();

    assert_eq!(details.source, CacheSource::Network);
    assert_eq!(details.data.restaurant.id, 5);
    let ids: Vec<i64> = details.data.reviews.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![2, 1]);
  }

  #[tokio::test]
  async fn test_fetch_by_id_offline_serves_store() {
    let transport = FakeTransport::new();
    transport.set_online(false);
    let (client, store) = setup(&transport);
    store.put(&restaurant(5, true), None).unwrap();
    store.put(&review(1, 5), None).unwrap();

    let details = client.fetch_by_id(5).await.unwrap();

    assert_eq!(details.source, CacheSource::Cache);
    assert!(details.data.restaurant.is_favorite);
    assert_eq!(details.data.reviews.len(), 1);
    assert!(!details.revalidation.unwrap().finished().await);
  }

  #[tokio::test]
  async fn test_fetch_by_id_offline_with_no_reviews() {
    let transport = FakeTransport::new();
    transport.respond("GET /restaurants/5", serde_json::json!(restaurant(5, false)));
    transport.respond("GET /reviews/?restaurant_id=5", serde_json::json!([]));
    let (client, _) = setup(&transport);

    let online = client.fetch_by_id(5).await.unwrap();
    assert_eq!(online.source, CacheSource::Network);
    assert!(online.data.reviews.is_empty());

    transport.set_online(false);
    let offline = client.fetch_by_id(5).await.unwrap();

    assert_eq!(offline.source, CacheSource::Cache);
    assert_eq!(offline.data.restaurant.id, 5);
    assert!(offline.data.reviews.is_empty());
    assert!(offline.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_fetch_reviews_converges_on_backend_list() {
    let transport = FakeTransport::new();
    transport.respond("GET /reviews/?restaurant_id=5", serde_json::json!([review(1, 5)]));
    let (client, store) = setup(&transport);
    store.put(&review(1, 5), None).unwrap();
    store.put(&review(2, 5), None).unwrap();

    let first = client.fetch_reviews(5).await.unwrap();
    assert_eq!(first.data.len(), 2);
    assert!(first.revalidation.unwrap().finished().await);

    let second = client.fetch_reviews(5).await.unwrap();
    let ids: Vec<i64> = second.data.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1]);
    assert!(store.get::<Review>(2).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_offline_writes_are_pending() {
    let transport = FakeTransport::new();
    transport.set_online(false);
    let (client, store) = setup(&transport);
    store.put(&restaurant(5, false), None).unwrap();

    assert!(client.favorite(5).await.unwrap_err().is_queued());
    assert!(client
      .add_review(5, "Alice", 4, "Great food")
      .await
      .unwrap_err()
      .is_queued());

    let pending = client.pending().unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].kind, ResourceKind::Restaurant);
    assert_eq!(pending[1].kind, ResourceKind::Review);

    let reviews = client.fetch_reviews(5).await.unwrap().data;
    assert_eq!(reviews.len(), 1);
    assert!(reviews[0].is_temporary());
  }

  #[tokio::test]
  async fn test_edit_and_delete_of_offline_review_stay_local() {
    let transport = FakeTransport::new();
    transport.set_online(false);
    let (client, store) = setup(&transport);

    let Err(Error::Queued { id, .. }) = client.add_review(5, "Alice", 4, "Great food").await else {
      panic!("expected the create to be queued");
    };
    let mut edited = store.get::<Review>(id).unwrap().unwrap().record;
    edited.comments = "Even better".into();
    assert!(client.update_review(&edited).await.unwrap_err().is_queued());

    let stored = store.get::<Review>(id).unwrap().unwrap();
    assert_eq!(stored.marker, Some(SyncMarker::Create));
    assert_eq!(stored.record.comments, "Even better");
    assert_eq!(client.pending().unwrap().len(), 1);

    client.delete_review(id).await.unwrap();
    assert!(store.get::<Review>(id).unwrap().is_none());
    assert!(client.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_invalid_rating_never_reaches_network() {
    let transport = FakeTransport::new();
    let (client, _) = setup(&transport);

    let err = client.add_review(5, "Alice", 9, "x").await.unwrap_err();

    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(transport.requests().is_empty());
  }

  #[test]
  fn test_urls_for_restaurant() {
    let mut r = restaurant(3, false);
    assert_eq!(url_for_restaurant(&r), "restaurant.html?id=3");
    assert_eq!(image_urls_for_restaurant(&r).x1, "img/3_1x.jpg");

    r.photograph = None;
    let urls = image_urls_for_restaurant(&r);
    assert_eq!(urls.x1, "img/placeholder_1x.jpg");
    assert_eq!(urls.x2, "img/placeholder_2x.jpg");
  }
}

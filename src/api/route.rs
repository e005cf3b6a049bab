//! Request classification by target origin and path.

use url::Url;

use crate::cache::ResourceKind;

/// Where an outgoing request is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
  /// A resource the store mirrors
  Resource(Route),
  /// Backend origin, but a path the store does not understand
  Api,
  /// Anything on another origin
  Foreign,
}

/// A classified backend request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
  pub kind: ResourceKind,
  pub id: Option<i64>,
  /// `?restaurant_id=` filter on review lists
  pub restaurant_id: Option<i64>,
  /// `?is_favorite=` on favorite toggles
  pub is_favorite: Option<bool>,
}

/// Builds and classifies backend URLs.
#[derive(Debug, Clone)]
pub struct Router {
  base: Url,
}

impl Router {
  pub fn new(mut base: Url) -> Self {
    // Url::join treats a base without a trailing slash as a file
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }
    base.set_query(None);
    base.set_fragment(None);
    Self { base }
  }

  pub fn base(&self) -> &Url {
    &self.base
  }

  /// `/restaurants` or `/reviews/`; reviews always carry the trailing slash
  /// the backend expects for collection routes.
  pub fn collection(&self, kind: ResourceKind) -> Url {
    let path = match kind {
      ResourceKind::Restaurant => "restaurants",
      ResourceKind::Review => "reviews/",
    };
    self.join(path)
  }

  pub fn item(&self, kind: ResourceKind, id: i64) -> Url {
    self.join(&format!("{}/{id}", kind.path_segment()))
  }

  pub fn reviews_for(&self, restaurant_id: i64) -> Url {
    let mut url = self.collection(ResourceKind::Review);
    url
      .query_pairs_mut()
      .append_pair("restaurant_id", &restaurant_id.to_string());
    url
  }

  pub fn favorite(&self, restaurant_id: i64, is_favorite: bool) -> Url {
    let mut url = self.join(&format!("restaurants/{restaurant_id}/"));
    url
      .query_pairs_mut()
      .append_pair("is_favorite", if is_favorite { "true" } else { "false" });
    url
  }

  fn join(&self, path: &str) -> Url {
    // Only static segments and integers are joined, so this cannot fail
    self.base.join(path).unwrap_or_else(|_| self.base.clone())
  }

  pub fn classify(&self, url: &Url) -> Target {
    if url.origin() != self.base.origin() {
      return Target::Foreign;
    }

    let Some(rest) = url.path().strip_prefix(self.base.path()) else {
      return Target::Api;
    };

    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    let (kind, id) = match segments.as_slice() {
      [collection] => match ResourceKind::from_partition(collection) {
        Some(kind) => (kind, None),
        None => return Target::Api,
      },
      [collection, id] => match (ResourceKind::from_partition(collection), id.parse().ok()) {
        (Some(kind), Some(id)) => (kind, Some(id)),
        _ => return Target::Api,
      },
      _ => return Target::Api,
    };

    let mut route = Route {
      kind,
      id,
      restaurant_id: None,
      is_favorite: None,
    };

    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "restaurant_id" => route.restaurant_id = value.parse().ok(),
        "is_favorite" => route.is_favorite = Some(value.eq_ignore_ascii_case("true")),
        _ => {}
      }
    }

    Target::Resource(route)
  }
}

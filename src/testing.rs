//! Fixtures and a scripted transport shared by unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};
use url::Url;

use crate::api::route::Router;
use crate::api::transport::{ApiRequest, Transport};
use crate::api::types::{Restaurant, Review};
use crate::cache::{AssetPolicy, LocalStore};
use crate::error::TransportError;
use crate::sync::Interceptor;

pub const BASE: &str = "http://localhost:1337";

pub fn restaurant(id: i64, is_favorite: bool) -> Restaurant {
  Restaurant {
    id,
    name: format!("Restaurant {id}"),
    neighborhood: "Manhattan".to_string(),
    photograph: Some(id.to_string()),
    address: format!("{id} Main St"),
    latlng: None,
    cuisine_type: "Pizza".to_string(),
    operating_hours: BTreeMap::new(),
    is_favorite,
    created_at: None,
    updated_at: None,
    extra: Map::new(),
  }
}

pub fn review(id: i64, restaurant_id: i64) -> Review {
  Review {
    id,
    restaurant_id,
    name: "Bob".to_string(),
    rating: 3,
    comments: format!("Review {id}"),
    created_at: None,
    updated_at: None,
    extra: Map::new(),
  }
}

pub fn router() -> Router {
  Router::new(Url::parse(BASE).unwrap())
}

#[derive(Default)]
struct FakeState {
  offline: bool,
  responses: HashMap<String, Value>,
  failures: HashMap<String, VecDeque<TransportError>>,
  log: Vec<String>,
}

/// In-memory backend. Requests are keyed as `"METHOD /path?query"`;
/// anything without a scripted response answers 404.
#[derive(Clone, Default)]
pub struct FakeTransport {
  state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_online(&self, online: bool) {
    self.state.lock().unwrap().offline = !online;
  }

  pub fn respond(&self, key: &str, body: Value) {
    self
      .state
      .lock()
      .unwrap()
      .responses
      .insert(key.to_string(), body);
  }

  pub fn fail_once(&self, key: &str, error: TransportError) {
    self
      .state
      .lock()
      .unwrap()
      .failures
      .entry(key.to_string())
      .or_default()
      .push_back(error);
  }

  /// Every request seen so far, including failed ones.
  pub fn requests(&self) -> Vec<String> {
    self.state.lock().unwrap().log.clone()
  }

  pub fn count(&self, key: &str) -> usize {
    self.requests().iter().filter(|r| *r == key).count()
  }
}

fn request_key(request: &ApiRequest) -> String {
  let mut key = format!("{} {}", request.method, request.url.path());
  if let Some(query) = request.url.query() {
    key.push('?');
    key.push_str(query);
  }
  key
}

impl Transport for FakeTransport {
  async fn send(&self, request: &ApiRequest) -> Result<Vec<u8>, TransportError> {
    let key = request_key(request);
    let mut state = self.state.lock().unwrap();
    state.log.push(key.clone());

    if state.offline {
      return Err(TransportError::Unreachable("connection refused".into()));
    }
    if let Some(error) = state.failures.get_mut(&key).and_then(VecDeque::pop_front) {
      return Err(error);
    }
    match state.responses.get(&key) {
      Some(body) => Ok(serde_json::to_vec(body).unwrap()),
      None => Err(TransportError::Status {
        status: 404,
        body: json!({ "error": "not found" }).to_string(),
      }),
    }
  }
}

pub fn interceptor(transport: &FakeTransport) -> (Interceptor<FakeTransport>, LocalStore) {
  let store = LocalStore::open_in_memory().unwrap();
  let interceptor = Interceptor::new(
    transport.clone(),
    router(),
    Some(store.clone()),
    AssetPolicy::default(),
  );
  (interceptor, store)
}

pub fn unavailable() -> TransportError {
  TransportError::Status {
    status: 503,
    body: "unavailable".into(),
  }
}

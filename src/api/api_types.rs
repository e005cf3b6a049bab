//! Serde-deserializable types matching the backend's JSON.
//!
//! The backend is loose about encodings: favorites arrive as booleans, as
//! `"true"`/`"false"` strings or not at all, and ids or ratings sometimes
//! arrive as strings. These types absorb that; domain types deserialize
//! through them.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::types::{LatLng, Restaurant, Review};

// ============================================================================
// Loosely typed scalars
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LooseBool {
  Bool(bool),
  Text(String),
  Number(i64),
}

impl LooseBool {
  pub fn value(&self) -> bool {
    match self {
      Self::Bool(b) => *b,
      Self::Text(s) => s.trim().eq_ignore_ascii_case("true"),
      Self::Number(n) => *n != 0,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LooseInt {
  Number(i64),
  Float(f64),
  Text(String),
}

impl LooseInt {
  pub fn value(&self) -> Option<i64> {
    match self {
      Self::Number(n) => Some(*n),
      #[allow(clippy::cast_possible_truncation)]
      Self::Float(f) if f.is_finite() => Some(f.round() as i64),
      Self::Float(_) => None,
      Self::Text(s) => s.trim().parse().ok(),
    }
  }
}

/// `createdAt` / `updatedAt`: epoch milliseconds or an RFC 3339 string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LooseTimestamp {
  Millis(i64),
  Text(String),
}

impl LooseTimestamp {
  pub fn value(&self) -> Option<DateTime<Utc>> {
    match self {
      Self::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
      Self::Text(s) => DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| s.trim().parse::<i64>().ok().and_then(|ms| Utc.timestamp_millis_opt(ms).single())),
    }
  }
}

fn int(value: Option<&LooseInt>) -> i64 {
  value.and_then(LooseInt::value).unwrap_or_default()
}

fn timestamp(value: Option<&LooseTimestamp>) -> Option<DateTime<Utc>> {
  value.and_then(LooseTimestamp::value)
}

// ============================================================================
// Restaurants
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiRestaurant {
  pub id: Option<LooseInt>,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub neighborhood: String,
  pub photograph: Option<Value>,
  #[serde(default)]
  pub address: String,
  pub latlng: Option<LatLng>,
  #[serde(default)]
  pub cuisine_type: String,
  #[serde(default)]
  pub operating_hours: BTreeMap<String, String>,
  pub is_favorite: Option<LooseBool>,
  #[serde(rename = "createdAt")]
  pub created_at: Option<LooseTimestamp>,
  #[serde(rename = "updatedAt")]
  pub updated_at: Option<LooseTimestamp>,
  // Catch-all so unknown fields survive a trip through the store
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl From<ApiRestaurant> for Restaurant {
  fn from(api: ApiRestaurant) -> Self {
    let photograph = match api.photograph {
      Some(Value::String(s)) if !s.is_empty() => Some(s),
      Some(Value::Number(n)) => Some(n.to_string()),
      _ => None,
    };

    Self {
      id: int(api.id.as_ref()),
      name: api.name,
      neighborhood: api.neighborhood,
      photograph,
      address: api.address,
      latlng: api.latlng,
      cuisine_type: api.cuisine_type,
      operating_hours: api.operating_hours,
      is_favorite: api.is_favorite.as_ref().is_some_and(LooseBool::value),
      created_at: timestamp(api.created_at.as_ref()),
      updated_at: timestamp(api.updated_at.as_ref()),
      extra: api.extra,
    }
  }
}

// ============================================================================
// Reviews
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiReview {
  pub id: Option<LooseInt>,
  pub restaurant_id: Option<LooseInt>,
  #[serde(default)]
  pub name: String,
  pub rating: Option<LooseInt>,
  #[serde(default)]
  pub comments: String,
  #[serde(rename = "createdAt")]
  pub created_at: Option<LooseTimestamp>,
  #[serde(rename = "updatedAt")]
  pub updated_at: Option<LooseTimestamp>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl From<ApiReview> for Review {
  fn from(api: ApiReview) -> Self {
    let rating = u8::try_from(int(api.rating.as_ref()).clamp(0, 5)).unwrap_or_default();

    Self {
      id: int(api.id.as_ref()),
      restaurant_id: int(api.restaurant_id.as_ref()),
      name: api.name,
      rating,
      comments: api.comments,
      created_at: timestamp(api.created_at.as_ref()),
      updated_at: timestamp(api.updated_at.as_ref()),
      extra: api.extra,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_favorite_normalization() {
    let cases = [
      (json!({"id": 1, "is_favorite": true}), true),
      (json!({"id": 1, "is_favorite": "true"}), true),
      (json!({"id": 1, "is_favorite": "false"}), false),
      (json!({"id": 1, "is_favorite": false}), false),
      (json!({"id": 1}), false),
      (json!({"id": 1, "is_favorite": null}), false),
    ];

    for (payload, expected) in cases {
      let restaurant: Restaurant = serde_json::from_value(payload.clone()).unwrap();
      assert_eq!(restaurant.is_favorite, expected, "{payload}");
    }
  }

  #[test]
  fn test_string_encoded_numbers() {
    let review: Review = serde_json::from_value(json!({
      "id": "12",
      "restaurant_id": "3",
      "name": "Bob",
      "rating": "4",
      "comments": "ok",
      "createdAt": 1_504_095_567_183_i64,
      "updatedAt": "2018-05-20T10:00:00.000Z"
    }))
    .unwrap();

    assert_eq!(review.id, 12);
    assert_eq!(review.restaurant_id, 3);
    assert_eq!(review.rating, 4);
    assert!(review.created_at.is_some());
    assert!(review.updated_at.is_some());
  }

  #[test]
  fn test_unknown_fields_survive_round_trip() {
    let restaurant: Restaurant = serde_json::from_value(json!({
      "id": 2,
      "name": "Emily",
      "photograph": 2,
      "rating_summary": "great"
    }))
    .unwrap();

    assert_eq!(restaurant.photograph.as_deref(), Some("2"));
    let value = serde_json::to_value(&restaurant).unwrap();
    assert_eq!(value["rating_summary"], "great");
  }
}

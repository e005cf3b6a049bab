use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use super::api_types::{ApiRestaurant, ApiReview};
use crate::cache::{Cacheable, ResourceKind};
use crate::error::{Error, Result};

/// Restaurant as listed by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ApiRestaurant")]
pub struct Restaurant {
  pub id: i64,
  pub name: String,
  pub neighborhood: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub photograph: Option<String>,
  pub address: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub latlng: Option<LatLng>,
  pub cuisine_type: String,
  pub operating_hours: BTreeMap<String, String>,
  pub is_favorite: bool,
  #[serde(rename = "createdAt", serialize_with = "millis", skip_serializing_if = "Option::is_none")]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(rename = "updatedAt", serialize_with = "millis", skip_serializing_if = "Option::is_none")]
  pub updated_at: Option<DateTime<Utc>>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
  pub lat: f64,
  pub lng: f64,
}

/// Review of a restaurant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ApiReview")]
pub struct Review {
  pub id: i64,
  pub restaurant_id: i64,
  pub name: String,
  pub rating: u8,
  pub comments: String,
  #[serde(rename = "createdAt", serialize_with = "millis", skip_serializing_if = "Option::is_none")]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(rename = "updatedAt", serialize_with = "millis", skip_serializing_if = "Option::is_none")]
  pub updated_at: Option<DateTime<Utc>>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Review {
  /// Local record for a review that has not reached the backend yet.
  pub fn staged(temp_id: i64, new: &NewReview, now: DateTime<Utc>) -> Self {
    Self {
      id: temp_id,
      restaurant_id: new.restaurant_id,
      name: new.name.clone(),
      rating: new.rating,
      comments: new.comments.clone(),
      created_at: Some(now),
      updated_at: Some(now),
      extra: Map::new(),
    }
  }

  /// True while the id is a local placeholder.
  pub const fn is_temporary(&self) -> bool {
    self.id < 0
  }

  /// Writable fields, as sent on create and update.
  pub fn to_new(&self) -> NewReview {
    NewReview {
      restaurant_id: self.restaurant_id,
      name: self.name.clone(),
      rating: self.rating,
      comments: self.comments.clone(),
    }
  }
}

/// Body of `POST /reviews/` and `PUT /reviews/:id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReview {
  pub restaurant_id: i64,
  pub name: String,
  pub rating: u8,
  pub comments: String,
}

impl NewReview {
  pub fn new(
    restaurant_id: i64,
    name: impl Into<String>,
    rating: u8,
    comments: impl Into<String>,
  ) -> Result<Self> {
    let review = Self {
      restaurant_id,
      name: name.into().trim().to_string(),
      rating,
      comments: comments.into(),
    };
    review.validate()?;
    Ok(review)
  }

  pub fn validate(&self) -> Result<()> {
    if !(1..=5).contains(&self.rating) {
      return Err(Error::InvalidInput(format!(
        "rating must be between 1 and 5, got {}",
        self.rating
      )));
    }
    if self.name.trim().is_empty() {
      return Err(Error::InvalidInput("reviewer name must not be empty".into()));
    }
    if self.restaurant_id <= 0 {
      return Err(Error::InvalidInput(format!(
        "invalid restaurant id {}",
        self.restaurant_id
      )));
    }
    Ok(())
  }
}

/// Restaurant with its reviews, newest first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestaurantDetails {
  #[serde(flatten)]
  pub restaurant: Restaurant,
  pub reviews: Vec<Review>,
}

/// Image sources for a restaurant at 1x and 2x density
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageUrls {
  #[serde(rename = "1x")]
  pub x1: String,
  #[serde(rename = "2x")]
  pub x2: String,
}

impl Cacheable for Restaurant {
  fn id(&self) -> i64 {
    self.id
  }

  fn kind() -> ResourceKind {
    ResourceKind::Restaurant
  }
}

impl Cacheable for Review {
  fn id(&self) -> i64 {
    self.id
  }

  fn kind() -> ResourceKind {
    ResourceKind::Review
  }

  fn parent_id(&self) -> Option<i64> {
    Some(self.restaurant_id)
  }
}

#[allow(clippy::ref_option)]
fn millis<S: Serializer>(value: &Option<DateTime<Utc>>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
  match value {
    Some(dt) => serializer.serialize_i64(dt.timestamp_millis()),
    None => serializer.serialize_none(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn test_new_review_validation() {
    assert!(NewReview::new(5, "Alice", 4, "Great food").is_ok());
    assert!(NewReview::new(5, "Alice", 0, "x").is_err());
    assert!(NewReview::new(5, "Alice", 6, "x").is_err());
    assert!(NewReview::new(5, "   ", 3, "x").is_err());
    assert!(NewReview::new(-1, "Alice", 3, "x").is_err());
  }

  #[test]
  fn test_review_survives_store_round_trip() {
    let new = NewReview::new(5, "Alice", 4, "Great food").unwrap();
    let staged = Review::staged(-42, &new, Utc::now());

    let json = serde_json::to_string(&staged).unwrap();
    let back: Review = serde_json::from_str(&json).unwrap();

    assert_eq!(back.id, -42);
    assert!(back.is_temporary());
    assert_eq!(back.to_new(), new);
    assert_eq!(
      back.created_at.map(|t| t.timestamp_millis()),
      staged.created_at.map(|t| t.timestamp_millis())
    );
  }
}

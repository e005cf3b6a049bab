//! Backend API: wire types, request routing, transport and the client
//! facade.

pub mod api_types;
pub mod client;
pub mod route;
pub mod transport;
pub mod types;

pub use client::{image_urls_for_restaurant, url_for_restaurant, RestaurantClient, ALL};
pub use route::{Route, Router, Target};
pub use transport::{ApiRequest, HttpTransport, Transport};
pub use types::{ImageUrls, LatLng, NewReview, Restaurant, RestaurantDetails, Review};

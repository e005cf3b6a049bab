//! Network transport: the seam between the interceptor and the real network.

use std::future::Future;
use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use url::Url;

use crate::error::TransportError;

/// An outgoing request, before the interceptor decides how to serve it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  pub url: Url,
  pub body: Option<serde_json::Value>,
}

impl ApiRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      body: None,
    }
  }

  pub fn delete(url: Url) -> Self {
    Self {
      method: Method::DELETE,
      url,
      body: None,
    }
  }

  pub fn with_json(method: Method, url: Url, body: &impl Serialize) -> serde_json::Result<Self> {
    Ok(Self {
      method,
      url,
      body: Some(serde_json::to_value(body)?),
    })
  }
}

/// Sends requests over the network and returns the raw response body.
///
/// Implementations must report non-success statuses as
/// [`TransportError::Status`].
pub trait Transport: Send + Sync + 'static {
  fn send(
    &self,
    request: &ApiRequest,
  ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Option<Duration>) -> Result<Self, TransportError> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }
    let client = builder
      .build()
      .map_err(|e| TransportError::Unreachable(format!("failed to build HTTP client: {e}")))?;

    Ok(Self { client })
  }
}

impl Transport for HttpTransport {
  async fn send(&self, request: &ApiRequest) -> Result<Vec<u8>, TransportError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone())
      .header("Accept", "application/json");

    if let Some(body) = &request.body {
      let bytes = serde_json::to_vec(body)
        .map_err(|e| TransportError::Unreachable(format!("failed to encode body: {e}")))?;
      builder = builder
        .header("Content-Type", "application/json")
        .body(bytes);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| TransportError::Unreachable(e.to_string()))?;

    let status = response.status();
    let body = response
      .bytes()
      .await
      .map_err(|e| TransportError::Unreachable(e.to_string()))?;

    if !status.is_success() {
      return Err(TransportError::Status {
        status: status.as_u16(),
        body: String::from_utf8_lossy(&body).trim().to_string(),
      });
    }

    tracing::debug!(method = %request.method, url = %request.url, status = status.as_u16(), "Fetched");
    Ok(body.to_vec())
  }
}

//! Outbound request description and the network seam underneath the pipeline.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use url::Url;

use super::error::ApiError;
use crate::cache::RequestKey;

/// How a request interacts with the response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
  /// Reads consult and populate the cache; mutations never do.
  #[default]
  Default,
  /// Never read from or write to the cache. Concurrent identical reads are
  /// still coalesced.
  Bypass,
}

/// A request to a marketplace endpoint, relative to the API base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
  pub method: Method,
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
  pub cache: CachePolicy,
}

impl ApiRequest {
  fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: None,
      cache: CachePolicy::Default,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::GET, path)
  }

  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self {
      body: Some(body),
      ..Self::new(Method::POST, path)
    }
  }

  pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
    self.query.push((key.into(), value.to_string()));
    self
  }

  pub fn bypass_cache(mut self) -> Self {
    self.cache = CachePolicy::Bypass;
    self
  }

  /// Safe, idempotent reads are the only requests eligible for caching and coalescing.
  pub fn is_read(&self) -> bool {
    self.method == Method::GET || self.method == Method::HEAD
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::new(self.method.as_str(), &self.path, &self.query)
  }
}

/// Status and body as received, before classification.
#[derive(Debug, Clone)]
pub struct RawResponse {
  pub status: u16,
  pub body: Vec<u8>,
}

impl RawResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Sends a request over the network.
///
/// Implementations only report transport failures (timeout, connection) as
/// errors; any HTTP status, including 401, comes back as a `RawResponse`.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &ApiRequest, token: Option<&str>) -> Result<RawResponse, ApiError>;
}

/// `reqwest` transport with a fixed per-request timeout.
pub struct ReqwestTransport {
  client: reqwest::Client,
  base_url: Url,
  timeout: Duration,
}

impl ReqwestTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
    // `Url::join` drops the last segment unless the base ends with a slash.
    let base = if base_url.ends_with('/') {
      base_url.to_string()
    } else {
      format!("{}/", base_url)
    };
    let base_url =
      Url::parse(&base).map_err(|e| ApiError::Network(format!("invalid base URL {}: {}", base, e)))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("drivelink/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| ApiError::Network(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      timeout,
    })
  }

  fn url_for(&self, request: &ApiRequest) -> Result<Url, ApiError> {
    let mut url = self
      .base_url
      .join(request.path.trim_start_matches('/'))
      .map_err(|e| ApiError::Network(format!("invalid path {}: {}", request.path, e)))?;
    if !request.query.is_empty() {
      url.query_pairs_mut().extend_pairs(request.query.iter());
    }
    Ok(url)
  }
}

#[async_trait]
impl Transport for ReqwestTransport {
  async fn send(&self, request: &ApiRequest, token: Option<&str>) -> Result<RawResponse, ApiError> {
    let url = self.url_for(request)?;
    let mut builder = self.client.request(request.method.clone(), url);
    if let Some(token) = token {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await.map_err(|e| self.map_error(e))?;
    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(|e| self.map_error(e))?;

    Ok(RawResponse {
      status,
      body: body.to_vec(),
    })
  }
}

impl ReqwestTransport {
  fn map_error(&self, e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
      ApiError::Timeout(self.timeout)
    } else {
      ApiError::Network(e.to_string())
    }
  }
}

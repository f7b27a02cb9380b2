//! Request pipeline: cache and coalescer in front of the transport, session
//! invalidation behind it.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::error::ApiError;
use super::policy::TtlPolicy;
use super::transport::{ApiRequest, CachePolicy, Transport};
use crate::cache::{Coalescer, Fetched, Flight, TtlCache};
use crate::session::{Navigator, SessionGuard, TokenStore};

/// Tunables for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
  pub ttl_policy: TtlPolicy,
  /// How long a settled read stays joinable.
  pub coalesce_grace: Duration,
  /// How long the session stays in `Invalidating` after a rejection.
  pub session_cooldown: Duration,
}

/// HTTP client that makes caching and coalescing transparent to callers.
///
/// Reads are answered from a live cache entry when one exists, otherwise they
/// join an identical in-flight read or dispatch a new one. Mutations always go
/// to the network. A 401 under a live token hands control to the session guard.
#[derive(Clone)]
pub struct HttpClient {
  transport: Arc<dyn Transport>,
  cache: Arc<TtlCache<Value>>,
  pending: Coalescer<Value, ApiError>,
  session: Arc<SessionGuard>,
  policy: TtlPolicy,
}

impl HttpClient {
  pub fn new(
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenStore>,
    navigator: Arc<dyn Navigator>,
    options: PipelineOptions,
  ) -> Self {
    let cache = Arc::new(TtlCache::new());
    let pending = Coalescer::new(options.coalesce_grace);
    let session = Arc::new(SessionGuard::new(
      tokens,
      navigator,
      Arc::clone(&cache),
      pending.clone(),
      options.session_cooldown,
    ));

    Self {
      transport,
      cache,
      pending,
      session,
      policy: options.ttl_policy,
    }
  }

  pub fn session(&self) -> &Arc<SessionGuard> {
    &self.session
  }

  pub fn cache(&self) -> &Arc<TtlCache<Value>> {
    &self.cache
  }

  /// Send a request through the pipeline.
  pub async fn fetch(&self, request: ApiRequest) -> Result<Fetched<Value>, ApiError> {
    if !request.is_read() {
      let value = self.send(request, None).await?;
      return Ok(Fetched::from_network(value));
    }

    let key = request.key();
    let hash = key.cache_hash();
    let use_cache = request.cache == CachePolicy::Default;

    if use_cache {
      if let Some(entry) = self.cache.get_entry(&hash) {
        debug!(request = %key.description(), "Cache hit");
        return Ok(Fetched::from_cache(entry.value, entry.created_at));
      }
    }

    let ttl = self.policy.ttl_for(&request.path);
    let store = (use_cache && !ttl.is_zero()).then(|| (hash.clone(), ttl));
    let client = self.clone();
    let (future, flight) = self
      .pending
      .join_or_dispatch(&hash, move || async move { client.send(request, store).await });

    if flight == Flight::Joined {
      debug!(request = %key.description(), "Joined in-flight request");
    }
    let value = future.await?;
    Ok(match flight {
      Flight::Dispatched => Fetched::from_network(value),
      Flight::Joined => Fetched::joined(value),
    })
  }

  /// Fetch and deserialize the payload.
  pub async fn fetch_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
    let fetched = self.fetch(request).await?;
    serde_json::from_value(fetched.data).map_err(|e| ApiError::Decode(e.to_string()))
  }

  /// Drop the cached response for a read, typically after a mutation touched it.
  pub fn invalidate(&self, request: &ApiRequest) -> bool {
    self.cache.delete(&request.key().cache_hash())
  }

  /// One network round trip. `store` carries the cache key and lifetime when
  /// the response should populate the cache.
  async fn send(
    &self,
    request: ApiRequest,
    store: Option<(String, Duration)>,
  ) -> Result<Value, ApiError> {
    let ticket = self.session.ticket();
    let response = self
      .transport
      .send(&request, ticket.token.as_deref())
      .await
      .inspect_err(|e| debug!(path = %request.path, error = %e, "Transport failure"))?;

    if !response.is_success() {
      let error = ApiError::from_status(response.status, &response.body, ticket.token.is_some());
      if response.status == 401 {
        self.session.handle_unauthorized(&ticket);
      }
      return Err(error);
    }

    let value = if response.body.is_empty() {
      Value::Null
    } else {
      serde_json::from_slice(&response.body).map_err(|e| ApiError::Decode(e.to_string()))?
    };

    if let Some((hash, ttl)) = store {
      // The identity that produced this response may be gone by now.
      if self.session.is_current(&ticket) {
        self.cache.set(hash, value.clone(), ttl);
      } else {
        warn!(path = %request.path, "Discarding response from an invalidated session");
      }
    }

    Ok(value)
  }
}

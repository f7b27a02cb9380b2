//! Result envelope describing where fetched data came from.

use tokio::time::Instant;

/// Data returned by the request pipeline, with metadata about the source.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: Source,
  /// When the data was cached (if served from cache)
  pub cached_at: Option<Instant>,
}

impl<T> Fetched<T> {
  /// Data obtained by this caller's own network call.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: Source::Network,
      cached_at: None,
    }
  }

  /// Data served from a live cache entry.
  pub fn from_cache(data: T, cached_at: Instant) -> Self {
    Self {
      data,
      source: Source::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Data obtained by joining another caller's in-flight request.
  pub fn joined(data: T) -> Self {
    Self {
      data,
      source: Source::Joined,
      cached_at: None,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
    Fetched {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Indicates where fetched data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
  /// Fresh data from a request this caller dispatched
  Network,
  /// Live cache entry; nothing was sent
  Cache,
  /// Shared result of a concurrent identical request
  Joined,
}

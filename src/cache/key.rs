//! Deterministic cache keys for API requests.

use sha2::{Digest, Sha256};

/// Identity of a read request: the logical resource plus its parameters.
///
/// Two keys built from the same path and the same parameters hash identically
/// regardless of parameter order; any differing parameter yields a different key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestKey {
  method: String,
  path: String,
  params: Vec<(String, String)>,
}

impl RequestKey {
  pub fn new(method: &str, path: &str, params: &[(String, String)]) -> Self {
    let mut params = params.to_vec();
    params.sort();
    Self {
      method: method.to_uppercase(),
      path: normalize_path(path),
      params,
    }
  }

  /// Stable, fixed-length hash suitable as a map key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical().as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Human readable form, used in log fields.
  pub fn description(&self) -> String {
    self.canonical()
  }

  fn canonical(&self) -> String {
    let query = self
      .params
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect::<Vec<_>>()
      .join("&");
    if query.is_empty() {
      format!("{} {}", self.method, self.path)
    } else {
      format!("{} {}?{}", self.method, self.path, query)
    }
  }
}

/// Trim surrounding slashes so `/vehicles/` and `vehicles` name the same resource.
fn normalize_path(path: &str) -> String {
  path.trim().trim_matches('/').to_string()
}

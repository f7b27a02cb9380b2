use std::time::Duration;

use crate::config::CacheConfig;

/// Picks a cache lifetime for a read from its endpoint's volatility class.
///
/// Rules match on path prefix; the longest matching prefix wins. A zero TTL
/// means "do not cache".
#[derive(Debug, Clone)]
pub struct TtlPolicy {
  default_ttl: Duration,
  rules: Vec<(String, Duration)>,
}

impl TtlPolicy {
  pub fn new(default_ttl: Duration) -> Self {
    Self {
      default_ttl,
      rules: Vec::new(),
    }
  }

  pub fn with_rule(mut self, prefix: &str, ttl: Duration) -> Self {
    self
      .rules
      .push((prefix.trim_matches('/').to_string(), ttl));
    self
  }

  pub fn from_config(config: &CacheConfig) -> Self {
    config.rules.iter().fold(
      Self::new(Duration::from_secs(config.default_ttl_secs)),
      |policy, rule| policy.with_rule(&rule.prefix, Duration::from_secs(rule.ttl_secs)),
    )
  }

  pub fn ttl_for(&self, path: &str) -> Duration {
    let path = path.trim_matches('/');
    self
      .rules
      .iter()
      .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
      .max_by_key(|(prefix, _)| prefix.len())
      .map(|(_, ttl)| *ttl)
      .unwrap_or(self.default_ttl)
  }
}

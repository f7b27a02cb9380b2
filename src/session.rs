//! Session token ownership and single-flight invalidation on credential rejection.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{Coalescer, TtlCache};
use crate::http::ApiError;

/// Persisted credential storage.
pub trait TokenStore: Send + Sync {
  fn load(&self) -> Option<String>;
  fn store(&self, token: &str) -> Result<()>;
  fn clear(&self) -> Result<()>;
}

/// A screen the client can be showing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
  Login,
  Register,
  Conversations,
  Conversation(String),
  Notifications,
  Other(String),
}

impl Route {
  /// Login and registration never need a redirect to login.
  pub fn is_auth_surface(&self) -> bool {
    matches!(self, Route::Login | Route::Register)
  }
}

impl fmt::Display for Route {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Route::Login => write!(f, "login"),
      Route::Register => write!(f, "register"),
      Route::Conversations => write!(f, "conversations"),
      Route::Conversation(id) => write!(f, "conversations/{}", id),
      Route::Notifications => write!(f, "notifications"),
      Route::Other(path) => write!(f, "{}", path),
    }
  }
}

/// Where the user is, and how to send them somewhere else.
pub trait Navigator: Send + Sync {
  fn current_route(&self) -> Route;
  fn navigate(&self, route: Route);
}

/// Session state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
  Active,
  Invalidating,
}

/// What happened when a 401 was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
  /// This call ran the invalidation sequence.
  Triggered,
  /// Another invalidation is underway, or already ended the identity the
  /// request was sent under.
  Suppressed,
  /// No token was attached; the endpoint merely requires auth.
  Ignored,
}

/// Credential snapshot taken when a request is sent.
#[derive(Debug, Clone)]
pub struct Ticket {
  pub token: Option<String>,
  epoch: u64,
}

/// Owns the credential and runs the invalidation sequence at most once per burst.
///
/// Invalidation clears the token, the response cache and every pending read,
/// then redirects to login unless the user is already on an auth screen. The
/// guard stays in `Invalidating` for a cool-down so that the rest of a burst
/// of 401s is absorbed.
pub struct SessionGuard {
  tokens: Arc<dyn TokenStore>,
  navigator: Arc<dyn Navigator>,
  cache: Arc<TtlCache<Value>>,
  pending: Coalescer<Value, ApiError>,
  invalidating: Arc<AtomicBool>,
  /// Bumped every time the identity changes; requests carry the value they were sent under.
  epoch: AtomicU64,
  invalidations: AtomicU64,
  cooldown: Duration,
}

impl SessionGuard {
  pub fn new(
    tokens: Arc<dyn TokenStore>,
    navigator: Arc<dyn Navigator>,
    cache: Arc<TtlCache<Value>>,
    pending: Coalescer<Value, ApiError>,
    cooldown: Duration,
  ) -> Self {
    Self {
      tokens,
      navigator,
      cache,
      pending,
      invalidating: Arc::new(AtomicBool::new(false)),
      epoch: AtomicU64::new(0),
      invalidations: AtomicU64::new(0),
      cooldown,
    }
  }

  pub fn phase(&self) -> SessionPhase {
    if self.invalidating.load(Ordering::SeqCst) {
      SessionPhase::Invalidating
    } else {
      SessionPhase::Active
    }
  }

  pub fn token(&self) -> Option<String> {
    self.tokens.load()
  }

  /// Snapshot the credential for an outgoing request.
  pub fn ticket(&self) -> Ticket {
    Ticket {
      token: self.tokens.load(),
      epoch: self.epoch.load(Ordering::SeqCst),
    }
  }

  /// Whether the identity a request was sent under is still current.
  pub fn is_current(&self, ticket: &Ticket) -> bool {
    self.epoch.load(Ordering::SeqCst) == ticket.epoch
  }

  /// Number of invalidation sequences that have run.
  pub fn invalidation_count(&self) -> u64 {
    self.invalidations.load(Ordering::SeqCst)
  }

  /// Store a fresh credential after a successful login.
  pub fn login(&self, token: &str) -> Result<()> {
    self.epoch.fetch_add(1, Ordering::SeqCst);
    self.cache.clear();
    self.pending.clear();
    self.tokens.store(token)?;
    info!("Session started");
    Ok(())
  }

  /// User-initiated logout: same teardown as invalidation, without a redirect.
  pub fn logout(&self) -> Result<()> {
    self.epoch.fetch_add(1, Ordering::SeqCst);
    self.tokens.clear()?;
    self.cache.clear();
    self.pending.clear();
    info!("Session ended by user");
    Ok(())
  }

  /// React to a 401 for a request sent with `ticket`.
  pub fn handle_unauthorized(&self, ticket: &Ticket) -> Invalidation {
    if ticket.token.is_none() {
      debug!("401 without credentials, ignoring");
      return Invalidation::Ignored;
    }
    if !self.is_current(ticket) {
      debug!("401 for a previous session, ignoring");
      return Invalidation::Suppressed;
    }
    if self
      .invalidating
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!("Session invalidation already underway");
      return Invalidation::Suppressed;
    }

    warn!("Credentials rejected, invalidating session");
    self.epoch.fetch_add(1, Ordering::SeqCst);
    self.invalidations.fetch_add(1, Ordering::SeqCst);
    if let Err(e) = self.tokens.clear() {
      warn!(error = %e, "Failed to remove stored token");
    }
    self.cache.clear();
    self.pending.clear();

    let route = self.navigator.current_route();
    if route.is_auth_surface() {
      debug!(%route, "Already on an auth surface, not redirecting");
    } else {
      self.navigator.navigate(Route::Login);
    }

    let invalidating = Arc::clone(&self.invalidating);
    let cooldown = self.cooldown;
    tokio::spawn(async move {
      tokio::time::sleep(cooldown).await;
      invalidating.store(false, Ordering::SeqCst);
      debug!("Session invalidation cool-down finished");
    });

    Invalidation::Triggered
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{MemoryTokenStore, RecordingNavigator};

  fn guard(token: Option<&str>, route: Route) -> (SessionGuard, Arc<MemoryTokenStore>, Arc<RecordingNavigator>) {
    let tokens = Arc::new(MemoryTokenStore::new(token));
    let navigator = Arc::new(RecordingNavigator::new(route));
    let guard = SessionGuard::new(
      tokens.clone(),
      navigator.clone(),
      Arc::new(TtlCache::new()),
      Coalescer::new(Duration::from_millis(100)),
      Duration::from_secs(1),
    );
    (guard, tokens, navigator)
  }

  #[tokio::test(start_paused = true)]
  async fn test_first_401_runs_sequence_once() {
    let (guard, tokens, navigator) = guard(Some("t0k3n"), Route::Conversation("7".into()));
    guard.cache.set("k", Value::Null, Duration::from_secs(60));
    let ticket = guard.ticket();

    assert_eq!(guard.handle_unauthorized(&ticket), Invalidation::Triggered);
    assert_eq!(guard.handle_unauthorized(&ticket), Invalidation::Suppressed);

    assert_eq!(guard.phase(), SessionPhase::Invalidating);
    assert_eq!(tokens.load(), None);
    assert_eq!(tokens.clear_count(), 1);
    assert_eq!(guard.cache.len(), 0);
    assert_eq!(navigator.redirects(), vec![Route::Login]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_no_token_is_ignored() {
    let (guard, tokens, navigator) = guard(None, Route::Conversations);
    guard.cache.set("k", Value::Null, Duration::from_secs(60));

    let ticket = guard.ticket();
    assert_eq!(guard.handle_unauthorized(&ticket), Invalidation::Ignored);
    assert_eq!(guard.phase(), SessionPhase::Active);
    assert_eq!(guard.cache.len(), 1);
    assert_eq!(tokens.clear_count(), 0);
    assert!(navigator.redirects().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_no_redirect_from_auth_surface() {
    let (guard, _tokens, navigator) = guard(Some("t0k3n"), Route::Register);
    let ticket = guard.ticket();

    assert_eq!(guard.handle_unauthorized(&ticket), Invalidation::Triggered);
    assert!(navigator.redirects().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_cooldown_returns_to_active() {
    let (guard, _tokens, navigator) = guard(Some("t0k3n"), Route::Notifications);
    guard.handle_unauthorized(&guard.ticket());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(guard.phase(), SessionPhase::Active);

    // A fresh login followed by another rejection invalidates again.
    guard.login("second").unwrap();
    assert_eq!(guard.handle_unauthorized(&guard.ticket()), Invalidation::Triggered);
    assert_eq!(guard.invalidation_count(), 2);
    assert_eq!(navigator.redirects().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_ticket_after_relogin_is_suppressed() {
    let (guard, tokens, _navigator) = guard(Some("old"), Route::Conversations);
    let old_ticket = guard.ticket();
    guard.login("new").unwrap();

    assert_eq!(guard.handle_unauthorized(&old_ticket), Invalidation::Suppressed);
    assert_eq!(tokens.load().as_deref(), Some("new"));
  }

  #[test]
  fn test_logout_clears_everything_without_redirect() {
    let (guard, tokens, navigator) = guard(Some("t0k3n"), Route::Conversations);
    guard.cache.set("k", Value::Null, Duration::from_secs(60));

    guard.logout().unwrap();
    assert_eq!(tokens.load(), None);
    assert_eq!(guard.cache.len(), 0);
    assert!(navigator.redirects().is_empty());
  }
}

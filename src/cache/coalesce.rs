//! Single-flight coalescing of concurrent async operations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::trace;

pub type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

struct Pending<T, E> {
  id: u64,
  future: SharedResult<T, E>,
}

struct Inner<T, E> {
  pending: Mutex<HashMap<String, Pending<T, E>>>,
  next_id: AtomicU64,
  grace: Duration,
}

impl<T, E> Inner<T, E> {
  fn lock(&self) -> MutexGuard<'_, HashMap<String, Pending<T, E>>> {
    self.pending.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Remove `key` only if it still belongs to operation `id`; a later
  /// registration under the same key must survive an older release.
  fn release(&self, key: &str, id: u64) {
    let mut pending = self.lock();
    if pending.get(key).map(|p| p.id) == Some(id) {
      pending.remove(key);
      trace!(key, "Released pending operation");
    }
  }
}

/// Whether a caller started the operation or joined one already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flight {
  Dispatched,
  Joined,
}

/// Shares one in-flight operation between every concurrent caller of the same key.
///
/// Successful operations stay registered for a short grace window after they
/// settle so that callers arriving right behind still join instead of
/// dispatching again. Failed operations are released immediately so a retry is
/// never blocked by an error.
pub struct Coalescer<T, E> {
  inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Coalescer<T, E> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T, E> Coalescer<T, E>
where
  T: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  pub fn new(grace: Duration) -> Self {
    Self {
      inner: Arc::new(Inner {
        pending: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(0),
        grace,
      }),
    }
  }

  /// Run `request` unless an operation for `key` is already pending, in which
  /// case wait for that one instead. Every caller sees the same result.
  pub async fn deduplicate<F, Fut>(&self, key: &str, request: F) -> Result<T, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let (future, _) = self.join_or_dispatch(key, request);
    future.await
  }

  /// Register or join the operation for `key` without awaiting it.
  ///
  /// Registration happens before this returns, so there is no suspension point
  /// between the lookup and the insert. The map is not locked while `request`
  /// builds its future.
  pub fn join_or_dispatch<F, Fut>(&self, key: &str, request: F) -> (SharedResult<T, E>, Flight)
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    if let Some(existing) = self.inner.lock().get(key) {
      trace!(key, "Joined pending operation");
      return (existing.future.clone(), Flight::Joined);
    }

    // `request` runs with the map unlocked so it may use this coalescer.
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    let inner = Arc::downgrade(&self.inner);
    let owned_key = key.to_string();
    let operation = request();

    let future = async move {
      let result = operation.await;
      schedule_release(inner, owned_key, id, result.is_ok());
      result
    }
    .boxed()
    .shared();

    let mut pending = self.inner.lock();
    if let Some(existing) = pending.get(key) {
      // Another caller registered while `request` ran; ours is never polled.
      trace!(key, "Joined pending operation");
      return (existing.future.clone(), Flight::Joined);
    }
    pending.insert(
      key.to_string(),
      Pending {
        id,
        future: future.clone(),
      },
    );
    (future, Flight::Dispatched)
  }

  /// Whether an operation for `key` is currently registered.
  pub fn is_pending(&self, key: &str) -> bool {
    self.inner.lock().contains_key(key)
  }

  /// Forget every registered operation. Callers already awaiting one still get
  /// its result; new callers dispatch fresh.
  pub fn clear(&self) {
    self.inner.lock().clear();
  }
}

fn schedule_release<T, E>(inner: Weak<Inner<T, E>>, key: String, id: u64, succeeded: bool)
where
  T: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  let Some(strong) = inner.upgrade() else {
    return;
  };
  if !succeeded || strong.grace.is_zero() {
    strong.release(&key, id);
    return;
  }
  let grace = strong.grace;
  drop(strong);
  tokio::spawn(async move {
    tokio::time::sleep(grace).await;
    if let Some(inner) = inner.upgrade() {
      inner.release(&key, id);
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  fn counted(
    calls: &Arc<AtomicUsize>,
    value: u32,
    delay: Duration,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<u32, String>> {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      async move {
        tokio::time::sleep(delay).await;
        Ok(value)
      }
      .boxed()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_callers_share_one_call() {
    let coalescer: Coalescer<u32, String> = Coalescer::new(Duration::from_millis(100));
    let calls = Arc::new(AtomicUsize::new(0));

    let (a, b) = tokio::join!(
      coalescer.deduplicate("X", counted(&calls, 1, Duration::from_millis(50))),
      coalescer.deduplicate("X", counted(&calls, 2, Duration::from_millis(50))),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a, Ok(1));
    assert_eq!(b, Ok(1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_different_keys_are_isolated() {
    let coalescer: Coalescer<u32, String> = Coalescer::new(Duration::from_millis(100));
    let calls_x = Arc::new(AtomicUsize::new(0));
    let calls_y = Arc::new(AtomicUsize::new(0));

    let (x, y) = tokio::join!(
      coalescer.deduplicate("X", counted(&calls_x, 1, Duration::from_millis(10))),
      coalescer.deduplicate("Y", counted(&calls_y, 2, Duration::from_millis(10))),
    );

    assert_eq!(calls_x.load(Ordering::SeqCst), 1);
    assert_eq!(calls_y.load(Ordering::SeqCst), 1);
    assert_eq!((x, y), (Ok(1), Ok(2)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_straggler_within_grace_joins() {
    let coalescer: Coalescer<u32, String> = Coalescer::new(Duration::from_millis(100));
    let calls = Arc::new(AtomicUsize::new(0));

    let first = coalescer
      .deduplicate("X", counted(&calls, 1, Duration::ZERO))
      .await;
    tokio::time::advance(Duration::from_millis(50)).await;
    let second = coalescer
      .deduplicate("X", counted(&calls, 2, Duration::ZERO))
      .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first, second);
  }

  #[tokio::test(start_paused = true)]
  async fn test_released_after_grace() {
    let coalescer: Coalescer<u32, String> = Coalescer::new(Duration::from_millis(100));
    let calls = Arc::new(AtomicUsize::new(0));

    coalescer
      .deduplicate("X", counted(&calls, 1, Duration::ZERO))
      .await
      .unwrap();
    assert!(coalescer.is_pending("X"));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!coalescer.is_pending("X"));

    let again = coalescer
      .deduplicate("X", counted(&calls, 2, Duration::ZERO))
      .await;
    assert_eq!(again, Ok(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_is_shared_and_released_immediately() {
    let coalescer: Coalescer<u32, String> = Coalescer::new(Duration::from_secs(1));
    let calls = Arc::new(AtomicUsize::new(0));

    let failing = |calls: &Arc<AtomicUsize>| {
      let calls = Arc::clone(calls);
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
          tokio::time::sleep(Duration::from_millis(20)).await;
          Err::<u32, String>("boom".to_string())
        }
        .boxed()
      }
    };

    let (a, b) = tokio::join!(
      coalescer.deduplicate("X", failing(&calls)),
      coalescer.deduplicate("X", failing(&calls)),
    );
    assert_eq!(a, Err("boom".to_string()));
    assert_eq!(b, Err("boom".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!coalescer.is_pending("X"));

    let retry = coalescer
      .deduplicate("X", counted(&calls, 9, Duration::ZERO))
      .await;
    assert_eq!(retry, Ok(9));
  }

  #[tokio::test]
  async fn test_request_may_use_the_coalescer() {
    let coalescer: Coalescer<u32, String> = Coalescer::new(Duration::ZERO);
    let nested = coalescer.clone();

    let value = coalescer
      .deduplicate("X", move || {
        // Would deadlock if the map were locked while building the future.
        let seen = nested.is_pending("X");
        async move { Ok(u32::from(seen)) }
      })
      .await;

    assert_eq!(value, Ok(0));
    assert!(!coalescer.is_pending("X"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_does_not_release_newer_registration() {
    let coalescer: Coalescer<u32, String> = Coalescer::new(Duration::from_millis(100));
    let calls = Arc::new(AtomicUsize::new(0));

    let (old, _) = coalescer.join_or_dispatch("X", counted(&calls, 1, Duration::from_millis(10)));
    coalescer.clear();
    let (_new, flight) =
      coalescer.join_or_dispatch("X", counted(&calls, 2, Duration::from_secs(5)));
    assert_eq!(flight, Flight::Dispatched);

    // The old operation settles and schedules its own release; the new one stays.
    assert_eq!(old.await, Ok(1));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(coalescer.is_pending("X"));
  }
}

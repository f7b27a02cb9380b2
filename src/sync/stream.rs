//! Incremental sync of an append-mostly remote stream (chat messages).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::cursor::{Record, SyncCursor};
use super::schedule::{spawn_poll_loop, Gate, PollHandle, Trigger, Visibility};
use crate::http::ApiError;

/// Remote side of a stream.
///
/// `after` returns records strictly newer than the given id and `before`
/// records strictly older, both in ascending creation order. An empty vector
/// means nothing matched.
#[async_trait]
pub trait StreamSource<T>: Send + Sync {
  async fn latest(&self, limit: usize) -> Result<Vec<T>, ApiError>;
  async fn after(&self, last_seen_id: &str) -> Result<Vec<T>, ApiError>;
  async fn before(&self, oldest_id: &str, limit: usize) -> Result<Vec<T>, ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
  /// Nothing loaded
  Idle,
  /// Initial page loaded, no polling
  Loaded,
  /// Scheduled incremental fetches running
  Polling,
}

/// Result of a history fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OlderPage {
  pub added: usize,
  /// The server returned a full page, so there may be more.
  pub has_more: bool,
}

struct State<T> {
  cursor: SyncCursor<T>,
  phase: StreamPhase,
}

/// Local view of one remote stream, kept fresh with minimal transfer.
///
/// Every change bumps a revision on a watch channel so a view can redraw.
/// Nothing here touches scroll position.
pub struct StreamSync<T, S> {
  source: S,
  state: Mutex<State<T>>,
  /// Bumped on reset so that fetches started before it are discarded.
  generation: AtomicU64,
  revision: watch::Sender<u64>,
  page_size: usize,
}

impl<T, S> StreamSync<T, S>
where
  T: Record,
  S: StreamSource<T> + 'static,
{
  pub fn new(source: S, page_size: usize) -> Self {
    let (revision, _) = watch::channel(0);
    Self {
      source,
      state: Mutex::new(State {
        cursor: SyncCursor::new(),
        phase: StreamPhase::Idle,
      }),
      generation: AtomicU64::new(0),
      revision,
      page_size,
    }
  }

  fn lock(&self) -> MutexGuard<'_, State<T>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn bump(&self) {
    self.revision.send_modify(|rev| *rev += 1);
  }

  /// Run `apply` against the state unless a reset happened since `generation`.
  fn apply_if_current<R>(&self, generation: u64, apply: impl FnOnce(&mut State<T>) -> R) -> Option<R> {
    let mut state = self.lock();
    if self.generation.load(Ordering::SeqCst) != generation {
      debug!("Discarding fetch for a closed stream");
      return None;
    }
    Some(apply(&mut state))
  }

  pub fn phase(&self) -> StreamPhase {
    self.lock().phase
  }

  pub fn items(&self) -> Vec<T> {
    self.lock().cursor.items().to_vec()
  }

  pub fn len(&self) -> usize {
    self.lock().cursor.len()
  }

  pub fn last_seen_id(&self) -> Option<String> {
    self.lock().cursor.last_seen_id().map(String::from)
  }

  /// Receiver that changes whenever the items do.
  pub fn subscribe(&self) -> watch::Receiver<u64> {
    self.revision.subscribe()
  }

  /// Fetch the newest page and make it the whole view.
  pub async fn load_initial(&self) -> Result<usize, ApiError> {
    let generation = self.generation.load(Ordering::SeqCst);
    let batch = self.source.latest(self.page_size).await?;
    let loaded = self.apply_if_current(generation, |state| {
      state.cursor.replace(batch);
      if state.phase == StreamPhase::Idle {
        state.phase = StreamPhase::Loaded;
      }
      state.cursor.len()
    });
    self.bump();
    Ok(loaded.unwrap_or(0))
  }

  /// Fetch records newer than the last one held and append them.
  ///
  /// Returns how many were new. With nothing held yet this falls back to the
  /// newest page.
  pub async fn poll_once(&self) -> Result<usize, ApiError> {
    let generation = self.generation.load(Ordering::SeqCst);
    let batch = match self.last_seen_id() {
      Some(last) => self.source.after(&last).await?,
      None => self.source.latest(self.page_size).await?,
    };
    if batch.is_empty() {
      return Ok(0);
    }
    let added = self
      .apply_if_current(generation, |state| state.cursor.merge_newer(batch))
      .unwrap_or(0);
    if added > 0 {
      self.bump();
    }
    Ok(added)
  }

  /// Fetch one page older than the oldest record held and prepend it.
  pub async fn load_older(&self) -> Result<OlderPage, ApiError> {
    let generation = self.generation.load(Ordering::SeqCst);
    let oldest = self.lock().cursor.oldest_id().map(String::from);
    let Some(oldest) = oldest else {
      return Ok(OlderPage {
        added: 0,
        has_more: false,
      });
    };
    let batch = self.source.before(&oldest, self.page_size).await?;
    let has_more = batch.len() >= self.page_size;
    let added = self
      .apply_if_current(generation, |state| state.cursor.prepend_older(batch))
      .unwrap_or(0);
    if added > 0 {
      self.bump();
    }
    Ok(OlderPage { added, has_more })
  }

  /// Merge a record produced locally, such as a message this client just sent.
  ///
  /// The poll cursor is left alone so that records the server gained before
  /// this one are still fetched.
  pub fn apply_local(&self, record: T) -> bool {
    let added = self.lock().cursor.insert_local(record);
    if added {
      self.bump();
    }
    added
  }

  /// Forget everything and go back to `Idle`.
  pub fn reset(&self) {
    {
      let mut state = self.lock();
      self.generation.fetch_add(1, Ordering::SeqCst);
      state.cursor.clear();
      state.phase = StreamPhase::Idle;
    }
    self.bump();
  }

  fn set_phase(&self, phase: StreamPhase) {
    self.lock().phase = phase;
  }
}

/// Open a stream: load the newest page, then poll every `period` while `gate`
/// is open and once on every return to visibility.
///
/// A failed initial load is returned to the caller. Failed polls are logged
/// and retried on the next tick; they never clear what is already shown.
pub async fn open_stream<T, S, G>(
  sync: Arc<StreamSync<T, S>>,
  period: Duration,
  gate: G,
  visibility: Visibility,
) -> Result<StreamHandle<T, S>, ApiError>
where
  T: Record,
  S: StreamSource<T> + 'static,
  G: Gate + 'static,
{
  sync.load_initial().await?;
  sync.set_phase(StreamPhase::Polling);

  let poller = Arc::clone(&sync);
  let poll = spawn_poll_loop(period, gate, visibility, move |trigger| {
    let sync = Arc::clone(&poller);
    async move { poll_and_log(&sync, trigger).await }
  });
  info!(items = sync.len(), "Stream opened");

  Ok(StreamHandle {
    sync,
    poll: Some(poll),
  })
}

async fn poll_and_log<T, S>(sync: &StreamSync<T, S>, trigger: Trigger)
where
  T: Record,
  S: StreamSource<T> + 'static,
{
  match sync.poll_once().await {
    Ok(0) => {}
    Ok(added) => debug!(added, ?trigger, "Merged new records"),
    Err(e) => warn!(error = %e, ?trigger, "Poll failed, retrying next tick"),
  }
}

/// Owns an open stream's polling task. Closing or dropping it stops polling
/// and clears the view.
pub struct StreamHandle<T, S>
where
  T: Record,
  S: StreamSource<T> + 'static,
{
  sync: Arc<StreamSync<T, S>>,
  poll: Option<PollHandle>,
}

impl<T, S> StreamHandle<T, S>
where
  T: Record,
  S: StreamSource<T> + 'static,
{
  pub fn sync(&self) -> &Arc<StreamSync<T, S>> {
    &self.sync
  }

  /// Stop polling, wait for the task to finish, and clear the view.
  pub async fn close(mut self) {
    if let Some(poll) = self.poll.take() {
      poll.stop().await;
    }
  }
}

impl<T, S> Drop for StreamHandle<T, S>
where
  T: Record,
  S: StreamSource<T> + 'static,
{
  fn drop(&mut self) {
    // Dropping the poll handle cancels the task.
    self.poll.take();
    self.sync.reset();
    debug!("Stream closed");
  }
}

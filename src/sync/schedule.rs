//! Poll scheduling: an interval tick source composed with a gate predicate.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Condition under which a scheduled poll may run.
pub trait Gate: Send + Sync {
  fn is_open(&self) -> bool;
}

impl<A: Gate, B: Gate> Gate for (A, B) {
  fn is_open(&self) -> bool {
    self.0.is_open() && self.1.is_open()
  }
}

/// Create a linked visibility sender/receiver pair.
pub fn visibility_channel(visible: bool) -> (VisibilitySignal, Visibility) {
  let (tx, rx) = watch::channel(visible);
  (VisibilitySignal { tx }, Visibility { rx })
}

/// Producer side of the visibility state, driven by the host (terminal focus).
#[derive(Debug)]
pub struct VisibilitySignal {
  tx: watch::Sender<bool>,
}

impl VisibilitySignal {
  /// Publish a new state; repeated identical states are not re-announced.
  pub fn set(&self, visible: bool) {
    self.tx.send_if_modified(|current| {
      if *current == visible {
        false
      } else {
        *current = visible;
        true
      }
    });
  }

  pub fn subscribe(&self) -> Visibility {
    Visibility {
      rx: self.tx.subscribe(),
    }
  }
}

/// Whether the user can currently see the client.
#[derive(Debug, Clone)]
pub struct Visibility {
  rx: watch::Receiver<bool>,
}

impl Visibility {
  pub fn is_visible(&self) -> bool {
    *self.rx.borrow()
  }
}

impl Gate for Visibility {
  fn is_open(&self) -> bool {
    self.is_visible()
  }
}

#[derive(Debug, Clone, Copy, Default)]
struct ScrollMetrics {
  /// First visible row
  top: usize,
  /// Rows on screen
  viewport: usize,
  /// Rows of content
  content: usize,
}

/// Shared scroll position of a message list.
///
/// The position is anchored at the top row, so content growing below the
/// viewport never moves what the user is looking at.
#[derive(Debug, Clone)]
pub struct ScrollState {
  metrics: Arc<Mutex<ScrollMetrics>>,
  near_bottom_rows: usize,
}

impl ScrollState {
  pub fn new(near_bottom_rows: usize) -> Self {
    Self {
      metrics: Arc::new(Mutex::new(ScrollMetrics::default())),
      near_bottom_rows,
    }
  }

  fn lock(&self) -> MutexGuard<'_, ScrollMetrics> {
    self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn top(&self) -> usize {
    self.lock().top
  }

  pub fn viewport(&self) -> usize {
    self.lock().viewport
  }

  /// Record the current layout; `top` is clamped but otherwise kept.
  pub fn set_layout(&self, viewport: usize, content: usize) {
    let mut m = self.lock();
    m.viewport = viewport;
    m.content = content;
    m.top = m.top.min(content.saturating_sub(viewport));
  }

  pub fn scroll_by(&self, delta: isize) {
    let mut m = self.lock();
    let max_top = m.content.saturating_sub(m.viewport);
    m.top = m.top.saturating_add_signed(delta).min(max_top);
  }

  pub fn scroll_to_bottom(&self) {
    let mut m = self.lock();
    m.top = m.content.saturating_sub(m.viewport);
  }

  /// Shift the anchor after rows were inserted above it.
  pub fn rows_inserted_above(&self, rows: usize) {
    let mut m = self.lock();
    m.content += rows;
    m.top += rows;
  }

  pub fn distance_from_bottom(&self) -> usize {
    let m = self.lock();
    m.content.saturating_sub(m.top + m.viewport)
  }

  pub fn is_near_bottom(&self) -> bool {
    self.distance_from_bottom() <= self.near_bottom_rows
  }
}

impl Gate for ScrollState {
  fn is_open(&self) -> bool {
    self.is_near_bottom()
  }
}

/// Why a poll ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
  /// First poll of a loop started with `spawn_poll_loop_now`
  Initial,
  Interval,
  BecameVisible,
}

/// Run `poll` every `period` while `gate` is open, plus once immediately
/// whenever the client goes from hidden to visible, until `cancel` fires.
///
/// A visibility-triggered poll restarts the interval. The gate is checked at
/// schedule time.
pub async fn run_poll_loop<G, F, Fut>(
  period: Duration,
  gate: G,
  mut visibility: Visibility,
  cancel: CancellationToken,
  mut poll: F,
) where
  G: Gate,
  F: FnMut(Trigger) -> Fut,
  Fut: Future<Output = ()>,
{
  let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  let mut was_visible = visibility.is_visible();
  let mut signal_live = true;

  loop {
    let trigger = tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      changed = visibility.rx.changed(), if signal_live => {
        if changed.is_err() {
          signal_live = false;
          continue;
        }
        let visible = visibility.is_visible();
        let entered = visible && !was_visible;
        was_visible = visible;
        if !entered {
          continue;
        }
        ticker.reset();
        Trigger::BecameVisible
      }
      _ = ticker.tick() => Trigger::Interval,
    };

    if !gate.is_open() {
      trace!(?trigger, "Poll skipped, gate closed");
      continue;
    }
    tokio::select! {
      _ = cancel.cancelled() => break,
      _ = poll(trigger) => {}
    }
  }
  trace!("Poll loop stopped");
}

/// Spawn `run_poll_loop` and return the handle that owns it.
pub fn spawn_poll_loop<G, F, Fut>(
  period: Duration,
  gate: G,
  visibility: Visibility,
  poll: F,
) -> PollHandle
where
  G: Gate + 'static,
  F: FnMut(Trigger) -> Fut + Send + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  spawn_owned(period, gate, visibility, false, poll)
}

/// Like `spawn_poll_loop`, but poll once right away, ungated. The first poll
/// belongs to the loop task, so stopping the handle cancels it too.
pub fn spawn_poll_loop_now<G, F, Fut>(
  period: Duration,
  gate: G,
  visibility: Visibility,
  poll: F,
) -> PollHandle
where
  G: Gate + 'static,
  F: FnMut(Trigger) -> Fut + Send + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  spawn_owned(period, gate, visibility, true, poll)
}

fn spawn_owned<G, F, Fut>(
  period: Duration,
  gate: G,
  visibility: Visibility,
  immediate: bool,
  mut poll: F,
) -> PollHandle
where
  G: Gate + 'static,
  F: FnMut(Trigger) -> Fut + Send + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  let cancel = CancellationToken::new();
  let token = cancel.clone();
  let task = tokio::spawn(async move {
    if immediate {
      tokio::select! {
        _ = token.cancelled() => return,
        _ = poll(Trigger::Initial) => {}
      }
    }
    run_poll_loop(period, gate, visibility, token, poll).await;
  });
  PollHandle {
    cancel,
    task: Some(task),
  }
}

/// A running poll loop. Dropping the handle stops it.
#[derive(Debug)]
pub struct PollHandle {
  cancel: CancellationToken,
  task: Option<JoinHandle<()>>,
}

impl PollHandle {
  /// Stop the loop and wait until it has exited.
  pub async fn stop(mut self) {
    self.cancel.cancel();
    if let Some(task) = self.task.take() {
      if let Err(e) = task.await {
        warn!(error = %e, "Poll task ended abnormally");
      }
    }
  }
}

impl Drop for PollHandle {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

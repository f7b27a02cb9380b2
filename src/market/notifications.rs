//! Unread notification counter, refreshed on a visibility-gated interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::client::MarketClient;
use crate::http::ApiError;
use crate::sync::{spawn_poll_loop_now, PollHandle, Visibility};

/// Latest known unread count. `None` until the first successful fetch.
pub struct UnreadCounter {
  client: MarketClient,
  count: watch::Sender<Option<u64>>,
}

impl UnreadCounter {
  pub fn new(client: MarketClient) -> Arc<Self> {
    let (count, _) = watch::channel(None);
    Arc::new(Self { client, count })
  }

  pub fn get(&self) -> Option<u64> {
    *self.count.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
    self.count.subscribe()
  }

  /// Fetch the count now. On failure the previous value is kept.
  pub async fn refresh(&self) -> Result<u64, ApiError> {
    let count = self.client.unread_count().await?;
    self.count.send_if_modified(|current| {
      let changed = *current != Some(count);
      *current = Some(count);
      changed
    });
    Ok(count)
  }

  /// Refresh once right away, then every `period` while visible and on every
  /// return to visibility. Stopping the handle cancels any fetch in flight.
  pub fn spawn(self: &Arc<Self>, period: Duration, visibility: Visibility) -> PollHandle {
    let counter = Arc::clone(self);
    spawn_poll_loop_now(period, visibility.clone(), visibility, move |trigger| {
      let counter = Arc::clone(&counter);
      async move {
        match counter.refresh().await {
          Ok(count) => debug!(count, ?trigger, "Unread count refreshed"),
          Err(e) => warn!(error = %e, ?trigger, "Unread count refresh failed"),
        }
      }
    })
  }
}

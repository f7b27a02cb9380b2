//! Test doubles shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::Value;

use crate::http::{ApiError, ApiRequest, RawResponse, Transport};
use crate::session::{Navigator, Route, TokenStore};

pub struct MemoryTokenStore {
  token: Mutex<Option<String>>,
  clears: AtomicUsize,
}

impl MemoryTokenStore {
  pub fn new(token: Option<&str>) -> Self {
    Self {
      token: Mutex::new(token.map(String::from)),
      clears: AtomicUsize::new(0),
    }
  }

  pub fn clear_count(&self) -> usize {
    self.clears.load(Ordering::SeqCst)
  }
}

impl TokenStore for MemoryTokenStore {
  fn load(&self) -> Option<String> {
    self.token.lock().unwrap().clone()
  }

  fn store(&self, token: &str) -> Result<()> {
    *self.token.lock().unwrap() = Some(token.to_string());
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    self.clears.fetch_add(1, Ordering::SeqCst);
    *self.token.lock().unwrap() = None;
    Ok(())
  }
}

pub struct RecordingNavigator {
  route: Mutex<Route>,
  redirects: Mutex<Vec<Route>>,
}

impl RecordingNavigator {
  pub fn new(route: Route) -> Self {
    Self {
      route: Mutex::new(route),
      redirects: Mutex::new(Vec::new()),
    }
  }

  pub fn redirects(&self) -> Vec<Route> {
    self.redirects.lock().unwrap().clone()
  }
}

impl Navigator for RecordingNavigator {
  fn current_route(&self) -> Route {
    self.route.lock().unwrap().clone()
  }

  fn navigate(&self, route: Route) {
    *self.route.lock().unwrap() = route.clone();
    self.redirects.lock().unwrap().push(route);
  }
}

/// Canned response for one path.
#[derive(Debug, Clone)]
pub struct Reply {
  status: u16,
  body: Vec<u8>,
  delay: Duration,
  timeout: bool,
}

impl Reply {
  pub fn json(value: Value) -> Self {
    Self {
      status: 200,
      body: serde_json::to_vec(&value).unwrap(),
      delay: Duration::ZERO,
      timeout: false,
    }
  }

  pub fn status(status: u16) -> Self {
    Self {
      status,
      body: Vec::new(),
      delay: Duration::ZERO,
      timeout: false,
    }
  }

  pub fn timeout() -> Self {
    Self {
      timeout: true,
      ..Self::status(0)
    }
  }

  pub fn delayed(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }
}

/// Transport answering from per-path reply queues.
///
/// Each call pops the next reply for its path; the last one repeats. Unknown
/// paths get a 404.
#[derive(Default)]
pub struct ScriptedTransport {
  replies: Mutex<HashMap<String, VecDeque<Reply>>>,
  calls: Mutex<HashMap<String, usize>>,
  requests: Mutex<Vec<ApiRequest>>,
  last_token: Mutex<Option<String>>,
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn reply(&self, path: &str, reply: Reply) {
    self
      .replies
      .lock()
      .unwrap()
      .entry(path.trim_matches('/').to_string())
      .or_default()
      .push_back(reply);
  }

  pub fn calls(&self, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .get(path.trim_matches('/'))
      .copied()
      .unwrap_or(0)
  }

  pub fn requests(&self) -> Vec<ApiRequest> {
    self.requests.lock().unwrap().clone()
  }

  pub fn last_token(&self) -> Option<String> {
    self.last_token.lock().unwrap().clone()
  }

  fn next_reply(&self, path: &str) -> Option<Reply> {
    let mut replies = self.replies.lock().unwrap();
    let queue = replies.get_mut(path)?;
    if queue.len() > 1 {
      queue.pop_front()
    } else {
      queue.front().cloned()
    }
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn send(&self, request: &ApiRequest, token: Option<&str>) -> Result<RawResponse, ApiError> {
    let path = request.path.trim_matches('/').to_string();
    *self.calls.lock().unwrap().entry(path.clone()).or_default() += 1;
    self.requests.lock().unwrap().push(request.clone());
    *self.last_token.lock().unwrap() = token.map(String::from);

    let reply = self.next_reply(&path).unwrap_or_else(|| Reply::status(404));
    if !reply.delay.is_zero() {
      tokio::time::sleep(reply.delay).await;
    }
    if reply.timeout {
      return Err(ApiError::Timeout(Duration::from_secs(30)));
    }
    Ok(RawResponse {
      status: reply.status,
      body: reply.body,
    })
  }
}

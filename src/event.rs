use crossterm::event::{self, Event as CrosstermEvent, KeyEvent, KeyEventKind};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::market::Message;
use crate::sync::OlderPage;

/// Application events
#[derive(Debug)]
pub enum Event {
  /// Terminal key press
  Key(KeyEvent),
  /// Terminal gained or lost focus; stands in for page visibility
  Focus(bool),
  /// Terminal resized
  Resize,
  /// Periodic tick for UI refresh
  Tick,
  /// Results from background work
  Chat(ChatEvent),
}

/// Results delivered by background chat tasks
#[derive(Debug)]
pub enum ChatEvent {
  /// The message list changed
  Updated,
  /// A history page arrived
  OlderLoaded(OlderPage),
  /// The server accepted a message
  Sent(Box<Message>),
  /// Unread notification count changed
  Unread(u64),
  /// The session was invalidated and the user sent to login
  SessionExpired,
  Failed(String),
}

/// Event handler that produces events from terminal input and a tick timer
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // crossterm reads block, so the reader gets its own thread
    let reader = tx.clone();
    tokio::task::spawn_blocking(move || loop {
      let event = if event::poll(tick_rate).unwrap_or(false) {
        match event::read() {
          Ok(CrosstermEvent::Key(key)) if key.kind == KeyEventKind::Press => Event::Key(key),
          Ok(CrosstermEvent::FocusGained) => Event::Focus(true),
          Ok(CrosstermEvent::FocusLost) => Event::Focus(false),
          Ok(CrosstermEvent::Resize(_, _)) => Event::Resize,
          _ => continue,
        }
      } else {
        Event::Tick
      };
      if reader.send(event).is_err() {
        break;
      }
    });

    Self { tx, rx }
  }

  /// Sender for background tasks to report back on
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

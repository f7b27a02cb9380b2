use crate::config::SyncConfig;
use crate::event::{ChatEvent, Event, EventHandler};
use crate::market::{ConversationMessages, MarketClient, Message, UnreadCounter};
use crate::session::{Navigator, Route};
use crate::sync::{
  open_stream, visibility_channel, OlderPage, PollHandle, ScrollState, StreamHandle, StreamPhase,
  StreamSync, VisibilitySignal,
};
use crate::ui;
use crate::ui::components::{InputResult, TextInput};
use color_eyre::Result;
use crossterm::event::{DisableFocusChange, EnableFocusChange, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{
  disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::prelude::*;
use std::io::stdout;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

type MessageSync = StreamSync<Message, ConversationMessages>;

/// Rows taken by the header and the status line
const CHROME_ROWS: u16 = 2;

/// Input mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  Normal,
  Compose,
}

/// What the main area shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
  Chat,
  SessionExpired,
}

/// Navigator for the terminal client.
///
/// A redirect to login is turned into an event so the app can switch to the
/// login notice and close its stream.
pub struct ChannelNavigator {
  route: Mutex<Route>,
  tx: mpsc::UnboundedSender<Event>,
}

impl ChannelNavigator {
  pub fn new(route: Route, tx: mpsc::UnboundedSender<Event>) -> Self {
    Self {
      route: Mutex::new(route),
      tx,
    }
  }

  fn set_route(&self, route: Route) {
    *self.route.lock().unwrap_or_else(PoisonError::into_inner) = route;
  }
}

impl Navigator for ChannelNavigator {
  fn current_route(&self) -> Route {
    self.route.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  fn navigate(&self, route: Route) {
    info!(%route, "Navigating");
    let expired = route == Route::Login;
    self.set_route(route);
    if expired {
      let _ = self.tx.send(Event::Chat(ChatEvent::SessionExpired));
    }
  }
}

/// Full-screen chat view of one conversation
pub struct App {
  client: MarketClient,
  config: SyncConfig,
  navigator: Arc<ChannelNavigator>,
  conversation_id: String,

  sync: Arc<MessageSync>,
  stream: Option<StreamHandle<Message, ConversationMessages>>,
  /// Snapshot of the stream, refreshed on every revision
  messages: Vec<Message>,
  scroll: ScrollState,
  visibility: VisibilitySignal,
  /// Jump to the newest message on the next layout
  follow_once: bool,

  unread_poll: Option<PollHandle>,
  unread: Option<u64>,

  screen: Screen,
  mode: Mode,
  input: TextInput,
  status: Option<String>,
  loading_older: bool,
  has_more: bool,

  event_tx: mpsc::UnboundedSender<Event>,
  should_quit: bool,
}

impl App {
  pub fn new(
    client: MarketClient,
    config: SyncConfig,
    navigator: Arc<ChannelNavigator>,
    conversation_id: String,
    event_tx: mpsc::UnboundedSender<Event>,
  ) -> Self {
    let sync = Arc::new(StreamSync::new(
      client.messages(&conversation_id),
      config.page_size,
    ));
    let (visibility, _) = visibility_channel(true);

    Self {
      scroll: ScrollState::new(config.near_bottom_rows),
      client,
      config,
      navigator,
      conversation_id,
      sync,
      stream: None,
      messages: Vec::new(),
      visibility,
      follow_once: false,
      unread_poll: None,
      unread: None,
      screen: Screen::Chat,
      mode: Mode::Normal,
      input: TextInput::new(),
      status: None,
      loading_older: false,
      has_more: true,
      event_tx,
      should_quit: false,
    }
  }

  pub async fn run(&mut self, mut events: EventHandler) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    stdout().execute(EnableFocusChange)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    self.status = Some("Loading messages...".to_string());
    self.layout(terminal.size()?.height);
    terminal.draw(|frame| ui::draw(frame, self))?;

    self.open().await;
    self.start_unread_counter();

    // Main loop
    while !self.should_quit {
      self.layout(terminal.size()?.height);
      terminal.draw(|frame| ui::draw(frame, self))?;

      match events.next().await {
        Some(event) => self.handle_event(event),
        None => break,
      }
    }

    self.close().await;

    // Cleanup terminal
    stdout().execute(DisableFocusChange)?;
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    Ok(())
  }

  /// Load the newest page and start polling.
  async fn open(&mut self) {
    self
      .navigator
      .set_route(Route::Conversation(self.conversation_id.clone()));

    let gate = (self.visibility.subscribe(), self.scroll.clone());
    let period = Duration::from_secs(self.config.message_interval_secs);
    match open_stream(
      Arc::clone(&self.sync),
      period,
      gate,
      self.visibility.subscribe(),
    )
    .await
    {
      Ok(handle) => {
        self.stream = Some(handle);
        self.status = None;
        self.follow_once = true;
        self.refresh_messages();
        self.forward_revisions();
      }
      Err(e) => {
        warn!(conversation = %self.conversation_id, error = %e, "Could not open conversation");
        self.status = Some(format!("Could not load messages: {}", e));
      }
    }
  }

  async fn close(&mut self) {
    if let Some(poll) = self.unread_poll.take() {
      poll.stop().await;
    }
    if let Some(stream) = self.stream.take() {
      stream.close().await;
    }
  }

  fn forward_revisions(&self) {
    let mut revisions = self.sync.subscribe();
    let tx = self.event_tx.clone();
    tokio::spawn(async move {
      while revisions.changed().await.is_ok() {
        if tx.send(Event::Chat(ChatEvent::Updated)).is_err() {
          break;
        }
      }
    });
  }

  fn start_unread_counter(&mut self) {
    let counter = UnreadCounter::new(self.client.clone());
    let period = Duration::from_secs(self.config.notification_interval_secs);
    self.unread_poll = Some(counter.spawn(period, self.visibility.subscribe()));

    let mut counts = counter.subscribe();
    let tx = self.event_tx.clone();
    tokio::spawn(async move {
      while counts.changed().await.is_ok() {
        let count = *counts.borrow_and_update();
        if let Some(count) = count {
          if tx.send(Event::Chat(ChatEvent::Unread(count))).is_err() {
            break;
          }
        }
      }
    });
  }

  /// Feed the current viewport height to the scroll state.
  fn layout(&mut self, height: u16) {
    let viewport = height.saturating_sub(CHROME_ROWS) as usize;
    self.scroll.set_layout(viewport, self.messages.len());
    if self.follow_once {
      self.scroll.scroll_to_bottom();
      self.follow_once = false;
    }
  }

  fn refresh_messages(&mut self) {
    self.messages = self.sync.items();
  }

  fn handle_event(&mut self, event: Event) {
    match event {
      Event::Key(key) => self.handle_key(key),
      Event::Focus(visible) => self.visibility.set(visible),
      Event::Resize | Event::Tick => {} // redraw happens every loop
      Event::Chat(chat_event) => self.handle_chat_event(chat_event),
    }
  }

  fn handle_chat_event(&mut self, event: ChatEvent) {
    match event {
      ChatEvent::Updated => self.refresh_messages(),
      ChatEvent::OlderLoaded(OlderPage { added, has_more }) => {
        self.loading_older = false;
        self.has_more = has_more;
        self.refresh_messages();
        // Keep the rows the user was reading in place
        self.scroll.rows_inserted_above(added);
      }
      ChatEvent::Sent(message) => {
        self.status = None;
        self.input.clear();
        self.sync.apply_local(*message);
        self.refresh_messages();
        self.follow_once = true;
      }
      ChatEvent::Unread(count) => self.unread = Some(count),
      ChatEvent::SessionExpired => {
        self.screen = Screen::SessionExpired;
        self.mode = Mode::Normal;
        self.unread_poll = None;
        // Dropping the handle stops polling and clears the view
        self.stream = None;
        self.messages.clear();
      }
      ChatEvent::Failed(msg) => {
        self.loading_older = false;
        self.status = Some(msg);
      }
    }
  }

  fn handle_key(&mut self, key: KeyEvent) {
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
      self.should_quit = true;
      return;
    }
    match self.mode {
      Mode::Normal => self.handle_normal_mode_key(key),
      Mode::Compose => self.handle_compose_mode_key(key),
    }
  }

  fn handle_normal_mode_key(&mut self, key: KeyEvent) {
    if self.screen == Screen::SessionExpired {
      if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
        self.should_quit = true;
      }
      return;
    }

    match key.code {
      KeyCode::Char('q') => self.should_quit = true,

      KeyCode::Up | KeyCode::Char('k') => {
        if self.scroll.top() == 0 {
          self.load_older();
        } else {
          self.scroll.scroll_by(-1);
        }
      }
      KeyCode::PageUp => {
        if self.scroll.top() == 0 {
          self.load_older();
        } else {
          self.scroll.scroll_by(-(self.scroll.viewport() as isize));
        }
      }
      KeyCode::Down | KeyCode::Char('j') => self.scroll.scroll_by(1),
      KeyCode::PageDown => self.scroll.scroll_by(self.scroll.viewport() as isize),
      KeyCode::End | KeyCode::Char('G') => self.scroll.scroll_to_bottom(),

      KeyCode::Char('i') => {
        self.mode = Mode::Compose;
        self.status = None;
      }

      _ => {}
    }
  }

  fn handle_compose_mode_key(&mut self, key: KeyEvent) {
    match self.input.handle_key(key) {
      InputResult::Submitted(body) => {
        self.mode = Mode::Normal;
        self.send(body);
      }
      InputResult::Cancelled => self.mode = Mode::Normal,
      InputResult::Consumed | InputResult::NotHandled => {}
    }
  }

  fn load_older(&mut self) {
    if self.loading_older || !self.has_more || self.stream.is_none() {
      return;
    }
    self.loading_older = true;

    let sync = Arc::clone(&self.sync);
    let tx = self.event_tx.clone();
    tokio::spawn(async move {
      let event = match sync.load_older().await {
        Ok(page) => ChatEvent::OlderLoaded(page),
        Err(e) => ChatEvent::Failed(format!("Could not load older messages: {}", e)),
      };
      let _ = tx.send(Event::Chat(event));
    });
  }

  fn send(&mut self, body: String) {
    self.status = Some("Sending...".to_string());

    let client = self.client.clone();
    let conversation_id = self.conversation_id.clone();
    let tx = self.event_tx.clone();
    tokio::spawn(async move {
      let event = match client.send_message(&conversation_id, &body).await {
        Ok(message) => ChatEvent::Sent(Box::new(message)),
        Err(e) => ChatEvent::Failed(format!("Message not sent: {}", e)),
      };
      let _ = tx.send(Event::Chat(event));
    });
  }

  // Accessors for UI rendering
  pub fn conversation_id(&self) -> &str {
    &self.conversation_id
  }

  pub fn messages(&self) -> &[Message] {
    &self.messages
  }

  pub fn scroll_top(&self) -> usize {
    self.scroll.top()
  }

  pub fn is_following(&self) -> bool {
    self.scroll.is_near_bottom()
  }

  pub fn phase(&self) -> StreamPhase {
    self.sync.phase()
  }

  pub fn unread(&self) -> Option<u64> {
    self.unread
  }

  pub fn screen(&self) -> Screen {
    self.screen
  }

  pub fn mode(&self) -> Mode {
    self.mode
  }

  pub fn input(&self) -> &TextInput {
    &self.input
  }

  pub fn status(&self) -> Option<&str> {
    self.status.as_deref()
  }

  pub fn is_loading_older(&self) -> bool {
    self.loading_older
  }

  pub fn has_more(&self) -> bool {
    self.has_more
  }
}

mod app;
mod cache;
mod config;
mod db;
mod event;
mod http;
mod market;
mod session;
mod sync;
#[cfg(test)]
mod testing;
mod ui;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::app::{App, ChannelNavigator};
use crate::config::Config;
use crate::db::LocalStorage;
use crate::event::EventHandler;
use crate::http::{HttpClient, ReqwestTransport};
use crate::market::MarketClient;
use crate::session::{Navigator, Route};

#[derive(Parser, Debug)]
#[command(name = "drivelink")]
#[command(about = "Terminal client for a peer-to-peer vehicle rental marketplace")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/drivelink/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Sign in and store the session token
  Login {
    #[arg(short, long)]
    email: String,
  },
  /// Forget the stored session token
  Logout,
  /// List conversations
  Conversations,
  /// Show the unread notification count
  Unread,
  /// Open a conversation in the chat view
  Chat { conversation_id: String },
  /// GET an API path through the cache, printing the JSON body
  Get {
    path: String,
    /// Query parameters as key=value
    params: Vec<String>,
  },
}

/// Navigator for one-shot commands: there is no screen to redirect, so an
/// expired session is only reported.
struct CliNavigator;

impl Navigator for CliNavigator {
  fn current_route(&self) -> Route {
    Route::Other("cli".to_string())
  }

  fn navigate(&self, route: Route) {
    if route == Route::Login {
      warn!("Session expired");
      eprintln!("Session expired. Run `drivelink login` to sign in again.");
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging()?;

  let config = Config::load(args.config.as_deref())?;
  let transport = Arc::new(ReqwestTransport::new(&config.api.base_url, config.timeout())?);
  let storage = Arc::new(LocalStorage::open()?);

  let events = match args.command {
    Command::Chat { .. } => Some(EventHandler::new(Duration::from_millis(250))),
    _ => None,
  };
  let navigator: Arc<dyn Navigator>;
  let mut chat_navigator = None;
  if let Some(events) = &events {
    let nav = Arc::new(ChannelNavigator::new(Route::Conversations, events.sender()));
    chat_navigator = Some(Arc::clone(&nav));
    navigator = nav;
  } else {
    navigator = Arc::new(CliNavigator);
  }

  let http = HttpClient::new(transport, storage, navigator, config.pipeline_options());
  let sweeper_cancel = CancellationToken::new();
  let sweeper = http.cache().spawn_sweeper(
    Duration::from_secs(config.cache.sweep_interval_secs),
    sweeper_cancel.clone(),
  );
  let client = MarketClient::new(http);

  match args.command {
    Command::Login { email } => {
      let password = match Config::get_password() {
        Some(p) => p,
        None => prompt_password()?,
      };
      let user = client.login(&email, &password).await?;
      match user {
        Some(user) => println!("Signed in as {}", user.name),
        None => println!("Signed in"),
      }
    }
    Command::Logout => {
      client.logout()?;
      println!("Signed out");
    }
    Command::Conversations => {
      require_login(&client)?;
      for conversation in client.conversations().await? {
        let unread = if conversation.unread > 0 {
          format!(" ({} unread)", conversation.unread)
        } else {
          String::new()
        };
        println!(
          "{}  {}{}  {}",
          conversation.id,
          conversation.counterpart_name,
          unread,
          conversation.vehicle_title.unwrap_or_default()
        );
        if let Some(last) = conversation.last_message {
          println!("    {}", last);
        }
      }
    }
    Command::Unread => {
      require_login(&client)?;
      println!("{}", client.unread_count().await?);
    }
    Command::Chat { conversation_id } => {
      require_login(&client)?;
      let (Some(events), Some(navigator)) = (events, chat_navigator) else {
        return Err(eyre!("Chat view requires a terminal event handler"));
      };
      info!(conversation = %conversation_id, "Opening chat");
      let mut app = App::new(
        client,
        config.sync.clone(),
        navigator,
        conversation_id,
        events.sender(),
      );
      app.run(events).await?;
    }
    Command::Get { path, params } => {
      let params = parse_params(&params)?;
      let fetched = client.get_raw(&path, &params).await?;
      eprintln!("source: {:?}", fetched.source);
      println!("{}", serde_json::to_string_pretty(&fetched.data)?);
    }
  }

  sweeper_cancel.cancel();
  let _ = sweeper.await;
  Ok(())
}

/// Log to a daily file in the data directory; the terminal belongs to the UI.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = db::data_dir()?;
  std::fs::create_dir_all(&log_dir)?;

  let appender = tracing_appender::rolling::daily(log_dir, "drivelink.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("DRIVELINK_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(guard)
}

fn require_login(client: &MarketClient) -> Result<()> {
  if client.is_logged_in() {
    Ok(())
  } else {
    Err(eyre!("Not signed in. Run `drivelink login --email <email>` first."))
  }
}

fn prompt_password() -> Result<String> {
  eprint!("Password: ");
  let mut line = String::new();
  std::io::stdin().read_line(&mut line)?;
  let password = line.trim_end_matches(['\r', '\n']).to_string();
  if password.is_empty() {
    return Err(eyre!("No password given"));
  }
  Ok(password)
}

/// Parse `key=value` arguments into query pairs.
fn parse_params(raw: &[String]) -> Result<Vec<(String, String)>> {
  raw
    .iter()
    .map(|pair| {
      pair
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| eyre!("Expected key=value, got '{}'", pair))
    })
    .collect()
}

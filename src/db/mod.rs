use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::session::TokenStore;

/// Well-known key the session credential is stored under.
pub const AUTH_TOKEN_KEY: &str = "auth_token";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS local_storage (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Persistent string key/value store for client state.
pub struct LocalStorage {
  conn: Mutex<Connection>,
}

impl LocalStorage {
  /// Open or create the store at the default location
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    Self::open_at(&path)
  }

  pub fn open_at(path: &Path) -> Result<Self> {
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open storage at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory storage: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default storage path
  pub fn default_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("storage.db"))
  }

  fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn get_item(&self, key: &str) -> Result<Option<String>> {
    self
      .conn()?
      .query_row(
        "SELECT value FROM local_storage WHERE key = ?1",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  pub fn set_item(&self, key: &str, value: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT INTO local_storage (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;
    Ok(())
  }

  pub fn remove_item(&self, key: &str) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM local_storage WHERE key = ?1", params![key])
      .map_err(|e| eyre!("Failed to remove {}: {}", key, e))?;
    Ok(())
  }
}

impl TokenStore for LocalStorage {
  fn load(&self) -> Option<String> {
    self
      .get_item(AUTH_TOKEN_KEY)
      .inspect_err(|e| warn!(error = %e, "Failed to read stored token"))
      .ok()
      .flatten()
  }

  fn store(&self, token: &str) -> Result<()> {
    self.set_item(AUTH_TOKEN_KEY, token)
  }

  fn clear(&self) -> Result<()> {
    self.remove_item(AUTH_TOKEN_KEY)
  }
}

/// Application data directory ($XDG_DATA_HOME/drivelink).
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("drivelink"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_item_roundtrip_and_overwrite() {
    let storage = LocalStorage::open_in_memory().unwrap();
    assert_eq!(storage.get_item("theme").unwrap(), None);

    storage.set_item("theme", "dark").unwrap();
    storage.set_item("theme", "light").unwrap();
    assert_eq!(storage.get_item("theme").unwrap().as_deref(), Some("light"));

    storage.remove_item("theme").unwrap();
    assert_eq!(storage.get_item("theme").unwrap(), None);
  }

  #[test]
  fn test_token_store_uses_well_known_key() {
    let storage = LocalStorage::open_in_memory().unwrap();
    storage.store("abc").unwrap();

    assert_eq!(
      storage.get_item(AUTH_TOKEN_KEY).unwrap().as_deref(),
      Some("abc")
    );
    assert_eq!(storage.load().as_deref(), Some("abc"));

    TokenStore::clear(&storage).unwrap();
    assert_eq!(storage.load(), None);
  }
}

use std::collections::HashSet;

use chrono::{DateTime, Utc};

/// A server-assigned record in an append-mostly stream.
pub trait Record: Clone + Send + Sync + 'static {
  fn record_id(&self) -> &str;
  fn created_at(&self) -> DateTime<Utc>;
}

fn order_key<T: Record>(record: &T) -> (DateTime<Utc>, &str) {
  (record.created_at(), record.record_id())
}

/// Ordered local copy of a remote stream.
///
/// Items are kept in creation order and are unique by id. Merging is
/// idempotent: feeding the same batch twice leaves the items unchanged, and a
/// late batch of older records is slotted into place without moving anything
/// already held.
///
/// The poll cursor tracks the newest record received from the server, not the
/// newest record held: a record merged locally (a message this client just
/// sent) may be newer than records the server has not delivered yet.
#[derive(Debug, Clone)]
pub struct SyncCursor<T> {
  items: Vec<T>,
  ids: HashSet<String>,
  fetched: Option<(DateTime<Utc>, String)>,
}

impl<T: Record> SyncCursor<T> {
  pub fn new() -> Self {
    Self {
      items: Vec::new(),
      ids: HashSet::new(),
      fetched: None,
    }
  }

  /// Id of the newest record fetched from the server; the `after` cursor for
  /// the next poll.
  pub fn last_seen_id(&self) -> Option<&str> {
    self.fetched.as_ref().map(|(_, id)| id.as_str())
  }

  /// Id of the oldest record held; the `before` cursor for history.
  pub fn oldest_id(&self) -> Option<&str> {
    self.items.first().map(|r| r.record_id())
  }

  pub fn items(&self) -> &[T] {
    &self.items
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn contains(&self, id: &str) -> bool {
    self.ids.contains(id)
  }

  /// Replace everything with a full load.
  pub fn replace(&mut self, batch: Vec<T>) {
    self.clear();
    self.merge_newer(batch);
  }

  /// Merge the result of an incremental fetch. Returns how many records were new.
  pub fn merge_newer(&mut self, batch: Vec<T>) -> usize {
    self.advance(&batch);
    let mut added = 0;
    for record in batch {
      if self.insert_ordered(record) {
        added += 1;
      }
    }
    added
  }

  /// Merge a page of older history. Records that would land after the newest
  /// held record are ignored so the poll cursor never moves here.
  pub fn prepend_older(&mut self, batch: Vec<T>) -> usize {
    let mut added = 0;
    for record in batch {
      let beyond_tail = self
        .items
        .last()
        .is_some_and(|last| order_key(&record) > order_key(last));
      if !beyond_tail && self.insert_ordered(record) {
        added += 1;
      }
    }
    added
  }

  /// Merge a record that did not come from a fetch. The poll cursor stays put.
  pub fn insert_local(&mut self, record: T) -> bool {
    self.insert_ordered(record)
  }

  pub fn clear(&mut self) {
    self.items.clear();
    self.ids.clear();
    self.fetched = None;
  }

  /// Move the poll cursor to the newest record in a fetched batch.
  fn advance(&mut self, batch: &[T]) {
    for record in batch {
      let newer = self
        .fetched
        .as_ref()
        .map_or(true, |(at, id)| (*at, id.as_str()) < order_key(record));
      if newer {
        self.fetched = Some((record.created_at(), record.record_id().to_string()));
      }
    }
  }

  fn insert_ordered(&mut self, record: T) -> bool {
    if self.ids.contains(record.record_id()) {
      return false;
    }
    let at_tail = self
      .items
      .last()
      .map_or(true, |last| order_key(last) <= order_key(&record));
    let position = if at_tail {
      self.items.len()
    } else {
      self
        .items
        .partition_point(|held| order_key(held) <= order_key(&record))
    };
    self.ids.insert(record.record_id().to_string());
    self.items.insert(position, record);
    true
  }
}

impl<T: Record> Default for SyncCursor<T> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use chrono::TimeZone;

  #[derive(Debug, Clone, PartialEq)]
  pub struct Note {
    pub id: String,
    pub at: DateTime<Utc>,
  }

  impl Record for Note {
    fn record_id(&self) -> &str {
      &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
      self.at
    }
  }

  pub fn note(id: u32) -> Note {
    Note {
      id: id.to_string(),
      at: Utc.timestamp_opt(1_700_000_000 + id as i64, 0).unwrap(),
    }
  }

  pub fn notes(ids: &[u32]) -> Vec<Note> {
    ids.iter().map(|id| note(*id)).collect()
  }

  fn ids(cursor: &SyncCursor<Note>) -> Vec<&str> {
    cursor.items().iter().map(|n| n.id.as_str()).collect()
  }

  #[test]
  fn test_merge_preserves_order_without_duplicates() {
    let mut cursor = SyncCursor::new();
    cursor.replace(notes(&[1, 2]));

    assert_eq!(cursor.merge_newer(notes(&[3, 4])), 2);
    assert_eq!(cursor.merge_newer(notes(&[4, 5])), 1);

    assert_eq!(ids(&cursor), vec!["1", "2", "3", "4", "5"]);
    assert_eq!(cursor.last_seen_id(), Some("5"));
  }

  #[test]
  fn test_merge_is_idempotent() {
    let mut once = SyncCursor::new();
    once.replace(notes(&[1, 2]));
    once.merge_newer(notes(&[3, 4]));

    let mut twice = once.clone();
    assert_eq!(twice.merge_newer(notes(&[3, 4])), 0);
    assert_eq!(ids(&once), ids(&twice));
  }

  #[test]
  fn test_late_batch_slots_into_place() {
    let mut cursor = SyncCursor::new();
    cursor.replace(notes(&[1, 2, 5]));

    cursor.merge_newer(notes(&[3, 4]));
    assert_eq!(ids(&cursor), vec!["1", "2", "3", "4", "5"]);
    assert_eq!(cursor.last_seen_id(), Some("5"));
  }

  #[test]
  fn test_replace_discards_prior_state() {
    let mut cursor = SyncCursor::new();
    cursor.replace(notes(&[1, 2, 3]));
    cursor.replace(notes(&[7, 8]));

    assert_eq!(ids(&cursor), vec!["7", "8"]);
    assert!(!cursor.contains("1"));
  }

  #[test]
  fn test_prepend_older_keeps_cursor() {
    let mut cursor = SyncCursor::new();
    cursor.replace(notes(&[10, 11]));

    assert_eq!(cursor.prepend_older(notes(&[8, 9, 12])), 2);
    assert_eq!(ids(&cursor), vec!["8", "9", "10", "11"]);
    assert_eq!(cursor.last_seen_id(), Some("11"));
    assert_eq!(cursor.oldest_id(), Some("8"));
  }

  #[test]
  fn test_local_insert_does_not_move_poll_cursor() {
    let mut cursor = SyncCursor::new();
    cursor.replace(notes(&[1]));

    assert!(cursor.insert_local(note(3)));
    assert_eq!(ids(&cursor), vec!["1", "3"]);
    assert_eq!(cursor.last_seen_id(), Some("1"));

    // The server later delivers both the missed record and the local one.
    assert_eq!(cursor.merge_newer(notes(&[2, 3])), 1);
    assert_eq!(ids(&cursor), vec!["1", "2", "3"]);
    assert_eq!(cursor.last_seen_id(), Some("3"));
  }

  #[test]
  fn test_poll_cursor_never_moves_backwards() {
    let mut cursor = SyncCursor::new();
    cursor.replace(notes(&[4, 5]));
    cursor.merge_newer(notes(&[3]));
    assert_eq!(cursor.last_seen_id(), Some("5"));
  }

  #[test]
  fn test_empty_cursor() {
    let mut cursor: SyncCursor<Note> = SyncCursor::new();
    assert_eq!(cursor.last_seen_id(), None);
    assert_eq!(cursor.merge_newer(Vec::new()), 0);
    cursor.replace(Vec::new());
    assert!(cursor.is_empty());
    assert_eq!(cursor.last_seen_id(), None);
  }
}

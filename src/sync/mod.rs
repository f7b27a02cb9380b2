//! Incremental polling sync for message streams and counters.
//!
//! - `SyncCursor` keeps an ordered, id-unique local copy of a remote stream
//! - `run_poll_loop` composes an interval with a gate (visibility, scroll position)
//! - `StreamSync` and `open_stream` tie both to a `StreamSource`; the returned
//!   `StreamHandle` owns the polling task and tears it down on close or drop

mod cursor;
mod schedule;
mod stream;

pub use cursor::{Record, SyncCursor};
pub use schedule::{
  run_poll_loop, spawn_poll_loop, spawn_poll_loop_now, visibility_channel, Gate, PollHandle, ScrollState, Trigger,
  Visibility, VisibilitySignal,
};
pub use stream::{open_stream, OlderPage, StreamHandle, StreamPhase, StreamSource, StreamSync};

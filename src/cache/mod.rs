//! In-memory caching primitives for the request pipeline.
//!
//! This module is transport-agnostic and provides:
//! - A TTL cache whose entries self-invalidate on read
//! - A coalescer that shares one in-flight operation between concurrent callers
//! - Deterministic request keys (method, path, sorted params)
//! - A result envelope recording whether data came from network, cache, or a joined call

mod coalesce;
mod key;
mod traits;
mod ttl;

pub use coalesce::{Coalescer, Flight};
pub use key::RequestKey;
pub use traits::{Fetched, Source};
pub use ttl::TtlCache;

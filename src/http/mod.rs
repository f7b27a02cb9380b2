//! HTTP access to the marketplace API.

mod client;
mod error;
mod policy;
mod transport;

pub use client::{HttpClient, PipelineOptions};
pub use error::{ApiError, ErrorClass};
pub use policy::TtlPolicy;
pub use transport::{ApiRequest, CachePolicy, RawResponse, ReqwestTransport, Transport};

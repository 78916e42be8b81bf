//! Remote fetches against scrape targets.
//!
//! Each target exposes a metrics endpoint in the text exposition format, a
//! JSON process snapshot endpoint, and a never-ending log stream.

mod exposition;
mod http;

pub use exposition::*;
pub use http::*;

use thiserror::Error;

/// Fetch error types.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("decode error: {0}")]
    Decode(String),
}

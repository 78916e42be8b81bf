//! Storage module for contrail.
//!
//! Flat JSON-lines shard files, one per (kind, job, target[, app]) key.

mod codec;
mod models;
mod query;
mod store;

pub use codec::*;
pub use models::*;
pub use store::*;

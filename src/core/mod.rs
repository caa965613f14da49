//! Core abstractions shared by every layer of the caching gateway.

pub mod error;

pub use error::{CacheError, CacheResult};

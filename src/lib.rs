//! Offline caching gateway.
//!
//! A versioned request cache placed between an application and its origin:
//! static assets and the application shell are served cache-first, API calls
//! network-first with a stored or synthesized offline fallback.

pub mod cache;
pub mod config;
pub mod core;
pub mod intercept;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod network;
pub mod service;
pub mod utils;

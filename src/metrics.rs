//! Prometheus counters for the caching layer.
//!
//! Registered lazily in the default registry, exported by pingora's
//! prometheus HTTP service when `prometheus.address` is configured.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};

// Store lookups by store name and outcome (hit / miss)
pub static CACHE_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cache_lookups_total",
        "Store lookups performed by the caching layer",
        &["store", "result"]
    )
    .unwrap()
});

// Successful writes per store
pub static CACHE_WRITES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cache_writes_total",
        "Entries written into a store",
        &["store"]
    )
    .unwrap()
});

// Responses produced by the strategy executors
pub static STRATEGY_RESPONSES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "strategy_responses_total",
        "Responses returned by a strategy executor, by route and source",
        &[
            "route",  // static / dynamic_api
            "source", // cache / network / offline
        ]
    )
    .unwrap()
});

// Lifecycle state changes
pub static LIFECYCLE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lifecycle_transitions_total",
        "Lifecycle controller state transitions",
        &["state"]
    )
    .unwrap()
});

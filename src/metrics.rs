//! Prometheus metrics for observability
//!
//! All metrics register against the default registry and are exposed by the
//! control plane at `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Gauge, Histogram,
};

lazy_static! {
    /// Instances currently provisioning
    pub static ref POOL_STARTING: Gauge =
        register_gauge!("convopool_starting", "Instances currently provisioning").unwrap();

    /// Warm instances ready for claim
    pub static ref POOL_IDLE: Gauge =
        register_gauge!("convopool_idle", "Warm instances ready for claim").unwrap();

    /// Instances bound to a conversation
    pub static ref POOL_CLAIMED: Gauge =
        register_gauge!("convopool_claimed", "Instances bound to a conversation").unwrap();

    /// Crashed instances awaiting dismissal
    pub static ref POOL_CRASHED: Gauge =
        register_gauge!("convopool_crashed", "Crashed instances awaiting dismissal").unwrap();

    /// Duration of one reconciler tick in seconds
    pub static ref TICK_DURATION: Histogram = register_histogram!(
        "convopool_tick_duration_seconds",
        "Duration of one reconciler tick"
    )
    .unwrap();

    /// Duration of a successful claim in seconds
    pub static ref CLAIM_DURATION: Histogram = register_histogram!(
        "convopool_claim_duration_seconds",
        "Duration of a successful claim"
    )
    .unwrap();

    /// Duration of instance provisioning in seconds
    pub static ref CREATE_DURATION: Histogram = register_histogram!(
        "convopool_create_duration_seconds",
        "Duration of instance provisioning"
    )
    .unwrap();

    /// Claims by outcome (ok, no_idle, conflict, error)
    pub static ref CLAIMS_TOTAL: CounterVec = register_counter_vec!(
        "convopool_claims_total",
        "Claim attempts by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Instance creations that failed and rolled back
    pub static ref CREATE_FAILURES_TOTAL: Counter = register_counter!(
        "convopool_create_failures_total",
        "Instance creations that failed and rolled back"
    )
    .unwrap();

    /// Services deleted because they were dead or stray
    pub static ref CLEANUPS_TOTAL: Counter = register_counter!(
        "convopool_cleanups_total",
        "Services deleted because they were dead or stray"
    )
    .unwrap();
}

/// Update the pool state gauges from a fresh count
pub fn set_pool_counts(counts: &crate::pool::PoolCounts) {
    POOL_STARTING.set(counts.starting as f64);
    POOL_IDLE.set(counts.idle as f64);
    POOL_CLAIMED.set(counts.claimed as f64);
    POOL_CRASHED.set(counts.crashed as f64);
}

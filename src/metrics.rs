//! Metric helpers for the traffic-control plane.
//!
//! Thin wrappers over the `metrics` crate macros. No exporter is embedded; the
//! binary (or an embedding application) installs whatever recorder it wants.
//!
//! Provided metrics:
//! * `tollgate_requests_total` (counter; labels route, status)
//! * `tollgate_request_duration_seconds` (histogram; label route)
//! * `tollgate_slow_requests_total` (counter; label route)
//! * `tollgate_rejections_total` (counter; label code)
//! * `tollgate_rate_limit_decisions_total` (counter; label outcome)
//! * `tollgate_lock_acquisitions_total` (counter; labels mode, outcome)
//! * `tollgate_route_table_version` (gauge)
use std::{collections::HashMap, sync::Mutex, time::Duration};

use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::Lazy;

pub const TOLLGATE_REQUESTS_TOTAL: &str = "tollgate_requests_total";
pub const TOLLGATE_REQUEST_DURATION_SECONDS: &str = "tollgate_request_duration_seconds";
pub const TOLLGATE_SLOW_REQUESTS_TOTAL: &str = "tollgate_slow_requests_total";
pub const TOLLGATE_REJECTIONS_TOTAL: &str = "tollgate_rejections_total";
pub const TOLLGATE_RATE_LIMIT_DECISIONS_TOTAL: &str = "tollgate_rate_limit_decisions_total";
pub const TOLLGATE_LOCK_ACQUISITIONS_TOTAL: &str = "tollgate_lock_acquisitions_total";
pub const TOLLGATE_ROUTE_TABLE_VERSION: &str = "tollgate_route_table_version";

/// Last value written to each gauge, for the `/status` endpoint.
pub static GAUGE_SNAPSHOT: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_counter!(
        TOLLGATE_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests that went through the pipeline."
    );
    describe_histogram!(
        TOLLGATE_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "End-to-end latency of requests handled by the pipeline."
    );
    describe_counter!(
        TOLLGATE_SLOW_REQUESTS_TOTAL,
        Unit::Count,
        "Requests slower than the configured slow-request threshold."
    );
    describe_counter!(
        TOLLGATE_REJECTIONS_TOTAL,
        Unit::Count,
        "Control-plane rejections by machine-readable code."
    );
    describe_counter!(
        TOLLGATE_RATE_LIMIT_DECISIONS_TOTAL,
        Unit::Count,
        "Token-bucket decisions (allowed, limited, unavailable, invalid)."
    );
    describe_counter!(
        TOLLGATE_LOCK_ACQUISITIONS_TOTAL,
        Unit::Count,
        "Distributed lock acquisition attempts by mode and outcome."
    );
    describe_gauge!(
        TOLLGATE_ROUTE_TABLE_VERSION,
        "Version of the route table snapshot currently installed."
    );

    Mutex::new(HashMap::new())
});

fn remember_gauge(name: &str, value: f64) {
    match GAUGE_SNAPSHOT.lock() {
        Ok(mut gauges) => {
            gauges.insert(name.to_string(), value);
        }
        Err(e) => tracing::error!("Failed to acquire gauge snapshot lock: {}", e),
    }
}

pub fn increment_request_total(route: &str, status: u16) {
    counter!(
        TOLLGATE_REQUESTS_TOTAL,
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(route: &str, duration: Duration) {
    histogram!(TOLLGATE_REQUEST_DURATION_SECONDS, "route" => route.to_string())
        .record(duration.as_secs_f64());
}

pub fn increment_slow_request(route: &str) {
    counter!(TOLLGATE_SLOW_REQUESTS_TOTAL, "route" => route.to_string()).increment(1);
}

pub fn increment_rejection(code: &'static str) {
    counter!(TOLLGATE_REJECTIONS_TOTAL, "code" => code).increment(1);
}

pub fn increment_rate_limit_decision(outcome: &'static str) {
    counter!(TOLLGATE_RATE_LIMIT_DECISIONS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn increment_lock_acquisition(mode: &'static str, outcome: &'static str) {
    counter!(TOLLGATE_LOCK_ACQUISITIONS_TOTAL, "mode" => mode, "outcome" => outcome).increment(1);
}

pub fn set_route_table_version(version: u64) {
    gauge!(TOLLGATE_ROUTE_TABLE_VERSION).set(version as f64);
    remember_gauge(TOLLGATE_ROUTE_TABLE_VERSION, version as f64);
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    Lazy::force(&GAUGE_SNAPSHOT);
    tracing::info!("Tollgate metrics initialized");
    Ok(())
}

/// Snapshot of the last value written to each gauge.
pub fn get_current_metrics() -> HashMap<String, f64> {
    GAUGE_SNAPSHOT
        .lock()
        .map(|gauges| gauges.clone())
        .unwrap_or_default()
}

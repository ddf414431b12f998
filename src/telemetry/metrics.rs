//! Metric instrument factories for workpool.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workpool"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for workpool instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workpool")
}

/// Counter: work records durably posted.
/// Labels: `work_type`, `mode`.
pub fn work_posted() -> Counter<u64> {
    meter()
        .u64_counter("workpool.work.posted")
        .with_description("Number of work records posted")
        .build()
}

/// Counter: claim transactions.
/// Labels: `work_type`, `result` ("claimed" | "missing" | "acquired").
pub fn work_claims() -> Counter<u64> {
    meter()
        .u64_counter("workpool.work.claims")
        .with_description("Number of claim attempts by outcome")
        .build()
}

/// Counter: finalize transactions.
/// Labels: `work_type`, `result` ("completed" | "rescheduled" | "vanished" | "failed").
pub fn work_finalized() -> Counter<u64> {
    meter()
        .u64_counter("workpool.work.finalized")
        .with_description("Number of finalized executions by outcome")
        .build()
}

/// Counter: abandoned claims released by the stuck sweep.
/// Labels: `work_type`.
pub fn stuck_released() -> Counter<u64> {
    meter()
        .u64_counter("workpool.work.stuck_released")
        .with_description("Claims released by the stuck-claim sweep")
        .build()
}

/// Counter: fast-path notices published to the pool.
/// Labels: `work_type`, `result` ("ok" | "error").
pub fn fastpath_published() -> Counter<u64> {
    meter()
        .u64_counter("workpool.fastpath.published")
        .with_description("Fast-path notices published to the pool bus")
        .build()
}

/// Histogram: handler execution time in milliseconds.
/// Labels: `work_type`.
pub fn work_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workpool.work.duration_ms")
        .with_description("Work handler execution time in milliseconds")
        .with_unit("ms")
        .build()
}

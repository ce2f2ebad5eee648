//! Metric instrument factories for txflow.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"txflow"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for txflow instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("txflow")
}

/// Counter: `start_work` attempts.
/// Labels: `result` ("ok" | "not_available" | "error").
pub fn work_started() -> Counter<u64> {
    meter()
        .u64_counter("txflow.work.started")
        .with_description("Number of start_work attempts")
        .build()
}

/// Counter: conditional state transitions attempted.
/// Labels: `from`, `to`, `applied`.
pub fn work_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("txflow.work.state_transitions")
        .with_description("Number of work item state transition attempts")
        .build()
}

/// Counter: queue-level operations (create, send, read, delete, archive, set_vt).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("txflow.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: deliveries processed by a consumer loop.
/// Labels: `queue`, `result` ("committed" | "rolled_back" | "dead_lettered").
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("txflow.deliveries")
        .with_description("Number of deliveries processed")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("txflow.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

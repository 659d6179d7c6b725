//! Metric instrument factories for argus.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"argus"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for argus instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("argus")
}

/// Counter: events written to the store.
/// Labels: `result` ("inserted" | "duplicate").
pub fn events_persisted() -> Counter<u64> {
    meter()
        .u64_counter("argus.events.persisted")
        .with_description("Number of events written to the event store")
        .build()
}

/// Counter: messages routed to the dead-letter queue.
/// Labels: `reason` ("unmarshal_failed" | "validation_failed").
pub fn dlq_messages() -> Counter<u64> {
    meter()
        .u64_counter("argus.dlq.messages")
        .with_description("Number of messages sent to the dead letter queue")
        .build()
}

/// Counter: queue-level operations (send, read, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("argus.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: cache lookups.
/// Labels: `outcome` ("hit" | "miss").
pub fn cache_lookups() -> Counter<u64> {
    meter()
        .u64_counter("argus.cache.lookups")
        .with_description("Number of cache lookups")
        .build()
}

/// Counter: triage jobs by terminal status.
/// Labels: `status` ("complete" | "failed").
pub fn triage_jobs() -> Counter<u64> {
    meter()
        .u64_counter("argus.triage.jobs")
        .with_description("Number of triage jobs reaching a terminal status")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("argus.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

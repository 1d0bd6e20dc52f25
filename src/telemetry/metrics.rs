//! Metric instrument factories for event-dispatcher.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"event-dispatcher"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for event-dispatcher instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("event-dispatcher")
}

/// Counter: notifications received from the change feed.
/// Labels: `kind` ("add" | "update" | "delete").
pub fn notifications_received() -> Counter<u64> {
    meter()
        .u64_counter("dispatcher.notifications.received")
        .with_description("Notifications received from the change feed")
        .build()
}

/// Counter: events dropped by the staleness filter.
pub fn events_stale() -> Counter<u64> {
    meter()
        .u64_counter("dispatcher.events.stale")
        .with_description("Events older than the freshness window")
        .build()
}

/// Counter: events accepted into the dispatch queue.
pub fn events_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("dispatcher.events.enqueued")
        .with_description("Events accepted into the dispatch queue")
        .build()
}

/// Counter: per-sink delivery outcomes.
/// Labels: `sink`, `result` ("ok" | "error" | "filtered").
pub fn sink_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("dispatcher.sink.deliveries")
        .with_description("Sink delivery attempts by outcome")
        .build()
}

/// Histogram: sink send duration in milliseconds.
/// Labels: `sink`.
pub fn sink_send_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dispatcher.sink.send_duration_ms")
        .with_description("Sink send duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: leadership status changes.
/// Labels: `status` ("standby" | "leading" | "lost").
pub fn leadership_transitions() -> Counter<u64> {
    meter()
        .u64_counter("dispatcher.leadership.transitions")
        .with_description("Leader election status changes")
        .build()
}

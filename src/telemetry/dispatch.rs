//! Dispatch span helpers.
//!
//! One span per dequeued event, with per-sink outcomes recorded as events
//! inside it, plus a recorder for controller phase changes.

use tracing::Span;

use crate::model::Event;

/// Start a span covering delivery of one event to every sink.
pub fn start_dispatch_span(event: &Event, worker: usize) -> Span {
    tracing::info_span!(
        "dispatch.event",
        "event.uid" = %event.uid,
        "event.object" = %event.object_key(),
        "event.reason" = %event.reason,
        "dispatch.worker" = worker,
    )
}

/// Record one sink's outcome inside the dispatch span.
pub fn record_sink_result(span: &Span, sink: &str, result: &str, duration_ms: f64) {
    span.in_scope(|| {
        tracing::debug!(sink = sink, result = result, duration_ms, "sink_result");
    });
}

/// Record a controller phase transition.
pub fn record_phase_transition(from: &str, to: &str) {
    tracing::info!(from = from, to = to, "phase_transition");
}

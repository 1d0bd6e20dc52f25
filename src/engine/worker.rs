//! Worker pool draining the dispatch queue into the sink set.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error};

use super::queue::DispatchQueue;
use crate::model::Event;
use crate::sink::Sink;
use crate::telemetry::dispatch::{record_sink_result, start_dispatch_span};
use crate::telemetry::metrics;

/// Read-only sink list shared by every worker.
pub type SinkSet = Arc<[Box<dyn Sink>]>;

/// A fixed number of workers consuming one queue.
pub struct WorkerPool {
    workers: JoinSet<()>,
    size: usize,
}

impl WorkerPool {
    /// Start `size` workers. Each exits when `queue.get` reports shutdown.
    ///
    /// Each item is dispatched on its own task; a panicking sink fails that
    /// item only, and the item is still marked done.
    pub fn spawn(queue: Arc<DispatchQueue>, sinks: SinkSet, size: usize) -> Self {
        let mut workers = JoinSet::new();
        for id in 0..size {
            let queue = Arc::clone(&queue);
            let sinks = Arc::clone(&sinks);
            workers.spawn(async move {
                while let Some(event) = queue.get().await {
                    let uid = event.uid.clone();
                    let span = start_dispatch_span(&event, id);
                    let item = {
                        let sinks = Arc::clone(&sinks);
                        let inner = span.clone();
                        tokio::spawn(
                            async move { dispatch(&sinks, &event, &inner).await }.instrument(span),
                        )
                    };
                    if let Err(e) = item.await {
                        error!(worker = id, uid = %uid, "dispatch task failed: {e}");
                    }
                    queue.done(&uid);
                }
                debug!(worker = id, "worker stopped");
            });
        }
        Self { workers, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for every worker to exit.
    pub async fn join(mut self) {
        while let Some(res) = self.workers.join_next().await {
            if let Err(e) = res {
                error!("worker task failed: {e}");
            }
        }
    }
}

/// Offer one event to every sink in order.
///
/// Send errors are logged and never stop delivery to the remaining sinks.
pub async fn dispatch(sinks: &[Box<dyn Sink>], event: &Event, span: &tracing::Span) {
    for sink in sinks {
        let labels = |result: &'static str| {
            [
                KeyValue::new("sink", sink.name().to_string()),
                KeyValue::new("result", result),
            ]
        };

        if !sink.filter(event) {
            metrics::sink_deliveries().add(1, &labels("filtered"));
            record_sink_result(span, sink.name(), "filtered", 0.0);
            continue;
        }

        let start = Instant::now();
        let result = sink.send(event).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::sink_send_duration_ms()
            .record(elapsed_ms, &[KeyValue::new("sink", sink.name().to_string())]);

        match result {
            Ok(()) => {
                metrics::sink_deliveries().add(1, &labels("ok"));
                record_sink_result(span, sink.name(), "ok", elapsed_ms);
            }
            Err(e) => {
                metrics::sink_deliveries().add(1, &labels("error"));
                record_sink_result(span, sink.name(), "error", elapsed_ms);
                error!(
                    sink = sink.name(),
                    uid = %event.uid,
                    object = %event.object_key(),
                    reason = %event.reason,
                    "send event error: {e}"
                );
            }
        }
    }
}

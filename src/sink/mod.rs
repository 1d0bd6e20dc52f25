//! Delivery targets for dispatched events.
//!
//! A sink is constructed once from configuration, asked to `filter` and
//! `send` every dispatched event, and closed once when the controller
//! stops. Send failures are reported to the caller, which logs them and
//! moves on; a sink can never stall the pipeline.

pub mod console;
pub mod discard;
pub mod search_index;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{FilterConfig, SinksConfig};
use crate::model::Event;

pub use console::ConsoleSink;
pub use discard::DiscardSink;
pub use search_index::{HttpIndexClient, IndexClient, IndexResponse, SearchIndexSink};

/// Why a sink could not be built or could not deliver an event.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid sink configuration: {0}")]
    InvalidConfig(String),
}

/// A delivery target.
///
/// Implementations must be safe to call from several workers at once.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &str;

    /// Return false if the event should not be sent to this sink.
    fn filter(&self, event: &Event) -> bool;

    /// Deliver one event.
    async fn send(&self, event: &Event) -> Result<(), SinkError>;

    /// Release held resources. Called once at shutdown.
    async fn close(&self);
}

/// Allow-list check shared by the built-in sinks.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    types: Vec<String>,
    namespaces: Vec<String>,
}

impl EventFilter {
    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn from_config(config: &FilterConfig) -> Self {
        Self {
            types: config.types.clone(),
            namespaces: config.namespaces.clone(),
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        let type_ok = self.types.is_empty()
            || self
                .types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(event.event_type.as_str()));
        let ns_ok = self.namespaces.is_empty()
            || self
                .namespaces
                .iter()
                .any(|ns| *ns == event.involved_object.namespace);
        type_ok && ns_ok
    }
}

/// Build every configured sink.
///
/// A sink that fails to construct is replaced by a [`DiscardSink`] so the
/// pipeline still runs. With nothing configured, a single discard sink is
/// returned.
pub async fn build_sinks(config: &SinksConfig) -> Vec<Box<dyn Sink>> {
    let filter = EventFilter::from_config(&config.filter);
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();

    if let Some(es) = &config.search_index {
        match SearchIndexSink::connect(es, filter.clone()).await {
            Ok(sink) => {
                info!(sink = sink.name(), index = %es.index, "sink loaded");
                sinks.push(Box::new(sink));
            }
            Err(e) => {
                error!(sink = search_index::NAME, "create sink error: {e}, falling back to discard");
                sinks.push(Box::new(DiscardSink::new()));
            }
        }
    }
    if config.console {
        let sink = ConsoleSink::stdout(filter.clone());
        info!(sink = sink.name(), "sink loaded");
        sinks.push(Box::new(sink));
    }
    if config.discard {
        let sink = DiscardSink::new();
        info!(sink = sink.name(), "sink loaded");
        sinks.push(Box::new(sink));
    }

    if sinks.is_empty() {
        warn!("no sinks configured, events will be discarded");
        sinks.push(Box::new(DiscardSink::new()));
    }
    sinks
}

//! Sink that accepts and drops every event.

use async_trait::async_trait;

use super::{Sink, SinkError};
use crate::model::Event;

pub const NAME: &str = "blackhole";

/// Fallback sink. Keeps the pipeline running when nothing else can.
#[derive(Debug, Default)]
pub struct DiscardSink;

impl DiscardSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sink for DiscardSink {
    fn name(&self) -> &str {
        NAME
    }

    fn filter(&self, _event: &Event) -> bool {
        true
    }

    async fn send(&self, _event: &Event) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&self) {}
}

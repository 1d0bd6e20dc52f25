//! Sink that writes one JSON line per event.

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use super::{EventFilter, Sink, SinkError};
use crate::model::Event;

pub const NAME: &str = "console";

type Output = Pin<Box<dyn AsyncWrite + Send>>;

/// Serializes events to a line-oriented output, stdout by default.
///
/// Lines from concurrent workers never interleave: the output is held for
/// the whole write.
pub struct ConsoleSink {
    out: Mutex<Output>,
    filter: EventFilter,
}

impl ConsoleSink {
    pub fn stdout(filter: EventFilter) -> Self {
        Self::with_writer(tokio::io::stdout(), filter)
    }

    /// Write to an arbitrary output, e.g. a pipe or buffer in tests.
    pub fn with_writer(out: impl AsyncWrite + Send + 'static, filter: EventFilter) -> Self {
        Self {
            out: Mutex::new(Box::pin(out)),
            filter,
        }
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        NAME
    }

    fn filter(&self, event: &Event) -> bool {
        self.filter.matches(event)
    }

    async fn send(&self, event: &Event) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.out.lock().await.flush().await {
            debug!(sink = NAME, "flush on close: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn writes_one_line_per_event_to_an_async_pipe() {
        let (writer, reader) = tokio::io::duplex(64);
        let sink = ConsoleSink::with_writer(writer, EventFilter::accept_all());

        // The pipe buffer is smaller than one line, so send only completes
        // while the reader keeps draining.
        let reading = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let mut got = Vec::new();
            while got.len() < 2 {
                match lines.next_line().await.unwrap() {
                    Some(line) => got.push(line),
                    None => break,
                }
            }
            got
        });

        sink.send(&Event::new("u1", "default", "web-0", "BackOff"))
            .await
            .unwrap();
        sink.send(&Event::new("u2", "default", "web-1", "Pulled"))
            .await
            .unwrap();
        sink.close().await;

        let lines = reading.await.unwrap();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first["uid"], "u1");
        assert_eq!(first["reason"], "BackOff");
        assert!(lines[1].contains("\"u2\""));
    }
}

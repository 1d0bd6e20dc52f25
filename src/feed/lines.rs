//! Change feed reading newline-delimited JSON notifications.
//!
//! Each line is one watch envelope, `{"type": "ADDED", "object": {...}}`.
//! Lines that do not parse are logged and skipped. The stream has no
//! initial list, so the feed reports synced as soon as it starts reading.

use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ChangeFeed, forward};
use crate::error::{Error, Result};
use crate::model::Notification;

type Reader = Pin<Box<dyn AsyncBufRead + Send>>;

pub struct JsonLinesFeed {
    reader: Mutex<Option<Reader>>,
    source: String,
    synced: AtomicBool,
}

impl JsonLinesFeed {
    pub fn new(reader: impl AsyncBufRead + Send + 'static, source: impl Into<String>) -> Self {
        Self {
            reader: Mutex::new(Some(Box::pin(reader))),
            source: source.into(),
            synced: AtomicBool::new(false),
        }
    }

    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), "stdin")
    }

    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(BufReader::new(file), path.display().to_string()))
    }
}

#[async_trait]
impl ChangeFeed for JsonLinesFeed {
    async fn run(&self, out: mpsc::Sender<Notification>, shutdown: CancellationToken) -> Result<()> {
        let reader = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| Error::Feed(format!("{} feed already started", self.source)))?;
        let mut lines = reader.lines();
        self.synced.store(true, Ordering::Release);
        info!(source = %self.source, "reading notifications");

        let mut line_no: u64 = 0;
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                info!(source = %self.source, lines = line_no, "end of notification stream");
                return Ok(());
            };
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Notification>(&line) {
                Ok(n) => {
                    if !forward(&out, &shutdown, n).await {
                        return Ok(());
                    }
                }
                Err(e) => warn!(source = %self.source, line = line_no, "skipping malformed notification: {e}"),
            }
        }
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

//! In-process change feed.
//!
//! Replays a fixed initial list, marks itself synced, then forwards whatever
//! is published through a [`FeedPublisher`]. Used for tests and for
//! embedding the dispatcher in another process.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ChangeFeed, forward};
use crate::error::{Error, Result};
use crate::model::{Event, Notification};

/// Handle for publishing notifications into a [`MemoryFeed`].
#[derive(Clone)]
pub struct FeedPublisher {
    tx: mpsc::UnboundedSender<Notification>,
}

impl FeedPublisher {
    /// Returns false once the feed has stopped.
    pub fn publish(&self, notification: Notification) -> bool {
        self.tx.send(notification).is_ok()
    }

    pub fn added(&self, event: Event) -> bool {
        self.publish(Notification::Added(event))
    }

    pub fn updated(&self, event: Event) -> bool {
        self.publish(Notification::Updated(event))
    }
}

pub struct MemoryFeed {
    initial: Mutex<Vec<Notification>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    tx: mpsc::UnboundedSender<Notification>,
    synced: AtomicBool,
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::with_initial(Vec::new())
    }

    /// Feed whose initial replay contains `events` as additions.
    pub fn with_initial(events: Vec<Event>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            initial: Mutex::new(events.into_iter().map(Notification::Added).collect()),
            rx: Mutex::new(Some(rx)),
            tx,
            synced: AtomicBool::new(false),
        }
    }

    pub fn publisher(&self) -> FeedPublisher {
        FeedPublisher {
            tx: self.tx.clone(),
        }
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn run(&self, out: mpsc::Sender<Notification>, shutdown: CancellationToken) -> Result<()> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| Error::Feed("memory feed already started".to_string()))?;

        let initial = std::mem::take(&mut *self.initial.lock());
        debug!(count = initial.len(), "replaying initial list");
        for n in initial {
            if !forward(&out, &shutdown, n).await {
                return Ok(());
            }
        }
        self.synced.store(true, Ordering::Release);

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                next = rx.recv() => next,
            };
            match next {
                Some(n) => {
                    if !forward(&out, &shutdown, n).await {
                        return Ok(());
                    }
                }
                // The feed itself holds a sender, so this only happens if
                // the channel is closed from outside.
                None => return Ok(()),
            }
        }
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

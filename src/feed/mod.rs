//! Change-feed sources.
//!
//! A change feed replays the current set of event records and then streams
//! every add, update and delete it observes. The controller owns the
//! receiving end of the notification channel; the feed owns the sending
//! end and reports when its initial replay is complete.

pub mod lines;
pub mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::Notification;

pub use lines::JsonLinesFeed;
pub use memory::{FeedPublisher, MemoryFeed};

/// Source of event notifications.
///
/// Contract for implementations:
/// - `run` sends notifications into `out` until `shutdown` is cancelled,
///   the source is exhausted, or `out` is closed. It is called at most once.
/// - `has_synced` becomes true once the initial replay has been sent and
///   never goes back to false.
/// - Nothing is sent after `shutdown` is observed.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn run(&self, out: mpsc::Sender<Notification>, shutdown: CancellationToken) -> Result<()>;

    fn has_synced(&self) -> bool;
}

/// Send one notification unless shutdown wins the race.
///
/// Returns false when the feed should stop.
pub(crate) async fn forward(
    out: &mpsc::Sender<Notification>,
    shutdown: &CancellationToken,
    notification: Notification,
) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        sent = out.send(notification) => sent.is_ok(),
    }
}

//! Controller: consumes the change feed, filters stale events, feeds the
//! dispatch queue and owns the worker pool and sinks for one run.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::DispatchQueue;
use super::staleness::{DEFAULT_MAX_EVENT_AGE, StalenessFilter};
use super::worker::{SinkSet, WorkerPool};
use crate::config::{Config, ControllerConfig};
use crate::error::{Error, Result};
use crate::feed::ChangeFeed;
use crate::model::{Event, Notification};
use crate::sink::{Sink, build_sinks};
use crate::telemetry::dispatch::record_phase_transition;
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Lifecycle phase of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Constructed, `run` not called yet.
    Created,
    /// Feed started, waiting for its initial replay to finish.
    Syncing,
    /// Workers are dispatching.
    Running,
    /// Stop requested; workers finishing in-flight items.
    Draining,
    /// Terminal.
    Stopped,
}

impl Phase {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Created, Syncing)
                | (Syncing, Running)
                | (Syncing, Draining)   // stop requested before sync
                | (Syncing, Stopped)    // sync failed
                | (Running, Draining)
                | (Draining, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == Phase::Stopped
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Created => "created",
            Phase::Syncing => "syncing",
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Tuning for a controller run.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Freshness window for the staleness filter.
    pub max_event_age: Duration,
    /// Upper bound on the initial sync.
    pub sync_timeout: Duration,
    /// How often to re-check `has_synced` while waiting.
    pub sync_poll_interval: Duration,
    /// Buffer between the feed and the notification handler.
    pub channel_capacity: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_event_age: DEFAULT_MAX_EVENT_AGE,
            sync_timeout: Duration::from_secs(60),
            sync_poll_interval: Duration::from_millis(100),
            channel_capacity: 1024,
        }
    }
}

impl From<&ControllerConfig> for ControllerSettings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            max_event_age: config.max_event_age(),
            sync_timeout: config.sync_timeout(),
            channel_capacity: config.channel_capacity.max(1),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// One run of the watch-queue-dispatch pipeline.
///
/// Not restartable: once `run` returns, build a new controller.
pub struct Controller {
    feed: Arc<dyn ChangeFeed>,
    sinks: SinkSet,
    queue: Arc<DispatchQueue>,
    staleness: StalenessFilter,
    settings: ControllerSettings,
    shutdown: CancellationToken,
    phase: watch::Sender<Phase>,
}

impl Controller {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        sinks: Vec<Box<dyn Sink>>,
        settings: ControllerSettings,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Created);
        Self {
            feed,
            sinks: sinks.into(),
            queue: Arc::new(DispatchQueue::new()),
            staleness: StalenessFilter::new(settings.max_event_age),
            settings,
            shutdown: CancellationToken::new(),
            phase,
        }
    }

    /// Build the configured sinks and a controller around them.
    pub async fn from_config(feed: Arc<dyn ChangeFeed>, config: &Config) -> Self {
        let sinks = build_sinks(&config.sinks).await;
        Self::new(feed, sinks, ControllerSettings::from(&config.controller))
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Watch phase changes.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    /// Request a graceful stop. Idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Run until stopped, the feed closes, or startup fails.
    pub async fn run(&self, workers: usize) -> Result<()> {
        if workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        self.transition(Phase::Syncing)?;
        info!(workers, sinks = ?self.sink_names(), "starting event controller");

        let (tx, mut rx) = mpsc::channel(self.settings.channel_capacity);
        let feed_token = self.shutdown.child_token();
        let mut feed_task = Some({
            let feed = Arc::clone(&self.feed);
            let token = feed_token.clone();
            tokio::spawn(async move { feed.run(tx, token).await })
        });

        match self.wait_for_sync(&mut rx, &mut feed_task).await {
            Ok(true) if !self.shutdown.is_cancelled() => {}
            Ok(_) => {
                info!("stop requested before change feed synced");
                self.transition(Phase::Draining)?;
                let feed_result = self.finish(feed_token, rx, feed_task, None).await;
                self.transition(Phase::Stopped)?;
                return feed_result;
            }
            Err(e) => {
                error!("wait for cache sync error: {e}");
                feed_token.cancel();
                self.queue.shutdown();
                drop(rx);
                if let Some(task) = feed_task.take() {
                    task.abort();
                }
                self.close_sinks().await;
                self.transition(Phase::Stopped)?;
                return Err(e);
            }
        }

        self.transition(Phase::Running)?;
        info!("change feed synced, controller started");
        let pool = WorkerPool::spawn(Arc::clone(&self.queue), Arc::clone(&self.sinks), workers);

        let feed_closed = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("stop requested");
                    break false;
                }
                next = rx.recv() => match next {
                    Some(n) => self.on_notification(n),
                    None => {
                        info!("change feed closed");
                        break true;
                    }
                },
            }
        };

        self.transition(Phase::Draining)?;
        if feed_closed {
            // Nothing more will arrive; deliver what is already queued.
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => info!("stop requested while draining"),
                _ = self.queue.wait_idle() => debug!("dispatch queue drained"),
            }
        }
        let result = self.finish(feed_token, rx, feed_task, Some(pool)).await;
        self.transition(Phase::Stopped)?;
        info!("stopping event controller");
        result
    }

    /// Wait for the feed's initial sync, handling notifications meanwhile.
    ///
    /// Returns `Ok(false)` if a stop was requested first, even when the feed
    /// is already synced.
    async fn wait_for_sync(
        &self,
        rx: &mut mpsc::Receiver<Notification>,
        feed_task: &mut Option<JoinHandle<Result<()>>>,
    ) -> Result<bool> {
        let deadline = tokio::time::sleep(self.settings.sync_timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.settings.sync_poll_interval);

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(false);
            }
            if self.feed.has_synced() {
                return Ok(true);
            }
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(false),
                _ = &mut deadline => return Err(Error::SyncTimeout(self.settings.sync_timeout)),
                next = rx.recv() => match next {
                    // Replay before sync goes through the staleness filter
                    // like everything else; workers are not started yet.
                    Some(n) => self.on_notification(n),
                    None => {
                        if self.shutdown.is_cancelled() {
                            return Ok(false);
                        }
                        if self.feed.has_synced() {
                            return Ok(true);
                        }
                        let reason = match join_feed(feed_task).await {
                            Err(e) => e.to_string(),
                            Ok(()) => "feed ended".to_string(),
                        };
                        return Err(Error::SyncFailed(reason));
                    }
                },
                _ = poll.tick() => {}
            }
        }
    }

    /// Drain: stop the queue and feed, join workers, close sinks.
    async fn finish(
        &self,
        feed_token: CancellationToken,
        rx: mpsc::Receiver<Notification>,
        mut feed_task: Option<JoinHandle<Result<()>>>,
        pool: Option<WorkerPool>,
    ) -> Result<()> {
        self.queue.shutdown();
        feed_token.cancel();
        drop(rx);

        let feed_result = join_feed(&mut feed_task).await;
        if let Err(e) = &feed_result {
            error!("change feed error: {e}");
        }
        if let Some(pool) = pool {
            pool.join().await;
        }
        self.close_sinks().await;
        feed_result
    }

    async fn close_sinks(&self) {
        for sink in self.sinks.iter() {
            debug!(sink = sink.name(), "closing sink");
            sink.close().await;
        }
    }

    fn on_notification(&self, notification: Notification) {
        let kind = notification.kind();
        metrics::notifications_received().add(1, &[KeyValue::new("kind", kind)]);
        match notification {
            Notification::Added(event) | Notification::Updated(event) => self.enqueue(event, kind),
            Notification::Deleted(_) => {
                // Nothing to do
            }
        }
    }

    fn enqueue(&self, event: Event, kind: &str) {
        let now = Utc::now();
        let age_ms = now
            .signed_duration_since(event.last_timestamp)
            .num_milliseconds();
        debug!(
            kind,
            uid = %event.uid,
            object = %event.object_key(),
            reason = %event.reason,
            age_ms,
            "event received"
        );
        if !self.staleness.should_process(&event, now) {
            metrics::events_stale().add(1, &[]);
            return;
        }

        let uid = event.uid.clone();
        if self.queue.add(event) {
            metrics::events_enqueued().add(1, &[]);
            info!(uid = %uid, "event to send");
        } else {
            warn!(uid = %uid, "queue shut down, event dropped");
        }
    }

    fn transition(&self, to: Phase) -> Result<()> {
        let mut result = Ok(());
        self.phase.send_if_modified(|current| {
            if current.can_transition_to(to) {
                record_phase_transition(&current.to_string(), &to.to_string());
                *current = to;
                true
            } else {
                result = Err(Error::InvalidTransition { from: *current, to });
                false
            }
        });
        result
    }
}

async fn join_feed(task: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    match task.take() {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(Error::Feed(format!("feed task panicked: {e}"))),
        },
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transitions_follow_lifecycle() {
        use Phase::*;
        assert!(Created.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Running));
        assert!(Syncing.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Stopped));

        assert!(!Created.can_transition_to(Running));
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Syncing));
        assert!(Stopped.is_terminal());
    }

    #[test]
    fn settings_from_config() {
        let config = ControllerConfig {
            max_event_age_secs: 30,
            sync_timeout_secs: 5,
            channel_capacity: 0,
        };
        let settings = ControllerSettings::from(&config);
        assert_eq!(settings.max_event_age, Duration::from_secs(30));
        assert_eq!(settings.sync_timeout, Duration::from_secs(5));
        assert_eq!(settings.channel_capacity, 1);
    }
}

//! Staleness filter applied to notifications before they are queued.
//!
//! The feed's initial replay carries every event record still retained by
//! the control plane. Without this check each restart would redeliver all of
//! them to every sink.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::Event;

/// Default freshness window.
pub const DEFAULT_MAX_EVENT_AGE: Duration = Duration::from_secs(5);

/// Decides whether an event is fresh enough to dispatch.
#[derive(Debug, Clone, Copy)]
pub struct StalenessFilter {
    max_age: Duration,
}

impl Default for StalenessFilter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENT_AGE)
    }
}

impl StalenessFilter {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// True when `now - last_timestamp` is at most the window.
    ///
    /// An age of exactly the window is fresh. Events stamped in the future
    /// (clock skew between control plane and this process) are fresh.
    pub fn should_process(&self, event: &Event, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(event.last_timestamp);
        match age.to_std() {
            Ok(age) => age <= self.max_age,
            // negative age
            Err(_) => true,
        }
    }
}

/// [`StalenessFilter::should_process`] with the default window.
pub fn should_process(event: &Event, now: DateTime<Utc>) -> bool {
    StalenessFilter::default().should_process(event, now)
}

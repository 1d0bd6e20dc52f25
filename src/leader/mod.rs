//! Leader election over a shared lease.
//!
//! The [`LeaderElector`] trait is the storage side: acquire, renew and
//! release a named lease. [`LeaderElection`] drives an elector on a timer
//! and publishes the resulting [`LeaseStatus`] on a watch channel, which is
//! all the dispatch engine looks at.
//!
//! - **Leases, not locks**: a holder keeps leadership only while it renews.
//! - **Fail closed**: a renewal that cannot be confirmed within the renew
//!   deadline is reported as `Lost`.
//! - **Graceful handoff**: the lease is released on shutdown so a standby
//!   replica takes over without waiting for expiry.

pub mod file;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LeaderElectionConfig;
use crate::error::Result;
use crate::telemetry::metrics;

pub use file::FileLeaseElector;
pub use memory::InMemoryLeaderElector;

/// A persisted leadership lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub namespace: String,
    pub name: String,
    /// Identity of the current holder.
    pub holder_identity: String,
    /// Token proving ownership for renew/release.
    pub token: String,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    pub lease_duration_secs: u64,
}

impl Lease {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.renew_time + chrono::Duration::seconds(self.lease_duration_secs as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }
}

/// Result of a leadership acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipResult {
    /// Successfully acquired leadership.
    Acquired {
        /// Lease token that must be used for renewal.
        lease_token: String,
        /// Duration until the lease expires.
        lease_duration: Duration,
    },
    /// Leadership is held by another instance.
    NotLeader {
        /// Identity of the current holder, if known.
        current_leader: Option<String>,
    },
}

impl LeadershipResult {
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }

    #[must_use]
    pub fn lease_token(&self) -> Option<&str> {
        match self {
            Self::Acquired { lease_token, .. } => Some(lease_token),
            Self::NotLeader { .. } => None,
        }
    }
}

/// Result of a lease renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalResult {
    Renewed { lease_duration: Duration },
    /// Lease expired or was taken by another holder.
    Lost,
    /// The token does not match the current lease.
    InvalidToken,
}

impl RenewalResult {
    #[must_use]
    pub const fn is_renewed(&self) -> bool {
        matches!(self, Self::Renewed { .. })
    }
}

/// Storage side of leader election.
///
/// Lock keys are `namespace/name`. All methods may be called concurrently.
#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Take the lease if it is free, expired, or already ours.
    async fn try_acquire(&self, lock_key: &str, identity: &str) -> Result<LeadershipResult>;

    /// Extend a held lease.
    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult>;

    /// Give the lease up. Returns false if it was not ours any more.
    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool>;

    /// Identity of the current unexpired holder.
    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>>;
}

/// What the engine sees of the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseStatus {
    /// Not leading; waiting for the lease.
    Standby,
    /// Holding the lease.
    Leading,
    /// Held the lease and lost it. Terminal.
    Lost,
}

impl std::fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LeaseStatus::Standby => "standby",
            LeaseStatus::Leading => "leading",
            LeaseStatus::Lost => "lost",
        };
        write!(f, "{s}")
    }
}

/// Timing and identity for one election participant.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub namespace: String,
    pub name: String,
    pub identity: String,
    /// How long a lease stays valid without renewal.
    pub lease_duration: Duration,
    /// Leader gives up if it could not renew for this long.
    pub renew_deadline: Duration,
    /// Interval between acquire attempts and between renewals.
    pub retry_period: Duration,
}

impl LeaseConfig {
    pub fn from_config(config: &LeaderElectionConfig, identity: impl Into<String>) -> Self {
        Self {
            namespace: config.resolve_namespace(),
            name: config.name.clone(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(config.lease_duration_secs),
            renew_deadline: Duration::from_secs(config.renew_deadline_secs),
            retry_period: Duration::from_secs(config.retry_period_secs),
        }
    }

    pub fn lock_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Unique participant identity: `<hostname>_<uuid>`.
pub fn default_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}_{}", uuid::Uuid::new_v4())
}

/// Drives a [`LeaderElector`] and publishes [`LeaseStatus`].
pub struct LeaderElection<L> {
    elector: std::sync::Arc<L>,
    config: LeaseConfig,
}

impl<L: LeaderElector + 'static> LeaderElection<L> {
    pub fn new(elector: std::sync::Arc<L>, config: LeaseConfig) -> Self {
        Self { elector, config }
    }

    /// Start campaigning on a background task.
    ///
    /// The task ends after reporting `Lost`, or when `shutdown` fires, in
    /// which case a held lease is released.
    pub fn spawn(
        self,
        shutdown: CancellationToken,
    ) -> (watch::Receiver<LeaseStatus>, JoinHandle<Result<()>>) {
        let (tx, rx) = watch::channel(LeaseStatus::Standby);
        let handle = tokio::spawn(async move { self.campaign(tx, shutdown).await });
        (rx, handle)
    }

    async fn campaign(
        self,
        status: watch::Sender<LeaseStatus>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let key = self.config.lock_key();
        let identity = self.config.identity.clone();
        info!(lease = %key, %identity, "starting leader election");

        // Standby: retry until acquired.
        let token = loop {
            match self.elector.try_acquire(&key, &identity).await {
                Ok(LeadershipResult::Acquired { lease_token, .. }) => break lease_token,
                Ok(LeadershipResult::NotLeader { current_leader }) => {
                    debug!(lease = %key, leader = ?current_leader, "lease held by another replica");
                }
                Err(e) => warn!(lease = %key, "acquire lease error: {e}"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        };

        info!(lease = %key, %identity, "successfully acquired lease");
        publish(&status, LeaseStatus::Leading);

        // Leading: renew until lost or shut down.
        let mut last_renewed = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    match self.elector.release(&key, &token).await {
                        Ok(true) => info!(lease = %key, "released lease"),
                        Ok(false) => warn!(lease = %key, "lease was no longer ours at release"),
                        Err(e) => warn!(lease = %key, "release lease error: {e}"),
                    }
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }

            match self.elector.renew(&key, &token).await {
                Ok(RenewalResult::Renewed { .. }) => {
                    last_renewed = Instant::now();
                    debug!(lease = %key, "renewed lease");
                    continue;
                }
                Ok(other) => {
                    warn!(lease = %key, result = ?other, "lease taken over");
                    publish(&status, LeaseStatus::Lost);
                    return Ok(());
                }
                Err(e) => warn!(lease = %key, "renew lease error: {e}"),
            }

            if last_renewed.elapsed() >= self.config.renew_deadline {
                warn!(lease = %key, "failed to renew lease within renew deadline");
                publish(&status, LeaseStatus::Lost);
                return Ok(());
            }
        }
    }
}

fn publish(status: &watch::Sender<LeaseStatus>, next: LeaseStatus) {
    metrics::leadership_transitions().add(1, &[KeyValue::new("status", next.to_string())]);
    status.send_replace(next);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leadership_result_accessors() {
        let acquired = LeadershipResult::Acquired {
            lease_token: "token".to_string(),
            lease_duration: Duration::from_secs(15),
        };
        assert!(acquired.is_leader());
        assert_eq!(acquired.lease_token(), Some("token"));

        let not_leader = LeadershipResult::NotLeader {
            current_leader: Some("other".to_string()),
        };
        assert!(!not_leader.is_leader());
        assert_eq!(not_leader.lease_token(), None);
    }

    #[test]
    fn renewal_result_is_renewed() {
        assert!(
            RenewalResult::Renewed {
                lease_duration: Duration::from_secs(15)
            }
            .is_renewed()
        );
        assert!(!RenewalResult::Lost.is_renewed());
        assert!(!RenewalResult::InvalidToken.is_renewed());
    }

    #[test]
    fn lease_expiry() {
        let now = Utc::now();
        let lease = Lease {
            namespace: "default".to_string(),
            name: "event-dispatcher".to_string(),
            holder_identity: "a".to_string(),
            token: "t".to_string(),
            acquire_time: now,
            renew_time: now,
            lease_duration_secs: 15,
        };
        assert!(!lease.is_expired(now + chrono::Duration::seconds(14)));
        assert!(lease.is_expired(now + chrono::Duration::seconds(15)));
    }

    #[test]
    fn identity_is_unique_per_call() {
        assert_ne!(default_identity(), default_identity());
    }
}

//! In-process leader elector.
//!
//! Shares leases between participants holding the same
//! `Arc<InMemoryLeaderElector>`. No cross-process coordination; used by tests
//! and single-binary setups.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{Lease, LeaderElector, LeadershipResult, RenewalResult};
use crate::error::Result;

#[derive(Debug)]
pub struct InMemoryLeaderElector {
    leases: RwLock<HashMap<String, Lease>>,
    lease_duration: Duration,
}

impl Default for InMemoryLeaderElector {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

impl InMemoryLeaderElector {
    #[must_use]
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            lease_duration,
        }
    }

    /// Snapshot of the lease stored under `lock_key`, expired or not.
    pub fn lease(&self, lock_key: &str) -> Option<Lease> {
        self.leases.read().get(lock_key).cloned()
    }

    /// Drop a lease without a token, as if it expired.
    pub fn expire(&self, lock_key: &str) {
        self.leases.write().remove(lock_key);
    }

    fn lease_secs(&self) -> u64 {
        self.lease_duration.as_secs().max(1)
    }
}

#[async_trait]
impl LeaderElector for InMemoryLeaderElector {
    async fn try_acquire(&self, lock_key: &str, identity: &str) -> Result<LeadershipResult> {
        let mut leases = self.leases.write();
        let now = Utc::now();

        if let Some(lease) = leases.get(lock_key) {
            if !lease.is_expired(now) && lease.holder_identity != identity {
                return Ok(LeadershipResult::NotLeader {
                    current_leader: Some(lease.holder_identity.clone()),
                });
            }
        }

        let (namespace, name) = split_key(lock_key);
        let lease = Lease {
            namespace,
            name,
            holder_identity: identity.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            acquire_time: now,
            renew_time: now,
            lease_duration_secs: self.lease_secs(),
        };
        let token = lease.token.clone();
        leases.insert(lock_key.to_string(), lease);

        Ok(LeadershipResult::Acquired {
            lease_token: token,
            lease_duration: self.lease_duration,
        })
    }

    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult> {
        let mut leases = self.leases.write();
        let now = Utc::now();

        let Some(lease) = leases.get_mut(lock_key) else {
            return Ok(RenewalResult::Lost);
        };
        if lease.token != lease_token {
            return Ok(RenewalResult::InvalidToken);
        }
        if lease.is_expired(now) {
            return Ok(RenewalResult::Lost);
        }

        lease.renew_time = now;
        Ok(RenewalResult::Renewed {
            lease_duration: self.lease_duration,
        })
    }

    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool> {
        let mut leases = self.leases.write();
        match leases.get(lock_key) {
            Some(lease) if lease.token == lease_token => {
                leases.remove(lock_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        Ok(self
            .leases
            .read()
            .get(lock_key)
            .filter(|lease| !lease.is_expired(now))
            .map(|lease| lease.holder_identity.clone()))
    }
}

pub(crate) fn split_key(lock_key: &str) -> (String, String) {
    match lock_key.split_once('/') {
        Some((ns, name)) => (ns.to_string(), name.to_string()),
        None => ("default".to_string(), lock_key.to_string()),
    }
}

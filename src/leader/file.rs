//! Lease elector backed by files in a shared directory.
//!
//! Each lock key maps to `<namespace>.<name>.lease.json` holding the current
//! [`Lease`], guarded by an exclusive `fs2` lock on a sibling `.lock` file.
//! Every replica pointing at the same directory (a shared volume, or one host)
//! campaigns for the same lease.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;

use super::memory::split_key;
use super::{Lease, LeaderElector, LeadershipResult, RenewalResult};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct FileLeaseElector {
    dir: PathBuf,
    lease_duration: Duration,
}

impl FileLeaseElector {
    /// Use `dir` for lease files, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>, lease_duration: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::Lease(format!("create lease dir {}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            lease_duration,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read the stored lease for `lock_key`, expired or not.
    pub fn read_lease(&self, lock_key: &str) -> Result<Option<Lease>> {
        read_lease(&self.lease_path(lock_key))
    }

    fn lease_path(&self, lock_key: &str) -> PathBuf {
        let (namespace, name) = split_key(lock_key);
        self.dir.join(format!("{namespace}.{name}.lease.json"))
    }

    /// Run `f` on the stored lease while holding the lock file.
    async fn locked<R, F>(&self, lock_key: &str, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Path, Option<Lease>) -> Result<R> + Send + 'static,
    {
        let path = self.lease_path(lock_key);
        tokio::task::spawn_blocking(move || {
            let _guard = acquire_lock(&path)?;
            let current = read_lease(&path)?;
            f(&path, current)
        })
        .await
        .map_err(|e| Error::Lease(format!("lease task failed: {e}")))?
    }
}

fn acquire_lock(lease_path: &Path) -> Result<File> {
    let lock_path = lease_path.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    lock_file
        .lock_exclusive()
        .map_err(|e| Error::Lease(format!("lock {}: {e}", lock_path.display())))?;
    Ok(lock_file)
}

fn read_lease(path: &Path) -> Result<Option<Lease>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temp file so readers never see a partial lease.
fn write_lease(path: &Path, lease: &Lease) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(lease)?)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl LeaderElector for FileLeaseElector {
    async fn try_acquire(&self, lock_key: &str, identity: &str) -> Result<LeadershipResult> {
        let identity = identity.to_string();
        let (namespace, name) = split_key(lock_key);
        let lease_duration = self.lease_duration;

        self.locked(lock_key, move |path, current| {
            let now = Utc::now();
            if let Some(lease) = &current {
                if !lease.is_expired(now) && lease.holder_identity != identity {
                    return Ok(LeadershipResult::NotLeader {
                        current_leader: Some(lease.holder_identity.clone()),
                    });
                }
            }

            let lease = Lease {
                namespace,
                name,
                holder_identity: identity,
                token: uuid::Uuid::new_v4().to_string(),
                acquire_time: now,
                renew_time: now,
                lease_duration_secs: lease_duration.as_secs().max(1),
            };
            write_lease(path, &lease)?;
            Ok(LeadershipResult::Acquired {
                lease_token: lease.token,
                lease_duration,
            })
        })
        .await
    }

    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult> {
        let token = lease_token.to_string();
        let lease_duration = self.lease_duration;

        self.locked(lock_key, move |path, current| {
            let now = Utc::now();
            let Some(mut lease) = current else {
                return Ok(RenewalResult::Lost);
            };
            if lease.token != token {
                return Ok(RenewalResult::InvalidToken);
            }
            if lease.is_expired(now) {
                return Ok(RenewalResult::Lost);
            }
            lease.renew_time = now;
            write_lease(path, &lease)?;
            Ok(RenewalResult::Renewed { lease_duration })
        })
        .await
    }

    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool> {
        let token = lease_token.to_string();
        self.locked(lock_key, move |path, current| match current {
            Some(lease) if lease.token == token => {
                fs::remove_file(path)?;
                Ok(true)
            }
            _ => Ok(false),
        })
        .await
    }

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        Ok(self
            .read_lease(lock_key)?
            .filter(|lease| !lease.is_expired(now))
            .map(|lease| lease.holder_identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "monitoring/event-dispatcher";

    fn elector(dir: &Path) -> FileLeaseElector {
        FileLeaseElector::new(dir, Duration::from_secs(15)).unwrap()
    }

    #[tokio::test]
    async fn acquire_writes_lease_file() {
        let tmp = tempfile::tempdir().unwrap();
        let elector = elector(tmp.path());

        let result = elector.try_acquire(KEY, "host-a_1").await.unwrap();
        assert!(result.is_leader());

        let path = tmp.path().join("monitoring.event-dispatcher.lease.json");
        assert!(path.exists());
        let lease = elector.read_lease(KEY).unwrap().unwrap();
        assert_eq!(lease.holder_identity, "host-a_1");
        assert_eq!(lease.namespace, "monitoring");
        assert_eq!(Some(lease.token.as_str()), result.lease_token());
    }

    #[tokio::test]
    async fn two_electors_share_one_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let a = elector(tmp.path());
        let b = elector(tmp.path());

        let token = a
            .try_acquire(KEY, "a")
            .await
            .unwrap()
            .lease_token()
            .unwrap()
            .to_string();
        assert!(!b.try_acquire(KEY, "b").await.unwrap().is_leader());
        assert_eq!(b.current_leader(KEY).await.unwrap().as_deref(), Some("a"));

        assert!(a.renew(KEY, &token).await.unwrap().is_renewed());
        assert!(a.release(KEY, &token).await.unwrap());
        assert!(b.try_acquire(KEY, "b").await.unwrap().is_leader());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken() {
        let tmp = tempfile::tempdir().unwrap();
        let elector = elector(tmp.path());
        let token = elector
            .try_acquire(KEY, "a")
            .await
            .unwrap()
            .lease_token()
            .unwrap()
            .to_string();

        // Age the lease past its duration.
        let mut lease = elector.read_lease(KEY).unwrap().unwrap();
        lease.renew_time = Utc::now() - chrono::Duration::seconds(60);
        write_lease(&elector.lease_path(KEY), &lease).unwrap();

        assert_eq!(elector.current_leader(KEY).await.unwrap(), None);
        assert_eq!(elector.renew(KEY, &token).await.unwrap(), RenewalResult::Lost);
        assert!(elector.try_acquire(KEY, "b").await.unwrap().is_leader());
    }

    #[tokio::test]
    async fn release_with_stale_token_keeps_lease() {
        let tmp = tempfile::tempdir().unwrap();
        let elector = elector(tmp.path());
        elector.try_acquire(KEY, "a").await.unwrap();

        assert!(!elector.release(KEY, "stale").await.unwrap());
        assert_eq!(
            elector.current_leader(KEY).await.unwrap().as_deref(),
            Some("a")
        );
    }
}

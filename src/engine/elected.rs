//! Lease-gated controller lifecycle for multi-replica deployments.
//!
//! The replica waits in standby until the lease status stream reports
//! `Leading`, then runs one fresh controller. Losing the lease while running
//! stops the controller and ends the run with [`Error::LeadershipLost`];
//! this process must not keep dispatching once it may no longer be leader.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::control::Controller;
use crate::error::{Error, Result};
use crate::leader::LeaseStatus;

/// Run a controller only while this replica holds the lease.
///
/// `build` is called once, after leadership is acquired. Returns `Ok(())`
/// when `shutdown` fires (in standby or while running) and
/// `Err(Error::LeadershipLost)` when the lease is lost.
pub async fn run_elected<F, Fut>(
    mut status: watch::Receiver<LeaseStatus>,
    shutdown: CancellationToken,
    workers: usize,
    build: F,
) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Controller>>,
{
    info!("waiting for leadership");
    loop {
        match *status.borrow_and_update() {
            LeaseStatus::Leading => break,
            LeaseStatus::Lost => {
                return Err(Error::LeadershipLost(
                    "lease lost before controller started".to_string(),
                ));
            }
            LeaseStatus::Standby => {}
        }
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested while in standby");
                return Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return Err(Error::LeadershipLost("lease status stream closed".to_string()));
                }
            }
        }
    }

    info!("started leading");
    let controller = Arc::new(build().await?);
    let lost = Arc::new(AtomicBool::new(false));

    let watcher = {
        let controller = Arc::clone(&controller);
        let lost = Arc::clone(&lost);
        tokio::spawn(async move {
            loop {
                if *status.borrow_and_update() == LeaseStatus::Lost {
                    lost.store(true, Ordering::SeqCst);
                    controller.stop();
                    return;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        controller.stop();
                        return;
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            lost.store(true, Ordering::SeqCst);
                            controller.stop();
                            return;
                        }
                    }
                }
            }
        })
    };

    let result = controller.run(workers).await;
    watcher.abort();

    if lost.load(Ordering::SeqCst) {
        error!("leadership lost, dispatching stopped");
        return Err(Error::LeadershipLost(
            "lease lost while dispatching".to_string(),
        ));
    }
    result
}

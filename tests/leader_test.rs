//! Integration tests for leader election and the lease-gated controller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use event_dispatcher::engine::{Controller, ControllerSettings, Phase, run_elected};
use event_dispatcher::error::{Error, Result};
use event_dispatcher::feed::{FeedPublisher, MemoryFeed};
use event_dispatcher::leader::{
    InMemoryLeaderElector, LeaderElection, LeaderElector, LeadershipResult, LeaseConfig,
    LeaseStatus, RenewalResult,
};
use event_dispatcher::model::Event;
use event_dispatcher::sink::{DiscardSink, Sink, SinkError};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const KEY: &str = "default/event-dispatcher";

fn lease_config(identity: &str) -> LeaseConfig {
    LeaseConfig {
        namespace: "default".to_string(),
        name: "event-dispatcher".to_string(),
        identity: identity.to_string(),
        lease_duration: Duration::from_secs(1),
        renew_deadline: Duration::from_millis(300),
        retry_period: Duration::from_millis(50),
    }
}

fn controller() -> Controller {
    let sinks: Vec<Box<dyn Sink>> = vec![Box::new(DiscardSink::new())];
    Controller::new(
        Arc::new(MemoryFeed::new()),
        sinks,
        ControllerSettings::default(),
    )
}

async fn wait_for_status(rx: &mut watch::Receiver<LeaseStatus>, status: LeaseStatus) {
    tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| *s == status))
        .await
        .unwrap_or_else(|_| panic!("status never became {status}"))
        .unwrap();
}

// ---------------------------------------------------------------------------
// Election
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_leader_and_handover_on_release() {
    let elector = Arc::new(InMemoryLeaderElector::new(Duration::from_secs(1)));

    let token_a = CancellationToken::new();
    let (mut status_a, task_a) =
        LeaderElection::new(Arc::clone(&elector), lease_config("a")).spawn(token_a.clone());
    wait_for_status(&mut status_a, LeaseStatus::Leading).await;

    let token_b = CancellationToken::new();
    let (mut status_b, task_b) =
        LeaderElection::new(Arc::clone(&elector), lease_config("b")).spawn(token_b.clone());

    // B keeps retrying while A renews.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*status_b.borrow(), LeaseStatus::Standby);
    assert_eq!(elector.current_leader(KEY).await.unwrap().as_deref(), Some("a"));

    token_a.cancel();
    task_a.await.unwrap().unwrap();
    wait_for_status(&mut status_b, LeaseStatus::Leading).await;
    assert_eq!(elector.current_leader(KEY).await.unwrap().as_deref(), Some("b"));

    token_b.cancel();
    task_b.await.unwrap().unwrap();
    assert_eq!(elector.current_leader(KEY).await.unwrap(), None);
}

#[tokio::test]
async fn taken_over_lease_reports_lost() {
    let elector = Arc::new(InMemoryLeaderElector::new(Duration::from_secs(1)));
    let token = CancellationToken::new();
    let (mut status, task) =
        LeaderElection::new(Arc::clone(&elector), lease_config("a")).spawn(token.clone());
    wait_for_status(&mut status, LeaseStatus::Leading).await;

    elector.expire(KEY);
    assert!(elector.try_acquire(KEY, "b").await.unwrap().is_leader());

    wait_for_status(&mut status, LeaseStatus::Lost).await;
    task.await.unwrap().unwrap();
}

/// Grants the lease once, then every store call fails.
#[derive(Default)]
struct FlakyStore {
    granted: Mutex<bool>,
}

#[async_trait]
impl LeaderElector for FlakyStore {
    async fn try_acquire(&self, _lock_key: &str, _identity: &str) -> Result<LeadershipResult> {
        *self.granted.lock() = true;
        Ok(LeadershipResult::Acquired {
            lease_token: "t".to_string(),
            lease_duration: Duration::from_secs(1),
        })
    }

    async fn renew(&self, _lock_key: &str, _lease_token: &str) -> Result<RenewalResult> {
        Err(Error::Lease("store unavailable".to_string()))
    }

    async fn release(&self, _lock_key: &str, _lease_token: &str) -> Result<bool> {
        Ok(false)
    }

    async fn current_leader(&self, _lock_key: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[tokio::test]
async fn renewals_failing_past_deadline_report_lost() {
    let store = Arc::new(FlakyStore::default());
    let (mut status, task) =
        LeaderElection::new(Arc::clone(&store), lease_config("a")).spawn(CancellationToken::new());

    wait_for_status(&mut status, LeaseStatus::Leading).await;
    wait_for_status(&mut status, LeaseStatus::Lost).await;
    assert!(*store.granted.lock());
    task.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// run_elected
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_in_standby_never_builds() {
    let (_tx, rx) = watch::channel(LeaseStatus::Standby);
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let result = run_elected(rx, shutdown, 1, || async {
        Err(Error::Other("controller built in standby".to_string()))
    })
    .await;
    assert!(result.is_ok(), "got {result:?}");
}

#[tokio::test]
async fn lost_before_leading_is_fatal() {
    let (tx, rx) = watch::channel(LeaseStatus::Standby);
    tx.send_replace(LeaseStatus::Lost);

    let result = run_elected(rx, CancellationToken::new(), 1, || async { Ok(controller()) }).await;
    assert!(matches!(result, Err(Error::LeadershipLost(_))));
}

#[tokio::test]
async fn shutdown_while_leading_stops_cleanly() {
    let (tx, rx) = watch::channel(LeaseStatus::Leading);
    let shutdown = CancellationToken::new();
    let phases = Arc::new(Mutex::new(None));

    let run = {
        let shutdown = shutdown.clone();
        let phases = Arc::clone(&phases);
        tokio::spawn(async move {
            run_elected(rx, shutdown, 1, || async move {
                let controller = controller();
                *phases.lock() = Some(controller.subscribe());
                Ok(controller)
            })
            .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("run_elected did not return")
        .unwrap();
    assert!(result.is_ok());
    drop(tx);

    let phase = phases.lock().as_ref().map(|rx| *rx.borrow());
    assert_eq!(phase, Some(Phase::Stopped));
}

/// One replica: its own election runner, feed and recording sink. The feed
/// is opened when the replica starts leading, like a fresh watch.
struct Replica {
    status: watch::Receiver<LeaseStatus>,
    publisher: Arc<Mutex<Option<FeedPublisher>>>,
    phases: Arc<Mutex<Option<watch::Receiver<Phase>>>>,
    delivered: Arc<Mutex<Vec<String>>>,
    run: JoinHandle<Result<()>>,
}

impl Replica {
    fn start(elector: &Arc<InMemoryLeaderElector>, identity: &str) -> Self {
        let (status, _election) = LeaderElection::new(Arc::clone(elector), lease_config(identity))
            .spawn(CancellationToken::new());
        let publisher = Arc::new(Mutex::new(None));
        let phases = Arc::new(Mutex::new(None));
        let delivered = Arc::new(Mutex::new(Vec::new()));

        let run = {
            let status = status.clone();
            let publisher = Arc::clone(&publisher);
            let phases = Arc::clone(&phases);
            let delivered = Arc::clone(&delivered);
            tokio::spawn(async move {
                run_elected(status, CancellationToken::new(), 1, || async move {
                    let feed = MemoryFeed::new();
                    *publisher.lock() = Some(feed.publisher());
                    let sinks: Vec<Box<dyn Sink>> = vec![Box::new(RecordingSink(delivered))];
                    let controller =
                        Controller::new(Arc::new(feed), sinks, ControllerSettings::default());
                    *phases.lock() = Some(controller.subscribe());
                    Ok(controller)
                })
                .await
            })
        };

        Self {
            status,
            publisher,
            phases,
            delivered,
            run,
        }
    }

    /// Offer an event to this replica's watch, if it has one open.
    fn observe(&self, uid: &str) {
        if let Some(publisher) = self.publisher.lock().as_ref() {
            publisher.added(Event::new(uid, "default", "web-0", "Started"));
        }
    }

    fn delivered(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }

    async fn wait_running(&self) {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let running = self
                    .phases
                    .lock()
                    .as_ref()
                    .is_some_and(|rx| *rx.borrow() == Phase::Running);
                if running {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("replica never started dispatching");
    }

    async fn wait_delivered(&self, uid: &str) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !self.delivered.lock().iter().any(|u| u == uid) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{uid} was never delivered"));
    }
}

struct RecordingSink(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn filter(&self, _event: &Event) -> bool {
        true
    }

    async fn send(&self, event: &Event) -> std::result::Result<(), SinkError> {
        self.0.lock().push(event.uid.to_string());
        Ok(())
    }

    async fn close(&self) {}
}

/// Two replicas share one lease; only the leader dispatches. When the lease
/// moves, the old leader stops with a fatal error and the new one takes over.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_the_lease_holder_dispatches_across_a_handover() {
    let elector = Arc::new(InMemoryLeaderElector::new(Duration::from_secs(1)));

    let mut a = Replica::start(&elector, "a");
    a.wait_running().await;
    let mut b = Replica::start(&elector, "b");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(*b.status.borrow(), LeaseStatus::Standby);

    a.observe("e1");
    b.observe("e1");
    a.wait_delivered("e1").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.delivered().is_empty(), "standby replica dispatched");

    // The lease is taken from A.
    elector.expire(KEY);
    wait_for_status(&mut b.status, LeaseStatus::Leading).await;
    let result = tokio::time::timeout(Duration::from_secs(3), &mut a.run)
        .await
        .expect("old leader kept running")
        .unwrap();
    assert!(matches!(result, Err(Error::LeadershipLost(_))));
    let phase = a.phases.lock().as_ref().map(|rx| *rx.borrow());
    assert_eq!(phase, Some(Phase::Stopped));
    b.wait_running().await;

    a.observe("e2");
    b.observe("e2");
    b.wait_delivered("e2").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(a.delivered(), vec!["e1".to_string()]);
    assert_eq!(b.delivered(), vec!["e2".to_string()]);
    assert_eq!(elector.current_leader(KEY).await.unwrap().as_deref(), Some("b"));
    b.run.abort();
}

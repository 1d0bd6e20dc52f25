//! Deduplicating dispatch queue between the notification handler and workers.
//!
//! At most one entry per UID is pending at a time. A UID that is re-added
//! while pending has its payload replaced (newest wins). A UID re-added while
//! a worker holds it is parked and queued again once the worker calls
//! [`DispatchQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::model::{Event, Uid};

#[derive(Default)]
struct Inner {
    /// Pending order. Every UID here also has an entry in `dirty`.
    order: VecDeque<Uid>,
    /// Latest payload per UID that still needs processing.
    dirty: HashMap<Uid, Event>,
    /// UIDs handed out by `get` and not yet marked `done`.
    processing: HashSet<Uid>,
    shutting_down: bool,
}

impl Inner {
    fn is_idle(&self) -> bool {
        self.order.is_empty() && self.processing.is_empty()
    }
}

/// Concurrency-safe work queue with dedup-on-identity.
#[derive(Default)]
pub struct DispatchQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    /// Signalled when the queue becomes idle or shuts down.
    idle: Notify,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event. Returns false if the queue is shut down.
    ///
    /// Coalesces with a pending entry for the same UID.
    pub fn add(&self, event: Event) -> bool {
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            return false;
        }

        let uid = event.uid.clone();
        if inner.dirty.insert(uid.clone(), event).is_some() {
            // already pending (or parked behind an in-flight item)
            return true;
        }
        if inner.processing.contains(&uid) {
            return true;
        }

        inner.order.push_back(uid);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Wait for the next event. `None` means the queue was shut down.
    ///
    /// Every `Some` must be followed by exactly one [`done`](Self::done).
    pub async fn get(&self) -> Option<Event> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent
            // notify_waiters from shutdown cannot slip between the two.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.shutting_down {
                    return None;
                }
                if let Some(uid) = inner.order.pop_front() {
                    let more = !inner.order.is_empty();
                    if let Some(event) = inner.dirty.remove(&uid) {
                        inner.processing.insert(uid);
                        drop(inner);
                        if more {
                            self.notify.notify_one();
                        }
                        return Some(event);
                    }
                    continue;
                }
            }

            notified.await;
        }
    }

    /// Release the in-flight marker for `uid`.
    ///
    /// If the UID was re-added while in flight it goes back on the queue.
    pub fn done(&self, uid: &Uid) {
        let mut inner = self.inner.lock();
        if !inner.processing.remove(uid) {
            return;
        }
        if inner.dirty.contains_key(uid) && !inner.shutting_down {
            inner.order.push_back(uid.clone());
            drop(inner);
            self.notify.notify_one();
            return;
        }
        let idle = inner.is_idle();
        drop(inner);
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Wait until nothing is pending and nothing is in flight, or until the
    /// queue is shut down.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            {
                let inner = self.inner.lock();
                if inner.shutting_down || inner.is_idle() {
                    return;
                }
            }

            idle.await;
        }
    }

    /// Stop handing out work. Idempotent.
    ///
    /// Wakes every waiting `get`; current and future calls return `None`.
    /// Items already handed out are unaffected.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutting_down = true;
        drop(inner);
        self.notify.notify_waiters();
        self.idle.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Number of pending (not in-flight) entries.
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries handed out and not yet marked done.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().processing.len()
    }
}

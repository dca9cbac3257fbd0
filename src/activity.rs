//! Activity Tracker and graceful-pause support.
//!
//! Every in-flight unit of work (an RPC call, a transaction) registers
//! itself here for the duration it runs. A graceful shutdown first calls
//! [`ActivityTracker::pause`] to stop new work from registering, then
//! [`ActivityTracker::drain`] to wait for whatever was already in flight to
//! finish before the process exits.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A single tracked unit of work.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    /// Unique id for this activity.
    pub id: Uuid,
    /// Free-form label (e.g. the RPC method name) for diagnostics.
    pub kind: String,
    /// When the activity began.
    pub started_at: Instant,
}

struct Inner {
    active: DashMap<Uuid, ActivityRecord>,
    paused: AtomicBool,
}

/// Tracks in-flight activities across the server and coordinates graceful
/// pause/drain for shutdown.
#[derive(Clone)]
pub struct ActivityTracker {
    inner: Arc<Inner>,
}

impl ActivityTracker {
    /// Builds an empty, unpaused tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                active: DashMap::new(),
                paused: AtomicBool::new(false),
            }),
        }
    }

    /// Registers a new activity, returning a guard that deregisters it on
    /// drop. Fails if the tracker is paused.
    pub fn begin(&self, kind: impl Into<String>) -> Result<ActivityGuard> {
        if self.inner.paused.load(Ordering::SeqCst) {
            return Err(Error::NotSupported(
                "server is pausing; rejecting new activity".to_string(),
            ));
        }

        let record = ActivityRecord {
            id: Uuid::new_v4(),
            kind: kind.into(),
            started_at: Instant::now(),
        };
        let id = record.id;
        self.inner.active.insert(id, record);

        Ok(ActivityGuard {
            tracker: self.clone(),
            id,
        })
    }

    /// Whether the tracker is currently rejecting new activity.
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Stops new activities from registering. Already-running ones are
    /// unaffected.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    /// Resumes accepting new activities.
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    /// Number of activities currently in flight.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// A snapshot of every currently in-flight activity.
    pub fn active_snapshot(&self) -> Vec<ActivityRecord> {
        self.inner.active.iter().map(|e| e.value().clone()).collect()
    }

    /// Waits for every in-flight activity to complete, polling until either
    /// the count reaches zero or `timeout` elapses. Returns `true` if fully
    /// drained, `false` if the timeout was hit first. Does not pause the
    /// tracker itself — call [`ActivityTracker::pause`] first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.active_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(25)).await;
        }
    }

    fn end(&self, id: Uuid) {
        self.inner.active.remove(&id);
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by [`ActivityTracker::begin`]; deregisters the
/// activity when dropped.
pub struct ActivityGuard {
    tracker: ActivityTracker,
    id: Uuid,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.tracker.end(self.id);
    }
}

//! Long-Timeout Utility.
//!
//! Schedules a callback to run after a delay that may exceed a single
//! timer's safe maximum duration, by chaining sleeps in bounded chunks.
//! Cancellable at any point before it fires.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The longest single chunk this utility will ever sleep for. Chosen to
/// match the largest delay representable by a 32-bit millisecond timer
/// (~24.8 days), the constraint this utility exists to work around even
/// though `tokio::time::sleep` itself has no such limit.
pub const MAX_CHUNK: Duration = Duration::from_millis(i32::MAX as u64);

/// A handle to a scheduled long-timeout. Dropping it does not cancel the
/// timer; call [`LongTimeoutHandle::cancel`] explicitly.
pub struct LongTimeoutHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LongTimeoutHandle {
    /// Cancels the pending timeout. A no-op if it already fired.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the timeout has fired or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the timeout to fire (or be cancelled).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Schedules `callback` to run after `min(delay, max)`, chaining sleeps
/// longer than [`MAX_CHUNK`] into multiple waits. `max` is `None` when the
/// caller has no upper bound to enforce.
pub fn schedule<F>(delay: Duration, max: Option<Duration>, callback: F) -> LongTimeoutHandle
where
    F: FnOnce() + Send + 'static,
{
    schedule_async(delay, max, move || {
        callback();
        std::future::ready(())
    })
}

/// As [`schedule`], but the callback itself is async.
pub fn schedule_async<F, Fut>(delay: Duration, max: Option<Duration>, callback: F) -> LongTimeoutHandle
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let delay = match max {
        Some(max) => delay.min(max),
        None => delay,
    };

    let cancel = CancellationToken::new();
    let cancel_child = cancel.clone();

    let task = tokio::spawn(async move {
        let mut remaining = delay;
        loop {
            let chunk = remaining.min(MAX_CHUNK);
            tokio::select! {
                _ = tokio::time::sleep(chunk) => {}
                _ = cancel_child.cancelled() => return,
            }
            remaining = remaining.saturating_sub(chunk);
            if remaining.is_zero() {
                break;
            }
        }
        callback().await;
    });

    LongTimeoutHandle { cancel, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let handle = schedule(Duration::from_millis(10), None, move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        handle.join().await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_before_fire_prevents_callback() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let handle = schedule(Duration::from_secs(3600), None, move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        handle.cancel();
        handle.join().await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn async_callback_runs() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let handle = schedule_async(Duration::from_millis(5), None, move || async move {
            fired_clone.store(true, Ordering::SeqCst);
        });
        handle.join().await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn max_clamps_delay_below_requested() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let handle = schedule(
            Duration::from_secs(3600),
            Some(Duration::from_millis(10)),
            move || {
                fired_clone.store(true, Ordering::SeqCst);
            },
        );
        handle.join().await;
        assert!(fired.load(Ordering::SeqCst));
    }
}

//! Supervised Background Tasks
//!
//! Every long-lived worker in logreceiver (partition flushers, the retention
//! pruner, the filter processor) follows the same contract:
//!
//! - run until cancelled
//! - if the work function fails or panics, log it and start it again after a
//!   fixed delay, so a crashed worker never silently stops flushing/scanning
//! - sleep cooperatively: a sleeping worker can be woken early (for example
//!   by a dirty signal) and notices cancellation immediately
//!
//! ## Architecture
//!
//! ```text
//! SupervisedTask ──spawn──▶ supervisor loop
//!      │                        │
//!      │ wake()                 ├──spawn──▶ work(ctx)   ── Ok  ─▶ run again
//!      │ stop()                 │                       ── Err ─▶ log, wait restart_delay
//!      ▼                        │                       ── panic ▶ log, wait restart_delay
//!  Notify / watch ◀──── TaskContext::sleep()
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let task = SupervisedTask::spawn("flusher", Duration::from_secs(10), |ctx| async move {
//!     while ctx.sleep(Duration::from_secs(1)).await {
//!         flush().await?;
//!     }
//!     Ok(())
//! });
//!
//! task.wake();        // cut the current sleep short
//! task.stop().await;  // cancel and wait for the worker to exit
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Delay before a crashed worker is started again.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(10);

/// Handle given to the work function.
#[derive(Clone)]
pub struct TaskContext {
    name: Arc<str>,
    cancel: watch::Receiver<bool>,
    wake: Arc<Notify>,
}

impl TaskContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || self.cancel.has_changed().is_err()
    }

    /// Sleeps for `duration`, returning early on `wake()` or cancellation.
    ///
    /// Returns `false` if the task has been cancelled, either before or
    /// during the sleep. A wake issued while the worker was busy is kept and
    /// ends the next sleep immediately.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
            _ = cancel.wait_for(|cancelled| *cancelled) => {}
        }
        !self.is_cancelled()
    }

    /// Resolves once the task has been cancelled.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        // An error means the handle was dropped, which also cancels.
        let _ = cancel.wait_for(|cancelled| *cancelled).await;
    }

    /// Like `sleep`, but ignores wake-ups.
    async fn sleep_uninterruptible(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancelled() => {}
        }
        !self.is_cancelled()
    }
}

/// A background worker that restarts itself after failures.
pub struct SupervisedTask {
    name: Arc<str>,
    cancel: watch::Sender<bool>,
    wake: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SupervisedTask {
    /// Spawns `work` on the tokio runtime under supervision.
    ///
    /// `work` is called again every time the previous invocation returns,
    /// until the task is cancelled. Work functions are expected to loop on
    /// [`TaskContext::sleep`] and return once it yields `false`.
    pub fn spawn<F, Fut>(name: impl Into<String>, restart_delay: Duration, work: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name: Arc<str> = Arc::from(name.into());
        let (cancel, cancel_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());

        let ctx = TaskContext {
            name: Arc::clone(&name),
            cancel: cancel_rx,
            wake: Arc::clone(&wake),
        };
        let handle = tokio::spawn(supervise(ctx, restart_delay, work));

        Self {
            name,
            cancel,
            wake,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ends the worker's current (or next) sleep early.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Requests cancellation without waiting for the worker.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
        self.wake.notify_one();
    }

    /// Cancels the worker and waits until it has exited.
    pub async fn stop(&self) {
        self.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(task = %self.name, error = %e, "Supervisor exited abnormally");
            }
        }
    }
}

impl Drop for SupervisedTask {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

async fn supervise<F, Fut>(ctx: TaskContext, restart_delay: Duration, work: F)
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    info!(task = %ctx.name, "Background task started");

    while !ctx.is_cancelled() {
        let outcome = tokio::spawn(work(ctx.clone())).await;

        let failure = match outcome {
            Ok(Ok(())) => {
                if !ctx.is_cancelled() {
                    debug!(task = %ctx.name, "Work function returned, running it again");
                }
                continue;
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(join_error) if join_error.is_panic() => "work function panicked".to_string(),
            Err(join_error) => join_error.to_string(),
        };

        error!(
            task = %ctx.name,
            error = %failure,
            restart_delay_ms = restart_delay.as_millis() as u64,
            "Background task crashed, restarting after delay"
        );

        if !ctx.sleep_uninterruptible(restart_delay).await {
            break;
        }
    }

    info!(task = %ctx.name, "Background task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_stop_ends_sleeping_worker() {
        let task = SupervisedTask::spawn("sleeper", DEFAULT_RESTART_DELAY, |ctx| async move {
            while ctx.sleep(Duration::from_secs(3600)).await {}
            Ok(())
        });

        tokio::time::timeout(Duration::from_secs(5), task.stop())
            .await
            .expect("stop should not wait for the sleep to elapse");
        assert!(task.is_cancelled());
    }

    #[tokio::test]
    async fn test_wake_cuts_sleep_short() {
        let iterations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&iterations);

        let task = SupervisedTask::spawn("waker", DEFAULT_RESTART_DELAY, move |ctx| {
            let counter = Arc::clone(&counter);
            async move {
                while ctx.sleep(Duration::from_secs(3600)).await {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
        });

        task.wake();
        for _ in 0..100 {
            if iterations.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(iterations.load(Ordering::SeqCst), 1);

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_after_error() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let task = SupervisedTask::spawn("failing", Duration::from_secs(10), move |ctx| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("first run fails");
                }
                ctx.cancelled().await;
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1, "restart must wait for the delay");

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_after_panic() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let task = SupervisedTask::spawn("panicking", Duration::from_secs(1), move |ctx| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("boom");
                }
                ctx.cancelled().await;
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        task.stop().await;
    }

    #[tokio::test]
    async fn test_sleep_after_cancel_returns_false() {
        let (tx, rx) = watch::channel(true);
        let ctx = TaskContext {
            name: Arc::from("ctx"),
            cancel: rx,
            wake: Arc::new(Notify::new()),
        };
        assert!(!ctx.sleep(Duration::from_secs(3600)).await);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_restart_delay() {
        let task = SupervisedTask::spawn("crashy", Duration::from_secs(3600), |_ctx| async move {
            anyhow::bail!("always fails")
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tokio::time::timeout(Duration::from_secs(1), task.stop())
            .await
            .expect("stop must interrupt the restart delay");
    }
}

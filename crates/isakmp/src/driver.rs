//! Background expiry task
//!
//! Runs [`SaManager::run_timers`] on a tokio task. The task sleeps until
//! the earliest pending expiry, or the idle interval when nothing is
//! pending, and can be woken early after new timers are armed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::manager::SaManager;

/// Default sleep when no timer is pending
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(1);

/// Expiry task handle
///
/// Manages a background task that fires due SA expirations.
pub struct ExpiryTask {
    /// Sleep bound when idle
    idle_interval: Duration,
    /// Stop signal
    stop_signal: Arc<AtomicBool>,
    /// Early wake-up
    wake: Arc<Notify>,
    /// Task handle
    task_handle: Option<JoinHandle<()>>,
}

impl Default for ExpiryTask {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_INTERVAL)
    }
}

impl ExpiryTask {
    /// Creates a new expiry task (but doesn't start it).
    pub fn new(idle_interval: Duration) -> Self {
        Self {
            idle_interval,
            stop_signal: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            task_handle: None,
        }
    }

    /// Starts the task on the current tokio runtime.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let manager = Arc::new(Mutex::new(SaManager::new(SaConfig::default())?));
    /// let mut task = ExpiryTask::default();
    /// task.start(Arc::clone(&manager));
    /// ```
    pub fn start(&mut self, manager: Arc<Mutex<SaManager>>) {
        let idle = self.idle_interval;
        let stop_signal = Arc::clone(&self.stop_signal);
        let wake = Arc::clone(&self.wake);

        let handle = tokio::spawn(async move {
            debug!("Expiry task started, idle interval {:?}", idle);

            loop {
                if stop_signal.load(Ordering::Relaxed) {
                    break;
                }

                let (fired, next) = {
                    let mut mgr = manager.lock().await;
                    (mgr.run_timers(), mgr.time_to_next_expiry())
                };
                if fired > 0 {
                    debug!("Fired {} SA expirations", fired);
                }

                let sleep_for = next.map_or(idle, |d| d.min(idle));
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = wake.notified() => {}
                }
            }

            debug!("Expiry task stopped");
        });

        self.task_handle = Some(handle);
    }

    /// Wakes the task so it re-reads the timer queue.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stops the task.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        self.wake.notify_one();

        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }

    /// Returns whether the task is running.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ExpiryTask {
    fn drop(&mut self) {
        self.stop();
    }
}

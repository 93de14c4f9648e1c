//! Cooperative stop / pause handle shared by the engine's long-running loops
//!
//! Every loop checks [`WorkerControl::is_stopped`] at its iteration
//! boundaries and calls [`WorkerControl::wait_if_paused`] between items.
//! Blocking waits (long-poll, listings) race against
//! [`WorkerControl::cancelled`] inside `tokio::select!`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fallback re-check period while paused, in case a wakeup is missed
const DEFAULT_PAUSE_SLEEP: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct PauseState {
    paused: AtomicBool,
    resumed: Notify,
    sleep: Duration,
}

/// Cloneable stop/pause handle
#[derive(Debug, Clone)]
pub struct WorkerControl {
    token: CancellationToken,
    pause: Arc<PauseState>,
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::with_pause_sleep(DEFAULT_PAUSE_SLEEP)
    }

    /// Uses `sleep` as the re-check period while paused
    pub fn with_pause_sleep(sleep: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            pause: Arc::new(PauseState {
                paused: AtomicBool::new(false),
                resumed: Notify::new(),
                sleep,
            }),
        }
    }

    /// A handle stopped together with this one, but stoppable on its own
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            pause: Arc::clone(&self.pause),
        }
    }

    pub fn stop(&self) {
        debug!("Stop requested");
        self.token.cancel();
        // wake paused loops so that they observe the stop
        self.pause.resumed.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once [`Self::stop`] has been called
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn pause(&self) {
        debug!("Pause requested");
        self.pause.paused.store(true, Ordering::Release);
    }

    pub fn unpause(&self) {
        debug!("Unpause requested");
        self.pause.paused.store(false, Ordering::Release);
        self.pause.resumed.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.pause.paused.load(Ordering::Acquire)
    }

    /// Waits while paused; returns early if stopped
    pub async fn wait_if_paused(&self) {
        while self.is_paused() && !self.is_stopped() {
            tokio::select! {
                _ = self.pause.resumed.notified() => {}
                _ = self.token.cancelled() => {}
                _ = tokio::time::sleep(self.pause.sleep) => {}
            }
        }
    }
}

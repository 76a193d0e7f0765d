//! Cooperative cancellation for a pipeline run.
//!
//! A single `AbortController` is threaded through every long operation:
//! runtime spawns register their child process, retry sleeps use
//! [`AbortController::sleep`], and the runner calls
//! [`AbortController::checkpoint`] between groups. Calling `abort()` kills
//! registered children with a SIGTERM that escalates to SIGKILL after five
//! seconds, and wakes every pending sleeper with an `AbortedError`.

use crate::errors::AbortedError;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Inner {
    aborted: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<u32>>,
}

/// Process-wide abort switch for one pipeline run.
#[derive(Debug, Clone)]
pub struct AbortController {
    inner: Arc<Inner>,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                aborted: AtomicBool::new(false),
                notify: Notify::new(),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Whether `abort()` has been called.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Trip the abort switch: wake sleepers and kill registered children.
    ///
    /// Idempotent; the second and later calls are no-ops.
    pub fn abort(&self) {
        if self.inner.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("abort requested");
        self.inner.notify.notify_waiters();

        let pids: Vec<u32> = self
            .inner
            .children
            .lock()
            .expect("abort child registry poisoned")
            .drain(..)
            .collect();
        for pid in pids {
            tokio::spawn(kill_with_escalation(pid));
        }
    }

    /// Register a spawned child process so `abort()` can kill it.
    ///
    /// If the controller is already aborted the child is killed immediately.
    pub fn register_child(&self, pid: u32) {
        if self.is_aborted() {
            tokio::spawn(kill_with_escalation(pid));
            return;
        }
        self.inner
            .children
            .lock()
            .expect("abort child registry poisoned")
            .push(pid);
    }

    /// Drop a child from the registry once it has exited normally.
    pub fn unregister_child(&self, pid: u32) {
        self.inner
            .children
            .lock()
            .expect("abort child registry poisoned")
            .retain(|p| *p != pid);
    }

    /// Fail fast at an awaitable boundary.
    pub fn checkpoint(&self) -> Result<(), AbortedError> {
        if self.is_aborted() { Err(AbortedError) } else { Ok(()) }
    }

    /// Resolves once the controller is aborted (immediately if it already is).
    pub async fn wait_aborted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    /// Abort-aware sleep: resolves `Ok(())` after `duration`, or
    /// `Err(AbortedError)` as soon as the controller fires.
    pub async fn sleep(&self, duration: Duration) -> Result<(), AbortedError> {
        self.checkpoint()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.wait_aborted() => Err(AbortedError),
        }
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
///
/// ESRCH (process already gone) is the expected fast path and is ignored.
#[cfg(unix)]
pub async fn kill_with_escalation(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);
    match kill(target, Signal::SIGTERM) {
        Ok(()) => debug!(pid, "sent SIGTERM"),
        Err(nix::errno::Errno::ESRCH) => return,
        Err(e) => {
            warn!(pid, "SIGTERM failed: {e}");
            return;
        }
    }
    tokio::time::sleep(KILL_GRACE).await;
    match kill(target, Signal::SIGKILL) {
        Ok(()) => debug!(pid, "sent SIGKILL after grace period"),
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pid, "SIGKILL failed: {e}"),
    }
}

#[cfg(not(unix))]
pub async fn kill_with_escalation(_pid: u32) {
    // Windows has no SIGTERM; the runtime's kill_on_drop covers teardown.
}

//! Background reaping of processes that nobody waits for anymore.
//!
//! Stopped or abandoned processes are handed to a [`Reaper`], which asks them
//! to exit, escalates to a kill after [`ReaperConfig::TERMINATE_TIMEOUT`] and
//! collects the exit status so no zombie is left behind. At most
//! [`ReaperConfig::MAX_CONCURRENT_REAPS`] processes are handled at once.

use crate::config::ReaperConfig;
use crate::platform;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{Notify, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Cheaply cloneable handle to a reaping pool.
#[derive(Clone)]
pub struct Reaper {
    inner: Arc<ReaperInner>,
}

struct ReaperInner {
    permits: Semaphore,
    pending: AtomicUsize,
    idle: Notify,
    terminate_timeout: Duration,
    kill_timeout: Duration,
}

impl Default for Reaper {
    fn default() -> Self {
        Self::new()
    }
}

impl Reaper {
    pub fn new() -> Self {
        Self::with_timeouts(ReaperConfig::TERMINATE_TIMEOUT, ReaperConfig::KILL_TIMEOUT)
    }

    pub fn with_timeouts(terminate_timeout: Duration, kill_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ReaperInner {
                permits: Semaphore::new(ReaperConfig::MAX_CONCURRENT_REAPS),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                terminate_timeout,
                kill_timeout,
            }),
        }
    }

    /// Take ownership of `child` and make sure it exits.
    ///
    /// Must be called from within a tokio runtime.
    pub fn reap(&self, child: Child) {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let guard = PendingGuard {
            inner: Arc::clone(&self.inner),
        };

        tokio::spawn(async move {
            let inner = Arc::clone(&guard.inner);
            let _permit = match inner.permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            reap_child(child, inner.terminate_timeout, inner.kill_timeout).await;
            drop(guard);
        });
    }

    /// Number of processes still being reaped.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Wait until every handed-over process is gone.
    ///
    /// Returns `false` if processes were still pending after `limit`.
    pub async fn drain(&self, limit: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.pending() == 0 {
                    return;
                }
                notified.await;
            }
        };

        match timeout(limit, wait).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "Reaper still has {} process(es) pending after {:?}",
                    self.pending(),
                    limit
                );
                false
            }
        }
    }
}

/// Decrements the pending count even if the reap task is cancelled.
struct PendingGuard {
    inner: Arc<ReaperInner>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

async fn reap_child(mut child: Child, terminate_timeout: Duration, kill_timeout: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("Reaped already exited process ({})", status);
            return;
        }
        Ok(None) => {}
        Err(e) => {
            warn!("Failed to poll process before reaping: {}", e);
        }
    }

    let Some(pid) = child.id() else {
        return;
    };

    match platform::request_terminate(pid) {
        Ok(true) => {}
        Ok(false) => debug!("Process {} vanished before SIGTERM", pid),
        Err(e) => warn!("Failed to terminate process {}: {}", pid, e),
    }

    match timeout(terminate_timeout, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("Process {} terminated gracefully ({})", pid, status);
            return;
        }
        Ok(Err(e)) => {
            warn!("Failed to wait for process {}: {}", pid, e);
            return;
        }
        Err(_) => {}
    }

    debug!("Process {} still running, sending SIGKILL", pid);
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill process {}: {}", pid, e);
    }

    match timeout(kill_timeout, child.wait()).await {
        Ok(Ok(status)) => debug!("Process {} killed ({})", pid, status),
        Ok(Err(e)) => warn!("Failed to wait for killed process {}: {}", pid, e),
        Err(_) => warn!("Process {} did not exit after SIGKILL", pid),
    }
}

//! Stop-then-remove retry loop for a pod sandbox under a hard deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::cri::{SandboxId, SandboxLifecycle};
use crate::error::{HarnessError, Result};

const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// An absolute time bound.
/// An absolute bound. A limit too large to represent never expires.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
    limit: Duration,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(limit),
            limit,
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    pub fn remaining(&self) -> Duration {
        self.at
            .map_or(Duration::MAX, |at| at.saturating_duration_since(Instant::now()))
    }
}

/// What a successful teardown took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// stop+remove pairs started, including the successful one.
    pub attempts: u32,
    pub stop_failures: u32,
    pub remove_failures: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct TeardownRetryLoop {
    backoff: Duration,
    cancel: Option<Arc<AtomicBool>>,
}

impl Default for TeardownRetryLoop {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            cancel: None,
        }
    }
}

impl TeardownRetryLoop {
    pub fn new(backoff: Duration) -> Self {
        Self {
            backoff,
            cancel: None,
        }
    }

    /// Stop retrying at the next checkpoint once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Stop, then remove, until both succeed or `deadline` passes.
    ///
    /// Stop failures are retried immediately since stop races with in-flight
    /// task deletion and is idempotent. Remove failures back off first.
    pub fn run<R>(&self, runtime: &R, id: &SandboxId, deadline: Deadline) -> Result<TeardownReport>
    where
        R: SandboxLifecycle + ?Sized,
    {
        let started = Instant::now();
        let mut report = TeardownReport {
            attempts: 0,
            stop_failures: 0,
            remove_failures: 0,
            elapsed: Duration::ZERO,
        };

        loop {
            self.checkpoint(id, deadline, &report)?;
            report.attempts += 1;

            if let Err(e) = runtime.stop_pod_sandbox(id) {
                report.stop_failures += 1;
                warn!(sandbox = %id, attempt = report.attempts, error = %e, "teardown:stop failed");
                continue;
            }

            self.checkpoint(id, deadline, &report)?;
            match runtime.remove_pod_sandbox(id) {
                Ok(()) => {
                    report.elapsed = started.elapsed();
                    info!(
                        sandbox = %id,
                        attempts = report.attempts,
                        elapsed = ?report.elapsed,
                        "teardown:sandbox removed"
                    );
                    return Ok(report);
                }
                Err(e) => {
                    report.remove_failures += 1;
                    warn!(sandbox = %id, attempt = report.attempts, error = %e, "teardown:remove failed");
                    thread::sleep(self.backoff.min(deadline.remaining()));
                }
            }
        }
    }

    fn checkpoint(&self, id: &SandboxId, deadline: Deadline, report: &TeardownReport) -> Result<()> {
        if self
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            warn!(sandbox = %id, "teardown:cancelled");
            return Err(HarnessError::Cancelled { id: id.to_string() });
        }
        if deadline.expired() {
            warn!(sandbox = %id, limit = ?deadline.limit(), attempts = report.attempts, "teardown:deadline exceeded");
            return Err(HarnessError::DeadlineExceeded {
                id: id.to_string(),
                limit: deadline.limit(),
                attempts: report.attempts,
            });
        }
        Ok(())
    }
}

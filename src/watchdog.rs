//! Decides whether the traced syscall came back in time, and cleans up when
//! it did not.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::io;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::RpcError;
use crate::inject::{InjectionSession, TracerExit};
use crate::shim::ShimConnection;

/// Asks the shim whether it is still serving requests.
pub trait LivenessProbe {
    fn probe(&self) -> Result<u32, RpcError>;
}

impl LivenessProbe for ShimConnection {
    fn probe(&self) -> Result<u32, RpcError> {
        self.shim_pid()
    }
}

/// Sends the non-cooperative kill.
pub trait Terminator {
    fn force_terminate(&self, pid: u32) -> io::Result<()>;
}

/// SIGKILL to the process group led by `pid`, or to `pid` alone when it does
/// not lead a group. A target that is already gone counts as terminated.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroupKiller;

impl Terminator for ProcessGroupKiller {
    fn force_terminate(&self, pid: u32) -> io::Result<()> {
        let target = Pid::from_raw(pid as i32);
        match killpg(target, Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => match kill(target, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(errno) => Err(errno.into()),
            },
            Err(errno) => Err(errno.into()),
        }
    }
}

/// Outcome of the completion race.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// The tracer exited inside the grace period.
    Completed { exit: TracerExit },
    /// The grace period ran out; the shim was probed and killed.
    Hung {
        shim_pid: u32,
        /// `Ok` means the shim still answered after the grace period.
        probe: Result<u32, String>,
        kill_error: Option<String>,
        tracer_exit: TracerExit,
        diagnostics: String,
    },
}

impl Verdict {
    pub fn is_hung(&self) -> bool {
        matches!(self, Verdict::Hung { .. })
    }
}

pub struct CompletionWatchdog<'a, P: ?Sized, T: ?Sized> {
    probe: &'a P,
    terminator: &'a T,
    grace: Duration,
    reap_timeout: Duration,
}

impl<'a, P, T> CompletionWatchdog<'a, P, T>
where
    P: LivenessProbe + ?Sized,
    T: Terminator + ?Sized,
{
    pub fn new(probe: &'a P, terminator: &'a T, grace: Duration, reap_timeout: Duration) -> Self {
        Self {
            probe,
            terminator,
            grace,
            reap_timeout,
        }
    }

    /// Race the session's completion against the grace period.
    ///
    /// On the hung path the probe always runs before the kill, exactly one
    /// kill is sent to the shim, and the tracer is reaped before returning.
    pub fn adjudicate(&self, session: &InjectionSession, shim_pid: u32) -> Verdict {
        if let Some(exit) = session.wait_completion_timeout(self.grace) {
            info!(shim_pid, %exit, "watchdog:tracer completed in time");
            return Verdict::Completed { exit };
        }

        error!(
            shim_pid,
            grace = ?self.grace,
            syscall = session.syscall(),
            "watchdog:tracer did not exit in time"
        );

        let probe = match self.probe.probe() {
            Ok(pid) => {
                warn!(shim_pid, reported_pid = pid, "watchdog:shim still answers");
                Ok(pid)
            }
            Err(e) => {
                info!(shim_pid, error = %e, "watchdog:shim unreachable");
                Err(e.to_string())
            }
        };

        let kill_error = match self.terminator.force_terminate(shim_pid) {
            Ok(()) => {
                info!(shim_pid, "watchdog:shim killed");
                None
            }
            Err(e) => {
                error!(shim_pid, error = %e, "watchdog:failed to kill shim");
                Some(e.to_string())
            }
        };

        let tracer_exit = match session.wait_completion_timeout(self.reap_timeout) {
            Some(exit) => exit,
            None => {
                warn!(
                    tracer_pid = session.tracer_pid(),
                    timeout = ?self.reap_timeout,
                    "watchdog:tracer still running after shim kill"
                );
                session.kill_tracer();
                session.wait_completion()
            }
        };

        info!(
            tracer_pid = session.tracer_pid(),
            %tracer_exit,
            output_bytes = session.diagnostic_bytes_seen(),
            "watchdog:tracer reaped"
        );
        Verdict::Hung {
            shim_pid,
            probe,
            kill_error,
            tracer_exit,
            diagnostics: session.diagnostics(),
        }
    }
}

//! Syscall delay injection through an attached `strace`.
//!
//! The tracer's combined output is the only proof that it has attached: strace
//! prints its "Process N attached" banner before it intercepts anything. The
//! caller is held at that barrier so the scenario cannot race ahead of the
//! attach and silently run without the injected delay.

use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::fmt;
use std::io::{self, BufRead, BufReader, PipeReader, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::latch::Latch;

const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DIAGNOSTICS_LIMIT: usize = 64 * 1024;
const ABORT_REAP_TIMEOUT: Duration = Duration::from_secs(10);

/// How the tracer is launched and supervised.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub program: PathBuf,
    /// Upper bound on the attach barrier.
    pub attach_timeout: Duration,
    /// Mirror tracer output to our stderr as it arrives.
    pub echo: bool,
    /// Bytes of tracer output retained for postmortem.
    pub diagnostics_limit: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("strace"),
            attach_timeout: DEFAULT_ATTACH_TIMEOUT,
            echo: false,
            diagnostics_limit: DEFAULT_DIAGNOSTICS_LIMIT,
        }
    }
}

/// Lifecycle of one injection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Spawned,
    Armed,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arming {
    Attached,
    StreamClosed,
}

/// How the tracer process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub runtime: Duration,
}

impl TracerExit {
    fn from_status(status: ExitStatus, runtime: Duration) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
            runtime,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for TracerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {} after {:?}", code, self.runtime),
            (None, Some(signal)) => write!(f, "killed by signal {} after {:?}", signal, self.runtime),
            (None, None) => write!(f, "unknown status after {:?}", self.runtime),
        }
    }
}

/// Tail of the tracer's output.
#[derive(Debug, Default)]
struct DiagnosticBuffer {
    tail: Vec<u8>,
    total: usize,
    limit: usize,
}

impl DiagnosticBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.total += bytes.len();
        self.tail.extend_from_slice(bytes);
        if self.tail.len() > self.limit {
            let excess = self.tail.len() - self.limit;
            self.tail.drain(..excess);
        }
    }
}

/// State written by the reaper thread and read by everyone else.
#[derive(Debug)]
struct Shared {
    armed: Latch<Arming>,
    completed: Latch<TracerExit>,
    diagnostics: Mutex<DiagnosticBuffer>,
}

impl Shared {
    fn record(&self, bytes: &[u8]) {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes);
    }
}

/// Spawns tracers that delay one syscall in a target process tree.
#[derive(Debug, Clone, Default)]
pub struct DelayInjector {
    config: TracerConfig,
}

impl DelayInjector {
    pub fn new(config: TracerConfig) -> Self {
        Self { config }
    }

    /// strace arguments: follow threads and forks, let go of anything that
    /// execs (runc children), trace only `syscall`, delay it on entry.
    pub fn tracer_args(pid: u32, syscall: &str, delay: Duration) -> Vec<String> {
        vec![
            "-p".to_string(),
            pid.to_string(),
            "-f".to_string(),
            "--detach-on=execve".to_string(),
            format!("--trace={}", syscall),
            "-e".to_string(),
            format!("inject={}:delay_enter={}s", syscall, delay.as_secs()),
        ]
    }

    /// Attach to `pid` and block until the tracer is armed.
    pub fn start(&self, pid: u32, syscall: &str, delay: Duration) -> Result<InjectionSession> {
        let args = Self::tracer_args(pid, syscall, delay);
        let program = self.config.program.display().to_string();
        let spawn_error = |source: io::Error| HarnessError::TracerSpawn {
            program: program.clone(),
            source,
        };

        let (reader, writer) = io::pipe().map_err(spawn_error)?;
        let child = {
            let stderr = writer.try_clone().map_err(spawn_error)?;
            let mut cmd = Command::new(&self.config.program);
            cmd.args(&args)
                .stdin(Stdio::null())
                .stdout(writer)
                .stderr(stderr);
            // SAFETY: only async-signal-safe calls run between fork and exec.
            // The death signal is tied to the spawning thread, so sessions must
            // be started from a thread that outlives them.
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
                    nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)?;
                    Ok(())
                });
            }
            // `cmd` owns our copies of the write end; dropping it here lets the
            // reader see EOF once the tracer is gone.
            cmd.spawn().map_err(spawn_error)?
        };
        let tracer_pid = child.id();
        info!(tracer_pid, target_pid = pid, syscall, ?delay, "inject:tracer spawned");

        let shared = Arc::new(Shared {
            armed: Latch::new(),
            completed: Latch::new(),
            diagnostics: Mutex::new(DiagnosticBuffer {
                limit: self.config.diagnostics_limit,
                ..Default::default()
            }),
        });
        let reaper = {
            let shared = Arc::clone(&shared);
            let echo = self.config.echo;
            thread::Builder::new()
                .name(format!("tracer-{}", tracer_pid))
                .spawn(move || reap(child, reader, &shared, echo))
                .map_err(spawn_error)?
        };

        let mut session = InjectionSession {
            target_pid: pid,
            syscall: syscall.to_string(),
            delay,
            tracer_pid,
            shared,
            reaper: Some(reaper),
        };

        match session.shared.armed.wait_timeout(self.config.attach_timeout) {
            Some(Arming::Attached) => {
                info!(tracer_pid, target_pid = pid, "inject:armed");
                Ok(session)
            }
            Some(Arming::StreamClosed) => {
                let exit = session.abort();
                warn!(tracer_pid, %exit, "inject:output closed before attach");
                Err(HarnessError::TracerAttachment {
                    pid,
                    reason: format!("tracer output closed before first byte ({})", exit),
                })
            }
            None => {
                let exit = session.abort();
                warn!(
                    tracer_pid,
                    timeout = ?self.config.attach_timeout,
                    "inject:attach timeout"
                );
                Err(HarnessError::TracerAttachment {
                    pid,
                    reason: format!(
                        "no tracer output within {:?} ({})",
                        self.config.attach_timeout, exit
                    ),
                })
            }
        }
    }
}

/// Peek the first byte, drain the rest, then reap. Runs on its own thread.
fn reap(mut child: Child, reader: PipeReader, shared: &Shared, echo: bool) {
    let started = Instant::now();
    let tracer_pid = child.id();
    let mut reader = BufReader::new(reader);

    let arming = match reader.fill_buf() {
        Ok(buf) if !buf.is_empty() => Arming::Attached,
        Ok(_) => Arming::StreamClosed,
        Err(e) => {
            debug!(tracer_pid, error = %e, "inject:read error before attach");
            Arming::StreamClosed
        }
    };
    shared.armed.fire(arming);

    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let bytes = &chunk[..n];
                shared.record(bytes);
                debug!(tracer_pid, output = %String::from_utf8_lossy(bytes).trim_end(), "inject:tracer output");
                if echo {
                    let _ = io::stderr().lock().write_all(bytes);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(tracer_pid, error = %e, "inject:read error");
                break;
            }
        }
    }

    let exit = match child.wait() {
        Ok(status) => TracerExit::from_status(status, started.elapsed()),
        Err(e) => {
            warn!(tracer_pid, error = %e, "inject:failed to reap tracer");
            TracerExit {
                code: None,
                signal: None,
                runtime: started.elapsed(),
            }
        }
    };
    info!(tracer_pid, %exit, "inject:tracer exited");
    shared.completed.fire(exit);
}

/// One running tracer attachment.
///
/// Dropping a session that has not completed kills the tracer and joins the
/// reaper, so no tracer outlives the harness's interest in it.
#[derive(Debug)]
pub struct InjectionSession {
    target_pid: u32,
    syscall: String,
    delay: Duration,
    tracer_pid: u32,
    shared: Arc<Shared>,
    reaper: Option<thread::JoinHandle<()>>,
}

impl InjectionSession {
    pub fn target_pid(&self) -> u32 {
        self.target_pid
    }

    pub fn tracer_pid(&self) -> u32 {
        self.tracer_pid
    }

    pub fn syscall(&self) -> &str {
        &self.syscall
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn state(&self) -> SessionState {
        if self.shared.completed.is_fired() {
            SessionState::Completed
        } else if self.shared.armed.peek() == Some(Arming::Attached) {
            SessionState::Armed
        } else {
            SessionState::Spawned
        }
    }

    /// Wait up to `timeout` for the tracer to exit.
    pub fn wait_completion_timeout(&self, timeout: Duration) -> Option<TracerExit> {
        self.shared.completed.wait_timeout(timeout)
    }

    pub fn wait_completion(&self) -> TracerExit {
        self.shared.completed.wait()
    }

    /// Captured tail of the tracer's output.
    pub fn diagnostics(&self) -> String {
        let buf = self
            .shared
            .diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf.tail).into_owned()
    }

    pub fn diagnostic_bytes_seen(&self) -> usize {
        self.shared
            .diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total
    }

    /// SIGKILL the tracer's process group unless it already exited.
    pub fn kill_tracer(&self) {
        if self.shared.completed.is_fired() {
            return;
        }
        let pgid = Pid::from_raw(self.tracer_pid as i32);
        if let Err(errno) = killpg(pgid, Signal::SIGKILL) {
            debug!(tracer_pid = self.tracer_pid, %errno, "inject:killpg failed, killing pid");
            let _ = kill(pgid, Signal::SIGKILL);
        }
    }

    /// Wait for the tracer to exit, join the reaper and report a non-zero
    /// exit as a harness failure.
    pub fn finish(mut self) -> Result<TracerExit> {
        let exit = self.wait_completion();
        self.join_reaper();
        if exit.success() {
            Ok(exit)
        } else {
            Err(HarnessError::TracerExit {
                status: exit.to_string(),
            })
        }
    }

    /// Kill the tracer and reap it.
    fn abort(&mut self) -> TracerExit {
        self.kill_tracer();
        let exit = self
            .wait_completion_timeout(ABORT_REAP_TIMEOUT)
            .unwrap_or_else(|| {
                warn!(tracer_pid = self.tracer_pid, "inject:tracer not reaped after kill");
                self.wait_completion()
            });
        self.join_reaper();
        exit
    }

    fn join_reaper(&mut self) {
        if let Some(handle) = self.reaper.take()
            && handle.join().is_err()
        {
            warn!(tracer_pid = self.tracer_pid, "inject:reaper thread panicked");
        }
    }
}

impl Drop for InjectionSession {
    fn drop(&mut self) {
        if self.reaper.is_some() {
            self.kill_tracer();
            self.join_reaper();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Write a shell script standing in for strace.
    pub(crate) fn fake_tracer(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-strace");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub(crate) fn injector(program: PathBuf, attach_timeout: Duration) -> DelayInjector {
        DelayInjector::new(TracerConfig {
            program,
            attach_timeout,
            echo: false,
            diagnostics_limit: 1024,
        })
    }

    #[test]
    fn tracer_args_follow_strace_cli() {
        let args = DelayInjector::tracer_args(1234, "umount2", Duration::from_secs(12));
        assert_eq!(
            args,
            vec![
                "-p",
                "1234",
                "-f",
                "--detach-on=execve",
                "--trace=umount2",
                "-e",
                "inject=umount2:delay_enter=12s",
            ]
        );
    }

    #[test]
    fn barrier_holds_until_first_byte() {
        let tmp = tempfile::tempdir().unwrap();
        let program = fake_tracer(tmp.path(), "sleep 1\necho 'Process 1 attached'\nsleep 1");
        let start = Instant::now();

        let session = injector(program, Duration::from_secs(10))
            .start(std::process::id(), "umount2", Duration::from_secs(1))
            .unwrap();

        assert!(
            start.elapsed() >= Duration::from_millis(900),
            "released after {:?}",
            start.elapsed()
        );
        assert_eq!(session.state(), SessionState::Armed);
        assert!(session.diagnostic_bytes_seen() <= "Process 1 attached\n".len());
        let exit = session.finish().unwrap();
        assert!(exit.success());
    }

    #[test]
    fn completion_fires_once_after_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let program = fake_tracer(tmp.path(), "echo attached\nsleep 0.3\necho detached");

        let session = injector(program, Duration::from_secs(10))
            .start(4321, "umount2", Duration::from_secs(1))
            .unwrap();
        assert_ne!(session.state(), SessionState::Spawned);

        let exit = session
            .wait_completion_timeout(Duration::from_secs(10))
            .unwrap();
        assert!(exit.success());
        assert_eq!(session.state(), SessionState::Completed);
        assert!(!session.shared.completed.fire(exit.clone()));
        assert_eq!(session.wait_completion(), exit);
        assert!(session.diagnostics().contains("attached\ndetached"));
        assert_eq!(session.target_pid(), 4321);
    }

    #[test]
    fn non_zero_exit_is_tracer_exit_error() {
        let tmp = tempfile::tempdir().unwrap();
        let program = fake_tracer(tmp.path(), "echo 'attach failed: Operation not permitted' >&2\nexit 1");

        let session = injector(program, Duration::from_secs(10))
            .start(1, "umount2", Duration::from_secs(1))
            .unwrap();
        let err = session.finish().unwrap_err();
        assert!(matches!(err, HarnessError::TracerExit { .. }));
        assert!(err.is_infrastructure());
    }

    #[test]
    fn silent_exit_fails_attachment() {
        let tmp = tempfile::tempdir().unwrap();
        let program = fake_tracer(tmp.path(), "exit 0");

        let err = injector(program, Duration::from_secs(10))
            .start(1, "umount2", Duration::from_secs(1))
            .unwrap_err();
        match err {
            HarnessError::TracerAttachment { pid, reason } => {
                assert_eq!(pid, 1);
                assert!(reason.contains("closed before first byte"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn attach_timeout_kills_tracer_group() {
        let tmp = tempfile::tempdir().unwrap();
        let program = fake_tracer(tmp.path(), "sleep 30");
        let start = Instant::now();

        let err = injector(program, Duration::from_millis(300))
            .start(1, "umount2", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, HarnessError::TracerAttachment { .. }));
        // The sleeping grandchild holds the pipe too; only a group kill ends it.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_tracer_is_spawn_error() {
        let err = injector(
            PathBuf::from("/nonexistent/strace"),
            Duration::from_secs(1),
        )
        .start(1, "umount2", Duration::from_secs(1))
        .unwrap_err();
        assert!(matches!(err, HarnessError::TracerSpawn { .. }));
    }

    #[test]
    fn diagnostics_keep_only_the_tail() {
        let mut buf = DiagnosticBuffer {
            limit: 4,
            ..Default::default()
        };
        buf.push(b"abc");
        buf.push(b"defg");
        assert_eq!(buf.tail, b"defg");
        assert_eq!(buf.total, 7);
    }

    #[test]
    fn dropping_live_session_kills_tracer() {
        let tmp = tempfile::tempdir().unwrap();
        let program = fake_tracer(tmp.path(), "echo attached\nsleep 30");

        let session = injector(program, Duration::from_secs(10))
            .start(1, "umount2", Duration::from_secs(1))
            .unwrap();
        let tracer_pid = session.tracer_pid();
        let start = Instant::now();
        drop(session);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(kill(Pid::from_raw(tracer_pid as i32), None).is_err());
    }
}

use anyhow::{Context, Result, anyhow};
use std::ffi::OsString;
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

/// A builder for executing external tools with unified error handling and an
/// optional wall-clock limit.
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    timeout: Option<Duration>,
}

impl Cmd {
    /// Create a new command builder
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Kill the command if it runs longer than `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Execute the command and return the output.
    /// Returns an error if the command fails (non-zero exit code) or times out.
    pub fn run(self) -> Result<Output> {
        let shown = self.display();
        trace!(command = %shown, timeout = ?self.timeout, "cmd:run start");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute command: {}", shown))?;

        // Drain both pipes off-thread so a chatty child cannot block on a full pipe.
        let stdout = child.stdout.take().map(spawn_collector);
        let stderr = child.stderr.take().map(spawn_collector);

        // A limit past the representable range of Instant means no limit.
        let limit = self
            .timeout
            .filter(|limit| Instant::now().checked_add(*limit).is_some());
        let status = match limit {
            Some(limit) => match child
                .wait_timeout(limit)
                .with_context(|| format!("Failed to wait for command: {}", shown))?
            {
                Some(status) => status,
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!(command = %shown, ?limit, "cmd:run timeout");
                    return Err(anyhow!("Command timed out after {:?}: {}", limit, shown));
                }
            },
            None => child
                .wait()
                .with_context(|| format!("Failed to wait for command: {}", shown))?,
        };

        let output = Output {
            status,
            stdout: stdout.map(join_collector).unwrap_or_default(),
            stderr: stderr.map(join_collector).unwrap_or_default(),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                command = %shown,
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "cmd:run failure"
            );
            return Err(anyhow!("Command failed: {}\n{}", shown, stderr.trim()));
        }
        trace!(command = %shown, "cmd:run success");
        Ok(output)
    }

    /// Execute the command and return stdout as a trimmed string
    pub fn run_and_capture_stdout(self) -> Result<String> {
        let output = self.run()?;
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }

    /// Execute the command, returning Ok(true) if it succeeds, Ok(false) if it fails
    pub fn run_as_check(self) -> Result<bool> {
        match self.run() {
            Ok(_) => Ok(true),
            Err(e) if e.to_string().starts_with("Command failed") => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn spawn_collector<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_collector(handle: thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn captures_trimmed_stdout() {
        let out = Cmd::new("sh")
            .args(["-c", "echo '  pod-123  '"])
            .run_and_capture_stdout()
            .unwrap();
        assert_eq!(out, "pod-123");
    }

    #[test]
    fn failure_includes_stderr() {
        let err = Cmd::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .run()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("Command failed"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn errors_name_the_full_command_line() {
        let err = Cmd::new("sh")
            .args(["-c", "exit 7"])
            .run()
            .unwrap_err();
        assert!(err.to_string().starts_with("Command failed: sh -c exit 7"));

        let err = Cmd::new("shimrace-no-such-binary").arg("--flag").run().unwrap_err();
        assert!(
            format!("{err:#}").contains("Failed to execute command: shimrace-no-such-binary --flag")
        );
    }

    #[test]
    fn unrepresentable_timeout_runs_unbounded() {
        let out = Cmd::new("echo")
            .arg("ok")
            .timeout(Duration::MAX)
            .run_and_capture_stdout()
            .unwrap();
        assert_eq!(out, "ok");
    }

    #[test]
    fn check_reports_exit_status() {
        assert!(Cmd::new("true").run_as_check().unwrap());
        assert!(!Cmd::new("false").run_as_check().unwrap());
    }

    #[test]
    fn timeout_kills_slow_command() {
        let start = Instant::now();
        let err = Cmd::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200))
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}

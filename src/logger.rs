use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: OnceLock<()> = OnceLock::new();
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Log everything at `SHIMRACE_LOG` / `RUST_LOG` level (default info) to the
/// state-dir log file, and warnings and above to stderr.
pub fn init() -> Result<PathBuf> {
    let log_path = determine_log_path()?;
    if INIT.get().is_some() {
        return Ok(log_path);
    }

    init_inner(&log_path)?;
    let _ = INIT.set(());
    Ok(log_path)
}

fn init_inner(log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory at {}", parent.display()))?;
    }

    let (directory, file_name) = split_path(log_path)?;
    let file_appender = rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_env("SHIMRACE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_thread_names(true)
                .with_filter(env_filter),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact()
                .with_filter(LevelFilter::WARN),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

fn determine_log_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SHIMRACE_LOG_FILE")
        && !path.is_empty()
    {
        return Ok(PathBuf::from(path));
    }

    if let Ok(state_home) = std::env::var("XDG_STATE_HOME")
        && !state_home.is_empty()
    {
        return Ok(PathBuf::from(state_home)
            .join("shimrace")
            .join("shimrace.log"));
    }

    // ~/.local/state/shimrace/shimrace.log
    if let Some(home_dir) = home::home_dir() {
        return Ok(home_dir
            .join(".local")
            .join("state")
            .join("shimrace")
            .join("shimrace.log"));
    }

    Ok(std::env::current_dir()?.join("shimrace.log"))
}

fn split_path(path: &Path) -> Result<(PathBuf, &str)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name"))?;

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok((dir, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_separates_directory() {
        let (dir, name) = split_path(Path::new("/var/log/shimrace/run.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/log/shimrace"));
        assert_eq!(name, "run.log");
    }

    #[test]
    fn split_path_rejects_root() {
        assert!(split_path(Path::new("/")).is_err());
    }
}

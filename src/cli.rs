use crate::config::Config;
use crate::cri::{Crictl, SandboxId};
use crate::error::HarnessError;
use crate::inject::{DelayInjector, TracerConfig};
use crate::scenario::{Outcome, Scenario, ScenarioReport};
use crate::shim::ShimConnector;
use crate::spinner;
use crate::watchdog::ProcessGroupKiller;
use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "shimrace")]
#[command(
    about = "Reproduce the containerd shim teardown race by delaying umount2 inside the shim"
)]
#[command(after_help = "Exit codes: 0 passed, 1 scenario failed, 2 harness failure or cancelled, 3 skipped.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Overrides for values normally taken from the config files.
#[derive(Args, Debug, Default, Clone)]
struct InjectionOverrides {
    /// Syscall to delay
    #[arg(long)]
    syscall: Option<String>,

    /// Entry delay injected into each matching call, in seconds
    #[arg(long)]
    delay_secs: Option<u64>,

    /// Tracer binary (looked up on PATH when not absolute)
    #[arg(long)]
    tracer: Option<String>,

    /// Mirror tracer output to stderr
    #[arg(long)]
    echo: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full teardown reproduction against the local containerd
    Run {
        /// Explicit config file, applied over the global and project configs
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        injection: InjectionOverrides,

        /// Upper bound on the stop/remove retry loop, in seconds
        #[arg(long)]
        teardown_timeout_secs: Option<u64>,

        /// How long the traced call may keep running after teardown, in seconds
        #[arg(long)]
        grace_secs: Option<u64>,
    },

    /// Delay a syscall in an arbitrary process until the tracer exits
    Inject {
        /// Process to trace
        #[arg(long)]
        pid: u32,

        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        injection: InjectionOverrides,
    },

    /// Print the pid of a sandbox's shim
    ShimPid {
        /// Pod sandbox id
        id: String,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the shim socket address for a sandbox
    Address {
        /// Pod sandbox id
        id: String,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            injection,
            teardown_timeout_secs,
            grace_secs,
        } => {
            let mut cfg = load_config(config.as_deref(), &injection)?;
            if teardown_timeout_secs.is_some() {
                cfg.scenario.teardown_timeout_secs = teardown_timeout_secs;
            }
            if grace_secs.is_some() {
                cfg.scenario.grace_secs = grace_secs;
            }
            let outcome = run_scenario(cfg)?;
            let code = outcome.exit_code();
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Inject {
            pid,
            config,
            injection,
        } => {
            let cfg = load_config(config.as_deref(), &injection)?;
            run_inject(&cfg, pid)
        }
        Commands::ShimPid { id, config } => {
            let cfg = load_config(config.as_deref(), &InjectionOverrides::default())?;
            let shim = connector(&cfg).connect(&SandboxId::new(id))?;
            info!(socket = %shim.socket().display(), "shim:connected");
            let pid = shim.shim_pid().map_err(HarnessError::from)?;
            shim.close();
            println!("{pid}");
            Ok(())
        }
        Commands::Address { id, config } => {
            let cfg = load_config(config.as_deref(), &InjectionOverrides::default())?;
            println!("{}", connector(&cfg).resolve_address(&SandboxId::new(id))?);
            Ok(())
        }
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    }
}

fn load_config(explicit: Option<&Path>, overrides: &InjectionOverrides) -> Result<Config> {
    let mut cfg = Config::load(explicit)?;
    if overrides.syscall.is_some() {
        cfg.injection.syscall = overrides.syscall.clone();
    }
    if overrides.delay_secs.is_some() {
        cfg.injection.delay_secs = overrides.delay_secs;
    }
    if overrides.tracer.is_some() {
        cfg.injection.tracer = overrides.tracer.clone();
    }
    if overrides.echo {
        cfg.injection.echo = Some(true);
    }
    Ok(cfg)
}

fn connector(cfg: &Config) -> ShimConnector {
    let containerd = &cfg.containerd;
    ShimConnector::new(containerd.namespace(), containerd.endpoint())
        .with_state_dir(containerd.state_dir())
        .with_call_timeout(containerd.rpc_timeout())
}

fn injector(cfg: &Config) -> Result<DelayInjector> {
    let injection = &cfg.injection;
    Ok(DelayInjector::new(TracerConfig {
        program: resolve_tracer(injection.tracer())?,
        attach_timeout: injection.attach_timeout(),
        echo: injection.echo(),
        ..TracerConfig::default()
    }))
}

/// Bare names are looked up on PATH; anything with a slash is used as is.
fn resolve_tracer(tracer: &str) -> Result<PathBuf> {
    if tracer.contains('/') {
        return Ok(PathBuf::from(tracer));
    }
    which::which(tracer).with_context(|| format!("Tracer '{}' not found on PATH", tracer))
}

fn run_scenario(cfg: Config) -> Result<Outcome> {
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            warn!("interrupt received, cancelling");
            cancel.store(true, Ordering::SeqCst);
        })
        .context("Failed to install interrupt handler")?;
    }

    let runtime = match Crictl::discover(
        cfg.containerd.runtime_endpoint(),
        cfg.containerd.crictl_timeout(),
    ) {
        Ok(runtime) => runtime,
        Err(e) => return Ok(conclude(failed_setup(e).outcome())),
    };
    let injector = match injector(&cfg) {
        Ok(injector) => injector,
        Err(e) => return Ok(conclude(Outcome::InfrastructureFailed(format!("{e:#}")))),
    };
    let connector = connector(&cfg);
    let terminator = ProcessGroupKiller;
    let scenario = Scenario::new(&runtime, &terminator, connector, injector, cfg, cancel);

    let outcome = match scenario.skip_reason() {
        Ok(Some(reason)) => Outcome::Skipped(reason),
        Ok(None) => {
            match spinner::with_spinner("Starting pod sandbox and connecting to its shim", || {
                scenario.prepare()
            }) {
                Ok(prepared) => {
                    let report = spinner::with_spinner_judged(
                        "Injecting delay and tearing down the sandbox",
                        || scenario.execute(prepared),
                        |report: &ScenarioReport| report.outcome() == Outcome::Passed,
                    );
                    print_report(&report);
                    report.outcome()
                }
                Err(e) => failed_setup(e).outcome(),
            }
        }
        Err(e) => failed_setup(e).outcome(),
    };

    Ok(conclude(outcome))
}

fn conclude(outcome: Outcome) -> Outcome {
    info!(outcome = %outcome, code = outcome.exit_code(), "scenario finished");
    print_outcome(&outcome);
    outcome
}

fn failed_setup(error: HarnessError) -> ScenarioReport {
    ScenarioReport {
        error: Some(error),
        ..Default::default()
    }
}

fn print_report(report: &ScenarioReport) {
    if let Some(id) = &report.sandbox_id {
        let pid = report
            .shim_pid
            .map_or_else(|| "unknown".to_string(), |p| p.to_string());
        println!("  sandbox {} shim pid {}", style(id).bold(), style(pid).bold());
    }
    if let Some(Ok(teardown)) = &report.teardown {
        println!(
            "  teardown: {} attempt(s) in {:.1}s ({} stop failure(s), {} remove failure(s))",
            teardown.attempts,
            teardown.elapsed.as_secs_f64(),
            teardown.stop_failures,
            teardown.remove_failures
        );
    }
    if let Some(diagnostics) = report.diagnostics()
        && !diagnostics.is_empty()
    {
        eprintln!("{}", style("tracer output:").dim());
        eprintln!("{diagnostics}");
    }
}

fn print_outcome(outcome: &Outcome) {
    let line = match outcome {
        Outcome::Passed => style(outcome.to_string()).green().bold(),
        Outcome::Skipped(_) | Outcome::Cancelled => style(outcome.to_string()).yellow(),
        Outcome::ScenarioFailed(_) | Outcome::InfrastructureFailed(_) => {
            style(outcome.to_string()).red().bold()
        }
    };
    println!("{line}");
}

fn run_inject(cfg: &Config, pid: u32) -> Result<()> {
    let injection = &cfg.injection;
    let session = spinner::with_spinner(
        &format!("Attaching to pid {}", pid),
        || -> Result<_> {
            Ok(injector(cfg)?.start(pid, injection.syscall(), injection.delay())?)
        },
    )?;
    info!(target_pid = session.target_pid(), state = ?session.state(), "inject:session ready");
    println!(
        "delaying {} in pid {} by {:?} (tracer pid {}); interrupt the target or the tracer to stop",
        style(session.syscall()).bold(),
        session.target_pid(),
        session.delay(),
        session.tracer_pid()
    );
    let exit = session.finish()?;
    println!("tracer {exit}");
    Ok(())
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, &name, &mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_overrides() {
        let cli = Cli::try_parse_from([
            "shimrace",
            "run",
            "--delay-secs",
            "3",
            "--syscall",
            "unlinkat",
            "--grace-secs",
            "5",
            "--echo",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                injection,
                grace_secs,
                teardown_timeout_secs,
                ..
            } => {
                assert_eq!(injection.delay_secs, Some(3));
                assert_eq!(injection.syscall.as_deref(), Some("unlinkat"));
                assert!(injection.echo);
                assert_eq!(grace_secs, Some(5));
                assert_eq!(teardown_timeout_secs, None);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn inject_requires_pid() {
        assert!(Cli::try_parse_from(["shimrace", "inject"]).is_err());
        assert!(Cli::try_parse_from(["shimrace", "inject", "--pid", "42"]).is_ok());
    }

    #[test]
    fn tracer_with_slash_is_used_verbatim() {
        assert_eq!(
            resolve_tracer("/opt/bin/strace").unwrap(),
            PathBuf::from("/opt/bin/strace")
        );
        assert!(resolve_tracer("shimrace-no-such-tracer").is_err());
    }

    #[test]
    fn overrides_replace_config_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cfg.yaml");
        std::fs::write(&path, "injection:\n  syscall: umount2\n  delay_secs: 12\n").unwrap();
        let overrides = InjectionOverrides {
            delay_secs: Some(2),
            echo: true,
            ..Default::default()
        };
        let cfg = load_config(Some(&path), &overrides).unwrap();
        assert_eq!(cfg.injection.syscall(), "umount2");
        assert_eq!(cfg.injection.delay(), Duration::from_secs(2));
        assert!(cfg.injection.echo());
    }
}

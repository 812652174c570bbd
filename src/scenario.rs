//! End-to-end reproduction: delay `umount2` in a pod's shim, tear the pod
//! down, and check that the shim's traced call returns in time.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::cri::fixtures::{ContainerConfig, PodSandboxConfig};
use crate::cri::{RuntimeService, SandboxId};
use crate::error::{HarnessError, Result};
use crate::inject::{DelayInjector, InjectionSession};
use crate::shim::{ShimConnection, ShimConnector};
use crate::teardown::{Deadline, TeardownReport, TeardownRetryLoop};
use crate::watchdog::{CompletionWatchdog, Terminator, Verdict};

/// A pod that is running and whose shim we are connected to.
pub struct Prepared {
    pub sandbox_id: SandboxId,
    pub pod_config: PodSandboxConfig,
    pub shim: ShimConnection,
    pub shim_pid: u32,
}

/// Everything observed during one run.
#[derive(Debug, Default)]
pub struct ScenarioReport {
    pub sandbox_id: Option<SandboxId>,
    pub shim_pid: Option<u32>,
    pub teardown: Option<Result<TeardownReport>>,
    pub verdict: Option<Verdict>,
    /// Setup or harness failure that cut the run short.
    pub error: Option<HarnessError>,
    pub tracer_error: Option<HarnessError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Skipped(String),
    /// The race reproduced: teardown or the traced syscall did not finish.
    ScenarioFailed(String),
    /// The harness or its environment misbehaved.
    InfrastructureFailed(String),
    Cancelled,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Passed => 0,
            Outcome::ScenarioFailed(_) => 1,
            Outcome::InfrastructureFailed(_) | Outcome::Cancelled => 2,
            Outcome::Skipped(_) => 3,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => write!(f, "passed"),
            Outcome::Skipped(reason) => write!(f, "skipped: {}", reason),
            Outcome::ScenarioFailed(reason) => write!(f, "scenario failed: {}", reason),
            Outcome::InfrastructureFailed(reason) => {
                write!(f, "harness infrastructure failure: {}", reason)
            }
            Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl ScenarioReport {
    /// Harness failures outrank the deadline, which outranks a hung tracer.
    pub fn outcome(&self) -> Outcome {
        let pid = self
            .shim_pid
            .map_or_else(|| "unknown".to_string(), |p| p.to_string());

        if let Some(err) = &self.error {
            return classify(err, &pid);
        }
        if let Some(err) = &self.tracer_error {
            return Outcome::InfrastructureFailed(err.to_string());
        }
        if let Some(Err(err)) = &self.teardown {
            return classify(err, &pid);
        }
        if let Some(Verdict::Hung { .. }) = &self.verdict {
            return Outcome::ScenarioFailed(format!(
                "traced syscall did not return within the grace period (shim pid {})",
                pid
            ));
        }
        Outcome::Passed
    }

    pub fn diagnostics(&self) -> Option<&str> {
        match &self.verdict {
            Some(Verdict::Hung { diagnostics, .. }) => Some(diagnostics),
            _ => None,
        }
    }
}

fn classify(err: &HarnessError, pid: &str) -> Outcome {
    match err {
        HarnessError::Cancelled { .. } => Outcome::Cancelled,
        _ if err.is_infrastructure() => Outcome::InfrastructureFailed(err.to_string()),
        _ => Outcome::ScenarioFailed(format!("{} (shim pid {})", err, pid)),
    }
}

pub struct Scenario<'a, R: ?Sized, T: ?Sized> {
    runtime: &'a R,
    terminator: &'a T,
    connector: ShimConnector,
    injector: DelayInjector,
    config: Config,
    cancel: Arc<AtomicBool>,
}

impl<'a, R, T> Scenario<'a, R, T>
where
    R: RuntimeService + ?Sized,
    T: Terminator + ?Sized,
{
    pub fn new(
        runtime: &'a R,
        terminator: &'a T,
        connector: ShimConnector,
        injector: DelayInjector,
        config: Config,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            runtime,
            terminator,
            connector,
            injector,
            config,
            cancel,
        }
    }

    /// Reason to skip, if the runtime cannot host the reproduction.
    pub fn skip_reason(&self) -> Result<Option<String>> {
        if !self.config.scenario.require_runc_v2() {
            return Ok(None);
        }
        let runtime_type = self.runtime.default_runtime_type()?;
        info!(runtime_type = ?runtime_type, "scenario:default runtime");
        match runtime_type {
            Some(t) if t.ends_with("runc.v2") => Ok(None),
            Some(t) => Ok(Some(format!("default runtime should be runc.v2, but it's {}", t))),
            None => Ok(Some("runtime did not report a default runtime type".to_string())),
        }
    }

    /// Run the pod and connect to its shim.
    pub fn prepare(&self) -> Result<Prepared> {
        let scenario = &self.config.scenario;
        let pod_config = PodSandboxConfig::new(scenario.pod_name(), scenario.pod_namespace());
        let sandbox_id = self
            .runtime
            .run_pod_sandbox(&pod_config, self.config.containerd.runtime_handler())?;

        let connected = self
            .connector
            .connect(&sandbox_id)
            .and_then(|shim| Ok((shim.shim_pid()?, shim)));
        match connected {
            Ok((shim_pid, shim)) => {
                info!(sandbox = %sandbox_id, shim_pid, "scenario:prepared");
                Ok(Prepared {
                    sandbox_id,
                    pod_config,
                    shim,
                    shim_pid,
                })
            }
            Err(e) => {
                self.discard(&sandbox_id);
                Err(e)
            }
        }
    }

    /// Inject, start the container, tear down, adjudicate.
    pub fn execute(&self, prepared: Prepared) -> ScenarioReport {
        let Prepared {
            sandbox_id,
            pod_config,
            shim,
            shim_pid,
        } = prepared;
        let mut report = ScenarioReport {
            sandbox_id: Some(sandbox_id.clone()),
            shim_pid: Some(shim_pid),
            ..Default::default()
        };
        let injection = &self.config.injection;

        info!(
            shim_pid,
            syscall = injection.syscall(),
            delay = ?injection.delay(),
            "scenario:injecting delay"
        );
        let session = match self
            .injector
            .start(shim_pid, injection.syscall(), injection.delay())
        {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "scenario:injection failed");
                self.discard(&sandbox_id);
                shim.close();
                report.error = Some(e);
                return report;
            }
        };

        if let Err(e) = self.start_container(&sandbox_id, &pod_config) {
            error!(error = %e, "scenario:container start failed");
            self.discard(&sandbox_id);
            drop(session);
            shim.close();
            report.error = Some(e);
            return report;
        }

        let scenario = &self.config.scenario;
        info!(sandbox = %sandbox_id, "scenario:stopping and removing sandbox");
        let teardown = TeardownRetryLoop::new(scenario.retry_backoff())
            .with_cancel(Arc::clone(&self.cancel))
            .run(
                self.runtime,
                &sandbox_id,
                Deadline::after(scenario.teardown_timeout()),
            );
        match &teardown {
            Ok(r) => info!(sandbox = %sandbox_id, attempts = r.attempts, "scenario:sandbox deleted, waiting for tracer"),
            Err(e) => error!(sandbox = %sandbox_id, error = %e, "scenario:teardown failed"),
        }
        report.teardown = Some(teardown);

        let verdict = CompletionWatchdog::new(
            &shim,
            self.terminator,
            scenario.grace(),
            scenario.reap_timeout(),
        )
        .adjudicate(&session, shim_pid);
        let hung = verdict.is_hung();
        report.verdict = Some(verdict);

        report.tracer_error = self.finish_session(session, hung);
        shim.close();
        report
    }

    fn start_container(&self, sandbox_id: &SandboxId, pod_config: &PodSandboxConfig) -> Result<()> {
        let scenario = &self.config.scenario;
        self.runtime.ensure_image(scenario.pause_image())?;
        let container = ContainerConfig::new(scenario.container_name(), scenario.pause_image());
        let container_id = self
            .runtime
            .create_container(sandbox_id, &container, pod_config)?;
        self.runtime.start_container(&container_id)?;
        info!(container = %container_id, "scenario:container started");
        Ok(())
    }

    /// Reap the tracer. Its exit status only matters when it finished on its
    /// own; after a shim kill a non-zero exit is expected.
    fn finish_session(&self, session: InjectionSession, hung: bool) -> Option<HarnessError> {
        match session.finish() {
            Ok(_) => None,
            Err(e) if hung => {
                warn!(error = %e, "scenario:tracer exit after shim kill");
                None
            }
            Err(e) => Some(e),
        }
    }

    /// Best-effort removal of a sandbox the run is abandoning.
    fn discard(&self, sandbox_id: &SandboxId) {
        if let Err(e) = self.runtime.stop_pod_sandbox(sandbox_id) {
            warn!(sandbox = %sandbox_id, error = %e, "scenario:cleanup stop failed");
        }
        if let Err(e) = self.runtime.remove_pod_sandbox(sandbox_id) {
            warn!(sandbox = %sandbox_id, error = %e, "scenario:cleanup remove failed");
        }
    }
}

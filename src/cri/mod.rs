//! The orchestration service boundary.
//!
//! The harness only needs a handful of CRI calls. They are modelled as a
//! trait so the teardown loop can be driven by a synthetic backend; the real
//! backend shells out to `crictl`.

pub mod fixtures;

use anyhow::Context;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::cmd::Cmd;
use crate::error::{HarnessError, Result};
use fixtures::{ContainerConfig, PodSandboxConfig};

/// Identity of a pod sandbox as returned by `RunPodSandbox`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxId(String);

impl SandboxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two teardown calls the retry loop drives.
pub trait SandboxLifecycle {
    fn stop_pod_sandbox(&self, id: &SandboxId) -> Result<()>;
    fn remove_pod_sandbox(&self, id: &SandboxId) -> Result<()>;
}

pub trait RuntimeService: SandboxLifecycle {
    fn run_pod_sandbox(&self, config: &PodSandboxConfig, runtime_handler: &str)
    -> Result<SandboxId>;

    fn create_container(
        &self,
        pod: &SandboxId,
        config: &ContainerConfig,
        sandbox_config: &PodSandboxConfig,
    ) -> Result<ContainerId>;

    fn start_container(&self, id: &ContainerId) -> Result<()>;

    /// Pull `image` unless the runtime already has it.
    fn ensure_image(&self, image: &str) -> Result<()>;

    /// The runtime type (e.g. `io.containerd.runc.v2`) of the CRI default
    /// runtime, if the runtime reports one.
    fn default_runtime_type(&self) -> Result<Option<String>>;
}

/// `crictl`-backed runtime service.
#[derive(Debug, Clone)]
pub struct Crictl {
    binary: PathBuf,
    endpoint: String,
    timeout: Duration,
}

impl Crictl {
    pub fn new(binary: impl Into<PathBuf>, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            endpoint: endpoint.into(),
            timeout,
        }
    }

    /// Locate `crictl` on `PATH`.
    pub fn discover(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let binary = which::which("crictl").map_err(|e| HarnessError::Runtime {
            operation: "discover".to_string(),
            message: format!("crictl not found on PATH: {}", e),
        })?;
        Ok(Self::new(binary, endpoint, timeout))
    }

    fn command(&self, operation: &str) -> Cmd {
        Cmd::new(&self.binary)
            .args(["--runtime-endpoint", self.endpoint.as_str()])
            .arg(operation)
            .timeout(self.timeout)
    }

    fn run(&self, operation: &str, cmd: Cmd) -> Result<String> {
        debug!(operation, "crictl:call");
        cmd.run_and_capture_stdout()
            .map_err(|e| runtime_error(operation, e))
    }
}

fn runtime_error(operation: &str, err: anyhow::Error) -> HarnessError {
    HarnessError::Runtime {
        operation: operation.to_string(),
        message: format!("{:#}", err),
    }
}

fn write_json<T: serde::Serialize>(value: &T) -> anyhow::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("shimrace-")
        .suffix(".json")
        .tempfile()
        .context("Failed to create config file")?;
    serde_json::to_writer_pretty(&mut file, value).context("Failed to serialize config")?;
    file.flush()?;
    Ok(file)
}

/// Last non-empty line of `crictl` output, which is where it prints ids.
fn last_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).rfind(|l| !l.is_empty())
}

impl SandboxLifecycle for Crictl {
    fn stop_pod_sandbox(&self, id: &SandboxId) -> Result<()> {
        self.run("stopp", self.command("stopp").arg(id.as_str()))?;
        Ok(())
    }

    fn remove_pod_sandbox(&self, id: &SandboxId) -> Result<()> {
        self.run("rmp", self.command("rmp").arg(id.as_str()))?;
        Ok(())
    }
}

impl RuntimeService for Crictl {
    fn run_pod_sandbox(
        &self,
        config: &PodSandboxConfig,
        runtime_handler: &str,
    ) -> Result<SandboxId> {
        let pod_file = write_json(config).map_err(|e| runtime_error("runp", e))?;
        let mut cmd = self.command("runp");
        if !runtime_handler.is_empty() {
            cmd = cmd.args(["--runtime", runtime_handler]);
        }
        let out = self.run("runp", cmd.arg(pod_file.path()))?;
        let id = last_line(&out).ok_or_else(|| HarnessError::Runtime {
            operation: "runp".to_string(),
            message: "no sandbox id in output".to_string(),
        })?;
        info!(sandbox = id, "cri:pod sandbox running");
        Ok(SandboxId::new(id))
    }

    fn create_container(
        &self,
        pod: &SandboxId,
        config: &ContainerConfig,
        sandbox_config: &PodSandboxConfig,
    ) -> Result<ContainerId> {
        let ctr_file = write_json(config).map_err(|e| runtime_error("create", e))?;
        let pod_file = write_json(sandbox_config).map_err(|e| runtime_error("create", e))?;
        let out = self.run(
            "create",
            self.command("create")
                .arg(pod.as_str())
                .arg(ctr_file.path())
                .arg(pod_file.path()),
        )?;
        let id = last_line(&out).ok_or_else(|| HarnessError::Runtime {
            operation: "create".to_string(),
            message: "no container id in output".to_string(),
        })?;
        Ok(ContainerId::new(id))
    }

    fn start_container(&self, id: &ContainerId) -> Result<()> {
        self.run("start", self.command("start").arg(id.as_str()))?;
        Ok(())
    }

    fn ensure_image(&self, image: &str) -> Result<()> {
        let present = self
            .command("inspecti")
            .args(["-q", image])
            .run_as_check()
            .map_err(|e| runtime_error("inspecti", e))?;
        if present {
            debug!(image, "cri:image present");
            return Ok(());
        }
        info!(image, "cri:pulling image");
        self.run("pull", self.command("pull").arg(image))?;
        Ok(())
    }

    fn default_runtime_type(&self) -> Result<Option<String>> {
        let out = self.run("info", self.command("info"))?;
        parse_default_runtime_type(&out)
    }
}

/// Pull `config.containerd.runtimes[defaultRuntimeName].runtimeType` out of
/// `crictl info` JSON.
fn parse_default_runtime_type(info: &str) -> Result<Option<String>> {
    let value: serde_json::Value =
        serde_json::from_str(info).map_err(|e| HarnessError::Runtime {
            operation: "info".to_string(),
            message: format!("invalid JSON: {}", e),
        })?;
    let containerd = &value["config"]["containerd"];
    let Some(name) = containerd["defaultRuntimeName"].as_str() else {
        return Ok(None);
    };
    Ok(containerd["runtimes"][name]["runtimeType"]
        .as_str()
        .map(str::to_string))
}

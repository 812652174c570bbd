use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const PROJECT_CONFIG_NAMES: &[&str] = &[".shimrace.yaml", ".shimrace.yml"];

/// Where the containerd under test lives.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct ContainerdConfig {
    /// containerd namespace used by the CRI plugin. Default: k8s.io
    pub namespace: Option<String>,

    /// containerd gRPC socket path; part of the shim socket address hash.
    /// Default: /run/containerd/containerd.sock
    pub endpoint: Option<String>,

    /// CRI endpoint handed to crictl.
    /// Default: unix:///run/containerd/containerd.sock
    pub runtime_endpoint: Option<String>,

    /// containerd state directory. Default: /run/containerd
    pub state_dir: Option<String>,

    /// CRI runtime handler passed to RunPodSandbox. Default: runtime default
    pub runtime_handler: Option<String>,

    /// Seconds allowed for one crictl call. Default: 60
    pub crictl_timeout_secs: Option<u64>,

    /// Seconds allowed for one shim RPC. Default: 10
    pub rpc_timeout_secs: Option<u64>,
}

impl ContainerdConfig {
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("k8s.io")
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint
            .as_deref()
            .unwrap_or("/run/containerd/containerd.sock")
    }

    pub fn runtime_endpoint(&self) -> &str {
        self.runtime_endpoint
            .as_deref()
            .unwrap_or("unix:///run/containerd/containerd.sock")
    }

    pub fn state_dir(&self) -> &str {
        self.state_dir
            .as_deref()
            .unwrap_or(crate::shim::DEFAULT_STATE_DIR)
    }

    pub fn runtime_handler(&self) -> &str {
        self.runtime_handler.as_deref().unwrap_or("")
    }

    pub fn crictl_timeout(&self) -> Duration {
        Duration::from_secs(self.crictl_timeout_secs.unwrap_or(60))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs.unwrap_or(10))
    }

    fn merge(self, project: Self) -> Self {
        Self {
            namespace: project.namespace.or(self.namespace),
            endpoint: project.endpoint.or(self.endpoint),
            runtime_endpoint: project.runtime_endpoint.or(self.runtime_endpoint),
            state_dir: project.state_dir.or(self.state_dir),
            runtime_handler: project.runtime_handler.or(self.runtime_handler),
            crictl_timeout_secs: project.crictl_timeout_secs.or(self.crictl_timeout_secs),
            rpc_timeout_secs: project.rpc_timeout_secs.or(self.rpc_timeout_secs),
        }
    }
}

/// The tracer and the fault it injects.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct InjectionConfig {
    /// Tracer binary, looked up on PATH when not absolute. Default: strace
    pub tracer: Option<String>,

    /// Syscall to delay. Default: umount2
    pub syscall: Option<String>,

    /// Entry delay injected on every matching call, in seconds. Default: 12
    /// (the CRI plugin gives task deletion 10 seconds).
    pub delay_secs: Option<u64>,

    /// Seconds to wait for the tracer's first output. Default: 30
    pub attach_timeout_secs: Option<u64>,

    /// Mirror tracer output to stderr. Default: false
    pub echo: Option<bool>,
}

impl InjectionConfig {
    pub fn tracer(&self) -> &str {
        self.tracer.as_deref().unwrap_or("strace")
    }

    pub fn syscall(&self) -> &str {
        self.syscall.as_deref().unwrap_or("umount2")
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs.unwrap_or(12))
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_secs(self.attach_timeout_secs.unwrap_or(30))
    }

    pub fn echo(&self) -> bool {
        self.echo.unwrap_or(false)
    }

    fn merge(self, project: Self) -> Self {
        Self {
            tracer: project.tracer.or(self.tracer),
            syscall: project.syscall.or(self.syscall),
            delay_secs: project.delay_secs.or(self.delay_secs),
            attach_timeout_secs: project.attach_timeout_secs.or(self.attach_timeout_secs),
            echo: project.echo.or(self.echo),
        }
    }
}

/// The pod under test and the timing bounds of its teardown.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct ScenarioConfig {
    /// Pod name. Default: sandbox-test
    pub pod_name: Option<String>,

    /// Kubernetes namespace recorded in the pod metadata. Default: shimrace
    pub pod_namespace: Option<String>,

    /// Default: pausecontainer
    pub container_name: Option<String>,

    /// Default: registry.k8s.io/pause:3.9
    pub pause_image: Option<String>,

    /// Seconds stop+remove may take in total. Default: 180
    pub teardown_timeout_secs: Option<u64>,

    /// Milliseconds to wait after a failed remove. Default: 1000
    pub retry_backoff_ms: Option<u64>,

    /// Seconds the tracer gets to exit after the sandbox is gone. Default: 15
    pub grace_secs: Option<u64>,

    /// Seconds to wait for the tracer after killing the shim. Default: 60
    pub reap_timeout_secs: Option<u64>,

    /// Skip unless the CRI default runtime is runc v2. Default: true
    pub require_runc_v2: Option<bool>,
}

impl ScenarioConfig {
    pub fn pod_name(&self) -> &str {
        self.pod_name.as_deref().unwrap_or("sandbox-test")
    }

    pub fn pod_namespace(&self) -> &str {
        self.pod_namespace.as_deref().unwrap_or("shimrace")
    }

    pub fn container_name(&self) -> &str {
        self.container_name.as_deref().unwrap_or("pausecontainer")
    }

    pub fn pause_image(&self) -> &str {
        self.pause_image
            .as_deref()
            .unwrap_or("registry.k8s.io/pause:3.9")
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs.unwrap_or(180))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.unwrap_or(1000))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs.unwrap_or(15))
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_secs(self.reap_timeout_secs.unwrap_or(60))
    }

    pub fn require_runc_v2(&self) -> bool {
        self.require_runc_v2.unwrap_or(true)
    }

    fn merge(self, project: Self) -> Self {
        Self {
            pod_name: project.pod_name.or(self.pod_name),
            pod_namespace: project.pod_namespace.or(self.pod_namespace),
            container_name: project.container_name.or(self.container_name),
            pause_image: project.pause_image.or(self.pause_image),
            teardown_timeout_secs: project.teardown_timeout_secs.or(self.teardown_timeout_secs),
            retry_backoff_ms: project.retry_backoff_ms.or(self.retry_backoff_ms),
            grace_secs: project.grace_secs.or(self.grace_secs),
            reap_timeout_secs: project.reap_timeout_secs.or(self.reap_timeout_secs),
            require_runc_v2: project.require_runc_v2.or(self.require_runc_v2),
        }
    }
}

/// Configuration for shimrace, read from .shimrace.yaml
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub containerd: ContainerdConfig,

    #[serde(default)]
    pub injection: InjectionConfig,

    #[serde(default)]
    pub scenario: ScenarioConfig,
}

impl Config {
    /// Load the global config, then the nearest project config (which wins),
    /// then an explicit file if one was given (which wins over both).
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        debug!("config:loading");
        let global = Self::load_global()?.unwrap_or_default();
        let start_dir = std::env::current_dir().unwrap_or_default();
        let project = match find_project_config(&start_dir) {
            Some(path) => Self::load_from_path(&path)?.unwrap_or_default(),
            None => Self::default(),
        };
        let mut config = global.merge(project);

        if let Some(path) = explicit {
            let file = Self::load_from_path(path)?
                .ok_or_else(|| anyhow::anyhow!("Config file not found: {}", path.display()))?;
            config = config.merge(file);
        }

        debug!(
            namespace = config.containerd.namespace(),
            syscall = config.injection.syscall(),
            delay = ?config.injection.delay(),
            "config:loaded"
        );
        Ok(config)
    }

    fn load_from_path(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config at {}: {}", path.display(), e))?;
        Ok(Some(config))
    }

    /// ~/.config/shimrace/config.yaml
    fn load_global() -> anyhow::Result<Option<Self>> {
        if let Some(home_dir) = home::home_dir() {
            for name in ["config.yaml", "config.yml"] {
                let path = home_dir.join(".config/shimrace").join(name);
                if path.exists() {
                    return Self::load_from_path(&path);
                }
            }
        }
        Ok(None)
    }

    /// Field-wise merge; `project` takes precedence.
    fn merge(self, project: Self) -> Self {
        Self {
            containerd: self.containerd.merge(project.containerd),
            injection: self.injection.merge(project.injection),
            scenario: self.scenario.merge(project.scenario),
        }
    }
}

/// Walk upward from `start_dir` looking for a project config file.
pub fn find_project_config(start_dir: &Path) -> Option<PathBuf> {
    start_dir.ancestors().find_map(|dir| {
        PROJECT_CONFIG_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_the_reproduction() {
        let config = Config::default();
        assert_eq!(config.containerd.namespace(), "k8s.io");
        assert_eq!(config.injection.syscall(), "umount2");
        assert_eq!(config.injection.delay(), Duration::from_secs(12));
        assert_eq!(config.scenario.teardown_timeout(), Duration::from_secs(180));
        assert_eq!(config.scenario.grace(), Duration::from_secs(15));
        assert_eq!(config.scenario.retry_backoff(), Duration::from_secs(1));
        assert!(config.scenario.require_runc_v2());
    }

    #[test]
    fn parses_partial_yaml() {
        let yaml = "injection:\n  delay_secs: 20\nscenario:\n  grace_secs: 5\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.injection.delay(), Duration::from_secs(20));
        assert_eq!(config.scenario.grace(), Duration::from_secs(5));
        assert_eq!(config.containerd.namespace(), "k8s.io");
    }

    #[test]
    fn project_values_override_global() {
        let global: Config =
            serde_yaml::from_str("injection:\n  syscall: fsync\n  delay_secs: 3\n").unwrap();
        let project: Config = serde_yaml::from_str("injection:\n  delay_secs: 30\n").unwrap();
        let merged = global.merge(project);
        assert_eq!(merged.injection.syscall(), "fsync");
        assert_eq!(merged.injection.delay(), Duration::from_secs(30));
    }

    #[test]
    fn finds_config_in_parent_directory() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(temp.path().join(".shimrace.yml"), "scenario:\n  pod_name: x\n").unwrap();

        let found = find_project_config(&nested).unwrap();
        assert_eq!(found, temp.path().join(".shimrace.yml"));
        let config = Config::load_from_path(&found).unwrap().unwrap();
        assert_eq!(config.scenario.pod_name(), "x");
    }

    #[test]
    fn invalid_yaml_reports_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".shimrace.yaml");
        fs::write(&path, "scenario: [").unwrap();
        let err = Config::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains(".shimrace.yaml"));
    }
}

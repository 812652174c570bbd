//! Locating and talking to the per-sandbox shim process.
//!
//! The shim listens on a unix socket whose path containerd derives from the
//! containerd endpoint, the namespace and the sandbox id. We reproduce that
//! derivation, dial the socket and issue the task service `Connect` call to
//! learn the shim's pid.

pub mod proto;
pub mod ttrpc;

use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::cri::SandboxId;
use crate::error::{HarnessError, Result, RpcError};
use proto::{ConnectRequest, ConnectResponse, TASK_SERVICE};

/// containerd's default state directory.
pub const DEFAULT_STATE_DIR: &str = "/run/containerd";

const UNIX_SCHEME: &str = "unix://";
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens connections to shims belonging to one containerd instance.
#[derive(Debug, Clone)]
pub struct ShimConnector {
    namespace: String,
    endpoint: String,
    state_dir: PathBuf,
    call_timeout: Duration,
}

impl ShimConnector {
    pub fn new(namespace: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            endpoint: endpoint.into(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Resolve the shim's control socket address, `unix://` prefixed.
    ///
    /// The `address` file the shim writes into its bundle wins when present;
    /// otherwise the address is derived the same way containerd derives it.
    pub fn resolve_address(&self, id: &SandboxId) -> Result<String> {
        let unresolvable = |reason: &str| HarnessError::AddressResolution {
            id: id.to_string(),
            reason: reason.to_string(),
        };
        if self.namespace.is_empty() {
            return Err(unresolvable("namespace is required"));
        }
        if id.as_str().is_empty() {
            return Err(unresolvable("sandbox id is empty"));
        }
        if id.as_str().contains('/') {
            return Err(unresolvable("sandbox id contains a path separator"));
        }

        let address_file = self
            .state_dir
            .join("io.containerd.runtime.v2.task")
            .join(&self.namespace)
            .join(id.as_str())
            .join("address");
        if let Ok(contents) = fs::read_to_string(&address_file) {
            let address = contents.trim();
            if !address.is_empty() {
                debug!(file = %address_file.display(), address, "shim:address from bundle");
                return Ok(address.to_string());
            }
        }

        let endpoint = self.endpoint.strip_prefix(UNIX_SCHEME).unwrap_or(&self.endpoint);
        let endpoint = endpoint.trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(unresolvable("containerd endpoint is empty"));
        }
        let key = format!("{}/{}/{}", endpoint, self.namespace, id);
        let digest = Sha256::digest(key.as_bytes());
        let address = format!(
            "{}{}/{}",
            UNIX_SCHEME,
            self.state_dir.join("s").display(),
            hex::encode(digest)
        );
        debug!(%key, address, "shim:address derived");
        Ok(address)
    }

    /// Dial the shim for `id` and wrap the socket in a ttrpc client.
    pub fn connect(&self, id: &SandboxId) -> Result<ShimConnection> {
        let address = self.resolve_address(id)?;
        let path = address.strip_prefix(UNIX_SCHEME).unwrap_or(&address);
        let connection = ShimConnection::dial(Path::new(path), id, self.call_timeout)
            .map_err(|source| HarnessError::Connection {
                address: address.clone(),
                source,
            })?;
        info!(sandbox = %id, address, "shim:connected");
        Ok(connection)
    }
}

/// An open channel to one shim.
pub struct ShimConnection {
    id: SandboxId,
    socket: PathBuf,
    client: ttrpc::Client,
}

impl ShimConnection {
    fn dial(socket: &Path, id: &SandboxId, timeout: Duration) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket)?;
        let client = ttrpc::Client::new(stream, timeout)?;
        Ok(Self {
            id: id.clone(),
            socket: socket.to_path_buf(),
            client,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Issue the task service `Connect` call.
    pub fn connect_info(&self) -> std::result::Result<ConnectResponse, RpcError> {
        let request = ConnectRequest {
            id: self.id.to_string(),
        };
        self.client.call(TASK_SERVICE, "Connect", &request)
    }

    /// The shim's own pid, as reported by the shim.
    pub fn shim_pid(&self) -> std::result::Result<u32, RpcError> {
        let resp = self.connect_info()?;
        if resp.shim_pid == 0 {
            return Err(RpcError::Rejected {
                method: "Connect",
                code: 0,
                message: "shim reported pid 0".to_string(),
            });
        }
        Ok(resp.shim_pid)
    }

    pub fn close(self) {
        self.client.close();
    }
}

//! Error taxonomy for the harness.
//!
//! Variants split into two audiences: failures that mean the race was
//! reproduced (the scenario failed) and failures of the harness or its
//! environment (tracer missing, runtime unreachable). Operators should never
//! confuse the two, so `is_infrastructure` is the single place that decides.

use std::io;
use std::time::Duration;

/// Result alias used across the harness components.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// A failed call on the shim's ttrpc channel.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The channel itself broke. The shim has most likely exited.
    #[error("shim transport broken during {method}: {source}")]
    Transport {
        method: &'static str,
        #[source]
        source: io::Error,
    },

    /// The shim answered with a non-zero status.
    #[error("shim rejected {method} (code {code}): {message}")]
    Rejected {
        method: &'static str,
        code: i32,
        message: String,
    },
}

impl RpcError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("cannot derive shim socket address for sandbox {id:?}: {reason}")]
    AddressResolution { id: String, reason: String },

    #[error("failed to dial shim socket {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("failed to spawn tracer {program}: {source}")]
    TracerSpawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("tracer did not attach to pid {pid}: {reason}")]
    TracerAttachment { pid: u32, reason: String },

    #[error("sandbox {id} teardown did not complete within {limit:?} ({attempts} attempts)")]
    DeadlineExceeded {
        id: String,
        limit: Duration,
        attempts: u32,
    },

    #[error("tracer exited unsuccessfully ({status})")]
    TracerExit { status: String },

    #[error("teardown of sandbox {id} cancelled")]
    Cancelled { id: String },

    #[error("runtime call `{operation}` failed: {message}")]
    Runtime { operation: String, message: String },
}

impl HarnessError {
    /// True when the failure belongs to the harness or its environment rather
    /// than to the scenario under test.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, HarnessError::DeadlineExceeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_is_a_scenario_failure() {
        let err = HarnessError::DeadlineExceeded {
            id: "abc".to_string(),
            limit: Duration::from_secs(180),
            attempts: 7,
        };
        assert!(!err.is_infrastructure());
        assert!(err.to_string().contains("did not complete within"));
    }

    #[test]
    fn tracer_failures_are_infrastructure() {
        let exit = HarnessError::TracerExit {
            status: "exit status: 1".to_string(),
        };
        let attach = HarnessError::TracerAttachment {
            pid: 42,
            reason: "stream closed".to_string(),
        };
        assert!(exit.is_infrastructure());
        assert!(attach.is_infrastructure());
    }

    #[test]
    fn rpc_transport_is_distinguished_from_rejection() {
        let transport = RpcError::Transport {
            method: "Connect",
            source: io::Error::from(io::ErrorKind::UnexpectedEof),
        };
        let rejected = RpcError::Rejected {
            method: "Connect",
            code: 5,
            message: "not found".to_string(),
        };
        assert!(transport.is_transport());
        assert!(!rejected.is_transport());
        assert!(HarnessError::from(rejected).to_string().contains("code 5"));
    }
}

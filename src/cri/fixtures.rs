//! Pod and container configs handed to the runtime as opaque JSON documents.

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct PodSandboxMetadata {
    pub name: String,
    pub uid: String,
    pub namespace: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PodSandboxConfig {
    pub metadata: PodSandboxMetadata,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub linux: serde_json::Value,
}

impl PodSandboxConfig {
    /// A minimal pod owned by `namespace`, with a random uid so repeated runs
    /// never collide with a leftover sandbox.
    pub fn new(name: &str, namespace: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/managed-by".to_string(), "shimrace".to_string());
        Self {
            metadata: PodSandboxMetadata {
                name: name.to_string(),
                uid: random_uid(),
                namespace: namespace.to_string(),
                attempt: 0,
            },
            labels,
            linux: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerMetadata {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSpec {
    pub image: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerConfig {
    pub metadata: ContainerMetadata,
    pub image: ImageSpec,
    pub linux: serde_json::Value,
}

impl ContainerConfig {
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            metadata: ContainerMetadata {
                name: name.to_string(),
            },
            image: ImageSpec {
                image: image.to_string(),
            },
            linux: serde_json::json!({}),
        }
    }
}

fn random_uid() -> String {
    let mut buf = [0u8; 16];
    if getrandom::fill(&mut buf).is_ok() {
        return hex::encode(buf);
    }
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{:x}{:x}", nanos, std::process::id())
}

//! Image configuration JSON for scratch images
//!
//! Mirrors the Docker v1 image JSON (with `rootfs` and `history`) that the engine's
//! load primitive expects next to each layer.

use crate::config::{CommitOptions, ContainerHandle};
use crate::error::Result;
use crate::image::digest::DigestUtils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const IMAGE_ARCHITECTURE: &str = "amd64";
pub const DOCKER_VERSION: &str = "1.10";

/// Serializes as `{}`; used for port and volume sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "Hostname", default)]
    pub hostname: String,
    #[serde(rename = "User", default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(rename = "ExposedPorts", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, EmptyObject>,
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Volumes", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, EmptyObject>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "StopSignal", default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
}

impl RuntimeConfig {
    pub fn from_commit(commit: &CommitOptions, hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            user: commit.user.clone().unwrap_or_default(),
            exposed_ports: commit
                .ports
                .iter()
                .map(|port| (port.clone(), EmptyObject::default()))
                .collect(),
            env: commit.env.clone(),
            cmd: commit.cmd.clone(),
            entrypoint: commit.entrypoint.clone(),
            volumes: commit
                .volumes
                .iter()
                .map(|volume| (volume.clone(), EmptyObject::default()))
                .collect(),
            working_dir: commit.working_dir.clone().unwrap_or_default(),
            labels: commit.labels.clone(),
            stop_signal: commit.stop_signal.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub architecture: String,
    pub config: RuntimeConfig,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,
    pub container_config: RuntimeConfig,
    pub created: DateTime<Utc>,
    pub docker_version: String,
    pub history: Vec<History>,
    pub os: String,
    pub rootfs: RootFs,
}

impl ImageConfig {
    /// Config for a single-layer image whose layer has the given diff id.
    pub fn new(
        commit: &CommitOptions,
        container: Option<&ContainerHandle>,
        os: &str,
        diff_id: &str,
        created: DateTime<Utc>,
    ) -> Self {
        let hostname = container.map(ContainerHandle::short).unwrap_or_default();
        Self {
            architecture: IMAGE_ARCHITECTURE.to_string(),
            config: RuntimeConfig::from_commit(commit, hostname),
            container: container.map(|c| c.id().to_string()).unwrap_or_default(),
            container_config: RuntimeConfig {
                hostname: hostname.to_string(),
                ..RuntimeConfig::default()
            },
            created,
            docker_version: DOCKER_VERSION.to_string(),
            history: vec![History { created }],
            os: os.to_string(),
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: vec![diff_id.to_string()],
            },
        }
    }

    /// Serialize once and derive the layer id from that exact serialization.
    pub fn seal(self) -> Result<SealedConfig> {
        let json = serde_json::to_vec(&self)?;
        let layer_id = DigestUtils::compute_sha256(&json);
        Ok(SealedConfig { json, layer_id })
    }
}

/// Serialized image config and the id derived from it. Read-only by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedConfig {
    json: Vec<u8>,
    layer_id: String,
}

impl SealedConfig {
    pub fn json(&self) -> &[u8] {
        &self.json
    }

    /// Hex sha256 of [`SealedConfig::json`]
    pub fn layer_id(&self) -> &str {
        &self.layer_id
    }
}

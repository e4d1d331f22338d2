//! Node wiring: configuration file, key loading, mesh startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use node_mesh::{MeshConfig, RetryPolicy};
use serde::Deserialize;
use tracing::info;

pub const DEFAULT_CONFIG_FILE: &str = "hopmesh.toml";
pub const CONFIG_ENV: &str = "HOPMESH_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Directory holding `kem.pub` / `kem.key`. Without it a fresh keypair
    /// is generated on every start.
    #[serde(default)]
    pub key_dir: Option<PathBuf>,
    /// Seed peers, `label = "host:port"`.
    #[serde(default)]
    pub peers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 0 retries forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_label() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("node-{}", &id[..8])
}
fn default_bind_addr() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    7070
}
fn default_heartbeat_secs() -> u64 {
    5
}
fn default_connect_timeout_ms() -> u64 {
    3000
}
fn default_io_timeout_ms() -> u64 {
    5000
}
fn default_base_backoff_ms() -> u64 {
    250
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    8
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            heartbeat_secs: default_heartbeat_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            retry: RetryConfig::default(),
            key_dir: None,
            peers: BTreeMap::new(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_attempts: (self.max_attempts > 0).then_some(self.max_attempts),
        }
    }
}

impl NodeConfig {
    /// Build the mesh configuration, loading or creating the keypair in
    /// `key_dir` when one is configured.
    pub fn to_mesh_config(&self) -> Result<MeshConfig> {
        let keypair = match &self.key_dir {
            Some(dir) => Some(
                node_crypto::load_or_generate(dir)
                    .with_context(|| format!("load keypair from {}", dir.display()))?,
            ),
            None => None,
        };

        let mut mesh = MeshConfig::new(&self.label);
        mesh.bind_addr = self.bind_addr.clone();
        mesh.port = self.port;
        mesh.heartbeat_interval = Duration::from_secs(self.heartbeat_secs.max(1));
        mesh.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        mesh.io_timeout = Duration::from_millis(self.io_timeout_ms);
        mesh.retry = self.retry.policy();
        mesh.keypair = keypair;
        mesh.seeds = self
            .peers
            .iter()
            .map(|(label, addr)| (label.clone(), addr.clone()))
            .collect();
        Ok(mesh)
    }
}

/// Config path: the first CLI argument, then `HOPMESH_CONFIG`, then `hopmesh.toml`.
pub fn config_path(arg: Option<String>, env: Option<String>) -> PathBuf {
    arg.or(env)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Read `path`, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<NodeConfig> {
    if !path.exists() {
        info!("{} not found, using defaults", path.display());
        return Ok(NodeConfig::default());
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let config: NodeConfig =
        toml::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    Ok(config)
}

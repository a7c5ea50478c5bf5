//! Configuration for adops.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (ADOPS_HOME, ADOPS_WORKFLOWS, ADOPS_BIND)
//! 2. Config file (.adops/config.yaml)
//! 3. Defaults (~/.adops, ./workflows, 127.0.0.1:3002)
//!
//! Config file discovery:
//! - Searches current directory and parents for .adops/config.yaml
//! - `paths.home` is relative to the .adops/ directory, `paths.workflows`
//!   to the project root (the parent of .adops/)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::ConnectorConfig;
use crate::client::ReconnectPolicy;
use crate::engine::RunLimits;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_BIND: &str = "127.0.0.1:3002";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub limits: RunLimits,
    /// Stage executors keyed by agent id
    #[serde(default)]
    pub connectors: BTreeMap<String, ConnectorConfig>,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory for the event and message logs
    pub home: Option<String>,
    /// Directory of workflow YAML files
    pub workflows: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    pub bind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Budget for sessions created implicitly by a send
    #[serde(default = "default_max_messages")]
    pub max_messages_per_session: u32,

    /// Size of the live broadcast ring
    #[serde(default = "default_live_capacity")]
    pub live_capacity: usize,
}

fn default_max_messages() -> u32 {
    10
}
fn default_live_capacity() -> usize {
    1000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_messages_per_session: default_max_messages(),
            live_capacity: default_live_capacity(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to adops home (logs)
    pub home: PathBuf,
    /// Directory scanned for workflow definitions
    pub workflows: PathBuf,
    /// Server listen address
    pub bind: String,
    pub bus: BusConfig,
    pub limits: RunLimits,
    pub connectors: BTreeMap<String, ConnectorConfig>,
    pub reconnect: ReconnectPolicy,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Durable event log ($ADOPS_HOME/events.jsonl)
    pub fn events_log_path(&self) -> PathBuf {
        self.home.join("events.jsonl")
    }

    /// Durable agent message log ($ADOPS_HOME/messages.jsonl)
    pub fn messages_log_path(&self) -> PathBuf {
        self.home.join("messages.jsonl")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".adops").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a config file (if any) with env overrides and defaults
fn resolve(config_path: Option<PathBuf>, env: impl Fn(&str) -> Option<String>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".adops");

    let (file, adops_dir, project_dir) = match config_path {
        Some(ref path) => {
            let file = load_config_file(path)?;
            let adops_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
            let project_dir = adops_dir.parent().unwrap_or(Path::new(".")).to_path_buf();
            (file, adops_dir, project_dir)
        }
        None => (ConfigFile::default(), PathBuf::from("."), PathBuf::from(".")),
    };

    let home = match (env("ADOPS_HOME"), &file.paths.home) {
        (Some(env_home), _) => PathBuf::from(env_home),
        (None, Some(home)) => resolve_path(&adops_dir, home),
        (None, None) => default_home,
    };

    let workflows = match (env("ADOPS_WORKFLOWS"), &file.paths.workflows) {
        (Some(env_dir), _) => PathBuf::from(env_dir),
        (None, Some(dir)) => resolve_path(&project_dir, dir),
        (None, None) => project_dir.join("workflows"),
    };

    let bind = env("ADOPS_BIND")
        .or(file.server.bind)
        .unwrap_or_else(|| DEFAULT_BIND.to_string());

    Ok(ResolvedConfig {
        home,
        workflows,
        bind,
        bus: file.bus,
        limits: file.limits,
        connectors: file.connectors,
        reconnect: file.reconnect,
        config_file: config_path,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    resolve(find_config_file(), |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

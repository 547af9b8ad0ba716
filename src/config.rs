use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{TrackerError, TrackerResult};
use crate::types::TaskConfig;

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

pub const ENV_CLUSTER_NODES: &str = "BID_TRACKER_CLUSTER_NODES";
pub const ENV_CLUSTER_PASSWORD: &str = "BID_TRACKER_CLUSTER_PASSWORD";
pub const ENV_TASKS_API: &str = "BID_TRACKER_TASKS_API";
pub const ENV_API_TOKEN: &str = "BID_TRACKER_API_TOKEN";

/// Top-level application config deserialized from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Key-value cluster connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Seed node addresses (`host:port`).
    pub nodes: Vec<String>,
    /// Internal → external address table, keyed by `host:port` or bare `host`.
    #[serde(default)]
    pub remap: HashMap<String, String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Allow reads to be served by replicas.
    #[serde(default = "default_true")]
    pub read_from_replicas: bool,
    /// Handshake attempts per connect before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Upper bound on one `get_progress` call.
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    /// Polling interval of `bid-progress watch`.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

/// Where task documents come from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Base URL of the task-configuration service; `None` uses `static_tasks` only.
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub static_tasks: Vec<TaskConfig>,
}

/// Tokens accepted from dashboard callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_tokens: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_cap_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_deadline_ms() -> u64 {
    3_000
}

fn default_poll_interval() -> u64 {
    5
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_deadline_ms(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl ClusterConfig {
    pub fn new(nodes: Vec<String>) -> Self {
        Self {
            nodes,
            remap: HashMap::new(),
            username: None,
            password: None,
            read_from_replicas: default_true(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> TrackerResult<()> {
        if self.nodes.iter().all(|n| n.trim().is_empty()) {
            return Err(TrackerError::Config("cluster.nodes is empty".into()));
        }
        if let Some(bad) = self.nodes.iter().find(|n| !n.contains(':')) {
            return Err(TrackerError::Config(format!(
                "cluster node {bad:?} is not host:port"
            )));
        }
        if self.max_attempts == 0 {
            return Err(TrackerError::Config("cluster.max_attempts must be >= 1".into()));
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(TrackerError::Config(
                "cluster.backoff_base_ms exceeds cluster.backoff_cap_ms".into(),
            ));
        }
        Ok(())
    }
}

impl ProgressConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Write config to the given TOML file path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Apply overrides from the process environment (after `.env` is loaded).
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(nodes) = lookup(ENV_CLUSTER_NODES) {
            let nodes: Vec<String> = nodes
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect();
            if !nodes.is_empty() {
                self.cluster.nodes = nodes;
            }
        }
        if let Some(password) = lookup(ENV_CLUSTER_PASSWORD) {
            self.cluster.password = Some(password);
        }
        if let Some(api) = lookup(ENV_TASKS_API) {
            self.tasks.api_base = Some(api);
        }
        if let Some(token) = lookup(ENV_API_TOKEN) {
            if !self.auth.api_tokens.contains(&token) {
                self.auth.api_tokens.push(token);
            }
        }
    }

    pub fn validate(&self) -> TrackerResult<()> {
        self.cluster.validate()?;
        if self.progress.deadline_ms == 0 {
            return Err(TrackerError::Config("progress.deadline_ms must be > 0".into()));
        }
        Ok(())
    }
}

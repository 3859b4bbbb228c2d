//! Server configuration: TOML file + CLI overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use agsh_core::routing::{RouteStrategy, DEFAULT_VIRTUAL_NODES};
use agsh_core::{AgshError, AgshResult};

use crate::session::{SessionLimits, SpawnSpec};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub spawn: SpawnSection,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

/// `[sessions]` section: capacity and reaping.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_sessions_per_owner")]
    pub max_sessions_per_owner: usize,
    #[serde(default = "default_ring_buffer_bytes")]
    pub ring_buffer_bytes: usize,
    #[serde(default = "default_subscriber_queue_depth")]
    pub subscriber_queue_depth: usize,
    /// Seconds of inactivity before an unattended session is reaped.
    /// Zero disables idle reaping.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_sessions_per_owner: default_max_sessions_per_owner(),
            ring_buffer_bytes: default_ring_buffer_bytes(),
            subscriber_queue_depth: default_subscriber_queue_depth(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// `[spawn]` section: how the agent CLI is launched.
#[derive(Debug, Clone, Deserialize)]
pub struct SpawnSection {
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_workspaces_dir")]
    pub workspaces_dir: String,
    #[serde(default = "default_rows")]
    pub initial_rows: u16,
    #[serde(default = "default_cols")]
    pub initial_cols: u16,
    #[serde(default = "default_initial_command_delay")]
    pub initial_command_delay_ms: u64,
}

impl Default for SpawnSection {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            env: HashMap::new(),
            workspaces_dir: default_workspaces_dir(),
            initial_rows: default_rows(),
            initial_cols: default_cols(),
            initial_command_delay_ms: default_initial_command_delay(),
        }
    }
}

/// `[routing]` section: the fixed worker fleet.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingSection {
    #[serde(default)]
    pub workers: Vec<String>,
    #[serde(default)]
    pub strategy: RouteStrategy,
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            strategy: RouteStrategy::default(),
            virtual_nodes: default_virtual_nodes(),
        }
    }
}

/// `[auth]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// Identity assumed when the proxy header is absent. Leave unset in
    /// production.
    #[serde(default)]
    pub dev_fallback_user: Option<String>,
}

fn default_port() -> u16 {
    4480
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_max_sessions() -> usize {
    50
}
fn default_max_sessions_per_owner() -> usize {
    10
}
fn default_ring_buffer_bytes() -> usize {
    200 * 1024
}
fn default_subscriber_queue_depth() -> usize {
    1024
}
fn default_idle_timeout() -> u64 {
    1800
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_command() -> String {
    "claude".to_string()
}
fn default_args() -> Vec<String> {
    vec!["--dangerously-skip-permissions".to_string()]
}
fn default_workspaces_dir() -> String {
    "~/.agsh/workspaces".to_string()
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_initial_command_delay() -> u64 {
    3000
}
fn default_virtual_nodes() -> usize {
    DEFAULT_VIRTUAL_NODES
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub sessions: SessionsSection,
    pub spawn: SpawnSection,
    pub routing: RoutingSection,
    pub dev_fallback_user: Option<String>,
    pub workspaces_dir: PathBuf,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_workspaces_dir: Option<&str>,
        cli_max_sessions: Option<usize>,
        cli_idle_timeout: Option<u64>,
        cli_dev_user: Option<&str>,
    ) -> AgshResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| AgshError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let mut sessions = file_config.sessions;
        if let Some(max) = cli_max_sessions {
            sessions.max_sessions = max;
        }
        if let Some(idle) = cli_idle_timeout {
            sessions.idle_timeout_secs = idle;
        }

        let workspaces = cli_workspaces_dir
            .map(str::to_string)
            .unwrap_or_else(|| file_config.spawn.workspaces_dir.clone());

        Ok(Self {
            port: cli_port.unwrap_or(file_config.server.port),
            bind: file_config.server.bind,
            sessions,
            spawn: file_config.spawn,
            routing: file_config.routing,
            dev_fallback_user: cli_dev_user
                .map(str::to_string)
                .or(file_config.auth.dev_fallback_user),
            workspaces_dir: expand_tilde_str(&workspaces),
        })
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_sessions: self.sessions.max_sessions,
            max_sessions_per_owner: self.sessions.max_sessions_per_owner,
            ring_buffer_bytes: self.sessions.ring_buffer_bytes,
            subscriber_queue_depth: self.sessions.subscriber_queue_depth,
        }
    }

    pub fn spawn_spec(&self) -> SpawnSpec {
        SpawnSpec {
            command: self.spawn.command.clone(),
            args: self.spawn.args.clone(),
            env: self.spawn.env.clone(),
            initial_rows: self.spawn.initial_rows,
            initial_cols: self.spawn.initial_cols,
            initial_command_delay: Duration::from_millis(self.spawn.initial_command_delay_ms),
        }
    }

    /// Zero means idle reaping is disabled.
    pub fn idle_threshold(&self) -> Option<Duration> {
        match self.sessions.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.sweep_interval_secs.max(1))
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

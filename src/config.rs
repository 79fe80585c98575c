//! Portal configuration — deserialization, validation and loading.

use crate::error::PortalError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` if the value is not a
/// valid env-var reference.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve a map of env-var references to their actual values.
///
/// Unknown variables resolve to the empty string (same as shell `${UNSET-}`).
pub fn resolve_env_vars(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let resolved = match parse_env_ref(v) {
                Some(var_name) => std::env::var(var_name).unwrap_or_default(),
                None => v.clone(), // rejected by validate()
            };
            (k.clone(), resolved)
        })
        .collect()
}

/// How the endpoint artifact identifies the listening socket.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Loopback TCP; the endpoint file holds the port number.
    #[default]
    Tcp,
    /// The endpoint path is itself a Unix domain socket.
    Unix,
}

/// Top-level portal configuration, parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    pub endpoint: PathBuf,
    #[serde(default)]
    pub transport: TransportKind,
    /// Launch command for a new portal process; the endpoint path is appended.
    #[serde(default)]
    pub server_command: Option<Vec<String>>,
    /// Where a spawned portal writes its own diagnostics. Inherited when unset.
    #[serde(default)]
    pub server_log: Option<PathBuf>,
    #[serde(default = "default_accept_timeout_secs")]
    pub accept_timeout_secs: u64,
    #[serde(default = "default_idle_timeouts")]
    pub idle_timeouts: u32,
    #[serde(default = "default_start_poll_interval_ms")]
    pub start_poll_interval_ms: u64,
    #[serde(default = "default_start_poll_retries")]
    pub start_poll_retries: u32,
    /// Run the tool in-process when no portal comes up in time.
    #[serde(default)]
    pub cold_fallback: bool,
    #[serde(default)]
    pub tools: HashMap<String, ToolConfig>,
}

/// Configuration for a single executable exposed as a portal tool.
///
/// Configured under `[tools.<name>]`. The tool is run directly (never through
/// a shell) with the configured args prepended to the request's args.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Env var references (`${VAR}`), resolved at invocation time.
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_accept_timeout_secs() -> u64 {
    60
}

fn default_idle_timeouts() -> u32 {
    3
}

fn default_start_poll_interval_ms() -> u64 {
    333
}

fn default_start_poll_retries() -> u32 {
    10
}

impl PortalConfig {
    /// Minimal configuration for an endpoint, all other settings at their defaults.
    pub fn new(endpoint: impl Into<PathBuf>, transport: TransportKind) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
            server_command: None,
            server_log: None,
            accept_timeout_secs: default_accept_timeout_secs(),
            idle_timeouts: default_idle_timeouts(),
            start_poll_interval_ms: default_start_poll_interval_ms(),
            start_poll_retries: default_start_poll_retries(),
            cold_fallback: false,
            tools: HashMap::new(),
        }
    }

    /// Read, parse and validate a portal.toml file.
    ///
    /// A relative `endpoint` (and `server_log`) is resolved against the
    /// directory containing the config file.
    pub async fn load(path: &Path) -> crate::Result<Self> {
        let section = path.display().to_string();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PortalError::InvalidConfig(section.clone(), e.to_string()))?;
        let mut config: PortalConfig = toml::from_str(&content)
            .map_err(|e| PortalError::InvalidConfig(section, e.to_string()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        if config.endpoint.is_relative() {
            config.endpoint = base.join(&config.endpoint);
        }
        if let Some(log) = config.server_log.as_mut() {
            if log.is_relative() {
                *log = base.join(&*log);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    pub fn start_poll_interval(&self) -> Duration {
        Duration::from_millis(self.start_poll_interval_ms)
    }

    /// Validate the config, failing fast before any socket is bound or process spawned.
    pub fn validate(&self) -> crate::Result<()> {
        let invalid =
            |reason: &str| PortalError::InvalidConfig("portal".to_string(), reason.to_string());

        // 1. The endpoint needs a file name so sibling sentinels have a directory
        if self.endpoint.file_name().is_none() {
            return Err(invalid("'endpoint' must name a file"));
        }

        // 2. Timing knobs must all be positive
        if self.accept_timeout_secs == 0 {
            return Err(invalid("'accept_timeout_secs' must be > 0"));
        }
        if self.idle_timeouts == 0 {
            return Err(invalid("'idle_timeouts' must be > 0"));
        }
        if self.start_poll_interval_ms == 0 {
            return Err(invalid("'start_poll_interval_ms' must be > 0"));
        }
        if self.start_poll_retries == 0 {
            return Err(invalid("'start_poll_retries' must be > 0"));
        }

        // 3. An explicit launch command needs at least a program
        if let Some(command) = &self.server_command {
            if command.first().is_none_or(|program| program.is_empty()) {
                return Err(invalid("'server_command' must not be empty"));
            }
        }

        // 4. Validate each enabled tool
        for (name, tool) in &self.tools {
            if !tool.enabled {
                continue;
            }
            let section = format!("tools.{name}");

            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(PortalError::InvalidConfig(
                    section,
                    "tool name must be non-empty without whitespace".to_string(),
                ));
            }

            if tool.command.is_empty() {
                return Err(PortalError::InvalidConfig(
                    section,
                    "'command' must not be empty".to_string(),
                ));
            }

            for (key, value) in &tool.env {
                if parse_env_ref(value).is_none() {
                    return Err(PortalError::InvalidConfig(
                        section,
                        format!(
                            "env value for key '{}' must be a ${{VAR}} reference, got '{}'",
                            key, value
                        ),
                    ));
                }
            }
        }

        Ok(())
    }
}

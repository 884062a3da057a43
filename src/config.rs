//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::acp::codec::{MAX_LINE_BYTES, READ_BUFFER_BYTES};
use crate::acp::spawner::SpawnConfig;
use crate::logging::LogFormat;
use crate::{AppError, Result};

/// Keychain service the credential is stored under.
pub const KEYRING_SERVICE: &str = "agent-conductor";

/// Keychain entry name for the shared agent credential.
pub const CREDENTIAL_KEYRING_KEY: &str = "agent_credential";

/// Environment fallback for the shared agent credential.
pub const CREDENTIAL_ENV_VAR: &str = "CONDUCTOR_AGENT_CREDENTIAL";

/// How to launch the agent binary.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent binary (e.g., `claude-code-acp`).
    pub command: String,
    /// Arguments passed to every agent.
    #[serde(default)]
    pub args: Vec<String>,
    /// Variable name the credential is exposed to the child as.
    #[serde(default = "default_credential_env")]
    pub credential_env: String,
}

fn default_credential_env() -> String {
    "AGENT_API_KEY".into()
}

/// Teardown timeouts in seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Per-agent bound when a whole user session is torn down.
    #[serde(default = "default_timeout_seconds")]
    pub agent_close_seconds: u64,
    /// Grace period for a child to exit after stdin closes, before kill.
    #[serde(default = "default_timeout_seconds")]
    pub process_exit_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            agent_close_seconds: default_timeout_seconds(),
            process_exit_seconds: default_timeout_seconds(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    5
}

/// Per-client memory limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LimitsConfig {
    /// Hard cap on one response line.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Initial capacity of the response read buffer.
    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            read_buffer_bytes: default_read_buffer_bytes(),
        }
    }
}

fn default_max_line_bytes() -> usize {
    MAX_LINE_BYTES
}

fn default_read_buffer_bytes() -> usize {
    READ_BUFFER_BYTES
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Agent launch settings.
    pub agent: AgentConfig,
    /// Teardown timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Per-client limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Log output format for [`crate::logging::init_tracing`].
    #[serde(default)]
    pub log_format: LogFormat,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Per-agent close bound used by session teardown.
    #[must_use]
    pub fn agent_close_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.agent_close_seconds)
    }

    /// Spawn settings without the credential; see
    /// [`AcpClientFactory::from_config`](crate::driver::acp_driver::AcpClientFactory::from_config).
    #[must_use]
    pub fn spawn_config(&self) -> SpawnConfig {
        let mut spawn = SpawnConfig::new(self.agent.command.clone(), self.agent.args.clone());
        spawn.process_exit_timeout = Duration::from_secs(self.timeouts.process_exit_seconds);
        spawn.max_line_bytes = self.limits.max_line_bytes;
        spawn.read_buffer_bytes = self.limits.read_buffer_bytes;
        spawn
    }

    /// Resolve the shared agent credential from OS keychain with env-var
    /// fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither source provides a value.
    pub async fn load_credential(&self) -> Result<String> {
        load_credential(CREDENTIAL_KEYRING_KEY, CREDENTIAL_ENV_VAR).await
    }

    fn validate(&self) -> Result<()> {
        if self.agent.command.trim().is_empty() {
            return Err(AppError::Config("agent.command must not be empty".into()));
        }

        if self.agent.credential_env.trim().is_empty() {
            return Err(AppError::Config(
                "agent.credential_env must not be empty".into(),
            ));
        }

        if self.timeouts.agent_close_seconds == 0 || self.timeouts.process_exit_seconds == 0 {
            return Err(AppError::Config(
                "timeouts must be greater than zero".into(),
            ));
        }

        if self.limits.max_line_bytes == 0 {
            return Err(AppError::Config(
                "limits.max_line_bytes must be greater than zero".into(),
            ));
        }

        if self.limits.read_buffer_bytes > self.limits.max_line_bytes {
            return Err(AppError::Config(
                "limits.read_buffer_bytes must not exceed limits.max_line_bytes".into(),
            ));
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    match env::var(env_key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))),
    }
}

//! Bridge configuration loading and validation.
//!
//! A config describes one child process plus the bridge's timing policy.
//! Files are YAML; string values may reference the environment as
//! `${VAR_NAME}` or `${VAR_NAME:-default}`, which is how credentials and
//! endpoint URLs reach the child without being written to disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::bridge::errors::BridgeError;

// ─── Defaults ────────────────────────────────────────────────────────────────

/// Default per-call deadline (ms).
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Default startup grace period before the child is considered ready (ms).
pub const DEFAULT_STARTUP_GRACE_MS: u64 = 2_000;

/// Caller identity recorded in the usage log when none is given.
pub const DEFAULT_CALLER: &str = "bridge";

fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

fn default_startup_grace_ms() -> u64 {
    DEFAULT_STARTUP_GRACE_MS
}

fn default_caller() -> String {
    DEFAULT_CALLER.to_string()
}

// ─── BridgeConfig ────────────────────────────────────────────────────────────

/// Configuration for one bridge and its child process.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Executable to spawn.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides merged on top of the inherited parent environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// When set, the child is ready once it emits a notification with this
    /// method, instead of after the grace period.
    #[serde(default)]
    pub ready_notification: Option<String>,
    /// Identity recorded in the usage log for calls made without an explicit
    /// caller.
    #[serde(default = "default_caller")]
    pub caller: String,
    /// Usage log location. `None` means the platform data directory.
    #[serde(default)]
    pub usage_log_path: Option<PathBuf>,
}

impl BridgeConfig {
    /// Programmatic config with defaults for everything but the command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            startup_grace_ms: DEFAULT_STARTUP_GRACE_MS,
            ready_notification: None,
            caller: default_caller(),
            usage_log_path: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// Where the usage log lives: the configured path, or
    /// `<data dir>/usage-log.json`.
    pub fn resolved_usage_log_path(&self) -> PathBuf {
        self.usage_log_path
            .clone()
            .unwrap_or_else(|| crate::data_dir().join("usage-log.json"))
    }

    /// Reject configs that can never work.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.command.trim().is_empty() {
            return Err(BridgeError::config("command must not be empty"));
        }
        if self.call_timeout_ms == 0 {
            return Err(BridgeError::config("call_timeout_ms must be greater than zero"));
        }
        if self.caller.trim().is_empty() {
            return Err(BridgeError::config("caller must not be empty"));
        }
        Ok(())
    }

    /// Parse a YAML document (after env interpolation) and validate it.
    pub fn from_yaml_str(raw: &str) -> Result<Self, BridgeError> {
        let interpolated = interpolate_env_vars(raw);
        let mut config: BridgeConfig = serde_yaml::from_str(&interpolated)
            .map_err(|e| BridgeError::config(format!("failed to parse config: {e}")))?;

        config.command = expand_tilde(&config.command);
        config.cwd = config.cwd.as_deref().map(expand_tilde);
        config.usage_log_path = config
            .usage_log_path
            .as_deref()
            .map(|p| PathBuf::from(expand_tilde(&p.to_string_lossy())));

        config.validate()?;
        Ok(config)
    }

    /// Load and parse a YAML config file.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_yaml_str(&raw)
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Substitute `${VAR}` / `${VAR:-default}` references. An unterminated
/// `${` is left as written.
fn interpolate_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&resolve_var_expr(&after[..end]));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| default.to_string()),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

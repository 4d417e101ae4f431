//! Host configuration.
//!
//! Every option is fixed at construction time; there is no command-line
//! flag surface. Deployments that need different settings point
//! `NYX_CONFIG` at a JSON file.

use serde::{Deserialize, Serialize};

/// Environment variable naming a JSON config override.
const CONFIG_ENV: &str = "NYX_CONFIG";

/// Smallest stack ceiling the host will accept.
const MIN_STACK_SIZE: usize = 16 * 1024;

/// Complete host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Ceiling on engine heap bytes. `None` means unlimited.
    pub memory_limit: Option<usize>,

    /// Ceiling on the execution stack. `None` keeps the engine default.
    pub stack_size: Option<usize>,

    /// Route every engine allocation through an accounting ledger and
    /// trace each operation.
    pub trace_memory: bool,

    /// Emit a memory report at shutdown.
    pub dump_memory: bool,

    /// Observe unhandled promise rejections.
    pub track_rejections: bool,

    /// Register the std/os capability modules in new contexts.
    pub register_std: bool,

    /// Install the global helpers (print, script arguments).
    pub install_helpers: bool,

    /// Arguments exposed to evaluated programs through the helpers.
    pub script_args: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            stack_size: None,
            trace_memory: false,
            dump_memory: false,
            track_rejections: false,
            register_std: true,
            install_helpers: true,
            script_args: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Hardened configuration: bounded heap and stack, rejections
    /// observed.
    pub fn sandboxed() -> Self {
        Self {
            memory_limit: Some(16 * 1024 * 1024),
            stack_size: Some(512 * 1024),
            track_rejections: true,
            ..Self::default()
        }
    }

    /// Configuration for allocation debugging: traced ledger plus a
    /// report at shutdown.
    pub fn traced() -> Self {
        Self {
            trace_memory: true,
            dump_memory: true,
            ..Self::default()
        }
    }

    /// Load the configuration, honoring a `NYX_CONFIG` JSON override.
    pub fn from_env() -> Result<Self, ConfigError> {
        let Ok(path) = std::env::var(CONFIG_ENV) else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(&path)
            .map_err(|err| ConfigError::Unreadable(format!("{path}: {err}")))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|err| ConfigError::Invalid(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_limit == Some(0) {
            return Err(ConfigError::ZeroMemoryLimit);
        }
        if let Some(stack) = self.stack_size {
            if stack < MIN_STACK_SIZE {
                return Err(ConfigError::StackTooSmall);
            }
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("a memory limit of zero would deny every allocation")]
    ZeroMemoryLimit,

    #[error("stack size too small (minimum 16 KB)")]
    StackTooSmall,

    #[error("cannot read config file: {0}")]
    Unreadable(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

//! Host-level error taxonomy.
//!
//! Construction failures are fatal — the launcher exits with a distinct
//! status, since nothing can proceed without a runtime or a context.
//! Evaluation failures are ordinary: they short-circuit the drain loop
//! and route through the shared shutdown path.

use crate::config::ConfigError;
use nyx_engine::EngineError;

/// Fatal construction failures. When one of these surfaces no teardown is
/// owed: they happen before the resource in question exists.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("cannot allocate runtime")]
    RuntimeInit(#[source] EngineError),

    #[error("cannot allocate context")]
    ContextInit(#[source] EngineError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Evaluation failures. The diagnostic has already been written to the
/// host's error sink by the time one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("compilation failed: {0}")]
    Compile(String),

    #[error("execution failed: {0}")]
    Execute(String),

    #[error("pending job failed: {0}")]
    Job(String),
}

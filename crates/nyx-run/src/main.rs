//! nyx: script-runtime launcher
//!
//! Runs with no arguments: constructs one runtime host, evaluates one
//! embedded module, drains the job queue, and tears everything down.
//! Exit status 0 on success, 1 on an evaluation failure, 2 when the
//! runtime or context cannot be constructed.

use anyhow::{Context as _, Result};
use nyx_engine::{ContextId, ScriptedEngine, SourceBuffer};
use nyx_host::{HostConfig, MemoryLoader, RuntimeHost};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// The module evaluated on every run.
const SOURCE: &str = "\
import std
import os
import util
log engine up
alloc 4096
defer log deferred job ran
defer free
";

/// Origin label attached to the embedded module.
const ORIGIN: &str = "<nyx>";

/// Auxiliary module served through the loader.
const UTIL_SOURCE: &str = "\
# shared helper module
alloc 512
";

fn boot() -> Result<(RuntimeHost, ContextId)> {
    let config = HostConfig::from_env().context("configuration")?;
    let mut host = RuntimeHost::create(Box::new(ScriptedEngine::new()), config)
        .context("cannot allocate runtime")?;

    let mut loader = MemoryLoader::new();
    loader.insert("util", UTIL_SOURCE);
    host.set_module_loader(Box::new(loader));

    let ctx = host.new_context().context("cannot allocate context")?;
    Ok((host, ctx))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    info!("nyx starting");

    let (mut host, ctx) = match boot() {
        Ok(pair) => pair,
        Err(err) => {
            error!("nyx: {err:#}");
            return ExitCode::from(2);
        }
    };

    let source = SourceBuffer::module(SOURCE, ORIGIN);
    let status = match host.eval(ctx, &source).and_then(|()| host.drain()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("nyx: {err}");
            ExitCode::from(1)
        }
    };

    host.shutdown();
    info!("nyx shutting down");
    status
}

//! Module loaders.
//!
//! The engine calls back into one of these whenever a module-mode
//! evaluation imports a specifier that is not a registered native
//! module.

use nyx_engine::{ModuleError, ModuleLoader};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// Loader over an in-memory specifier map.
///
/// The launcher serves its embedded auxiliary modules from one of these;
/// tests use it for everything.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    modules: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a module.
    pub fn insert(&mut self, specifier: impl Into<String>, source: impl Into<String>) {
        self.modules.insert(specifier.into(), source.into());
    }
}

impl ModuleLoader for MemoryLoader {
    fn load(&mut self, specifier: &str) -> Result<String, ModuleError> {
        self.modules
            .get(specifier)
            .cloned()
            .ok_or_else(|| ModuleError::NotFound(specifier.to_string()))
    }
}

/// Loader that resolves specifiers as paths under a root directory.
#[derive(Debug)]
pub struct FsLoader {
    root: PathBuf,
}

impl FsLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ModuleLoader for FsLoader {
    fn load(&mut self, specifier: &str) -> Result<String, ModuleError> {
        let path = self.root.join(specifier);
        debug!("loading module '{specifier}' from {}", path.display());
        std::fs::read_to_string(&path).map_err(|source| ModuleError::Io {
            specifier: specifier.to_string(),
            source,
        })
    }
}

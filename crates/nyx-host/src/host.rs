//! The runtime host.
//!
//! Owns one engine backend for its whole life. Construction applies the
//! configured limits and installs the process-wide extension points in a
//! fixed order; teardown runs the inverse order through `Drop`, so every
//! exit path — success or failure — cleans up exactly once.

use crate::config::HostConfig;
use crate::error::HostError;
use crate::handlers::HandlerState;
use nyx_engine::{ContextId, ContextSeed, EngineBackend, ModuleLoader};
use nyx_memory::{AllocLedger, LedgerHandle, MemoryReport, process_rss};
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;
use tracing::{debug, info};

/// Capability modules registered into every context.
const STD_MODULES: [&str; 2] = ["std", "os"];

/// One runtime plus everything the host wires around it.
///
/// Field order is teardown order: the backend (the runtime and all its
/// contexts) drops before the handler state.
pub struct RuntimeHost {
    pub(crate) backend: Box<dyn EngineBackend>,
    handlers: HandlerState,
    config: HostConfig,
    ledger: Option<LedgerHandle>,
    contexts: Vec<ContextId>,
    pending_loader: Option<Box<dyn ModuleLoader>>,
    observer_installed: bool,
    pub(crate) diagnostics: Box<dyn Write>,
}

impl RuntimeHost {
    /// Construct a host around `backend`.
    ///
    /// Order matters: allocation accounting binds before anything else so
    /// the engine never allocates behind the ledger's back, limits come
    /// next, then the worker policy, then the handler state — all before
    /// the first context can exist.
    pub fn create(
        mut backend: Box<dyn EngineBackend>,
        config: HostConfig,
    ) -> Result<Self, HostError> {
        config.validate()?;

        let ledger = if config.trace_memory {
            let mut ledger = AllocLedger::new();
            if let Some(limit) = config.memory_limit {
                ledger.set_ceiling(limit);
            }
            ledger.set_trace(Box::new(io::stdout()));
            let handle: LedgerHandle = Rc::new(RefCell::new(ledger));
            backend.bind_allocator(handle.clone());
            Some(handle)
        } else {
            if let Some(limit) = config.memory_limit {
                backend.set_memory_limit(limit);
            }
            None
        };

        if let Some(stack) = config.stack_size {
            backend.set_max_stack_size(stack);
        }

        // Workers the engine constructs later follow the same policy as
        // the primary context.
        backend.set_worker_seed(ContextSeed {
            modules: if config.register_std {
                STD_MODULES.iter().map(|name| name.to_string()).collect()
            } else {
                Vec::new()
            },
            helpers: config.install_helpers,
            args: config.script_args.clone(),
        });

        let handlers = HandlerState::init();
        info!("runtime host up (memory limit: {:?})", config.memory_limit);

        Ok(Self {
            backend,
            handlers,
            config,
            ledger,
            contexts: Vec::new(),
            pending_loader: None,
            observer_installed: false,
            diagnostics: Box::new(io::stderr()),
        })
    }

    /// Stage a module loader; it is installed on the runtime when the
    /// next context is created.
    pub fn set_module_loader(&mut self, loader: Box<dyn ModuleLoader>) {
        self.pending_loader = Some(loader);
    }

    /// Redirect exception diagnostics (stderr by default).
    pub fn set_diagnostics(&mut self, sink: Box<dyn Write>) {
        self.diagnostics = sink;
    }

    /// Create an execution context: registers the capability modules,
    /// installs the helpers, and wires the runtime-level callbacks the
    /// first time through.
    pub fn new_context(&mut self) -> Result<ContextId, HostError> {
        let ctx = self
            .backend
            .create_context()
            .map_err(HostError::ContextInit)?;

        if self.config.register_std {
            for name in STD_MODULES {
                self.backend
                    .register_module(ctx, name)
                    .map_err(HostError::ContextInit)?;
            }
        }
        if self.config.install_helpers {
            self.backend
                .install_helpers(ctx, &self.config.script_args)
                .map_err(HostError::ContextInit)?;
        }
        if let Some(loader) = self.pending_loader.take() {
            self.backend.set_module_loader(loader);
        }
        if self.config.track_rejections && !self.observer_installed {
            self.backend
                .set_rejection_observer(Box::new(self.handlers.observer()));
            self.observer_installed = true;
        }

        self.contexts.push(ctx);
        info!("created {ctx}");
        Ok(ctx)
    }

    /// Accounting ledger, present when memory tracing is on.
    pub fn ledger(&self) -> Option<LedgerHandle> {
        self.ledger.clone()
    }

    /// Unhandled rejections observed so far.
    pub fn unhandled_rejections(&self) -> usize {
        self.handlers.unhandled_rejections()
    }

    /// Memory accounting snapshot, with the process RSS filled in.
    pub fn memory_report(&self) -> MemoryReport {
        let mut report = self.backend.memory_report();
        report.process_rss = process_rss();
        report
    }

    /// Explicit shutdown. Emits the memory report if configured, then
    /// runs the same linear teardown every exit path takes.
    pub fn shutdown(self) {
        if self.config.dump_memory {
            let report = self.memory_report();
            info!("memory at shutdown: {}", report.format());
            if let Ok(json) = serde_json::to_string(&report) {
                debug!(target: "nyx::mem", "{json}");
            }
        }
        drop(self);
    }
}

impl Drop for RuntimeHost {
    fn drop(&mut self) {
        // Contexts die first; the backend (the runtime itself) and the
        // handler state then drop in field order.
        for ctx in self.contexts.drain(..) {
            self.backend.destroy_context(ctx);
        }
        debug!("runtime host down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvalError;
    use crate::loader::MemoryLoader;
    use nyx_engine::{ScriptedEngine, SourceBuffer};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Write adapter over a shared buffer, for capturing diagnostics.
    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn traced_host() -> RuntimeHost {
        let config = HostConfig {
            trace_memory: true,
            ..HostConfig::default()
        };
        RuntimeHost::create(Box::new(ScriptedEngine::new()), config).unwrap()
    }

    #[test]
    fn test_std_modules_are_importable() {
        let mut host = traced_host();
        let ctx = host.new_context().unwrap();

        let source = SourceBuffer::module("import std\nimport os", "<test>");
        host.eval(ctx, &source).unwrap();
    }

    #[test]
    fn test_script_success_leaves_no_jobs() {
        let mut host = traced_host();
        let ctx = host.new_context().unwrap();

        let source = SourceBuffer::script("alloc 64\nfree", "<test>");
        host.eval(ctx, &source).unwrap();
        host.drain().unwrap();
    }

    #[test]
    fn test_uncaught_throw_dumps_a_diagnostic() {
        let captured = Rc::new(RefCell::new(Vec::new()));
        let mut host = traced_host();
        host.set_diagnostics(Box::new(SharedSink(captured.clone())));
        let ctx = host.new_context().unwrap();

        let source = SourceBuffer::script("throw boom", "<test>");
        let err = host.eval(ctx, &source).unwrap_err();
        assert!(matches!(err, EvalError::Execute(_)));

        let dumped = String::from_utf8(captured.borrow().clone()).unwrap();
        assert!(dumped.contains("Error: boom"));
    }

    #[test]
    fn test_shutdown_returns_accounting_to_zero() {
        let mut host = traced_host();
        let ledger = host.ledger().unwrap();
        let ctx = host.new_context().unwrap();

        let source = SourceBuffer::script("alloc 4096\ndefer alloc 64", "<test>");
        host.eval(ctx, &source).unwrap();
        host.drain().unwrap();
        assert!(ledger.borrow().live_bytes() > 0);

        host.shutdown();
        assert_eq!(ledger.borrow().live_bytes(), 0);
        assert_eq!(ledger.borrow().live_objects(), 0);
    }

    #[test]
    fn test_failed_eval_still_tears_down_cleanly() {
        let mut host = traced_host();
        host.set_diagnostics(Box::new(SharedSink(Rc::new(RefCell::new(Vec::new())))));
        let ledger = host.ledger().unwrap();
        let ctx = host.new_context().unwrap();

        let source = SourceBuffer::script("alloc 128\nthrow boom", "<test>");
        assert!(host.eval(ctx, &source).is_err());

        host.shutdown();
        assert_eq!(ledger.borrow().live_bytes(), 0);
        assert_eq!(ledger.borrow().live_objects(), 0);
    }

    #[test]
    fn test_missing_module_import_is_an_eval_error() {
        let captured = Rc::new(RefCell::new(Vec::new()));
        let mut host = traced_host();
        host.set_diagnostics(Box::new(SharedSink(captured.clone())));
        let ctx = host.new_context().unwrap();

        let source = SourceBuffer::module("import missing", "<test>");
        let err = host.eval(ctx, &source).unwrap_err();
        assert!(matches!(err, EvalError::Compile(_)));

        let dumped = String::from_utf8(captured.borrow().clone()).unwrap();
        assert!(dumped.contains("missing"));

        // Nothing was enqueued by the failed evaluation.
        host.drain().unwrap();
    }

    #[test]
    fn test_staged_loader_resolves_imports() {
        let mut host = traced_host();
        let mut loader = MemoryLoader::new();
        loader.insert("util", "alloc 32");
        host.set_module_loader(Box::new(loader));
        let ctx = host.new_context().unwrap();

        let source = SourceBuffer::module("import util", "<test>");
        host.eval(ctx, &source).unwrap();
    }

    #[test]
    fn test_rejections_are_counted_when_tracked() {
        let config = HostConfig {
            track_rejections: true,
            ..HostConfig::default()
        };
        let mut host = RuntimeHost::create(Box::new(ScriptedEngine::new()), config).unwrap();
        let ctx = host.new_context().unwrap();

        let source = SourceBuffer::script("reject nobody listening", "<test>");
        host.eval(ctx, &source).unwrap();
        host.drain().unwrap();

        assert_eq!(host.unhandled_rejections(), 1);
    }

    #[test]
    fn test_memory_report_includes_rss() {
        let host = traced_host();
        let report = host.memory_report();
        assert!(report.process_rss.unwrap() > 0);
    }

    #[test]
    fn test_invalid_config_is_a_construction_error() {
        let config = HostConfig {
            memory_limit: Some(0),
            ..HostConfig::default()
        };
        assert!(RuntimeHost::create(Box::new(ScriptedEngine::new()), config).is_err());
    }

    #[test]
    fn test_memory_limit_denial_is_catchable_not_fatal() {
        let config = HostConfig {
            trace_memory: true,
            memory_limit: Some(2048),
            ..HostConfig::default()
        };
        let mut host = RuntimeHost::create(Box::new(ScriptedEngine::new()), config).unwrap();
        host.set_diagnostics(Box::new(SharedSink(Rc::new(RefCell::new(Vec::new())))));
        let ctx = host.new_context().unwrap();

        let source = SourceBuffer::script("alloc 4096", "<test>");
        let err = host.eval(ctx, &source).unwrap_err();
        assert!(matches!(err, EvalError::Execute(_)));

        // The denial was an ordinary evaluation failure; the host still
        // works afterwards.
        let source = SourceBuffer::script("alloc 16\nfree", "<test>");
        host.eval(ctx, &source).unwrap();
    }
}

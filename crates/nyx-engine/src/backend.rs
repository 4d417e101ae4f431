//! The engine backend trait and its handle types.
//!
//! The host drives the engine exclusively through [`EngineBackend`]; real
//! bindings (QuickJS, V8) and the bundled scripted backend plug in behind
//! the same surface.

use crate::source::SourceBuffer;
use nyx_memory::{LedgerHandle, MemoryReport};
use std::fmt;

/// Opaque handle to one execution context inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Opaque handle to one engine-owned value (a compiled program or an
/// evaluation result). Whoever receives one owns it and must release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub(crate) u64);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "val#{}", self.0)
    }
}

/// Result of asking the engine to run one queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The queue is empty.
    Idle,
    /// One job ran to completion in the given context.
    Ran(ContextId),
    /// One job ran and raised; the exception is pending on the context.
    Raised(ContextId),
}

/// Initialization policy for contexts the engine constructs on its own
/// (worker contexts). Seeded by the host so workers match the primary
/// context.
#[derive(Debug, Clone, Default)]
pub struct ContextSeed {
    /// Native capability modules to register.
    pub modules: Vec<String>,
    /// Whether to install the global helpers.
    pub helpers: bool,
    /// Script arguments exposed through the helpers.
    pub args: Vec<String>,
}

/// Resolves module specifiers to source text on behalf of the engine.
pub trait ModuleLoader {
    /// Load the source for `specifier`.
    fn load(&mut self, specifier: &str) -> Result<String, ModuleError>;
}

/// Module resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("module '{0}' not found")]
    NotFound(String),

    #[error("failed to read module '{specifier}'")]
    Io {
        specifier: String,
        #[source]
        source: std::io::Error,
    },
}

/// Receives unhandled promise rejections surfaced by the engine.
pub trait RejectionObserver {
    fn on_unhandled_rejection(&mut self, ctx: ContextId, reason: &str);
}

/// Engine-level failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine construction failed: {0}")]
    Construction(String),

    #[error("unknown context handle")]
    InvalidContext,

    #[error("unknown value handle")]
    InvalidValue,

    /// An exception was raised and is pending on the context; retrieve it
    /// with [`EngineBackend::take_exception`].
    #[error("exception raised")]
    Exception,

    #[error("out of memory")]
    OutOfMemory,
}

/// Everything the host needs from an embedded interpreter.
///
/// One implementation owns one runtime: all contexts, all values, the job
/// queue, and the allocator binding. Dropping the backend destroys the
/// runtime and everything still inside it.
pub trait EngineBackend {
    /// Route all engine allocations through an accounting ledger. Must be
    /// called before the first context exists.
    fn bind_allocator(&mut self, ledger: LedgerHandle);

    /// Forward a memory ceiling to the engine's own accounting (used when
    /// no external ledger is bound).
    fn set_memory_limit(&mut self, bytes: usize);

    /// Cap the execution stack.
    fn set_max_stack_size(&mut self, bytes: usize);

    /// Install the module-loader callback. Replaces any previous loader.
    fn set_module_loader(&mut self, loader: Box<dyn ModuleLoader>);

    /// Install the unhandled-rejection observer.
    fn set_rejection_observer(&mut self, observer: Box<dyn RejectionObserver>);

    /// Seed the initialization policy for worker contexts.
    fn set_worker_seed(&mut self, seed: ContextSeed);

    /// Construct a fresh execution context.
    fn create_context(&mut self) -> Result<ContextId, EngineError>;

    /// Destroy a context and everything it owns.
    fn destroy_context(&mut self, ctx: ContextId);

    /// Register a native capability module under `name`. Idempotent per
    /// context; the only observable effect is that the name becomes
    /// importable.
    fn register_module(&mut self, ctx: ContextId, name: &str) -> Result<(), EngineError>;

    /// Install the global helpers (print and script arguments).
    fn install_helpers(&mut self, ctx: ContextId, args: &[String]) -> Result<(), EngineError>;

    /// Compile a buffer without executing it (module phase 1).
    fn compile(&mut self, ctx: ContextId, source: &SourceBuffer) -> Result<ValueId, EngineError>;

    /// Attach reflective metadata to a compiled module, between compile
    /// and execute.
    fn attach_module_meta(
        &mut self,
        ctx: ContextId,
        module: ValueId,
        origin: &str,
        main: bool,
    ) -> Result<(), EngineError>;

    /// Execute a compiled module (phase 2). Consumes `compiled` whether or
    /// not execution succeeds.
    fn execute(&mut self, ctx: ContextId, compiled: ValueId) -> Result<ValueId, EngineError>;

    /// Single-phase compile-and-run for script-mode buffers.
    fn eval(&mut self, ctx: ContextId, source: &SourceBuffer) -> Result<ValueId, EngineError>;

    /// Release an engine-owned value.
    fn release_value(&mut self, ctx: ContextId, value: ValueId);

    /// Take the pending exception off a context, formatted for
    /// diagnostics.
    fn take_exception(&mut self, ctx: ContextId) -> Option<String>;

    /// Run the next queued job, if any. The only way jobs ever execute.
    fn run_pending_job(&mut self) -> JobOutcome;

    /// Snapshot of the engine's memory accounting.
    fn memory_report(&self) -> MemoryReport;
}

//! Nyx Engine Interface
//!
//! The seam between the runtime host and the embedded script engine.
//! [`EngineBackend`] captures exactly the primitives the host consumes:
//! context construction, two-phase module evaluation, pending-exception
//! retrieval, job-queue stepping, memory and stack limits, and the
//! process-wide callbacks (module loader, rejection observer, worker
//! context policy).
//!
//! [`ScriptedEngine`] is the bundled deterministic backend: it honors the
//! full interface contract — compile/execute phases, a FIFO job queue,
//! allocator-charged object lifetimes — without carrying a JavaScript
//! implementation.

mod backend;
pub mod scripted;
mod source;

pub use backend::{
    ContextId, ContextSeed, EngineBackend, EngineError, JobOutcome, ModuleError, ModuleLoader,
    RejectionObserver, ValueId,
};
pub use scripted::ScriptedEngine;
pub use source::{EvalMode, SourceBuffer};

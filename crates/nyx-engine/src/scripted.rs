//! Deterministic scripted backend.
//!
//! Implements the full [`EngineBackend`] contract over a line-oriented
//! statement language instead of JavaScript: compilation validates every
//! statement and resolves every import, execution charges allocations
//! through the bound ledger, and asynchronous continuations go through the
//! runtime-owned FIFO job queue. Real engine bindings would slot in behind
//! the same trait; this backend exists so the launcher and the test suite
//! have an engine with fully observable behavior.
//!
//! Statements:
//!
//! ```text
//! log <message>      print through the global helpers
//! alloc <bytes>      allocate from the engine heap
//! grow <bytes>       resize the most recent allocation
//! free               release the most recent allocation
//! throw <message>    raise an exception
//! defer <statement>  queue a statement to run as a job
//! reject <reason>    queue an unhandled-rejection notification
//! import <name>      link a native module or load one (modules only)
//! recurse <frames>   consume stack frames
//! worker             construct a worker context from the seeded policy
//! ```
//!
//! Blank lines and lines starting with `#` are ignored.

use crate::backend::{
    ContextId, ContextSeed, EngineBackend, EngineError, JobOutcome, ModuleLoader,
    RejectionObserver, ValueId,
};
use crate::source::{EvalMode, SourceBuffer};
use nyx_memory::{AllocError, AllocId, AllocLedger, LedgerHandle, MemoryReport};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Bytes charged per live context.
const CONTEXT_COST: usize = 256;

/// Bytes charged per live value handle.
const VALUE_COST: usize = 16;

/// Bytes one recursion frame consumes against the stack ceiling.
const FRAME_COST: usize = 1024;

/// Import graphs deeper than this are rejected at compile time.
const MAX_IMPORT_DEPTH: usize = 8;

#[derive(Debug, Clone)]
enum Stmt {
    Log(String),
    Alloc(usize),
    Grow(usize),
    Free,
    Throw(String),
    Defer(Box<Stmt>),
    Reject(String),
    Import(String),
    Recurse(usize),
    Worker,
}

/// Reflective metadata attached to a compiled module between the compile
/// and execute phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleMeta {
    pub url: String,
    pub main: bool,
}

struct Program {
    statements: Vec<Stmt>,
    mode: EvalMode,
    meta: Option<ModuleMeta>,
}

enum ValueKind {
    Program(Program),
    Result,
}

struct ValueRecord {
    charge: AllocId,
    kind: ValueKind,
}

struct Context {
    charge: AllocId,
    modules: BTreeSet<String>,
    helpers: bool,
    user_allocs: Vec<AllocId>,
    values: HashMap<ValueId, ValueRecord>,
    pending_exception: Option<String>,
}

enum JobWork {
    Run(Stmt),
    NotifyRejection(String),
}

struct Job {
    ctx: ContextId,
    work: JobWork,
}

/// The bundled engine. One instance is one runtime: it owns every context,
/// every value, the job queue, and the allocator binding.
pub struct ScriptedEngine {
    ledger: LedgerHandle,
    contexts: HashMap<ContextId, Context>,
    jobs: VecDeque<Job>,
    loader: Option<Box<dyn ModuleLoader>>,
    rejections: Option<Box<dyn RejectionObserver>>,
    worker_seed: ContextSeed,
    stack_limit: Option<usize>,
    next_ctx: u64,
    next_value: u64,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            ledger: Rc::new(RefCell::new(AllocLedger::new())),
            contexts: HashMap::new(),
            jobs: VecDeque::new(),
            loader: None,
            rejections: None,
            worker_seed: ContextSeed::default(),
            stack_limit: None,
            next_ctx: 1,
            next_value: 1,
        }
    }

    /// Handle to the ledger currently accounting this engine.
    pub fn ledger(&self) -> LedgerHandle {
        self.ledger.clone()
    }

    /// Number of live contexts, workers included.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Number of queued jobs.
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Metadata attached to a compiled module value, if any.
    pub fn module_meta(&self, ctx: ContextId, value: ValueId) -> Option<ModuleMeta> {
        let record = self.contexts.get(&ctx)?.values.get(&value)?;
        match &record.kind {
            ValueKind::Program(program) => program.meta.clone(),
            ValueKind::Result => None,
        }
    }

    fn parse_program(
        loader: &mut Option<Box<dyn ModuleLoader>>,
        modules: &BTreeSet<String>,
        source: &str,
        origin: &str,
        mode: EvalMode,
        depth: usize,
    ) -> Result<Vec<Stmt>, String> {
        if depth > MAX_IMPORT_DEPTH {
            return Err(format!("InternalError: module graph too deep at '{origin}'"));
        }

        let mut out = Vec::new();
        for (idx, raw) in source.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line_no = idx + 1;

            if let Some(spec) = line.strip_prefix("import ") {
                let spec = spec.trim();
                if mode != EvalMode::Module {
                    return Err(format!(
                        "SyntaxError: import is only valid in modules ({origin}:{line_no})"
                    ));
                }
                if modules.contains(spec) {
                    out.push(Stmt::Import(spec.to_string()));
                    continue;
                }
                let text = match loader {
                    Some(loader_impl) => loader_impl.load(spec).map_err(|err| {
                        format!("ReferenceError: could not load module '{spec}': {err} ({origin}:{line_no})")
                    })?,
                    None => {
                        return Err(format!(
                            "ReferenceError: could not load module '{spec}' ({origin}:{line_no})"
                        ));
                    }
                };
                // The imported module's body runs before the rest of the
                // importer, so its statements are spliced in here.
                let imported =
                    Self::parse_program(loader, modules, &text, spec, EvalMode::Module, depth + 1)?;
                out.extend(imported);
                continue;
            }

            out.push(Self::parse_stmt(line, origin, line_no)?);
        }
        Ok(out)
    }

    fn parse_stmt(line: &str, origin: &str, line_no: usize) -> Result<Stmt, String> {
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };

        match head {
            "log" => Ok(Stmt::Log(rest.to_string())),
            "alloc" => Ok(Stmt::Alloc(parse_positive(rest, "alloc", origin, line_no)?)),
            "grow" => Ok(Stmt::Grow(parse_size(rest, "grow", origin, line_no)?)),
            "free" => Ok(Stmt::Free),
            "throw" => Ok(Stmt::Throw(if rest.is_empty() {
                "uncaught".to_string()
            } else {
                rest.to_string()
            })),
            "defer" => {
                if rest.is_empty() {
                    return Err(format!(
                        "SyntaxError: defer needs a statement ({origin}:{line_no})"
                    ));
                }
                if rest == "import" || rest.starts_with("import ") {
                    return Err(format!(
                        "SyntaxError: import cannot be deferred ({origin}:{line_no})"
                    ));
                }
                let inner = Self::parse_stmt(rest, origin, line_no)?;
                Ok(Stmt::Defer(Box::new(inner)))
            }
            "reject" => Ok(Stmt::Reject(if rest.is_empty() {
                "unhandled".to_string()
            } else {
                rest.to_string()
            })),
            "import" => Err(format!(
                "SyntaxError: import needs a module name ({origin}:{line_no})"
            )),
            "recurse" => Ok(Stmt::Recurse(parse_size(rest, "recurse", origin, line_no)?)),
            "worker" => Ok(Stmt::Worker),
            _ => Err(format!(
                "SyntaxError: unknown statement '{head}' ({origin}:{line_no})"
            )),
        }
    }

    fn run_statements(&mut self, ctx: ContextId, statements: &[Stmt]) -> Result<(), EngineError> {
        for stmt in statements {
            if let Err(message) = self.run_stmt(ctx, stmt) {
                self.set_exception(ctx, message);
                return Err(EngineError::Exception);
            }
        }
        Ok(())
    }

    fn run_stmt(&mut self, ctx: ContextId, stmt: &Stmt) -> Result<(), String> {
        match stmt {
            Stmt::Log(message) => {
                let context = self
                    .contexts
                    .get(&ctx)
                    .ok_or("InternalError: context destroyed")?;
                if !context.helpers {
                    return Err("ReferenceError: print is not defined".to_string());
                }
                info!(target: "nyx::script", "{message}");
                Ok(())
            }
            Stmt::Alloc(size) => match self.ledger.borrow_mut().allocate(*size) {
                Ok(id) => {
                    self.contexts
                        .get_mut(&ctx)
                        .ok_or("InternalError: context destroyed")?
                        .user_allocs
                        .push(id);
                    Ok(())
                }
                Err(AllocError::CeilingExceeded { .. }) => {
                    Err("RangeError: out of memory".to_string())
                }
                Err(err) => Err(format!("InternalError: {err}")),
            },
            Stmt::Grow(size) => {
                let last = self
                    .contexts
                    .get(&ctx)
                    .and_then(|context| context.user_allocs.last().copied());
                let Some(last) = last else {
                    return Err("TypeError: nothing to grow".to_string());
                };
                match self.ledger.borrow_mut().resize(Some(last), *size) {
                    Ok(Some(_)) => Ok(()),
                    Ok(None) => {
                        // Resized to zero: the allocation is gone.
                        if let Some(context) = self.contexts.get_mut(&ctx) {
                            context.user_allocs.pop();
                        }
                        Ok(())
                    }
                    Err(AllocError::CeilingExceeded { .. }) => {
                        Err("RangeError: out of memory".to_string())
                    }
                    Err(err) => Err(format!("InternalError: {err}")),
                }
            }
            Stmt::Free => {
                let popped = self
                    .contexts
                    .get_mut(&ctx)
                    .and_then(|context| context.user_allocs.pop());
                match popped {
                    Some(id) => {
                        self.ledger.borrow_mut().release(id);
                        Ok(())
                    }
                    None => Err("TypeError: nothing to free".to_string()),
                }
            }
            Stmt::Throw(message) => Err(format!("Error: {message}")),
            Stmt::Defer(inner) => {
                self.jobs.push_back(Job {
                    ctx,
                    work: JobWork::Run((**inner).clone()),
                });
                Ok(())
            }
            Stmt::Reject(reason) => {
                self.jobs.push_back(Job {
                    ctx,
                    work: JobWork::NotifyRejection(reason.clone()),
                });
                Ok(())
            }
            Stmt::Import(name) => {
                // Native modules are resolved at compile time; linking is
                // a no-op here.
                debug!("{ctx} linked native module '{name}'");
                Ok(())
            }
            Stmt::Recurse(frames) => {
                if let Some(limit) = self.stack_limit {
                    if frames.saturating_mul(FRAME_COST) > limit {
                        return Err("InternalError: stack overflow".to_string());
                    }
                }
                Ok(())
            }
            Stmt::Worker => {
                let worker = self
                    .spawn_worker_context()
                    .map_err(|err| format!("InternalError: {err}"))?;
                debug!("worker {worker} started");
                Ok(())
            }
        }
    }

    fn spawn_worker_context(&mut self) -> Result<ContextId, EngineError> {
        let seed = self.worker_seed.clone();
        let id = self.create_context()?;
        for module in &seed.modules {
            self.register_module(id, module)?;
        }
        if seed.helpers {
            self.install_helpers(id, &seed.args)?;
        }
        Ok(id)
    }

    fn new_result_value(&mut self, ctx: ContextId) -> Result<ValueId, EngineError> {
        if !self.contexts.contains_key(&ctx) {
            return Err(EngineError::InvalidContext);
        }
        let charge = self
            .ledger
            .borrow_mut()
            .allocate(VALUE_COST)
            .map_err(|_| EngineError::OutOfMemory)?;
        let id = ValueId(self.next_value);
        self.next_value += 1;
        self.contexts.get_mut(&ctx).expect("checked above").values.insert(
            id,
            ValueRecord {
                charge,
                kind: ValueKind::Result,
            },
        );
        Ok(id)
    }

    fn set_exception(&mut self, ctx: ContextId, message: String) {
        if let Some(context) = self.contexts.get_mut(&ctx) {
            context.pending_exception = Some(message);
        }
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBackend for ScriptedEngine {
    fn bind_allocator(&mut self, ledger: LedgerHandle) {
        debug_assert!(self.contexts.is_empty(), "allocator bound after contexts exist");
        self.ledger = ledger;
    }

    fn set_memory_limit(&mut self, bytes: usize) {
        self.ledger.borrow_mut().set_ceiling(bytes);
    }

    fn set_max_stack_size(&mut self, bytes: usize) {
        self.stack_limit = Some(bytes);
    }

    fn set_module_loader(&mut self, loader: Box<dyn ModuleLoader>) {
        self.loader = Some(loader);
    }

    fn set_rejection_observer(&mut self, observer: Box<dyn RejectionObserver>) {
        self.rejections = Some(observer);
    }

    fn set_worker_seed(&mut self, seed: ContextSeed) {
        self.worker_seed = seed;
    }

    fn create_context(&mut self) -> Result<ContextId, EngineError> {
        let charge = self
            .ledger
            .borrow_mut()
            .allocate(CONTEXT_COST)
            .map_err(|_| EngineError::OutOfMemory)?;
        let id = ContextId(self.next_ctx);
        self.next_ctx += 1;
        self.contexts.insert(
            id,
            Context {
                charge,
                modules: BTreeSet::new(),
                helpers: false,
                user_allocs: Vec::new(),
                values: HashMap::new(),
                pending_exception: None,
            },
        );
        debug!("created {id}");
        Ok(id)
    }

    fn destroy_context(&mut self, ctx: ContextId) {
        let Some(context) = self.contexts.remove(&ctx) else {
            warn!("destroy of unknown {ctx}");
            return;
        };
        let mut ledger = self.ledger.borrow_mut();
        for record in context.values.into_values() {
            ledger.release(record.charge);
        }
        for id in context.user_allocs {
            ledger.release(id);
        }
        ledger.release(context.charge);
        debug!("destroyed {ctx}");
    }

    fn register_module(&mut self, ctx: ContextId, name: &str) -> Result<(), EngineError> {
        let context = self.contexts.get_mut(&ctx).ok_or(EngineError::InvalidContext)?;
        context.modules.insert(name.to_string());
        Ok(())
    }

    fn install_helpers(&mut self, ctx: ContextId, args: &[String]) -> Result<(), EngineError> {
        let context = self.contexts.get_mut(&ctx).ok_or(EngineError::InvalidContext)?;
        context.helpers = true;
        if !args.is_empty() {
            debug!("{ctx} script args: {args:?}");
        }
        Ok(())
    }

    fn compile(&mut self, ctx: ContextId, source: &SourceBuffer) -> Result<ValueId, EngineError> {
        let context = self.contexts.get(&ctx).ok_or(EngineError::InvalidContext)?;
        let parsed = Self::parse_program(
            &mut self.loader,
            &context.modules,
            source.as_str(),
            source.origin(),
            source.mode(),
            0,
        );
        let statements = match parsed {
            Ok(statements) => statements,
            Err(message) => {
                self.set_exception(ctx, message);
                return Err(EngineError::Exception);
            }
        };

        let charged = self.ledger.borrow_mut().allocate(source.len().max(1));
        let charge = match charged {
            Ok(charge) => charge,
            Err(_) => {
                self.set_exception(ctx, "RangeError: out of memory".to_string());
                return Err(EngineError::Exception);
            }
        };
        let id = ValueId(self.next_value);
        self.next_value += 1;
        let count = statements.len();
        self.contexts.get_mut(&ctx).expect("checked above").values.insert(
            id,
            ValueRecord {
                charge,
                kind: ValueKind::Program(Program {
                    statements,
                    mode: source.mode(),
                    meta: None,
                }),
            },
        );
        debug!("{ctx} compiled {} ({count} statements)", source.origin());
        Ok(id)
    }

    fn attach_module_meta(
        &mut self,
        ctx: ContextId,
        module: ValueId,
        origin: &str,
        main: bool,
    ) -> Result<(), EngineError> {
        let context = self.contexts.get_mut(&ctx).ok_or(EngineError::InvalidContext)?;
        let record = context.values.get_mut(&module).ok_or(EngineError::InvalidValue)?;
        match &mut record.kind {
            ValueKind::Program(program) if program.mode == EvalMode::Module => {
                program.meta = Some(ModuleMeta {
                    url: origin.to_string(),
                    main,
                });
                Ok(())
            }
            _ => Err(EngineError::InvalidValue),
        }
    }

    fn execute(&mut self, ctx: ContextId, compiled: ValueId) -> Result<ValueId, EngineError> {
        if !self.contexts.contains_key(&ctx) {
            return Err(EngineError::InvalidContext);
        }
        let record = self
            .contexts
            .get_mut(&ctx)
            .expect("checked above")
            .values
            .remove(&compiled)
            .ok_or(EngineError::InvalidValue)?;
        self.ledger.borrow_mut().release(record.charge);
        let ValueKind::Program(program) = record.kind else {
            return Err(EngineError::InvalidValue);
        };

        self.run_statements(ctx, &program.statements)?;
        self.new_result_value(ctx)
    }

    fn eval(&mut self, ctx: ContextId, source: &SourceBuffer) -> Result<ValueId, EngineError> {
        let context = self.contexts.get(&ctx).ok_or(EngineError::InvalidContext)?;
        let parsed = Self::parse_program(
            &mut self.loader,
            &context.modules,
            source.as_str(),
            source.origin(),
            source.mode(),
            0,
        );
        let statements = match parsed {
            Ok(statements) => statements,
            Err(message) => {
                self.set_exception(ctx, message);
                return Err(EngineError::Exception);
            }
        };

        self.run_statements(ctx, &statements)?;
        self.new_result_value(ctx)
    }

    fn release_value(&mut self, ctx: ContextId, value: ValueId) {
        let removed = self
            .contexts
            .get_mut(&ctx)
            .and_then(|context| context.values.remove(&value));
        match removed {
            Some(record) => self.ledger.borrow_mut().release(record.charge),
            None => warn!("release of unknown {value}"),
        }
    }

    fn take_exception(&mut self, ctx: ContextId) -> Option<String> {
        self.contexts
            .get_mut(&ctx)
            .and_then(|context| context.pending_exception.take())
    }

    fn run_pending_job(&mut self) -> JobOutcome {
        while let Some(job) = self.jobs.pop_front() {
            if !self.contexts.contains_key(&job.ctx) {
                debug!("dropping job for destroyed {}", job.ctx);
                continue;
            }
            match job.work {
                JobWork::NotifyRejection(reason) => {
                    match &mut self.rejections {
                        Some(observer) => observer.on_unhandled_rejection(job.ctx, &reason),
                        None => debug!("{} unhandled rejection: {reason}", job.ctx),
                    }
                    return JobOutcome::Ran(job.ctx);
                }
                JobWork::Run(stmt) => {
                    return match self.run_stmt(job.ctx, &stmt) {
                        Ok(()) => JobOutcome::Ran(job.ctx),
                        Err(message) => {
                            self.set_exception(job.ctx, message);
                            JobOutcome::Raised(job.ctx)
                        }
                    };
                }
            }
        }
        JobOutcome::Idle
    }

    fn memory_report(&self) -> MemoryReport {
        self.ledger.borrow().report()
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        let ids: Vec<_> = self.contexts.keys().copied().collect();
        for id in ids {
            self.destroy_context(id);
        }
    }
}

fn parse_positive(rest: &str, what: &str, origin: &str, line_no: usize) -> Result<usize, String> {
    let n = parse_size(rest, what, origin, line_no)?;
    if n == 0 {
        return Err(format!(
            "SyntaxError: {what} needs a positive byte count ({origin}:{line_no})"
        ));
    }
    Ok(n)
}

fn parse_size(rest: &str, what: &str, origin: &str, line_no: usize) -> Result<usize, String> {
    rest.parse()
        .map_err(|_| format!("SyntaxError: {what} needs a number ({origin}:{line_no})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ModuleError;
    use std::collections::HashMap;

    struct MapLoader(HashMap<String, String>);

    impl MapLoader {
        fn with(specifier: &str, source: &str) -> Self {
            let mut map = HashMap::new();
            map.insert(specifier.to_string(), source.to_string());
            Self(map)
        }
    }

    impl ModuleLoader for MapLoader {
        fn load(&mut self, specifier: &str) -> Result<String, ModuleError> {
            self.0
                .get(specifier)
                .cloned()
                .ok_or_else(|| ModuleError::NotFound(specifier.to_string()))
        }
    }

    struct Capture(Rc<RefCell<Vec<String>>>);

    impl RejectionObserver for Capture {
        fn on_unhandled_rejection(&mut self, _ctx: ContextId, reason: &str) {
            self.0.borrow_mut().push(reason.to_string());
        }
    }

    fn engine_with_context() -> (ScriptedEngine, ContextId) {
        let mut engine = ScriptedEngine::new();
        let ctx = engine.create_context().unwrap();
        (engine, ctx)
    }

    #[test]
    fn test_unknown_statement_fails_compilation() {
        let (mut engine, ctx) = engine_with_context();
        let source = SourceBuffer::script("explode now", "<test>");

        assert!(matches!(engine.eval(ctx, &source), Err(EngineError::Exception)));
        let exception = engine.take_exception(ctx).unwrap();
        assert!(exception.contains("unknown statement 'explode'"));
        assert!(exception.contains("<test>:1"));
    }

    #[test]
    fn test_import_rejected_in_script_mode() {
        let (mut engine, ctx) = engine_with_context();
        engine.register_module(ctx, "std").unwrap();
        let source = SourceBuffer::script("import std", "<test>");

        assert!(engine.eval(ctx, &source).is_err());
        let exception = engine.take_exception(ctx).unwrap();
        assert!(exception.contains("only valid in modules"));
    }

    #[test]
    fn test_import_of_registered_native_module() {
        let (mut engine, ctx) = engine_with_context();
        engine.register_module(ctx, "std").unwrap();
        let source = SourceBuffer::module("import std", "<test>");

        let compiled = engine.compile(ctx, &source).unwrap();
        let result = engine.execute(ctx, compiled).unwrap();
        engine.release_value(ctx, result);
    }

    #[test]
    fn test_import_of_unknown_module_fails_compilation() {
        let (mut engine, ctx) = engine_with_context();
        let source = SourceBuffer::module("import missing", "<test>");

        assert!(matches!(
            engine.compile(ctx, &source),
            Err(EngineError::Exception)
        ));
        let exception = engine.take_exception(ctx).unwrap();
        assert!(exception.contains("could not load module 'missing'"));
    }

    #[test]
    fn test_loader_resolved_import_runs_before_importer() {
        let (mut engine, ctx) = engine_with_context();
        engine.set_module_loader(Box::new(MapLoader::with("dep", "alloc 32")));
        let ledger = engine.ledger();
        let baseline = ledger.borrow().live_bytes();

        let source = SourceBuffer::module("import dep", "<main>");
        let compiled = engine.compile(ctx, &source).unwrap();
        let result = engine.execute(ctx, compiled).unwrap();
        engine.release_value(ctx, result);

        // The imported module's alloc landed in this context's heap.
        assert_eq!(ledger.borrow().live_bytes(), baseline + 32);
    }

    #[test]
    fn test_throw_sets_pending_exception() {
        let (mut engine, ctx) = engine_with_context();
        let source = SourceBuffer::script("throw boom", "<test>");

        assert!(matches!(engine.eval(ctx, &source), Err(EngineError::Exception)));
        assert_eq!(engine.take_exception(ctx).unwrap(), "Error: boom");
        // Taking the exception clears it.
        assert!(engine.take_exception(ctx).is_none());
    }

    #[test]
    fn test_defer_enqueues_and_jobs_run_in_order() {
        let (mut engine, ctx) = engine_with_context();
        let source = SourceBuffer::script("defer alloc 8\ndefer alloc 16", "<test>");
        let result = engine.eval(ctx, &source).unwrap();
        engine.release_value(ctx, result);
        assert_eq!(engine.pending_jobs(), 2);

        let ledger = engine.ledger();
        let before = ledger.borrow().live_bytes();
        assert_eq!(engine.run_pending_job(), JobOutcome::Ran(ctx));
        assert_eq!(ledger.borrow().live_bytes(), before + 8);
        assert_eq!(engine.run_pending_job(), JobOutcome::Ran(ctx));
        assert_eq!(engine.run_pending_job(), JobOutcome::Idle);
    }

    #[test]
    fn test_failing_job_raises() {
        let (mut engine, ctx) = engine_with_context();
        let source = SourceBuffer::script("defer throw later", "<test>");
        let result = engine.eval(ctx, &source).unwrap();
        engine.release_value(ctx, result);

        assert_eq!(engine.run_pending_job(), JobOutcome::Raised(ctx));
        assert_eq!(engine.take_exception(ctx).unwrap(), "Error: later");
    }

    #[test]
    fn test_rejection_notifies_observer() {
        let (mut engine, ctx) = engine_with_context();
        let seen = Rc::new(RefCell::new(Vec::new()));
        engine.set_rejection_observer(Box::new(Capture(seen.clone())));

        let source = SourceBuffer::script("reject no handler", "<test>");
        let result = engine.eval(ctx, &source).unwrap();
        engine.release_value(ctx, result);

        assert_eq!(engine.run_pending_job(), JobOutcome::Ran(ctx));
        assert_eq!(seen.borrow().as_slice(), ["no handler"]);
    }

    #[test]
    fn test_stack_ceiling_throws() {
        let (mut engine, ctx) = engine_with_context();
        engine.set_max_stack_size(4 * 1024);

        let ok = SourceBuffer::script("recurse 4", "<test>");
        let result = engine.eval(ctx, &ok).unwrap();
        engine.release_value(ctx, result);

        let deep = SourceBuffer::script("recurse 5", "<test>");
        assert!(engine.eval(ctx, &deep).is_err());
        assert!(engine.take_exception(ctx).unwrap().contains("stack overflow"));
    }

    #[test]
    fn test_alloc_past_memory_limit_throws() {
        let mut engine = ScriptedEngine::new();
        engine.set_memory_limit(CONTEXT_COST + 100);
        let ctx = engine.create_context().unwrap();

        let source = SourceBuffer::script("alloc 64\nalloc 64", "<test>");
        assert!(engine.eval(ctx, &source).is_err());
        assert_eq!(
            engine.take_exception(ctx).unwrap(),
            "RangeError: out of memory"
        );
    }

    #[test]
    fn test_grow_and_free_adjust_accounting() {
        let (mut engine, ctx) = engine_with_context();
        let ledger = engine.ledger();
        let baseline = ledger.borrow().live_bytes();

        let source = SourceBuffer::script("alloc 10\ngrow 50", "<test>");
        let result = engine.eval(ctx, &source).unwrap();
        engine.release_value(ctx, result);
        assert_eq!(ledger.borrow().live_bytes(), baseline + 50);

        let free = SourceBuffer::script("free", "<test>");
        let result = engine.eval(ctx, &free).unwrap();
        engine.release_value(ctx, result);
        assert_eq!(ledger.borrow().live_bytes(), baseline);
    }

    #[test]
    fn test_module_meta_attachment() {
        let (mut engine, ctx) = engine_with_context();
        let source = SourceBuffer::module("# empty", "<main>");

        let compiled = engine.compile(ctx, &source).unwrap();
        assert_eq!(engine.module_meta(ctx, compiled), None);

        engine.attach_module_meta(ctx, compiled, "<main>", true).unwrap();
        let meta = engine.module_meta(ctx, compiled).unwrap();
        assert_eq!(meta.url, "<main>");
        assert!(meta.main);

        let result = engine.execute(ctx, compiled).unwrap();
        engine.release_value(ctx, result);
    }

    #[test]
    fn test_meta_attachment_rejected_for_scripts() {
        let (mut engine, ctx) = engine_with_context();
        let source = SourceBuffer::script("free", "<test>");

        // Compile-only also works for scripts; only metadata is refused.
        let compiled = engine.compile(ctx, &source).unwrap();
        assert!(matches!(
            engine.attach_module_meta(ctx, compiled, "<test>", true),
            Err(EngineError::InvalidValue)
        ));
    }

    #[test]
    fn test_execute_consumes_the_compiled_value() {
        let (mut engine, ctx) = engine_with_context();
        let source = SourceBuffer::module("# empty", "<main>");

        let compiled = engine.compile(ctx, &source).unwrap();
        let result = engine.execute(ctx, compiled).unwrap();
        engine.release_value(ctx, result);

        assert!(matches!(
            engine.execute(ctx, compiled),
            Err(EngineError::InvalidValue)
        ));
    }

    #[test]
    fn test_worker_statement_spawns_seeded_context() {
        let (mut engine, ctx) = engine_with_context();
        engine.set_worker_seed(ContextSeed {
            modules: vec!["std".to_string(), "os".to_string()],
            helpers: true,
            args: Vec::new(),
        });

        let source = SourceBuffer::script("worker", "<test>");
        let result = engine.eval(ctx, &source).unwrap();
        engine.release_value(ctx, result);
        assert_eq!(engine.context_count(), 2);
    }

    #[test]
    fn test_destroying_contexts_returns_ledger_to_zero() {
        let mut engine = ScriptedEngine::new();
        let ledger = engine.ledger();
        let ctx = engine.create_context().unwrap();

        let source = SourceBuffer::script("alloc 100\ndefer alloc 8", "<test>");
        let result = engine.eval(ctx, &source).unwrap();
        engine.release_value(ctx, result);

        engine.destroy_context(ctx);
        assert_eq!(ledger.borrow().live_bytes(), 0);
        assert_eq!(ledger.borrow().live_objects(), 0);

        // The orphaned job is skipped, not run.
        assert_eq!(engine.run_pending_job(), JobOutcome::Idle);
    }

    #[test]
    fn test_unreleased_value_shows_in_accounting() {
        let (mut engine, ctx) = engine_with_context();
        let ledger = engine.ledger();
        let baseline = ledger.borrow().live_bytes();

        let source = SourceBuffer::script("# empty", "<test>");
        let result = engine.eval(ctx, &source).unwrap();
        assert_eq!(ledger.borrow().live_bytes(), baseline + VALUE_COST);

        engine.release_value(ctx, result);
        assert_eq!(ledger.borrow().live_bytes(), baseline);
    }
}

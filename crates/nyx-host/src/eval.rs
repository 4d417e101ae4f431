//! Buffer evaluation.

use crate::error::EvalError;
use crate::host::RuntimeHost;
use nyx_engine::{ContextId, EngineError, EvalMode, SourceBuffer};
use std::io::Write;
use tracing::debug;

impl RuntimeHost {
    /// Evaluate one source buffer in `ctx`.
    ///
    /// Modules go through two explicit phases — compile, attach module
    /// metadata, execute — so a phase-1 failure is observably distinct
    /// from a phase-2 failure. Scripts compile and run in one phase.
    /// Any engine exception is dumped to the diagnostic sink and folded
    /// into the returned error; the temporary result value is released
    /// before returning, on every path.
    pub fn eval(&mut self, ctx: ContextId, source: &SourceBuffer) -> Result<(), EvalError> {
        debug!("evaluating {} ({:?} mode)", source.origin(), source.mode());
        match source.mode() {
            EvalMode::Module => self.eval_module(ctx, source),
            EvalMode::Script => self.eval_script(ctx, source),
        }
    }

    fn eval_module(&mut self, ctx: ContextId, source: &SourceBuffer) -> Result<(), EvalError> {
        let compiled = match self.backend.compile(ctx, source) {
            Ok(compiled) => compiled,
            Err(err) => return Err(EvalError::Compile(self.dump_exception(ctx, err))),
        };

        // Metadata lands between the phases so the module can observe its
        // own origin before any of it runs.
        if let Err(err) = self
            .backend
            .attach_module_meta(ctx, compiled, source.origin(), true)
        {
            self.backend.release_value(ctx, compiled);
            return Err(EvalError::Execute(self.dump_exception(ctx, err)));
        }

        match self.backend.execute(ctx, compiled) {
            Ok(result) => {
                self.backend.release_value(ctx, result);
                Ok(())
            }
            Err(err) => Err(EvalError::Execute(self.dump_exception(ctx, err))),
        }
    }

    fn eval_script(&mut self, ctx: ContextId, source: &SourceBuffer) -> Result<(), EvalError> {
        match self.backend.eval(ctx, source) {
            Ok(result) => {
                self.backend.release_value(ctx, result);
                Ok(())
            }
            Err(err) => Err(EvalError::Execute(self.dump_exception(ctx, err))),
        }
    }

    /// Write the pending exception (or the engine error itself) to the
    /// diagnostic sink and hand the text back for the error value.
    pub(crate) fn dump_exception(&mut self, ctx: ContextId, err: EngineError) -> String {
        let diagnostic = match err {
            EngineError::Exception => self
                .backend
                .take_exception(ctx)
                .unwrap_or_else(|| "Error: unknown exception".to_string()),
            other => other.to_string(),
        };
        let _ = writeln!(self.diagnostics, "{diagnostic}");
        debug!("{ctx} {diagnostic}");
        diagnostic
    }
}

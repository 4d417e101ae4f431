//! The job drain loop.

use crate::error::EvalError;
use crate::host::RuntimeHost;
use nyx_engine::{EngineError, JobOutcome};
use tracing::debug;

impl RuntimeHost {
    /// Service pending jobs until the queue is empty.
    ///
    /// Called once, after a successful evaluation. Jobs run strictly
    /// sequentially; the job boundary is the only suspension point. The
    /// first job that raises aborts the drain — its exception is dumped
    /// and returned, and the rest of the queue is left unprocessed.
    pub fn drain(&mut self) -> Result<(), EvalError> {
        let mut ran = 0usize;
        loop {
            match self.backend.run_pending_job() {
                JobOutcome::Idle => {
                    if ran > 0 {
                        debug!("drained {ran} job(s)");
                    }
                    return Ok(());
                }
                JobOutcome::Ran(_) => ran += 1,
                JobOutcome::Raised(ctx) => {
                    let diagnostic = self.dump_exception(ctx, EngineError::Exception);
                    return Err(EvalError::Job(diagnostic));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use nyx_engine::{ScriptedEngine, SourceBuffer};

    fn host() -> RuntimeHost {
        let mut host =
            RuntimeHost::create(Box::new(ScriptedEngine::new()), HostConfig::default()).unwrap();
        host.set_diagnostics(Box::new(std::io::sink()));
        host
    }

    #[test]
    fn test_drain_with_no_jobs_returns_immediately() {
        let mut host = host();
        host.new_context().unwrap();
        host.drain().unwrap();
    }

    #[test]
    fn test_drain_runs_queued_jobs_to_completion() {
        let mut host = host();
        let ctx = host.new_context().unwrap();

        let source = SourceBuffer::script("defer alloc 8\ndefer free", "<test>");
        host.eval(ctx, &source).unwrap();
        host.drain().unwrap();
    }

    #[test]
    fn test_first_failing_job_aborts_the_drain() {
        let mut host = host();
        let ctx = host.new_context().unwrap();

        let source = SourceBuffer::script("defer throw midway\ndefer alloc 8", "<test>");
        host.eval(ctx, &source).unwrap();

        match host.drain() {
            Err(EvalError::Job(diagnostic)) => assert_eq!(diagnostic, "Error: midway"),
            other => panic!("expected job failure, got {other:?}"),
        }
    }

    #[test]
    fn test_jobs_chained_by_jobs_still_drain() {
        let mut host = host();
        let ctx = host.new_context().unwrap();

        let source = SourceBuffer::script("defer defer alloc 8", "<test>");
        host.eval(ctx, &source).unwrap();
        host.drain().unwrap();
    }
}

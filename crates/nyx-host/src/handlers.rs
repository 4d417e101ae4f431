//! Process-wide handler state, instance-scoped.
//!
//! The standard-library emulation needs state that outlives any single
//! context: the worker construction policy and the rejection observer
//! live here. It is an explicit struct owned by the host and threaded by
//! reference, not a process singleton; the lifecycle is one init before
//! the first context and one teardown after the runtime dies.

use nyx_engine::{ContextId, RejectionObserver};
use std::cell::Cell;
use std::rc::Rc;
use tracing::{debug, warn};

pub struct HandlerState {
    installed: bool,
    rejections: Rc<Cell<usize>>,
}

impl HandlerState {
    /// Initialize the handler state. Called once per host, before the
    /// first context is created.
    pub fn init() -> Self {
        debug!("handler state initialized");
        Self {
            installed: true,
            rejections: Rc::new(Cell::new(0)),
        }
    }

    /// Observer to install on the engine; shares this state's counter.
    pub fn observer(&self) -> LoggingObserver {
        LoggingObserver {
            count: self.rejections.clone(),
        }
    }

    /// Unhandled rejections observed so far.
    pub fn unhandled_rejections(&self) -> usize {
        self.rejections.get()
    }

    /// Whether init has run and teardown has not.
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Tear the handler state down. Runs after the runtime is destroyed.
    pub fn teardown(&mut self) {
        if !self.installed {
            warn!("handler state torn down twice");
            return;
        }
        self.installed = false;
        let seen = self.rejections.get();
        if seen > 0 {
            warn!("{seen} unhandled promise rejection(s) this run");
        }
        debug!("handler state torn down");
    }
}

impl Drop for HandlerState {
    fn drop(&mut self) {
        if self.installed {
            self.teardown();
        }
    }
}

/// Rejection observer that logs each occurrence and counts it.
pub struct LoggingObserver {
    count: Rc<Cell<usize>>,
}

impl RejectionObserver for LoggingObserver {
    fn on_unhandled_rejection(&mut self, ctx: ContextId, reason: &str) {
        self.count.set(self.count.get() + 1);
        warn!("{ctx} unhandled promise rejection: {reason}");
    }
}

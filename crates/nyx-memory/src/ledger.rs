//! The allocation ledger.
//!
//! Three operations — allocate, resize, release — over one shared piece of
//! state: live byte count, live object count, and the configured ceiling.
//! Exceeding the ceiling is the only failure the ledger defines; a denied
//! operation leaves the counters untouched so the engine can turn the
//! denial into a catchable out-of-memory condition.

use crate::probe::{Exact, UsableSize};
use crate::stats::MemoryReport;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use tracing::warn;

/// Opaque identifier for one live allocation.
///
/// Assigned monotonically at allocate time and never reused within a
/// ledger. Stands in for the pointer a native allocator would return, so
/// trace output stays reproducible across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocId(u64);

impl AllocId {
    /// Raw counter value, mainly for diagnostics.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AllocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ledger failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("allocation of {requested} bytes denied: live {live} bytes, ceiling {ceiling}")]
    CeilingExceeded {
        requested: usize,
        live: usize,
        ceiling: usize,
    },

    #[error("zero-size allocation")]
    ZeroSize,

    #[error("unknown allocation id")]
    UnknownAllocation,
}

/// Accounting state for one runtime's allocation traffic.
pub struct AllocLedger {
    live_bytes: usize,
    live_objects: usize,
    peak_bytes: usize,
    ceiling: usize,
    next_id: u64,
    usable: HashMap<AllocId, usize>,
    probe: Box<dyn UsableSize>,
    trace: Option<Box<dyn Write>>,
}

impl AllocLedger {
    /// Create an unbounded ledger with the exact-size probe and no trace.
    pub fn new() -> Self {
        Self {
            live_bytes: 0,
            live_objects: 0,
            peak_bytes: 0,
            ceiling: usize::MAX,
            next_id: 1,
            usable: HashMap::new(),
            probe: Box::new(Exact),
            trace: None,
        }
    }

    /// Create a ledger that denies any operation pushing live bytes past
    /// `ceiling`.
    pub fn with_ceiling(ceiling: usize) -> Self {
        let mut ledger = Self::new();
        ledger.ceiling = ceiling;
        ledger
    }

    /// Replace the usable-size probe. Must happen before the first
    /// allocation; sizes recorded under the old probe would not balance.
    pub fn set_probe(&mut self, probe: Box<dyn UsableSize>) {
        debug_assert_eq!(self.live_objects, 0);
        self.probe = probe;
    }

    /// Install a trace sink. Every subsequent operation writes one line.
    pub fn set_trace(&mut self, sink: Box<dyn Write>) {
        self.trace = Some(sink);
    }

    /// Change the ceiling. Does not retroactively evict anything.
    pub fn set_ceiling(&mut self, ceiling: usize) {
        self.ceiling = ceiling;
    }

    /// Allocate `size` bytes.
    ///
    /// Zero-size requests are rejected; the caller routes those to a no-op
    /// path instead. A request that would push live bytes past the ceiling
    /// is denied without mutating any counter.
    pub fn allocate(&mut self, size: usize) -> Result<AllocId, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        self.check_ceiling(size)?;

        let usable = self.probe.usable_size(size);
        let id = AllocId(self.next_id);
        self.next_id += 1;
        self.usable.insert(id, usable);
        self.live_objects += 1;
        self.live_bytes += usable + self.probe.per_object_overhead();
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);

        if let Some(sink) = &mut self.trace {
            let _ = writeln!(sink, "A {size} -> {id}.{usable}");
        }
        Ok(id)
    }

    /// Resize an allocation.
    ///
    /// `resize(None, n)` behaves as `allocate(n)` (or `Ok(None)` for n = 0);
    /// `resize(Some(id), 0)` behaves as `release(id)` and returns `None`.
    /// The ceiling check happens before anything is touched: a native
    /// realloc may invalidate the old allocation the moment it is called,
    /// so a denial must leave it intact.
    pub fn resize(
        &mut self,
        id: Option<AllocId>,
        new_size: usize,
    ) -> Result<Option<AllocId>, AllocError> {
        let Some(id) = id else {
            if new_size == 0 {
                return Ok(None);
            }
            return self.allocate(new_size).map(Some);
        };
        if new_size == 0 {
            self.release(id);
            return Ok(None);
        }

        let old_usable = *self.usable.get(&id).ok_or(AllocError::UnknownAllocation)?;
        let shrunk = self.live_bytes - old_usable;
        match shrunk.checked_add(new_size) {
            Some(projected) if projected <= self.ceiling => {}
            _ => {
                return Err(AllocError::CeilingExceeded {
                    requested: new_size,
                    live: self.live_bytes,
                    ceiling: self.ceiling,
                });
            }
        }

        let new_usable = self.probe.usable_size(new_size);
        self.live_bytes = shrunk + new_usable;
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);
        self.usable.insert(id, new_usable);

        if let Some(sink) = &mut self.trace {
            let _ = writeln!(sink, "R {new_size} {id} -> {id}.{new_usable}");
        }
        Ok(Some(id))
    }

    /// Release an allocation. Never fails; releasing an id the ledger does
    /// not know is logged and ignored.
    pub fn release(&mut self, id: AllocId) {
        match self.usable.remove(&id) {
            Some(usable) => {
                self.live_objects -= 1;
                self.live_bytes -= usable + self.probe.per_object_overhead();
                if let Some(sink) = &mut self.trace {
                    let _ = writeln!(sink, "F {id}.{usable}");
                }
            }
            None => warn!("release of unknown allocation {id}"),
        }
    }

    /// Bytes currently accounted live.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Allocations currently live.
    pub fn live_objects(&self) -> usize {
        self.live_objects
    }

    /// High-water mark of live bytes.
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }

    /// Configured ceiling, if any.
    pub fn ceiling(&self) -> Option<usize> {
        (self.ceiling != usize::MAX).then_some(self.ceiling)
    }

    /// Usable size recorded for a live allocation.
    pub fn usable_size(&self, id: AllocId) -> Option<usize> {
        self.usable.get(&id).copied()
    }

    /// Snapshot of the counters. Process RSS is left for the host to fill.
    pub fn report(&self) -> MemoryReport {
        MemoryReport {
            live_bytes: self.live_bytes,
            live_objects: self.live_objects,
            peak_bytes: self.peak_bytes,
            ceiling: self.ceiling(),
            process_rss: None,
        }
    }

    fn check_ceiling(&self, size: usize) -> Result<(), AllocError> {
        match self.live_bytes.checked_add(size) {
            Some(projected) if projected <= self.ceiling => Ok(()),
            _ => Err(AllocError::CeilingExceeded {
                requested: size,
                live: self.live_bytes,
                ceiling: self.ceiling,
            }),
        }
    }
}

impl Default for AllocLedger {
    fn default() -> Self {
        Self::new()
    }
}

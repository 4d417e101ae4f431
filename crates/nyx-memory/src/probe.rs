//! Usable-size probes.
//!
//! A native allocator backs a request with more bytes than asked for; the
//! probe models that padding so the ledger accounts for what an allocator
//! would actually hand out, not what was requested.

/// Reports the padded size behind an allocation request.
pub trait UsableSize {
    /// Actual number of bytes backing an allocation of `requested` bytes.
    /// Never less than `requested`.
    fn usable_size(&self, requested: usize) -> usize;

    /// Fixed bookkeeping cost charged per live allocation.
    fn per_object_overhead(&self) -> usize {
        0
    }
}

/// Usable size equals the requested size, with no per-object overhead.
///
/// The default probe; keeps ledger arithmetic exact for limit tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exact;

impl UsableSize for Exact {
    fn usable_size(&self, requested: usize) -> usize {
        requested
    }
}

/// Rounds requests up to a 16-byte granule and charges an 8-byte header,
/// approximating the padding a general-purpose malloc applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeClass;

/// Allocation granule for [`SizeClass`].
const GRANULE: usize = 16;

/// Per-object header cost for [`SizeClass`].
const HEADER: usize = 8;

impl UsableSize for SizeClass {
    fn usable_size(&self, requested: usize) -> usize {
        match requested.checked_next_multiple_of(GRANULE) {
            Some(padded) => padded.max(GRANULE),
            None => requested,
        }
    }

    fn per_object_overhead(&self) -> usize {
        HEADER
    }
}

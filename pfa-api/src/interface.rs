//! Collaborator interfaces
//!
//! The allocator core is deliberately narrow: eviction, defragmentation and
//! victim selection live behind these traits. The null implementations make
//! a core instance self-contained (allocations simply fail once memory runs
//! out), and tests substitute recording or stash-backed doubles.

use crate::flags::GfpFlags;
use crate::types::NodeMask;

/// Outcome of a zone-local reclaim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneReclaimOutcome {
    /// Nothing was scanned (reclaim not applicable right now)
    NoScan,
    /// Scanned but nothing could be reclaimed
    Full,
    /// Some pages were reclaimed
    Reclaimed(usize),
}

/// Outcome of a compaction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactOutcome {
    /// Compaction was not attempted (unsuitable or deferred)
    Skipped,
    /// Compaction ran and freed some contiguity
    Partial,
    /// Compaction ran to completion
    Complete,
}

impl CompactOutcome {
    /// Whether the attempt made any progress worth re-checking free lists for
    #[inline]
    pub fn made_progress(&self) -> bool {
        !matches!(self, CompactOutcome::Skipped)
    }
}

/// Page eviction collaborator.
///
/// `try_to_free_pages` is synchronous direct reclaim; the return value is the
/// number of pages believed freed. `wakeup_background` nudges the per-node
/// background reclaimer and must never block.
pub trait ReclaimHook: Send + Sync {
    /// Direct reclaim targeting the allocation constraints. Returns pages freed.
    fn try_to_free_pages(
        &self,
        order: usize,
        flags: GfpFlags,
        nodemask: Option<NodeMask>,
    ) -> usize;

    /// Wake background reclaim for one zone. Non-blocking.
    fn wakeup_background(&self, node: usize, zone_idx: usize, order: usize, classzone_idx: usize);

    /// Zone-local reclaim used by the NUMA walker before falling back to a
    /// remote zone.
    fn zone_reclaim(
        &self,
        _node: usize,
        _zone_idx: usize,
        _order: usize,
        _flags: GfpFlags,
    ) -> ZoneReclaimOutcome {
        ZoneReclaimOutcome::NoScan
    }

    /// Throttle point used between slow-path retries. May block when the
    /// caller's flags permit sleeping; never called otherwise.
    fn congestion_wait(&self) {}
}

/// Memory defragmentation collaborator.
pub trait CompactionHook: Send + Sync {
    /// Attempt to assemble free blocks of at least `order` pages.
    fn try_to_compact(
        &self,
        order: usize,
        flags: GfpFlags,
        nodemask: Option<NodeMask>,
        sync: bool,
    ) -> CompactOutcome;
}

/// Out-of-memory escalation collaborator.
pub trait OomHook: Send + Sync {
    /// Select and kill a victim to free memory. `force` bypasses the usual
    /// suitability checks. Returns whether a victim was actually killed;
    /// the allocator only loops back around when there is a kill to wait
    /// for.
    fn out_of_memory(
        &self,
        order: usize,
        flags: GfpFlags,
        nodemask: Option<NodeMask>,
        force: bool,
    ) -> bool;
}

/// Monotonic time source for cache aging and report rate limiting.
pub trait Clock: Send + Sync {
    /// Current tick count. Must be monotonic.
    fn now_ticks(&self) -> u64;

    /// Ticks per second.
    fn tick_hz(&self) -> u64 {
        1000
    }
}

/// Allocation fault-injection seam. Installed by tests to force failures.
pub trait FaultInjector: Send + Sync {
    /// Whether this allocation should be failed artificially.
    fn should_fail(&self, flags: GfpFlags, order: usize) -> bool;
}

/// Reclaim collaborator that never frees anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReclaim;

impl ReclaimHook for NullReclaim {
    fn try_to_free_pages(
        &self,
        _order: usize,
        _flags: GfpFlags,
        _nodemask: Option<NodeMask>,
    ) -> usize {
        0
    }

    fn wakeup_background(
        &self,
        _node: usize,
        _zone_idx: usize,
        _order: usize,
        _classzone_idx: usize,
    ) {
    }
}

/// Compaction collaborator that always skips.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCompaction;

impl CompactionHook for NullCompaction {
    fn try_to_compact(
        &self,
        _order: usize,
        _flags: GfpFlags,
        _nodemask: Option<NodeMask>,
        _sync: bool,
    ) -> CompactOutcome {
        CompactOutcome::Skipped
    }
}

/// OOM collaborator that kills nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOom;

impl OomHook for NullOom {
    fn out_of_memory(
        &self,
        _order: usize,
        _flags: GfpFlags,
        _nodemask: Option<NodeMask>,
        _force: bool,
    ) -> bool {
        false
    }
}

/// Clock stuck at zero. Disables time-based cache expiry and makes report
/// rate limiting purely burst-based.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullClock;

impl Clock for NullClock {
    fn now_ticks(&self) -> u64 {
        0
    }
}

//! Allocation request flags
//!
//! The GFP-style flag word carried by every allocation request. Individual
//! bits describe what the caller may tolerate (blocking, IO, FS recursion),
//! how urgent the request is, which zones qualify, and the expected mobility
//! of the allocation.

use bitflags::bitflags;

bitflags! {
    /// Request flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GfpFlags: u32 {
        /// Caller may sleep and be throttled
        const WAIT          = 1 << 0;
        /// Caller allows IO to be started
        const IO            = 1 << 1;
        /// Caller allows filesystem callbacks
        const FS            = 1 << 2;
        /// High priority - may dip below the low watermark
        const HIGH          = 1 << 3;
        /// Returned pages must be zero-filled
        const ZERO          = 1 << 4;
        /// Format the run as a compound page
        const COMP          = 1 << 5;
        /// Fail rather than loop in the slow path
        const NORETRY       = 1 << 6;
        /// Never give up; retry with backoff indefinitely
        const NOFAIL        = 1 << 7;
        /// Retry a costly-order request until enough progress accumulates
        const REPEAT        = 1 << 8;
        /// Suppress the allocation-failure warning
        const NOWARN        = 1 << 9;
        /// Prefer the cold end of the per-CPU cache
        const COLD          = 1 << 10;
        /// HighMem zone qualifies
        const HIGHMEM       = 1 << 11;
        /// Restrict to the DMA zone
        const DMA           = 1 << 12;
        /// Restrict to the DMA32 zone (and below)
        const DMA32         = 1 << 13;
        /// Allocation is movable (page-migration friendly)
        const MOVABLE       = 1 << 14;
        /// Allocation is reclaimable (shrinker-backed kernel memory)
        const RECLAIMABLE   = 1 << 15;
        /// Only the preferred node qualifies; no remote fallback
        const THISNODE      = 1 << 16;
        /// Do not wake background reclaim
        const NO_KSWAPD     = 1 << 17;
        /// Caller is itself the memory-allocator path; use emergency reserves
        const MEMALLOC      = 1 << 18;
        /// Never touch emergency reserves, even from a MEMALLOC context
        const NOMEMALLOC    = 1 << 19;
        /// Enforce the node restriction strictly even on the fast path
        const HARDWALL      = 1 << 20;
        /// The page will be dirtied; apply the dirty-balance reserve
        const WRITE         = 1 << 21;
    }
}

impl GfpFlags {
    /// Kernel-internal allocation: may sleep, may start IO and FS callbacks.
    pub const KERNEL: GfpFlags = GfpFlags::WAIT.union(GfpFlags::IO).union(GfpFlags::FS);

    /// Interrupt-safe allocation: high priority, never sleeps.
    pub const ATOMIC: GfpFlags = GfpFlags::HIGH;

    /// Kernel allocation that must not recurse into filesystems.
    pub const NOFS: GfpFlags = GfpFlags::WAIT.union(GfpFlags::IO);

    /// Kernel allocation that must not start any IO.
    pub const NOIO: GfpFlags = GfpFlags::WAIT;

    /// Userspace page: hardwall-enforced kernel allocation.
    pub const USER: GfpFlags = Self::KERNEL.union(GfpFlags::HARDWALL);

    /// Userspace page that may live in HighMem.
    pub const HIGHUSER: GfpFlags = Self::USER.union(GfpFlags::HIGHMEM);

    /// Userspace page that may live in HighMem and may be migrated.
    pub const HIGHUSER_MOVABLE: GfpFlags = Self::HIGHUSER.union(GfpFlags::MOVABLE);

    /// Node-local kernel allocation that fails fast.
    pub const THISNODE_STRICT: GfpFlags = GfpFlags::THISNODE
        .union(GfpFlags::NORETRY)
        .union(GfpFlags::NOWARN);

    /// Whether the caller may sleep
    #[inline]
    pub fn may_wait(&self) -> bool {
        self.contains(GfpFlags::WAIT)
    }

    /// Whether this is an atomic-context request (cannot sleep, not
    /// explicitly exempted from reserve pressure)
    #[inline]
    pub fn is_atomic(&self) -> bool {
        !self.intersects(GfpFlags::WAIT | GfpFlags::NO_KSWAPD)
    }
}

//! Page descriptors
//!
//! One `Page` per physical frame, stored in a dense array indexed by PFN.
//! Every field is atomic so the array can be shared across CPUs; list
//! linkage and the private slot are only written under the owning zone or
//! per-CPU lock, the refcount and flag word follow the usual lock-free
//! discipline.
//!
//! A page is in exactly one of these states, encoded in flags plus derived
//! invariants rather than a type hierarchy:
//!
//! - **Reserved**: `RESERVED` set, untouched by the allocator.
//! - **Free (buddy)**: `BUDDY` set, refcount 0, on a free list,
//!   `private == order`.
//! - **Free (per-CPU)**: no `BUDDY`, refcount 0, on a PCP list,
//!   `private == migratetype`.
//! - **Allocated**: refcount >= 1, off all allocator lists; compound runs
//!   additionally carry `HEAD`/`TAIL`.
//! - **Guard**: `GUARD` set, off all lists, invisible to coalescing until
//!   its buddy is freed.

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::list::NIL;
use crate::Pfn;

bitflags! {
    /// Per-page flag word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Owned by boot code or firmware; never enters the buddy pool
        const RESERVED = 1 << 0;
        /// First page of a free buddy block
        const BUDDY    = 1 << 1;
        /// Head page of a compound run
        const HEAD     = 1 << 2;
        /// Tail page of a compound run
        const TAIL     = 1 << 3;
        /// Page is locked by a consumer
        const LOCKED   = 1 << 4;
        /// Frame has signalled an uncorrectable hardware error
        const HWPOISON = 1 << 5;
        /// Page is mlocked by a consumer
        const MLOCKED  = 1 << 6;
        /// Debug guard page: off-list upper half of a split
        const GUARD    = 1 << 7;
    }
}

impl PageFlags {
    /// Bits that must be clear when a page is handed back to the allocator.
    pub const CHECK_AT_FREE: PageFlags = PageFlags::LOCKED
        .union(PageFlags::BUDDY)
        .union(PageFlags::HEAD)
        .union(PageFlags::TAIL)
        .union(PageFlags::RESERVED)
        .union(PageFlags::GUARD);

    /// Bits that must be clear when a page leaves the allocator. MLOCKED is
    /// cleared silently on free, so it participates here but not above.
    pub const CHECK_AT_PREP: PageFlags = Self::CHECK_AT_FREE.union(PageFlags::MLOCKED);
}

/// Sentinel for "no compound head recorded".
const NO_HEAD: usize = usize::MAX;

/// Per-frame metadata.
pub struct Page {
    flags: AtomicU64,
    refcount: AtomicI32,
    mapcount: AtomicI32,
    /// Order while on a free list or guarded; migratetype while on a PCP
    /// list; order again for a compound head.
    private: AtomicUsize,
    /// Back-reference from a compound tail to its head.
    head_pfn: AtomicUsize,
    /// Free-list / PCP-list linkage, NIL when detached.
    pub(crate) next: AtomicU32,
    /// See `next`.
    pub(crate) prev: AtomicU32,
    /// Mobility class of the list this block currently sits on. Needed so a
    /// block can be unlinked without searching every class at its order.
    list_tag: AtomicU32,
    /// Packed (node id << 8 | zone index), assigned once at memmap init.
    nid_zid: AtomicU32,
}

impl Page {
    /// A descriptor in the boot state: reserved, unlinked, refcount zero.
    pub(crate) const fn new() -> Self {
        Self {
            flags: AtomicU64::new(PageFlags::RESERVED.bits()),
            refcount: AtomicI32::new(0),
            mapcount: AtomicI32::new(0),
            private: AtomicUsize::new(0),
            head_pfn: AtomicUsize::new(NO_HEAD),
            next: AtomicU32::new(NIL),
            prev: AtomicU32::new(NIL),
            list_tag: AtomicU32::new(0),
            nid_zid: AtomicU32::new(0),
        }
    }

    /// Mobility class of the free/PCP list this page is linked on.
    #[inline]
    pub(crate) fn list_tag(&self) -> usize {
        self.list_tag.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub(crate) fn set_list_tag(&self, mt: usize) {
        self.list_tag.store(mt as u32, Ordering::Relaxed);
    }

    /// Current flag word
    #[inline]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    /// Whether all of `f` are set
    #[inline]
    pub fn test(&self, f: PageFlags) -> bool {
        self.flags().contains(f)
    }

    #[inline]
    pub(crate) fn set_flags(&self, f: PageFlags) {
        self.flags.fetch_or(f.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn clear_flags(&self, f: PageFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::Relaxed);
    }

    /// Clear `f`, reporting whether any of it was set.
    #[inline]
    pub(crate) fn test_and_clear(&self, f: PageFlags) -> bool {
        self.flags.fetch_and(!f.bits(), Ordering::Relaxed) & f.bits() != 0
    }

    /// Reference count. Zero means free or reserved.
    #[inline]
    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_refcount(&self, n: i32) {
        self.refcount.store(n, Ordering::Release);
    }

    /// Drop one reference; true when it was the last.
    #[inline]
    pub(crate) fn put_testzero(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Mapped-consumer count. The core validates but never takes mappings.
    #[inline]
    pub fn mapcount(&self) -> i32 {
        self.mapcount.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_mapcount(&self, n: i32) {
        self.mapcount.store(n, Ordering::Relaxed);
    }

    /// The private slot, meaningful only in the states documented above.
    #[inline]
    pub fn private(&self) -> usize {
        self.private.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_private(&self, v: usize) {
        self.private.store(v, Ordering::Relaxed);
    }

    /// Buddy order of a free block's first page.
    #[inline]
    pub(crate) fn order(&self) -> usize {
        self.private()
    }

    /// Mark the first page of a free block with its order.
    #[inline]
    pub(crate) fn set_order(&self, order: usize) {
        self.set_private(order);
        self.set_flags(PageFlags::BUDDY);
    }

    /// Take a block off the buddy books.
    #[inline]
    pub(crate) fn clear_order(&self) {
        self.set_private(0);
        self.clear_flags(PageFlags::BUDDY);
    }

    /// Compound-head back-reference of a tail page.
    #[inline]
    pub fn head_pfn(&self) -> Option<Pfn> {
        match self.head_pfn.load(Ordering::Relaxed) {
            NO_HEAD => None,
            pfn => Some(pfn),
        }
    }

    #[inline]
    pub(crate) fn set_head_pfn(&self, pfn: Pfn) {
        self.head_pfn.store(pfn, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn clear_head_pfn(&self) {
        self.head_pfn.store(NO_HEAD, Ordering::Relaxed);
    }

    /// Record the owning (node, zone) pair. Done once at memmap init.
    #[inline]
    pub(crate) fn set_links(&self, node: usize, zone_idx: usize) {
        self.nid_zid
            .store(((node as u32) << 8) | zone_idx as u32, Ordering::Relaxed);
    }

    /// Packed (node, zone) identity; equal iff two pages share a zone.
    #[inline]
    pub(crate) fn zone_id(&self) -> u32 {
        self.nid_zid.load(Ordering::Relaxed)
    }

    /// Owning node id
    #[inline]
    pub fn node_id(&self) -> usize {
        (self.zone_id() >> 8) as usize
    }

    /// Owning zone index within the node
    #[inline]
    pub fn zone_idx(&self) -> usize {
        (self.zone_id() & 0xff) as usize
    }

    /// Whether this page heads a free buddy block of exactly `order`.
    #[inline]
    pub(crate) fn is_buddy_of_order(&self, order: usize) -> bool {
        self.test(PageFlags::BUDDY) && self.private() == order
    }

    /// Whether this page is a debug guard of exactly `order`.
    #[inline]
    pub(crate) fn is_guard_of_order(&self, order: usize) -> bool {
        self.test(PageFlags::GUARD) && self.private() == order
    }

    /// Integrity test applied to every page entering the free path.
    /// True when the page is fit to free.
    #[inline]
    pub(crate) fn check_at_free(&self) -> bool {
        self.mapcount() == 0
            && self.refcount() == 0
            && !self.flags().intersects(PageFlags::CHECK_AT_FREE)
            && !self.test(PageFlags::HWPOISON)
    }

    /// Integrity test applied to every page about to leave the allocator.
    #[inline]
    pub(crate) fn check_at_prep(&self) -> bool {
        self.mapcount() == 0
            && self.refcount() == 0
            && !self.flags().intersects(PageFlags::CHECK_AT_PREP)
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("flags", &self.flags())
            .field("refcount", &self.refcount())
            .field("mapcount", &self.mapcount())
            .field("private", &self.private())
            .field("node", &self.node_id())
            .field("zone", &self.zone_idx())
            .finish()
    }
}

/// Format a compound run: the head carries `HEAD` and the order, every other
/// page carries `TAIL` and a back-reference to the head.
pub(crate) fn prep_compound_page(pages: &[Page], pfn: Pfn, order: usize) {
    let head = &pages[pfn];
    head.set_flags(PageFlags::HEAD);
    head.set_private(order);
    for tail_pfn in pfn + 1..pfn + (1 << order) {
        let tail = &pages[tail_pfn];
        tail.set_flags(PageFlags::TAIL);
        tail.set_refcount(0);
        tail.set_head_pfn(pfn);
    }
}

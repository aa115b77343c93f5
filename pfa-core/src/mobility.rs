//! Mobility grouping
//!
//! Every page-block (a `2^pageblock_order` aligned region) carries one
//! mobility tag in a packed side bitmap. Free lists are partitioned by the
//! tag, allocations prefer their own class, and a fixed fallback table
//! governs what gets raided when a class runs dry. Keeping long-lived
//! kernel pages out of movable blocks is what keeps high-order allocations
//! feasible after days of churn.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::GfpFlags;

/// Number of mobility classes.
pub const MIGRATE_TYPES: usize = 5;

/// Classes cached on the per-CPU lists (the first three).
pub const MIGRATE_PCPTYPES: usize = 3;

/// Expected relocatability of an allocation, tagged per page-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum Migratetype {
    /// Pinned kernel memory; cannot move
    Unmovable = 0,
    /// Kernel memory a shrinker can release
    Reclaimable = 1,
    /// User pages the migration machinery can relocate
    Movable = 2,
    /// Held back for high-priority high-order atomics
    Reserve = 3,
    /// Quarantined from allocation (hot-remove, contiguous ranges)
    Isolate = 4,
}

const_assert_eq!(Migratetype::Isolate as usize + 1, MIGRATE_TYPES);
const_assert_eq!(Migratetype::Reserve as usize, MIGRATE_PCPTYPES);

impl Migratetype {
    /// All classes, index order.
    pub const ALL: [Migratetype; MIGRATE_TYPES] = [
        Migratetype::Unmovable,
        Migratetype::Reclaimable,
        Migratetype::Movable,
        Migratetype::Reserve,
        Migratetype::Isolate,
    ];

    pub(crate) fn from_index(idx: usize) -> Migratetype {
        Self::ALL[idx]
    }

    /// Whether the per-CPU lists cache this class.
    #[inline]
    pub fn is_pcp_type(&self) -> bool {
        (*self as usize) < MIGRATE_PCPTYPES
    }

    /// Mobility class requested by a flag word.
    pub fn from_flags(flags: GfpFlags) -> Migratetype {
        if flags.contains(GfpFlags::MOVABLE) {
            Migratetype::Movable
        } else if flags.contains(GfpFlags::RECLAIMABLE) {
            Migratetype::Reclaimable
        } else {
            Migratetype::Unmovable
        }
    }
}

/// When the preferred class is exhausted, raid these, in order. Reserve is
/// listed so exhaustion ends somewhere; the allocation path special-cases it
/// rather than walking this row.
pub(crate) const FALLBACKS: [[Migratetype; 3]; 4] = [
    // Unmovable
    [
        Migratetype::Reclaimable,
        Migratetype::Movable,
        Migratetype::Reserve,
    ],
    // Reclaimable
    [
        Migratetype::Unmovable,
        Migratetype::Movable,
        Migratetype::Reserve,
    ],
    // Movable
    [
        Migratetype::Reclaimable,
        Migratetype::Unmovable,
        Migratetype::Reserve,
    ],
    // Reserve - never walked
    [
        Migratetype::Reserve,
        Migratetype::Reserve,
        Migratetype::Reserve,
    ],
];

/// Bits per page-block in the side map. A power-of-two stride keeps the
/// word/shift arithmetic branch-free.
const PB_BITS: usize = 4;
const PB_MASK: u64 = (1 << PB_BITS) - 1;
const BLOCKS_PER_WORD: usize = u64::BITS as usize / PB_BITS;

/// Packed mobility tags, one nibble per page-block.
///
/// Reads are lock-free (the PCP free path consults the tag without the zone
/// lock); writers hold the zone lock by convention, so the word-level
/// read-modify-write below never races another writer.
#[derive(Debug)]
pub(crate) struct PageblockMap {
    words: Vec<AtomicU64>,
    nr_blocks: usize,
}

impl PageblockMap {
    /// All blocks start Movable; boot code re-tags as it learns better.
    pub(crate) fn new(nr_blocks: usize) -> Self {
        let mut init = 0u64;
        let mut i = 0;
        while i < BLOCKS_PER_WORD {
            init |= (Migratetype::Movable as u64) << (i * PB_BITS);
            i += 1;
        }
        let words = (0..nr_blocks.div_ceil(BLOCKS_PER_WORD))
            .map(|_| AtomicU64::new(init))
            .collect();
        Self { words, nr_blocks }
    }

    #[inline]
    pub(crate) fn nr_blocks(&self) -> usize {
        self.nr_blocks
    }

    pub(crate) fn get(&self, block: usize) -> Migratetype {
        debug_assert!(block < self.nr_blocks);
        let word = self.words[block / BLOCKS_PER_WORD].load(Ordering::Relaxed);
        let raw = (word >> ((block % BLOCKS_PER_WORD) * PB_BITS)) & PB_MASK;
        Migratetype::from_index(raw as usize)
    }

    pub(crate) fn set(&self, block: usize, mt: Migratetype) {
        debug_assert!(block < self.nr_blocks);
        let shift = (block % BLOCKS_PER_WORD) * PB_BITS;
        let word = &self.words[block / BLOCKS_PER_WORD];
        let old = word.load(Ordering::Relaxed);
        word.store(
            (old & !(PB_MASK << shift)) | ((mt as u64) << shift),
            Ordering::Relaxed,
        );
    }
}

//! Per-CPU hot/cold page caches
//!
//! Order-0 traffic bypasses the zone lock through a per-(CPU, zone) cache of
//! single pages, one list per PCP mobility class. Refill pulls `batch`
//! blocks from the buddy core under one lock hold; overflow drains `batch`
//! back. Each shard sits behind its own spinlock - the userspace rendering
//! of "interrupts disabled on the owning CPU".

use crate::list::PageList;
use crate::mobility::{Migratetype, MIGRATE_PCPTYPES};
use crate::page::Page;
use crate::zone::Zone;
use crate::PAGE_SIZE;

/// One CPU's cache for one zone.
#[derive(Debug)]
pub(crate) struct PerCpuPages {
    /// Pages currently held, all lists together
    pub(crate) count: usize,
    /// Drain threshold
    pub(crate) high: usize,
    /// Chunk size for refill and drain
    pub(crate) batch: usize,
    /// One list per PCP class; head is hot, tail is cold
    pub(crate) lists: [PageList; MIGRATE_PCPTYPES],
}

impl PerCpuPages {
    pub(crate) fn new(batch: usize) -> Self {
        Self {
            count: 0,
            high: 6 * batch,
            batch: batch.max(1),
            lists: [PageList::new(); MIGRATE_PCPTYPES],
        }
    }

    /// Override sizing from the `percpu_pagelist_fraction` tunable: `high`
    /// becomes the zone share, `batch` a quarter of it, capped so one drain
    /// cannot hold the zone lock unreasonably long.
    pub(crate) fn set_high_mark(&mut self, high: usize) {
        const MAX_BATCH: usize = 8 * 8; // PAGE_SHIFT * 8 with 4K pages
        self.high = high;
        self.batch = (high / 4).clamp(1, MAX_BATCH);
    }
}

/// Per-CPU pool sizing: about 1/1024th of the zone, at most 512KiB, a
/// quarter of which moves per refill/drain. The result is rounded to
/// `2^n - 1`: power-of-two batch strides were observed to alias badly with
/// CPU cache coloring when two tasks alternate allocations.
pub(crate) fn zone_batchsize(present_pages: usize) -> usize {
    let mut batch = present_pages / 1024;
    if batch * PAGE_SIZE > 512 * 1024 {
        batch = (512 * 1024) / PAGE_SIZE;
    }
    batch /= 4;
    if batch < 1 {
        batch = 1;
    }

    let grown = batch + batch / 2;
    (1usize << (usize::BITS - 1 - grown.leading_zeros() as u32)) - 1
}

impl Zone {
    /// Push `count` pages from a PCP shard back into the buddy pool.
    ///
    /// Pages are taken round-robin across the three class lists, one block
    /// from each non-empty list per pass, so that no class monopolizes
    /// eviction; when a single list remains it surrenders the whole
    /// remainder. Pages leave from the cold tail. Returns pages freed.
    pub(crate) fn free_pcppages_bulk(
        &self,
        pages: &[Page],
        pcp: &mut PerCpuPages,
        count: usize,
    ) -> usize {
        let mut inner = self.lock();
        self.note_free();

        let mut to_free = count.min(pcp.count);
        let freed = to_free;
        let mut mt_idx = 0usize;

        while to_free > 0 {
            let mut batch_free = 0;
            loop {
                batch_free += 1;
                mt_idx = (mt_idx + 1) % MIGRATE_PCPTYPES;
                if !pcp.lists[mt_idx].is_empty() {
                    break;
                }
                if batch_free > MIGRATE_PCPTYPES {
                    // lists and count disagree; stop rather than spin
                    debug_assert!(false, "pcp count out of sync with lists");
                    self.add_free_pages((freed - to_free) as isize);
                    pcp.count -= freed - to_free;
                    return freed - to_free;
                }
            }
            // only one list left: take the whole remainder from it
            if batch_free == MIGRATE_PCPTYPES {
                batch_free = to_free;
            }

            while batch_free > 0 && to_free > 0 {
                let Some(pfn) = pcp.lists[mt_idx].pop_tail(pages) else {
                    break;
                };
                // the Movable list may carry Reserve strays; trust the tag
                // recorded when the page entered the cache
                let mt = Migratetype::from_index(pages[pfn].private());
                self.free_one_page(&mut inner, pages, pfn, 0, mt);
                batch_free -= 1;
                to_free -= 1;
            }
        }

        drop(inner);
        // PGFREE was counted when each page entered the cache
        self.add_free_pages(freed as isize);
        pcp.count -= freed;
        freed
    }

    /// Drain one CPU's shard for this zone entirely.
    pub(crate) fn drain_pageset(&self, pages: &[Page], cpu: usize) {
        let mut pcp = self.pageset(cpu).lock();
        let count = pcp.count;
        if count > 0 {
            self.free_pcppages_bulk(pages, &mut pcp, count);
        }
    }

    /// Drain up to one batch from one CPU's shard (remote-node expiry).
    pub(crate) fn drain_pageset_batch(&self, pages: &[Page], cpu: usize) {
        let mut pcp = self.pageset(cpu).lock();
        let to_drain = pcp.count.min(pcp.batch);
        if to_drain > 0 {
            self.free_pcppages_bulk(pages, &mut pcp, to_drain);
        }
    }
}

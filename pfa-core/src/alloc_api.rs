//! Allocation entry points, zone walker, and the slow path
//!
//! The fast path walks the zonelist under the low watermark and either hits
//! the per-CPU cache (order 0) or the buddy core directly. When that fails
//! the slow path takes over: wake background reclaim, relax the watermark
//! per the request's urgency, then escalate through direct compaction,
//! direct reclaim (with a PCP drain between attempts), bounded retries, and
//! finally the OOM collaborator. Resource exhaustion is reported as `None`;
//! only structural misuse returns an `Error`.

use bitflags::bitflags;

use pfa_api::{GfpFlags, NodeMask};

use crate::mobility::Migratetype;
use crate::node::PhysMemory;
use crate::page::{prep_compound_page, PageFlags};
use crate::stats::VmEvent;
use crate::zone::{Watermark, Zone, ZoneKind};
use crate::zonelist::{ZoneRef, Zonelist};
use crate::{Error, Pfn, PfnRange, Result, MAX_ORDER, PAGE_ALLOC_COSTLY_ORDER, PAGE_SHIFT};

bitflags! {
    /// Internal allocation-attempt flags: which watermark gates the attempt
    /// and how hard the attempt may press into the reserves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Gate on the low watermark instead of min
        const WMARK_LOW      = 1 << 0;
        /// Gate on the high watermark (OOM recheck)
        const WMARK_HIGH     = 1 << 1;
        /// Skip the watermark test entirely
        const NO_WATERMARKS  = 1 << 2;
        /// Shave a quarter off the mark (atomic/realtime pressure)
        const HARDER         = 1 << 3;
        /// Halve the mark (high-priority request)
        const HIGH           = 1 << 4;
        /// Enforce the caller's node restriction
        const CPUSET         = 1 << 5;
    }
}

impl AllocFlags {
    /// Which standing watermark this attempt tests against.
    pub(crate) fn watermark(&self) -> Watermark {
        if self.contains(AllocFlags::WMARK_HIGH) {
            Watermark::High
        } else if self.contains(AllocFlags::WMARK_LOW) {
            Watermark::Low
        } else {
            Watermark::Min
        }
    }
}

/// Highest zone index the flag word permits.
pub(crate) fn gfp_zone(flags: GfpFlags) -> usize {
    if flags.contains(GfpFlags::DMA) {
        ZoneKind::Dma.idx()
    } else if flags.contains(GfpFlags::DMA32) {
        ZoneKind::Dma32.idx()
    } else if flags.contains(GfpFlags::HIGHMEM | GfpFlags::MOVABLE) {
        ZoneKind::Movable.idx()
    } else if flags.contains(GfpFlags::HIGHMEM) {
        ZoneKind::HighMem.idx()
    } else {
        ZoneKind::Normal.idx()
    }
}

/// One allocation request.
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    /// log2 of the number of contiguous frames wanted
    pub order: usize,
    /// Request flag word
    pub flags: GfpFlags,
    /// CPU issuing the request (selects the PCP shard)
    pub cpu: usize,
    /// Node whose zonelist anchors the walk; defaults to node 0
    pub preferred_node: Option<usize>,
    /// Nodes the request may be satisfied from (cpuset-style restriction)
    pub nodemask: Option<NodeMask>,
}

impl AllocRequest {
    /// A request with default placement.
    pub fn new(order: usize, flags: GfpFlags) -> Self {
        Self {
            order,
            flags,
            cpu: 0,
            preferred_node: None,
            nodemask: None,
        }
    }

    /// Issue from `cpu`'s pagesets.
    pub fn on_cpu(mut self, cpu: usize) -> Self {
        self.cpu = cpu;
        self
    }

    /// Anchor the zonelist walk at `node`.
    pub fn on_node(mut self, node: usize) -> Self {
        self.preferred_node = Some(node);
        self
    }

    /// Restrict candidate zones to `mask`'s nodes.
    pub fn with_nodemask(mut self, mask: NodeMask) -> Self {
        self.nodemask = Some(mask);
        self
    }
}

/// Resolved request state threaded through the walker and slow path.
#[derive(Clone, Copy)]
struct AllocContext {
    order: usize,
    flags: GfpFlags,
    cpu: usize,
    migratetype: Migratetype,
    high_zoneidx: usize,
    nodemask: Option<NodeMask>,
    preferred: ZoneRef,
}

enum OomResult {
    Page(Pfn),
    Restart,
    Fail,
}

impl PhysMemory {
    // ------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------

    /// Allocate a run of `2^order` contiguous frames. Returns the first
    /// frame, or `None` when memory is exhausted (after the slow path has
    /// done everything the flags allow).
    pub fn alloc_pages(&self, req: &AllocRequest) -> Option<Pfn> {
        let flags = req.flags;

        if req.order >= MAX_ORDER {
            self.warn_alloc_failed(flags, req.order);
            return None;
        }
        if flags.contains(GfpFlags::NOFAIL) && req.order > 1 {
            log::warn!("NOFAIL allocation of order {}: cannot honor", req.order);
        }
        if let Some(fault) = &self.fault {
            if fault.should_fail(flags, req.order) {
                return None;
            }
        }

        let nid = req
            .preferred_node
            .unwrap_or(0)
            .min(self.nodes().len() - 1);
        let node = &self.nodes()[nid];
        let guard = if flags.contains(GfpFlags::THISNODE) {
            node.thisnode.read()
        } else {
            node.zonelist.read()
        };
        let zonelist = &*guard;
        if zonelist.refs().is_empty() {
            return None;
        }

        let high_zoneidx = gfp_zone(flags);
        let preferred = zonelist.first_suitable(high_zoneidx, req.nodemask.as_ref())?;
        let ctx = AllocContext {
            order: req.order,
            flags,
            cpu: req.cpu,
            migratetype: Migratetype::from_flags(flags),
            high_zoneidx,
            nodemask: req.nodemask,
            preferred,
        };

        // first attempt: low watermark, node restriction enforced
        let fast = self.get_page_from_freelist(
            &ctx,
            AllocFlags::WMARK_LOW | AllocFlags::CPUSET,
            zonelist,
        );
        match fast {
            Some(pfn) => Some(pfn),
            None => self.alloc_pages_slowpath(&ctx, zonelist),
        }
    }

    /// Free a run previously returned by [`alloc_pages`](Self::alloc_pages).
    /// Order-0 frees pass through the per-CPU cache; higher orders go
    /// straight to the buddy core.
    pub fn free_pages(&self, cpu: usize, pfn: Pfn, order: usize) -> Result<()> {
        if order >= MAX_ORDER {
            return Err(Error::InvalidOrder(order));
        }
        if !self.pfn_valid(pfn) {
            return Err(Error::OutOfRange(pfn));
        }
        let page = &self.pages()[pfn];
        if page.refcount() <= 0 {
            self.bad_page(pfn);
            return Err(Error::BadPageState(pfn));
        }
        if !page.put_testzero() {
            return Ok(());
        }

        if order == 0 {
            self.free_hot_cold_inner(cpu, pfn, false);
        } else {
            self.free_pages_ok(pfn, order);
        }
        Ok(())
    }

    /// Free one order-0 frame with an explicit hot/cold hint.
    pub fn free_hot_cold(&self, cpu: usize, pfn: Pfn, cold: bool) -> Result<()> {
        if !self.pfn_valid(pfn) {
            return Err(Error::OutOfRange(pfn));
        }
        let page = &self.pages()[pfn];
        if page.refcount() <= 0 {
            self.bad_page(pfn);
            return Err(Error::BadPageState(pfn));
        }
        if page.put_testzero() {
            self.free_hot_cold_inner(cpu, pfn, cold);
        }
        Ok(())
    }

    /// Free a batch of order-0 frames with one hint.
    pub fn free_pages_bulk(&self, cpu: usize, pfns: &[Pfn], cold: bool) {
        for &pfn in pfns {
            if let Err(err) = self.free_hot_cold(cpu, pfn, cold) {
                log::error!("bulk free of pfn {:#x} failed: {}", pfn, err);
            }
        }
    }

    /// Expose an allocated non-compound run as independently-freeable
    /// single pages. Compound runs must go back through the compound free
    /// path instead.
    pub fn split_page(&self, pfn: Pfn, order: usize) -> Result<()> {
        if order >= MAX_ORDER {
            return Err(Error::InvalidOrder(order));
        }
        if !self.pfn_valid(pfn) || pfn + (1 << order) > self.nr_pages() {
            return Err(Error::OutOfRange(pfn));
        }
        let page = &self.pages()[pfn];
        if page.test(PageFlags::HEAD) || page.test(PageFlags::TAIL) {
            // compound runs carry invariants splitting would break; they
            // must be freed whole
            return Err(Error::CompoundMismatch(pfn));
        }
        if page.refcount() <= 0 {
            return Err(Error::BadPageState(pfn));
        }
        for p in pfn + 1..pfn + (1 << order) {
            self.pages()[p].set_refcount(1);
        }
        Ok(())
    }

    /// Detach a free block for the migration machinery; see the zone-level
    /// documentation for the watermark it obeys. Returns pages split out.
    pub fn split_free_page(&self, pfn: Pfn) -> usize {
        match self.page_zone(pfn) {
            Some(zone) => zone.split_free_page(self.pages(), pfn),
            None => 0,
        }
    }

    /// Allocate exactly `size` bytes of physically contiguous memory,
    /// rounding up to one order and returning the tail pages.
    pub fn alloc_pages_exact(&self, size: usize, flags: GfpFlags, cpu: usize) -> Option<PfnRange> {
        if size == 0 {
            return None;
        }
        let nr_pages = size.div_ceil(1 << PAGE_SHIFT);
        let order = pfa_api::types::order_for_pages(nr_pages);
        if order >= MAX_ORDER {
            return None;
        }

        // the run is handed out page-wise; compound format cannot apply
        let req = AllocRequest::new(order, flags.difference(GfpFlags::COMP)).on_cpu(cpu);
        let pfn = self.alloc_pages(&req)?;
        if self.split_page(pfn, order).is_err() {
            return None;
        }
        for tail in pfn + nr_pages..pfn + (1 << order) {
            if let Err(err) = self.free_pages(cpu, tail, 0) {
                log::error!("exact-alloc tail free failed: {}", err);
            }
        }
        Some(PfnRange::new(pfn, nr_pages))
    }

    /// Free memory obtained from [`alloc_pages_exact`](Self::alloc_pages_exact).
    pub fn free_pages_exact(&self, cpu: usize, range: PfnRange) {
        for pfn in range.start..range.end() {
            if let Err(err) = self.free_pages(cpu, pfn, 0) {
                log::error!("exact free of pfn {:#x} failed: {}", pfn, err);
            }
        }
    }

    /// Spill one CPU's pagesets back into every zone's buddy pool.
    pub fn drain_local(&self, cpu: usize) {
        for zone in self.zones_iter() {
            zone.drain_pageset(self.pages(), cpu);
        }
    }

    /// Spill every CPU's pagesets. The userspace stand-in for the IPI
    /// broadcast: each shard is drained under its own lock.
    pub fn drain_all(&self) {
        for cpu in 0..self.nr_cpus() {
            self.drain_local(cpu);
        }
    }

    /// Trickle one batch out of a single (CPU, zone) shard - the expiry
    /// path for pagesets cached on behalf of a remote node.
    pub fn drain_zone_pages(&self, cpu: usize, node: usize, zone_idx: usize) {
        if let Some(zone) = self.zone(node, zone_idx) {
            zone.drain_pageset_batch(self.pages(), cpu);
        }
    }

    // ------------------------------------------------------------------
    // Free internals
    // ------------------------------------------------------------------

    /// Validation and compound teardown common to every free.
    fn free_pages_prepare(&self, pfn: Pfn, order: usize) -> bool {
        let page = &self.pages()[pfn];

        if page.test(PageFlags::HEAD) {
            if self.destroy_compound_page(pfn, order) > 0 {
                return false;
            }
        } else if page.test(PageFlags::TAIL) {
            // a compound tail can only be freed via its head
            self.bad_page(pfn);
            return false;
        }

        let zone = self.page_zone(pfn);
        let mut bad = 0;
        for p in pfn..pfn + (1 << order) {
            let pg = &self.pages()[p];
            if pg.test_and_clear(PageFlags::MLOCKED) {
                if let Some(z) = zone {
                    z.add_mlock(-1);
                }
            }
            if !pg.check_at_free() {
                self.bad_page(p);
                bad += 1;
            }
        }
        bad == 0
    }

    /// Validate and unlink a compound run. Returns the number of bad pages.
    fn destroy_compound_page(&self, pfn: Pfn, order: usize) -> usize {
        let head = &self.pages()[pfn];
        let mut bad = 0;

        if head.private() != order || !head.test(PageFlags::HEAD) {
            self.bad_page(pfn);
            bad += 1;
        }
        head.clear_flags(PageFlags::HEAD);
        head.set_private(0);

        for p in pfn + 1..pfn + (1 << order) {
            let tail = &self.pages()[p];
            if !tail.test(PageFlags::TAIL) || tail.head_pfn() != Some(pfn) {
                self.bad_page(p);
                bad += 1;
            }
            tail.clear_flags(PageFlags::TAIL);
            tail.clear_head_pfn();
        }
        bad
    }

    /// Direct-to-buddy free for order > 0.
    fn free_pages_ok(&self, pfn: Pfn, order: usize) {
        if !self.free_pages_prepare(pfn, order) {
            return;
        }
        let Some(zone) = self.page_zone(pfn) else {
            self.bad_page(pfn);
            return;
        };
        let mt = zone.get_pageblock_migratetype(pfn);
        {
            let mut inner = zone.lock();
            zone.free_one_page(&mut inner, self.pages(), pfn, order, mt);
        }
        zone.add_free_pages(1 << order);
        if mt == Migratetype::Isolate {
            zone.add_isolated(1 << order);
        }
        zone.count_free(1 << order);
        zone.note_free();
    }

    /// Order-0 free through the per-CPU cache.
    fn free_hot_cold_inner(&self, cpu: usize, pfn: Pfn, cold: bool) {
        if !self.free_pages_prepare(pfn, 0) {
            return;
        }
        let Some(zone) = self.page_zone(pfn) else {
            self.bad_page(pfn);
            return;
        };

        let mut mt = zone.get_pageblock_migratetype(pfn);
        self.pages()[pfn].set_private(mt as usize);

        if !mt.is_pcp_type() {
            if mt == Migratetype::Isolate {
                // quarantined block: keep the page out of circulation
                {
                    let mut inner = zone.lock();
                    zone.free_one_page(&mut inner, self.pages(), pfn, 0, mt);
                }
                zone.add_free_pages(1);
                zone.add_isolated(1);
                zone.count_free(1);
                zone.note_free();
                return;
            }
            // Reserve pages ride the movable list so the reserve can be
            // reclaimed through normal traffic when the quota shrinks
            mt = Migratetype::Movable;
            self.pages()[pfn].set_private(mt as usize);
        }

        let mut pcp = zone.pageset(cpu).lock();
        let idx = mt as usize;
        if cold {
            pcp.lists[idx].push_tail(self.pages(), pfn);
        } else {
            pcp.lists[idx].push_head(self.pages(), pfn);
        }
        pcp.count += 1;
        zone.count_free(1);

        if pcp.count >= pcp.high {
            let batch = pcp.batch;
            zone.free_pcppages_bulk(self.pages(), &mut pcp, batch);
            self.vm_events.count(VmEvent::PcpDrain);
        }
    }

    // ------------------------------------------------------------------
    // Allocation internals
    // ------------------------------------------------------------------

    /// Final integrity pass on a run leaving the allocator.
    fn prep_new_page(&self, pfn: Pfn, order: usize, flags: GfpFlags) -> bool {
        for p in pfn..pfn + (1 << order) {
            if !self.pages()[p].check_at_prep() {
                self.bad_page(p);
                return false;
            }
        }
        let page = &self.pages()[pfn];
        page.set_private(0);
        page.set_refcount(1);
        if order > 0 && flags.contains(GfpFlags::COMP) {
            prep_compound_page(self.pages(), pfn, order);
        }
        true
    }

    /// One zone's allocation attempt: PCP for order 0, the locked buddy
    /// core otherwise. Retries internally when a bad page surfaces (the
    /// offender has been leaked by `prep_new_page`).
    fn buffered_rmqueue(
        &self,
        preferred: &ZoneRef,
        zref: &ZoneRef,
        zone: &Zone,
        ctx: &AllocContext,
    ) -> Option<Pfn> {
        let cold = ctx.flags.contains(GfpFlags::COLD);

        loop {
            let pfn = if ctx.order == 0 {
                let mut pcp = zone.pageset(ctx.cpu).lock();
                let idx = ctx.migratetype as usize;
                if pcp.lists[idx].is_empty() {
                    let batch = pcp.batch;
                    let got = zone.rmqueue_bulk(
                        self.pages(),
                        0,
                        batch,
                        &mut pcp.lists[idx],
                        ctx.migratetype,
                    );
                    pcp.count += got;
                    if pcp.lists[idx].is_empty() {
                        return None;
                    }
                }
                let taken = if cold {
                    pcp.lists[idx].pop_tail(self.pages())
                } else {
                    pcp.lists[idx].pop_head(self.pages())
                };
                match taken {
                    Some(pfn) => {
                        pcp.count -= 1;
                        pfn
                    }
                    None => return None,
                }
            } else {
                let taken = {
                    let mut inner = zone.lock();
                    zone.rmqueue(&mut inner, self.pages(), ctx.order, ctx.migratetype)
                };
                let pfn = taken?;
                zone.add_free_pages(-(1 << ctx.order));
                pfn
            };

            zone.count_alloc(1 << ctx.order);
            zone.count_numa(zref == preferred);

            if self.prep_new_page(pfn, ctx.order, ctx.flags) {
                return Some(pfn);
            }
            // the offending run was contained; take another
        }
    }

    /// Walk the zonelist looking for a zone that passes the gates, trying
    /// the allocation in each qualifying zone. Second pass ignores the
    /// full-zones cache in case it was pessimistic.
    fn get_page_from_freelist(
        &self,
        ctx: &AllocContext,
        alloc_flags: AllocFlags,
        zonelist: &Zonelist,
    ) -> Option<Pfn> {
        let numa = self.nodes().len() > 1;
        let cache = zonelist.cache();
        let classzone_idx = ctx.preferred.zone_idx;
        let mut zlc_active = false;
        let mut did_zlc_setup = false;

        for pass in 0..2 {
            let use_cache = pass == 0;

            for (i, zref) in zonelist.refs().iter().enumerate() {
                if zref.zone_idx > ctx.high_zoneidx {
                    continue;
                }
                let Some(zone) = self.zone(zref.node, zref.zone_idx) else {
                    continue;
                };

                if let Some(c) = cache {
                    if use_cache && zlc_active && c.is_full(i) {
                        continue;
                    }
                }
                if alloc_flags.contains(AllocFlags::CPUSET) {
                    if let Some(mask) = &ctx.nodemask {
                        if !mask.contains(zref.node) {
                            continue;
                        }
                    }
                }
                // keep any one zone inside its share of the dirty budget
                if alloc_flags.contains(AllocFlags::WMARK_LOW)
                    && ctx.flags.contains(GfpFlags::WRITE)
                    && !zone.dirty_ok(self.dirty_ratio())
                {
                    if let Some(c) = cache {
                        c.mark_full(i);
                    }
                    continue;
                }

                if !alloc_flags.contains(AllocFlags::NO_WATERMARKS) {
                    let mark = alloc_flags.watermark();
                    if !zone.watermark_ok(ctx.order, mark, classzone_idx, alloc_flags) {
                        if numa && !did_zlc_setup {
                            if let Some(c) = cache {
                                c.maybe_zap(self.clock.now_ticks(), self.clock.tick_hz());
                                zlc_active = true;
                            }
                            did_zlc_setup = true;
                        }
                        if let Some(c) = cache {
                            if use_cache && zlc_active && c.is_full(i) {
                                continue;
                            }
                        }
                        if !self.zone_reclaim_mode() {
                            if let Some(c) = cache {
                                c.mark_full(i);
                            }
                            continue;
                        }

                        use pfa_api::ZoneReclaimOutcome::*;
                        match self.reclaim.zone_reclaim(
                            zref.node,
                            zref.zone_idx,
                            ctx.order,
                            ctx.flags,
                        ) {
                            NoScan | Full => continue,
                            Reclaimed(_) => {
                                if !zone.watermark_ok(ctx.order, mark, classzone_idx, alloc_flags)
                                {
                                    if let Some(c) = cache {
                                        c.mark_full(i);
                                    }
                                    continue;
                                }
                            }
                        }
                    }
                }

                if let Some(pfn) = self.buffered_rmqueue(&ctx.preferred, zref, zone, ctx) {
                    return Some(pfn);
                }
                if let Some(c) = cache {
                    c.mark_full(i);
                }
            }

            // rescan only when the cache may have hidden a viable zone
            if !(numa && zlc_active) {
                break;
            }
            zlc_active = false;
        }
        None
    }

    /// Map request urgency onto attempt flags: HIGH halves the mark,
    /// atomic contexts press harder and shed the node restriction,
    /// allocator-recursive contexts skip watermarks entirely.
    fn gfp_to_alloc_flags(&self, flags: GfpFlags) -> AllocFlags {
        let mut alloc_flags = AllocFlags::CPUSET;

        if flags.contains(GfpFlags::HIGH) {
            alloc_flags |= AllocFlags::HIGH;
        }
        if flags.is_atomic() {
            if !flags.contains(GfpFlags::NOMEMALLOC) {
                alloc_flags |= AllocFlags::HARDER;
            }
            alloc_flags.remove(AllocFlags::CPUSET);
        }
        if !flags.contains(GfpFlags::NOMEMALLOC) && flags.contains(GfpFlags::MEMALLOC) {
            alloc_flags |= AllocFlags::NO_WATERMARKS;
        }
        alloc_flags
    }

    fn should_alloc_retry(
        &self,
        flags: GfpFlags,
        order: usize,
        did_some_progress: usize,
        pages_reclaimed: usize,
    ) -> bool {
        if flags.contains(GfpFlags::NORETRY) {
            return false;
        }
        if flags.contains(GfpFlags::NOFAIL) {
            return true;
        }
        // suspend disabled the storage below reclaim; looping is pointless
        if did_some_progress == 0 && self.suspended_storage() {
            return false;
        }
        if order <= PAGE_ALLOC_COSTLY_ORDER {
            return true;
        }
        if flags.contains(GfpFlags::REPEAT) && pages_reclaimed < (1 << order) {
            return true;
        }
        false
    }

    /// No-watermark loop for requests entitled to the emergency reserves.
    fn alloc_high_priority(&self, ctx: &AllocContext, zonelist: &Zonelist) -> Option<Pfn> {
        loop {
            if let Some(pfn) =
                self.get_page_from_freelist(ctx, AllocFlags::NO_WATERMARKS, zonelist)
            {
                return Some(pfn);
            }
            if !ctx.flags.contains(GfpFlags::NOFAIL) {
                return None;
            }
            self.reclaim.congestion_wait();
        }
    }

    /// Try compaction before (and after) direct reclaim for order > 0.
    fn direct_compact(
        &self,
        ctx: &AllocContext,
        alloc_flags: AllocFlags,
        zonelist: &Zonelist,
        sync: bool,
        deferred_compaction: &mut bool,
    ) -> Option<Pfn> {
        if ctx.order == 0 {
            return None;
        }
        let preferred_zone = self.zone(ctx.preferred.node, ctx.preferred.zone_idx)?;
        if preferred_zone.compaction_deferred(ctx.order) {
            *deferred_compaction = true;
            return None;
        }

        let outcome =
            self.compaction
                .try_to_compact(ctx.order, ctx.flags, ctx.nodemask, sync);
        if !outcome.made_progress() {
            return None;
        }

        // migration freed into the PCP lists, but we need merged blocks
        self.drain_local(ctx.cpu);

        if let Some(pfn) = self.get_page_from_freelist(ctx, alloc_flags, zonelist) {
            preferred_zone.compaction_defer_reset(ctx.order);
            self.vm_events.count(VmEvent::CompactSuccess);
            return Some(pfn);
        }

        // blocks exist but not where the watermark needs them
        self.vm_events.count(VmEvent::CompactFail);
        if sync {
            preferred_zone.defer_compaction(ctx.order);
        }
        None
    }

    /// Synchronous reclaim, then retry - once more after a full PCP drain,
    /// since freed pages may be pinned in the caches.
    fn direct_reclaim(
        &self,
        ctx: &AllocContext,
        alloc_flags: AllocFlags,
        zonelist: &Zonelist,
    ) -> (Option<Pfn>, usize) {
        self.vm_events.count(VmEvent::AllocStall);
        let progress = self
            .reclaim
            .try_to_free_pages(ctx.order, ctx.flags, ctx.nodemask);
        if progress == 0 {
            return (None, 0);
        }

        // zones that looked full deserve another look after progress
        if let Some(cache) = zonelist.cache() {
            cache.clear();
        }

        let mut drained = false;
        loop {
            if let Some(pfn) = self.get_page_from_freelist(ctx, alloc_flags, zonelist) {
                return (Some(pfn), progress);
            }
            if drained {
                return (None, progress);
            }
            self.drain_all();
            drained = true;
        }
    }

    /// OOM gate: serialize killers, recheck under the high watermark to
    /// catch a parallel kill, and only restart when a victim actually died.
    fn alloc_pages_may_oom(&self, ctx: &AllocContext, zonelist: &Zonelist) -> OomResult {
        use core::sync::atomic::Ordering;

        if self.oom_lock.swap(true, Ordering::Acquire) {
            // someone else is already killing; give them time
            self.reclaim.congestion_wait();
            return OomResult::Restart;
        }

        let result = (|| {
            if let Some(pfn) = self.get_page_from_freelist(
                ctx,
                AllocFlags::WMARK_HIGH | AllocFlags::CPUSET,
                zonelist,
            ) {
                return OomResult::Page(pfn);
            }

            if !ctx.flags.contains(GfpFlags::NOFAIL) {
                // the killer cannot help high orders, and killing over a
                // lowmem shortage punishes innocents
                if ctx.order > PAGE_ALLOC_COSTLY_ORDER {
                    return OomResult::Fail;
                }
                if ctx.high_zoneidx < ZoneKind::Normal.idx() {
                    return OomResult::Fail;
                }
                if ctx.flags.contains(GfpFlags::THISNODE) {
                    return OomResult::Fail;
                }
            }

            self.vm_events.count(VmEvent::OomInvoked);
            let killed = self
                .oom
                .out_of_memory(ctx.order, ctx.flags, ctx.nodemask, false);
            if killed {
                OomResult::Restart
            } else if ctx.flags.contains(GfpFlags::NOFAIL) {
                self.reclaim.congestion_wait();
                OomResult::Restart
            } else {
                OomResult::Fail
            }
        })();

        self.oom_lock.store(false, Ordering::Release);
        result
    }

    fn wake_background_reclaim(&self, ctx: &AllocContext, zonelist: &Zonelist) {
        for zref in zonelist.refs() {
            if zref.zone_idx > ctx.high_zoneidx {
                continue;
            }
            self.reclaim.wakeup_background(
                zref.node,
                zref.zone_idx,
                ctx.order,
                ctx.preferred.zone_idx,
            );
        }
        self.vm_events.count(VmEvent::KswapdWake);
    }

    fn warn_alloc_failed(&self, flags: GfpFlags, order: usize) {
        if flags.contains(GfpFlags::NOWARN) {
            return;
        }
        if let Some(missed) = self.nopage_rl.allow(self.clock.now_ticks()) {
            if missed > 0 {
                log::warn!("page allocation failure: {} reports suppressed", missed);
            }
            log::warn!(
                "page allocation failure: order:{}, mode:{:?}",
                order,
                flags
            );
        }
    }

    /// Everything past the first failed scan.
    fn alloc_pages_slowpath(&self, ctx: &AllocContext, zonelist: &Zonelist) -> Option<Pfn> {
        let flags = ctx.flags;
        let wait = flags.may_wait();

        // node-strict opportunistic requests never enter reclaim; their
        // callers fall back to other nodes themselves
        if flags.contains(GfpFlags::THISNODE)
            && flags.contains(GfpFlags::NORETRY)
            && flags.contains(GfpFlags::NOWARN)
        {
            return None;
        }

        let mut sync_migration = false;
        let mut pages_reclaimed = 0usize;

        'restart: loop {
            if !flags.contains(GfpFlags::NO_KSWAPD) {
                self.wake_background_reclaim(ctx, zonelist);
            }
            let alloc_flags = self.gfp_to_alloc_flags(flags);

            loop {
                // last general chance before desperate measures
                let watermarked = alloc_flags.difference(AllocFlags::NO_WATERMARKS);
                if let Some(pfn) = self.get_page_from_freelist(ctx, watermarked, zonelist) {
                    return Some(pfn);
                }

                if alloc_flags.contains(AllocFlags::NO_WATERMARKS) {
                    if let Some(pfn) = self.alloc_high_priority(ctx, zonelist) {
                        return Some(pfn);
                    }
                }

                // atomic requests cannot rebalance anything
                if !wait {
                    self.warn_alloc_failed(flags, ctx.order);
                    return None;
                }

                // the allocator must not recurse into its own slow path
                if flags.contains(GfpFlags::MEMALLOC) {
                    return None;
                }

                let mut deferred_compaction = false;
                if let Some(pfn) = self.direct_compact(
                    ctx,
                    alloc_flags,
                    zonelist,
                    sync_migration,
                    &mut deferred_compaction,
                ) {
                    return Some(pfn);
                }
                sync_migration = true;

                // a recently failed sync compaction plus a latency-averse
                // caller: fail fast rather than reclaim
                if deferred_compaction && flags.contains(GfpFlags::NO_KSWAPD) {
                    self.warn_alloc_failed(flags, ctx.order);
                    return None;
                }

                let (page, progress) = self.direct_reclaim(ctx, alloc_flags, zonelist);
                if let Some(pfn) = page {
                    return Some(pfn);
                }

                if progress == 0 && flags.contains(GfpFlags::FS) && !flags.contains(GfpFlags::NORETRY)
                {
                    match self.alloc_pages_may_oom(ctx, zonelist) {
                        OomResult::Page(pfn) => return Some(pfn),
                        OomResult::Restart => continue 'restart,
                        OomResult::Fail => {
                            self.warn_alloc_failed(flags, ctx.order);
                            return None;
                        }
                    }
                }

                pages_reclaimed += progress;
                if self.should_alloc_retry(flags, ctx.order, progress, pages_reclaimed) {
                    self.reclaim.congestion_wait();
                    continue;
                }

                // high-order requests get one synchronous compaction shot
                // before the final verdict
                let mut ignored = false;
                if let Some(pfn) =
                    self.direct_compact(ctx, alloc_flags, zonelist, sync_migration, &mut ignored)
                {
                    return Some(pfn);
                }

                self.warn_alloc_failed(flags, ctx.order);
                return None;
            }
        }
    }
}

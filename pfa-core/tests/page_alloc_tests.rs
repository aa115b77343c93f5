//! End-to-end allocator tests
//!
//! Exercises the public surface the way a kernel would: boot-release memory
//! into isolated `PhysMemory` instances, then drive allocation, free, PCP,
//! mobility, watermark and slow-path behaviour, with mock collaborators
//! standing in for reclaim, compaction and the OOM killer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use pfa_api::{
    CompactOutcome, CompactionHook, GfpFlags, NodeMask, OomHook, ReclaimHook,
};
use pfa_core::{
    AllocRequest, MemoryConfig, Migratetype, MobilityGrouping, NodeConfig, PfnRange, PhysMemory,
    Tunables, VmEvent, Watermark, ZoneConfig, ZoneKind, MAX_ORDER,
};

/// A released, mobility-grouped, watermark-free instance: one Normal zone.
fn boot_flat(pages: usize, pageblock_order: usize) -> PhysMemory {
    let mut cfg = MemoryConfig::flat(pages);
    cfg.tunables = Tunables {
        min_free_kbytes: Some(0),
        pageblock_order,
        mobility_grouping: MobilityGrouping::On,
        ..Tunables::default()
    };
    let mem = PhysMemory::new(cfg).unwrap();
    mem.release_bootmem(PfnRange::new(0, pages)).unwrap();
    mem
}

fn normal_zone(mem: &PhysMemory) -> &pfa_core::Zone {
    mem.zone(0, ZoneKind::Normal.idx()).unwrap()
}

#[test]
fn coalesce_restores_max_block() {
    // 16 contiguous free pages at pfn 0: two order-0 allocations return
    // pfn 0 then pfn 1; freeing them in reverse restores one order-4 block
    let mem = boot_flat(16, 4);
    let zone = normal_zone(&mem);

    let req = AllocRequest::new(0, GfpFlags::empty());
    assert_eq!(mem.alloc_pages(&req), Some(0));
    assert_eq!(mem.alloc_pages(&req), Some(1));

    mem.free_pages(0, 1, 0).unwrap();
    mem.free_pages(0, 0, 0).unwrap();
    mem.drain_all();

    assert_eq!(zone.nr_free(4), 1);
    for order in 0..4 {
        assert_eq!(zone.nr_free(order), 0, "order {} should be empty", order);
    }
    assert_eq!(zone.free_pages(), 16);
}

#[test]
fn split_leaves_ascending_remainders() {
    // order-0 out of a lone order-3 block: the remainder appears at
    // pfn 1 (order 0), pfn 2 (order 1), pfn 4 (order 2)
    let mem = boot_flat(8, 3);

    let got = mem.alloc_pages(&AllocRequest::new(0, GfpFlags::empty()));
    assert_eq!(got, Some(0));

    let mut blocks = mem.free_blocks(0, ZoneKind::Normal.idx());
    blocks.sort();
    assert_eq!(
        blocks,
        vec![
            (1, 0, Migratetype::Movable),
            (2, 1, Migratetype::Movable),
            (4, 2, Migratetype::Movable),
        ]
    );
}

#[test]
fn unmovable_steal_converts_pageblock() {
    // Unmovable request against only-Movable free lists: with an order-3
    // block and pageblock_order 4, the whole block converts
    let mut cfg = MemoryConfig::flat(16);
    cfg.tunables = Tunables {
        min_free_kbytes: Some(0),
        pageblock_order: 4,
        mobility_grouping: MobilityGrouping::On,
        ..Tunables::default()
    };
    let mem = PhysMemory::new(cfg).unwrap();
    mem.release_bootmem(PfnRange::new(0, 8)).unwrap();
    let zone = normal_zone(&mem);

    let got = mem.alloc_pages(&AllocRequest::new(0, GfpFlags::KERNEL));
    assert_eq!(got, Some(0));
    assert_eq!(zone.get_pageblock_migratetype(0), Migratetype::Unmovable);

    // the remaining 7 pages sit on Unmovable lists at orders 0, 1, 2
    let blocks = mem.free_blocks(0, ZoneKind::Normal.idx());
    assert_eq!(blocks.len(), 3);
    assert!(blocks.iter().all(|&(_, _, mt)| mt == Migratetype::Unmovable));
    let orders: Vec<usize> = {
        let mut o: Vec<usize> = blocks.iter().map(|&(_, order, _)| order).collect();
        o.sort();
        o
    };
    assert_eq!(orders, vec![0, 1, 2]);
}

#[test]
fn watermark_order_halving_gate() {
    // free pages sit at min + 2, all in order-0 blocks: order 0 clears the
    // watermark, order 1 fails the per-order halving test
    let mut cfg = MemoryConfig::flat(64);
    cfg.tunables = Tunables {
        min_free_kbytes: Some(32), // 8 pages
        pageblock_order: 4,
        mobility_grouping: MobilityGrouping::On,
        ..Tunables::default()
    };
    let mem = PhysMemory::new(cfg).unwrap();
    // ten scattered singles cannot merge
    for pfn in (1..21).step_by(2) {
        mem.release_bootmem(PfnRange::new(pfn, 1)).unwrap();
    }

    let zone = normal_zone(&mem);
    assert_eq!(zone.watermark(Watermark::Min), 8);
    assert_eq!(zone.free_pages(), 10);

    let flags = pfa_core::AllocFlags::empty();
    assert!(zone.watermark_ok(0, Watermark::Min, zone.zone_idx(), flags));
    assert!(!zone.watermark_ok(1, Watermark::Min, zone.zone_idx(), flags));
}

#[test]
fn pcp_refill_and_overflow_drain() {
    // present 12288 gives batch 3, high 18: first allocation pulls 3 under
    // the zone lock; the 18th free triggers a 3-page drain leaving 15
    let mem = boot_flat(12288, 9);
    let zone = normal_zone(&mem);
    let total = zone.free_pages();

    let req = AllocRequest::new(0, GfpFlags::empty());
    let first = mem.alloc_pages(&req).unwrap();
    assert_eq!(zone.pcp_pages(), 2);
    assert_eq!(zone.free_pages(), total - 3);

    let mut held = vec![first];
    for _ in 0..17 {
        held.push(mem.alloc_pages(&req).unwrap());
    }
    assert_eq!(zone.pcp_pages(), 0);

    for (i, &pfn) in held.iter().enumerate() {
        mem.free_pages(0, pfn, 0).unwrap();
        if i < 17 {
            assert_eq!(zone.pcp_pages(), i + 1);
        }
    }
    // the 18th free hit `high` and drained one batch
    assert_eq!(zone.pcp_pages(), 15);
    assert!(mem.vm_event(VmEvent::PcpDrain) >= 1);
}

struct OomRecorder {
    invoked: AtomicUsize,
    mem: OnceLock<Arc<PhysMemory>>,
    free_on_invoke: Option<usize>,
}

impl OomHook for OomRecorder {
    fn out_of_memory(
        &self,
        _order: usize,
        _flags: GfpFlags,
        _nodemask: Option<NodeMask>,
        _force: bool,
    ) -> bool {
        self.invoked.fetch_add(1, Ordering::SeqCst);
        if let (Some(pfn), Some(mem)) = (self.free_on_invoke, self.mem.get()) {
            mem.free_pages(0, pfn, 0).unwrap();
            return true;
        }
        false
    }
}

#[test]
fn exhaustion_noretry_fails_fast() {
    let mem = boot_flat(16, 4);
    let req = AllocRequest::new(0, GfpFlags::NOWARN);
    let mut got = 0;
    while mem.alloc_pages(&req).is_some() {
        got += 1;
    }
    assert_eq!(got, 16);

    // a sleeping NORETRY caller comes back empty without invoking OOM
    let flags = GfpFlags::KERNEL | GfpFlags::NORETRY | GfpFlags::NOWARN;
    assert_eq!(mem.alloc_pages(&AllocRequest::new(0, flags)), None);
    assert_eq!(mem.vm_event(VmEvent::OomInvoked), 0);
}

#[test]
fn exhaustion_invokes_oom() {
    let mut cfg = MemoryConfig::flat(16);
    cfg.tunables = Tunables {
        min_free_kbytes: Some(0),
        pageblock_order: 4,
        mobility_grouping: MobilityGrouping::On,
        ..Tunables::default()
    };
    let recorder = Arc::new(OomRecorder {
        invoked: AtomicUsize::new(0),
        mem: OnceLock::new(),
        free_on_invoke: None,
    });
    let mut mem = PhysMemory::new(cfg).unwrap();
    mem.set_oom_hook(Box::new(RecorderHandle(recorder.clone())));
    let mem = Arc::new(mem);
    mem.release_bootmem(PfnRange::new(0, 16)).unwrap();

    let req = AllocRequest::new(0, GfpFlags::NOWARN);
    while mem.alloc_pages(&req).is_some() {}

    // a full GFP_KERNEL request walks the whole slow path and ends at the
    // OOM collaborator; with no victim to kill it comes back empty
    let flags = GfpFlags::KERNEL | GfpFlags::NOWARN;
    assert_eq!(mem.alloc_pages(&AllocRequest::new(0, flags)), None);
    assert_eq!(recorder.invoked.load(Ordering::SeqCst), 1);
    assert_eq!(mem.vm_event(VmEvent::OomInvoked), 1);
}

#[test]
fn nofail_loops_until_oom_frees() {
    let mut cfg = MemoryConfig::flat(16);
    cfg.tunables = Tunables {
        min_free_kbytes: Some(0),
        pageblock_order: 4,
        mobility_grouping: MobilityGrouping::On,
        ..Tunables::default()
    };
    let recorder = Arc::new(OomRecorder {
        invoked: AtomicUsize::new(0),
        mem: OnceLock::new(),
        free_on_invoke: Some(7),
    });
    let mut mem = PhysMemory::new(cfg).unwrap();
    mem.set_oom_hook(Box::new(RecorderHandle(recorder.clone())));
    let mem = Arc::new(mem);
    recorder.mem.set(mem.clone()).ok().unwrap();
    mem.release_bootmem(PfnRange::new(0, 16)).unwrap();

    let req = AllocRequest::new(0, GfpFlags::NOWARN);
    let mut held = Vec::new();
    while let Some(pfn) = mem.alloc_pages(&req) {
        held.push(pfn);
    }

    // the kill frees pfn 7 and the restarted walk picks it up
    let flags = GfpFlags::KERNEL | GfpFlags::NOFAIL | GfpFlags::NOWARN;
    let got = mem.alloc_pages(&AllocRequest::new(0, flags));
    assert_eq!(got, Some(7));
    assert_eq!(recorder.invoked.load(Ordering::SeqCst), 1);
}

struct RecorderHandle(Arc<OomRecorder>);

impl OomHook for RecorderHandle {
    fn out_of_memory(
        &self,
        order: usize,
        flags: GfpFlags,
        nodemask: Option<NodeMask>,
        force: bool,
    ) -> bool {
        self.0.out_of_memory(order, flags, nodemask, force)
    }
}

struct StashReclaim {
    mem: OnceLock<Arc<PhysMemory>>,
    stash: Mutex<Vec<usize>>,
}

impl ReclaimHook for StashReclaim {
    fn try_to_free_pages(
        &self,
        _order: usize,
        _flags: GfpFlags,
        _nodemask: Option<NodeMask>,
    ) -> usize {
        let Some(mem) = self.mem.get() else { return 0 };
        let taken: Vec<usize> = {
            let mut stash = self.stash.lock().unwrap();
            let n = stash.len().min(4);
            stash.drain(..n).collect()
        };
        let freed = taken.len();
        for pfn in taken {
            mem.free_pages(0, pfn, 0).unwrap();
        }
        freed
    }

    fn wakeup_background(&self, _node: usize, _zone_idx: usize, _order: usize, _cz: usize) {}
}

#[test]
fn direct_reclaim_rescues_allocation() {
    let mut cfg = MemoryConfig::flat(16);
    cfg.tunables = Tunables {
        min_free_kbytes: Some(0),
        pageblock_order: 4,
        mobility_grouping: MobilityGrouping::On,
        ..Tunables::default()
    };
    let reclaimer = Arc::new(StashReclaim {
        mem: OnceLock::new(),
        stash: Mutex::new(Vec::new()),
    });
    let mut mem = PhysMemory::new(cfg).unwrap();
    mem.set_reclaim_hook(Box::new(ReclaimHandle(reclaimer.clone())));
    let mem = Arc::new(mem);
    reclaimer.mem.set(mem.clone()).ok().unwrap();
    mem.release_bootmem(PfnRange::new(0, 16)).unwrap();

    let req = AllocRequest::new(0, GfpFlags::NOWARN);
    let mut held = Vec::new();
    while let Some(pfn) = mem.alloc_pages(&req) {
        held.push(pfn);
    }
    // "page cache" the reclaimer can evict
    reclaimer.stash.lock().unwrap().extend(held.drain(..4));

    let flags = GfpFlags::KERNEL | GfpFlags::NOWARN;
    let got = mem.alloc_pages(&AllocRequest::new(0, flags));
    assert!(got.is_some());
    assert!(mem.vm_event(VmEvent::AllocStall) >= 1);
}

struct ReclaimHandle(Arc<StashReclaim>);

impl ReclaimHook for ReclaimHandle {
    fn try_to_free_pages(
        &self,
        order: usize,
        flags: GfpFlags,
        nodemask: Option<NodeMask>,
    ) -> usize {
        self.0.try_to_free_pages(order, flags, nodemask)
    }

    fn wakeup_background(&self, node: usize, zone_idx: usize, order: usize, cz: usize) {
        self.0.wakeup_background(node, zone_idx, order, cz);
    }
}

struct StashCompaction {
    mem: OnceLock<Arc<PhysMemory>>,
    block: Mutex<Option<(usize, usize)>>,
}

impl CompactionHook for StashCompaction {
    fn try_to_compact(
        &self,
        _order: usize,
        _flags: GfpFlags,
        _nodemask: Option<NodeMask>,
        _sync: bool,
    ) -> CompactOutcome {
        let Some(mem) = self.mem.get() else {
            return CompactOutcome::Skipped;
        };
        let Some((pfn, order)) = self.block.lock().unwrap().take() else {
            return CompactOutcome::Skipped;
        };
        mem.free_pages(0, pfn, order).unwrap();
        CompactOutcome::Partial
    }
}

#[test]
fn direct_compaction_rescues_high_order() {
    let mut cfg = MemoryConfig::flat(64);
    cfg.tunables = Tunables {
        min_free_kbytes: Some(0),
        pageblock_order: 4,
        mobility_grouping: MobilityGrouping::On,
        ..Tunables::default()
    };
    let compactor = Arc::new(StashCompaction {
        mem: OnceLock::new(),
        block: Mutex::new(None),
    });
    let mut mem = PhysMemory::new(cfg).unwrap();
    mem.set_compaction_hook(Box::new(CompactionHandle(compactor.clone())));
    let mem = Arc::new(mem);
    compactor.mem.set(mem.clone()).ok().unwrap();
    mem.release_bootmem(PfnRange::new(0, 64)).unwrap();

    // hold an order-4 run, splinter everything else as singles
    let big = mem
        .alloc_pages(&AllocRequest::new(4, GfpFlags::NOWARN))
        .unwrap();
    let req = AllocRequest::new(0, GfpFlags::NOWARN);
    while mem.alloc_pages(&req).is_some() {}
    *compactor.block.lock().unwrap() = Some((big, 4));

    // no order-3 block exists until "compaction" reassembles one
    let flags = GfpFlags::KERNEL | GfpFlags::NOWARN;
    let got = mem.alloc_pages(&AllocRequest::new(3, flags));
    assert!(got.is_some());
    assert_eq!(mem.vm_event(VmEvent::CompactSuccess), 1);
}

struct CompactionHandle(Arc<StashCompaction>);

impl CompactionHook for CompactionHandle {
    fn try_to_compact(
        &self,
        order: usize,
        flags: GfpFlags,
        nodemask: Option<NodeMask>,
        sync: bool,
    ) -> CompactOutcome {
        self.0.try_to_compact(order, flags, nodemask, sync)
    }
}

#[test]
fn boundary_orders() {
    let mem = boot_flat(1 << (MAX_ORDER - 1), MAX_ORDER - 2);
    let zone = normal_zone(&mem);
    assert_eq!(zone.nr_free(MAX_ORDER - 1), 1);

    // largest valid order succeeds, anything above fails cleanly
    let flags = GfpFlags::NOWARN;
    let top = mem.alloc_pages(&AllocRequest::new(MAX_ORDER - 1, flags));
    assert_eq!(top, Some(0));
    assert_eq!(mem.alloc_pages(&AllocRequest::new(MAX_ORDER, flags)), None);

    mem.free_pages(0, 0, MAX_ORDER - 1).unwrap();
    assert_eq!(zone.nr_free(MAX_ORDER - 1), 1);

    // freeing above the supported range is refused outright
    assert!(mem.free_pages(0, 0, MAX_ORDER).is_err());
}

#[test]
fn compound_pages_round_trip() {
    let mem = boot_flat(32, 4);
    let flags = GfpFlags::COMP | GfpFlags::NOWARN;
    let head = mem.alloc_pages(&AllocRequest::new(2, flags)).unwrap();

    // splitting a compound run is a caller bug
    assert!(mem.split_page(head, 2).is_err());

    mem.free_pages(0, head, 2).unwrap();
    mem.drain_all();
    assert_eq!(normal_zone(&mem).free_pages(), 32);
    assert!(!mem.is_tainted());
}

#[test]
fn split_page_then_free_singly() {
    let mem = boot_flat(32, 4);
    let pfn = mem
        .alloc_pages(&AllocRequest::new(3, GfpFlags::NOWARN))
        .unwrap();
    mem.split_page(pfn, 3).unwrap();
    for p in pfn..pfn + 8 {
        mem.free_pages(0, p, 0).unwrap();
    }
    mem.drain_all();
    assert_eq!(normal_zone(&mem).free_pages(), 32);
}

#[test]
fn alloc_exact_frees_tail() {
    let mem = boot_flat(32, 4);
    let zone = normal_zone(&mem);

    // 3 pages: rounds to order 2, tail page comes straight back
    let range = mem
        .alloc_pages_exact(3 * 4096, GfpFlags::NOWARN, 0)
        .unwrap();
    assert_eq!(range.count, 3);
    mem.drain_all();
    assert_eq!(zone.free_pages(), 32 - 3);

    mem.free_pages_exact(0, range);
    mem.drain_all();
    assert_eq!(zone.free_pages(), 32);
}

#[test]
fn cold_allocations_take_the_cold_end() {
    let mem = boot_flat(12288, 9);

    // prime the cache with a refill batch
    let first = mem
        .alloc_pages(&AllocRequest::new(0, GfpFlags::empty()))
        .unwrap();
    // refill delivered [first, first+1, first+2]; hot pop took `first`
    let cold = mem
        .alloc_pages(&AllocRequest::new(0, GfpFlags::COLD))
        .unwrap();
    assert_eq!(cold, first + 2);
    let hot = mem
        .alloc_pages(&AllocRequest::new(0, GfpFlags::empty()))
        .unwrap();
    assert_eq!(hot, first + 1);
}

#[test]
fn double_free_is_contained() {
    let mem = boot_flat(16, 4);
    let pfn = mem
        .alloc_pages(&AllocRequest::new(0, GfpFlags::NOWARN))
        .unwrap();
    mem.free_pages(0, pfn, 0).unwrap();

    let err = mem.free_pages(0, pfn, 0).unwrap_err();
    assert_eq!(err, pfa_core::Error::BadPageState(pfn));
    assert!(mem.is_tainted());
    assert!(mem.vm_event(VmEvent::BadPage) >= 1);
}

#[test]
fn memalloc_context_ignores_watermarks() {
    let mut cfg = MemoryConfig::flat(256);
    cfg.tunables = Tunables {
        // the derived min watermark dwarfs the zone
        min_free_kbytes: Some(4096),
        pageblock_order: 4,
        mobility_grouping: MobilityGrouping::On,
        ..Tunables::default()
    };
    let mem = PhysMemory::new(cfg).unwrap();
    mem.release_bootmem(PfnRange::new(0, 256)).unwrap();

    let plain = GfpFlags::NOWARN;
    assert_eq!(mem.alloc_pages(&AllocRequest::new(0, plain)), None);

    let emergency = GfpFlags::NOWARN | GfpFlags::MEMALLOC;
    assert!(mem.alloc_pages(&AllocRequest::new(0, emergency)).is_some());
}

fn numa_config() -> MemoryConfig {
    MemoryConfig {
        nodes: vec![
            NodeConfig {
                zones: vec![ZoneConfig::new(ZoneKind::Normal, 0, 64)],
                distances: vec![10, 20],
                nr_cpus: 1,
            },
            NodeConfig {
                zones: vec![ZoneConfig::new(ZoneKind::Normal, 64, 64)],
                distances: vec![20, 10],
                nr_cpus: 1,
            },
        ],
        nr_cpus: 2,
        holes: vec![],
        tunables: Tunables {
            min_free_kbytes: Some(0),
            pageblock_order: 4,
            mobility_grouping: MobilityGrouping::On,
            ..Tunables::default()
        },
    }
}

#[test]
fn numa_prefers_local_then_falls_back() {
    let mem = PhysMemory::new(numa_config()).unwrap();
    mem.release_bootmem(PfnRange::new(0, 128)).unwrap();

    let local = mem
        .alloc_pages(&AllocRequest::new(0, GfpFlags::NOWARN).on_node(1))
        .unwrap();
    assert!(local >= 64, "node 1 allocation landed on node 0");

    // exhaust node 1, the next request spills to node 0
    let req = AllocRequest::new(0, GfpFlags::NOWARN).on_node(1);
    while mem.alloc_pages(&req).map(|p| p >= 64).unwrap_or(false) {}
    let spilled = mem.alloc_pages(&req);
    assert!(matches!(spilled, Some(p) if p < 64));

    let counters = mem.zone_counters(1, ZoneKind::Normal.idx()).unwrap();
    assert!(counters.numa_hit >= 1);
}

#[test]
fn numa_thisnode_never_spills() {
    let mem = PhysMemory::new(numa_config()).unwrap();
    mem.release_bootmem(PfnRange::new(0, 128)).unwrap();

    let req = AllocRequest::new(0, GfpFlags::NOWARN | GfpFlags::THISNODE).on_node(1);
    let mut got = 0;
    while let Some(pfn) = mem.alloc_pages(&req) {
        assert!(pfn >= 64);
        got += 1;
    }
    // node 1's 64 pages and not one more
    assert_eq!(got, 64);
}

#[test]
fn numa_nodemask_restricts_placement() {
    let mem = PhysMemory::new(numa_config()).unwrap();
    mem.release_bootmem(PfnRange::new(0, 128)).unwrap();

    let req = AllocRequest::new(0, GfpFlags::NOWARN)
        .on_node(1)
        .with_nodemask(NodeMask::single(0));
    let pfn = mem.alloc_pages(&req).unwrap();
    assert!(pfn < 64);
}

#[test]
fn dma_restriction_honoured() {
    let cfg = MemoryConfig {
        nodes: vec![NodeConfig {
            zones: vec![
                ZoneConfig::new(ZoneKind::Dma, 0, 16),
                ZoneConfig::new(ZoneKind::Normal, 16, 48),
            ],
            distances: vec![10],
            nr_cpus: 1,
        }],
        nr_cpus: 1,
        holes: vec![],
        tunables: Tunables {
            min_free_kbytes: Some(0),
            pageblock_order: 4,
            mobility_grouping: MobilityGrouping::On,
            ..Tunables::default()
        },
    };
    let mem = PhysMemory::new(cfg).unwrap();
    mem.release_bootmem(PfnRange::new(0, 64)).unwrap();

    // kernel traffic stays out of DMA while Normal has memory
    let normal = mem
        .alloc_pages(&AllocRequest::new(0, GfpFlags::NOWARN))
        .unwrap();
    assert!(normal >= 16);

    let dma = mem
        .alloc_pages(&AllocRequest::new(0, GfpFlags::NOWARN | GfpFlags::DMA))
        .unwrap();
    assert!(dma < 16);
}

#[test]
fn movable_carveout_serves_movable_traffic() {
    let mut cfg = MemoryConfig::flat(128).carve_movable(64);
    cfg.tunables = Tunables {
        min_free_kbytes: Some(0),
        pageblock_order: 4,
        mobility_grouping: MobilityGrouping::On,
        ..Tunables::default()
    };
    let mem = PhysMemory::new(cfg).unwrap();
    mem.release_bootmem(PfnRange::new(0, 128)).unwrap();

    assert!(mem.zone(0, ZoneKind::Movable.idx()).is_some());

    // movable user pages land in the carveout, kernel pages below it
    let user = GfpFlags::HIGHUSER_MOVABLE | GfpFlags::NOWARN;
    let pfn = mem.alloc_pages(&AllocRequest::new(0, user)).unwrap();
    assert!(pfn >= 64);

    let kernel = mem
        .alloc_pages(&AllocRequest::new(0, GfpFlags::NOWARN))
        .unwrap();
    assert!(kernel < 64);
}

#[test]
fn accounting_holds_through_churn() {
    let mem = boot_flat(256, 4);
    let zone = normal_zone(&mem);

    let mut held: Vec<(usize, usize)> = Vec::new();
    let mut allocated = 0usize;
    for i in 0..64 {
        let order = [0, 0, 1, 2][i % 4];
        if let Some(pfn) = mem.alloc_pages(&AllocRequest::new(order, GfpFlags::NOWARN)) {
            held.push((pfn, order));
            allocated += 1 << order;
        }
        assert_eq!(
            zone.free_pages() + zone.pcp_pages() + allocated,
            256,
            "accounting drifted at step {}",
            i
        );
    }

    for (pfn, order) in held.drain(..) {
        mem.free_pages(0, pfn, order).unwrap();
        allocated -= 1 << order;
        assert_eq!(zone.free_pages() + zone.pcp_pages() + allocated, 256);
    }

    mem.drain_all();
    assert_eq!(zone.free_pages(), 256);
}

#[test]
fn concurrent_churn_smoke() {
    let mem = Arc::new(boot_flat(4096, 4));
    let zone_total = 4096;

    let mut handles = Vec::new();
    for cpu in 0..4 {
        let mem = mem.clone();
        handles.push(std::thread::spawn(move || {
            let mut held = Vec::new();
            for i in 0..500 {
                let order = [0, 0, 0, 1, 2][i % 5];
                let req = AllocRequest::new(order, GfpFlags::NOWARN).on_cpu(cpu);
                if let Some(pfn) = mem.alloc_pages(&req) {
                    held.push((pfn, order));
                }
                if i % 3 == 0 {
                    if let Some((pfn, order)) = held.pop() {
                        mem.free_pages(cpu, pfn, order).unwrap();
                    }
                }
            }
            for (pfn, order) in held {
                mem.free_pages(cpu, pfn, order).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    mem.drain_all();
    let zone = normal_zone(&mem);
    assert_eq!(zone.free_pages(), zone_total);
    assert!(!mem.is_tainted());

    // quiescent buddy structure: aligned blocks, no mergeable pairs left
    let blocks = mem.free_blocks(0, ZoneKind::Normal.idx());
    let total: usize = blocks.iter().map(|&(_, order, _)| 1usize << order).sum();
    assert_eq!(total, zone_total);
    for &(pfn, order, _) in &blocks {
        assert_eq!(pfn & ((1 << order) - 1), 0);
    }
    for &(pfn, order, _) in &blocks {
        let buddy = pfn ^ (1 << order);
        assert!(
            !blocks.iter().any(|&(p, o, _)| p == buddy && o == order),
            "unmerged buddies at {:#x}/{:#x} order {}",
            pfn,
            buddy,
            order
        );
    }
}

#[test]
fn drain_is_idempotent() {
    let mem = boot_flat(12288, 9);
    let zone = normal_zone(&mem);

    let mut held = Vec::new();
    for _ in 0..32 {
        held.push(
            mem.alloc_pages(&AllocRequest::new(0, GfpFlags::NOWARN))
                .unwrap(),
        );
    }
    for pfn in held {
        mem.free_pages(0, pfn, 0).unwrap();
    }

    mem.drain_all();
    let after_first = (zone.free_pages(), zone.pcp_pages());
    mem.drain_all();
    let after_second = (zone.free_pages(), zone.pcp_pages());
    assert_eq!(after_first, after_second);
    assert_eq!(after_first, (12288, 0));
}

#[test]
fn isolated_blocks_refuse_allocation_traffic() {
    let mem = boot_flat(64, 4);
    let zone = normal_zone(&mem);

    // take every page, then quarantine the second page-block
    let req = AllocRequest::new(0, GfpFlags::NOWARN);
    let mut held = Vec::new();
    while let Some(pfn) = mem.alloc_pages(&req) {
        held.push(pfn);
    }
    assert_eq!(held.len(), 64);
    mem.isolate_pageblock(16).unwrap();

    // pages freed into the quarantined block bypass the PCP cache and sit
    // on the isolate list, invisible to allocation
    for pfn in 16..32 {
        mem.free_pages(0, pfn, 0).unwrap();
    }
    assert_eq!(zone.free_pages(), 16);
    assert_eq!(zone.counters().nr_isolated, 16);
    assert_eq!(mem.alloc_pages(&req), None);

    // lifting the quarantine makes the block allocatable again
    mem.undo_isolate_pageblock(16).unwrap();
    assert_eq!(zone.counters().nr_isolated, 0);
    let back = mem.alloc_pages(&req).unwrap();
    assert!((16..32).contains(&back));
}

//! Nodes and the allocator context
//!
//! `PhysMemory` is the explicit context the whole core hangs off: the dense
//! frame array, the per-node zones, the published zonelists, the installed
//! collaborator hooks, and the runtime tunables. One instance per machine
//! at runtime; tests build as many small ones as they like.
//!
//! Construction follows the kernel boot sequence: every descriptor
//! starts Reserved, zones and pagesets are sized, watermarks and reserves
//! are derived, zonelists are built, and only then does `release_bootmem`
//! feed memory into the buddy pool.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use pfa_api::{
    Clock, CompactionHook, Error, FaultInjector, NullClock, NullCompaction, NullOom, NullReclaim,
    OomHook, ReclaimHook, Result,
};
use spin::{Mutex, RwLock};

use crate::mobility::{Migratetype, MIGRATE_TYPES};
use crate::page::{Page, PageFlags};
use crate::stats::{RateLimit, VmEvent, VmEventCounters, ZoneCounters};
use crate::tunables::{MobilityGrouping, Tunables};
use crate::zone::{Watermark, Zone, ZoneKind, MAX_NR_ZONES};
use crate::zonelist::{build_zonelists, default_zonelist_order, Zonelist, ZonelistOrder};
use crate::{Pfn, PfnRange, MAX_ORDER, PAGE_SHIFT};

/// Distance a node reports to itself.
const LOCAL_DISTANCE: u32 = 10;

/// One zone's extent within a node.
#[derive(Debug, Clone)]
pub struct ZoneConfig {
    /// Address-range class
    pub kind: ZoneKind,
    /// First frame
    pub start_pfn: Pfn,
    /// Frames spanned (holes included)
    pub pages: usize,
}

impl ZoneConfig {
    /// Shorthand constructor
    pub fn new(kind: ZoneKind, start_pfn: Pfn, pages: usize) -> Self {
        Self {
            kind,
            start_pfn,
            pages,
        }
    }
}

/// One NUMA node's memory layout.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Zones, ascending by kind
    pub zones: Vec<ZoneConfig>,
    /// Distance to every node, indexed by node id; defaults to local/remote
    pub distances: Vec<u32>,
    /// CPUs homed on this node (zonelist tie-breaking)
    pub nr_cpus: usize,
}

/// Whole-machine description handed to [`PhysMemory::new`].
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Per-node layout
    pub nodes: Vec<NodeConfig>,
    /// CPUs the per-CPU pagesets are sharded over
    pub nr_cpus: usize,
    /// Frames inside zone spans with no backing memory; they stay Reserved
    pub holes: Vec<PfnRange>,
    /// Knobs
    pub tunables: Tunables,
}

impl MemoryConfig {
    /// A single node with one Normal zone starting at frame 0 - the shape
    /// nearly every unit test wants.
    pub fn flat(pages: usize) -> Self {
        Self {
            nodes: vec![NodeConfig {
                zones: vec![ZoneConfig::new(ZoneKind::Normal, 0, pages)],
                distances: vec![LOCAL_DISTANCE],
                nr_cpus: 1,
            }],
            nr_cpus: 1,
            holes: Vec::new(),
            tunables: Tunables::default(),
        }
    }

    /// The movablecore boot split: carve `movable_pages` off the top of the
    /// machine into per-node Movable zones, proportional to each node's
    /// highest zone so no single node loses all its kernel-usable memory.
    pub fn carve_movable(mut self, movable_pages: usize) -> Self {
        let total_top: usize = self
            .nodes
            .iter()
            .filter_map(|n| n.zones.last())
            .map(|z| z.pages)
            .sum();
        if total_top == 0 || movable_pages == 0 {
            return self;
        }
        let movable_pages = movable_pages.min(total_top);

        for node in &mut self.nodes {
            let Some(top) = node.zones.last_mut() else {
                continue;
            };
            let share = (movable_pages * top.pages / total_top).min(top.pages - 1);
            if share == 0 {
                continue;
            }
            top.pages -= share;
            let cut = top.start_pfn + top.pages;
            node.zones.push(ZoneConfig::new(ZoneKind::Movable, cut, share));
        }
        self
    }
}

/// One NUMA node: its zones and published zonelists.
pub struct Node {
    id: usize,
    zones: [Option<Zone>; MAX_NR_ZONES],
    distances: Vec<u32>,
    nr_cpus: usize,
    pub(crate) zonelist: RwLock<Zonelist>,
    pub(crate) thisnode: RwLock<Zonelist>,
}

impl Node {
    pub(crate) fn empty(id: usize, distances: Vec<u32>, nr_cpus: usize) -> Self {
        Self {
            id,
            zones: [const { None }; MAX_NR_ZONES],
            distances,
            nr_cpus,
            zonelist: RwLock::new(Zonelist::empty()),
            thisnode: RwLock::new(Zonelist::empty()),
        }
    }

    pub(crate) fn set_zone(&mut self, zone: Zone) {
        let idx = zone.kind().idx();
        self.zones[idx] = Some(zone);
    }

    /// Node id
    pub fn id(&self) -> usize {
        self.id
    }

    /// The zone at `idx`, when configured
    pub fn zone(&self, idx: usize) -> Option<&Zone> {
        self.zones.get(idx).and_then(|z| z.as_ref())
    }

    /// CPUs homed here
    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// Whether the node has any present memory
    pub fn is_populated(&self) -> bool {
        self.zones
            .iter()
            .flatten()
            .any(|z| z.present_pages() > 0)
    }

    /// Inter-node distance, defaulting to local/2x-local when the config
    /// did not provide a matrix row
    pub fn distance_to(&self, other: usize) -> u32 {
        self.distances.get(other).copied().unwrap_or(if other == self.id {
            LOCAL_DISTANCE
        } else {
            2 * LOCAL_DISTANCE
        })
    }
}

/// The allocator context: frame array, nodes, hooks, tunables.
pub struct PhysMemory {
    pages: Box<[Page]>,
    nodes: Vec<Node>,
    holes: Vec<PfnRange>,
    nr_cpus: usize,
    pageblock_order: usize,

    min_free_kbytes: AtomicUsize,
    lowmem_reserve_ratio: [AtomicUsize; MAX_NR_ZONES],
    percpu_pagelist_fraction: AtomicUsize,
    zonelist_order: AtomicU8,
    dirty_ratio: AtomicUsize,
    total_reserve_pages: AtomicUsize,

    zone_reclaim_mode: AtomicBool,
    suspended_storage: AtomicBool,
    tainted: AtomicBool,
    pub(crate) oom_lock: AtomicBool,
    zonelist_mutex: Mutex<()>,

    pub(crate) vm_events: VmEventCounters,
    bad_page_rl: RateLimit,
    pub(crate) nopage_rl: RateLimit,

    pub(crate) reclaim: Box<dyn ReclaimHook>,
    pub(crate) compaction: Box<dyn CompactionHook>,
    pub(crate) oom: Box<dyn OomHook>,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) fault: Option<Box<dyn FaultInjector>>,
}

impl PhysMemory {
    /// Build a context from a machine description. Every frame starts
    /// Reserved; feed memory in with [`PhysMemory::release_bootmem`].
    pub fn new(config: MemoryConfig) -> Result<Self> {
        Self::validate(&config)?;

        let end_pfn = config
            .nodes
            .iter()
            .flat_map(|n| n.zones.iter())
            .map(|z| z.start_pfn + z.pages)
            .max()
            .unwrap_or(0);

        let mut pages = Vec::with_capacity(end_pfn);
        pages.resize_with(end_pfn, Page::new);
        let pages: Box<[Page]> = pages.into_boxed_slice();

        let pageblock_order = config.tunables.pageblock_order;
        let total_present: usize = config
            .nodes
            .iter()
            .flat_map(|n| n.zones.iter())
            .map(|z| z.pages - holes_in(&config.holes, z.start_pfn, z.pages))
            .sum();

        let grouping_disabled = match config.tunables.mobility_grouping {
            MobilityGrouping::On => false,
            MobilityGrouping::Off => true,
            MobilityGrouping::Auto => {
                total_present < (1 << pageblock_order) * MIGRATE_TYPES * 8
            }
        };

        let mut nodes = Vec::with_capacity(config.nodes.len());
        for (nid, ncfg) in config.nodes.iter().enumerate() {
            let mut node = Node::empty(nid, ncfg.distances.clone(), ncfg.nr_cpus);
            for zcfg in &ncfg.zones {
                let present = zcfg.pages - holes_in(&config.holes, zcfg.start_pfn, zcfg.pages);
                // memmap init: link every descriptor to its zone
                for pfn in zcfg.start_pfn..zcfg.start_pfn + zcfg.pages {
                    pages[pfn].set_links(nid, zcfg.kind.idx());
                }
                node.set_zone(Zone::new(
                    zcfg.kind,
                    nid,
                    zcfg.start_pfn,
                    zcfg.pages,
                    present,
                    pageblock_order,
                    config.tunables.debug_guardpage_minorder,
                    grouping_disabled,
                    config.nr_cpus,
                ));
            }
            nodes.push(node);
        }

        let lowmem_kbytes = nodes
            .iter()
            .flat_map(|n| n.zones.iter().flatten())
            .filter(|z| !z.kind().is_highmem())
            .map(|z| z.present_pages())
            .sum::<usize>()
            << (PAGE_SHIFT - 10);
        let min_free = config.tunables.resolve_min_free_kbytes(lowmem_kbytes);

        let mem = Self {
            pages,
            nodes,
            holes: config.holes,
            nr_cpus: config.nr_cpus.max(1),
            pageblock_order,
            min_free_kbytes: AtomicUsize::new(min_free),
            lowmem_reserve_ratio: core::array::from_fn(|i| {
                AtomicUsize::new(config.tunables.lowmem_reserve_ratio[i])
            }),
            percpu_pagelist_fraction: AtomicUsize::new(config.tunables.percpu_pagelist_fraction),
            zonelist_order: AtomicU8::new(config.tunables.zonelist_order as u8),
            dirty_ratio: AtomicUsize::new(config.tunables.dirty_ratio),
            total_reserve_pages: AtomicUsize::new(0),
            zone_reclaim_mode: AtomicBool::new(false),
            suspended_storage: AtomicBool::new(false),
            tainted: AtomicBool::new(false),
            oom_lock: AtomicBool::new(false),
            zonelist_mutex: Mutex::new(()),
            vm_events: VmEventCounters::new(),
            bad_page_rl: RateLimit::new(60, 60_000),
            nopage_rl: RateLimit::new(10, 5_000),
            reclaim: Box::new(NullReclaim),
            compaction: Box::new(NullCompaction),
            oom: Box::new(NullOom),
            clock: Box::new(NullClock),
            fault: None,
        };

        if config.tunables.percpu_pagelist_fraction != 0 {
            mem.apply_percpu_fraction(config.tunables.percpu_pagelist_fraction);
        }
        mem.setup_per_zone_wmarks();
        mem.setup_per_zone_lowmem_reserve();
        mem.build_all_zonelists();

        log::info!(
            "physical memory: {} node(s), {} pages, mobility grouping {}",
            mem.nodes.len(),
            mem.pages.len(),
            if grouping_disabled { "off" } else { "on" }
        );
        Ok(mem)
    }

    fn validate(config: &MemoryConfig) -> Result<()> {
        if config.nodes.is_empty() {
            return Err(Error::InvalidConfig("no nodes"));
        }
        if config.nodes.len() > pfa_api::NodeMask::MAX_NODES {
            return Err(Error::InvalidConfig("too many nodes"));
        }
        let po = config.tunables.pageblock_order;
        if po == 0 || po >= MAX_ORDER {
            return Err(Error::InvalidConfig("pageblock order out of range"));
        }

        let mut extents: Vec<(Pfn, Pfn)> = Vec::new();
        for ncfg in &config.nodes {
            let mut last_kind: Option<ZoneKind> = None;
            for zcfg in &ncfg.zones {
                if zcfg.pages == 0 {
                    return Err(Error::InvalidConfig("empty zone"));
                }
                if let Some(prev) = last_kind {
                    if zcfg.kind <= prev {
                        return Err(Error::InvalidConfig("zones out of order"));
                    }
                }
                last_kind = Some(zcfg.kind);
                extents.push((zcfg.start_pfn, zcfg.start_pfn + zcfg.pages));
            }
        }
        extents.sort_unstable();
        if extents.windows(2).any(|w| w[0].1 > w[1].0) {
            return Err(Error::InvalidConfig("overlapping zones"));
        }
        if let Some(&(_, end)) = extents.last() {
            if end >= u32::MAX as usize {
                return Err(Error::InvalidConfig("frame space too large"));
            }
        }
        Ok(())
    }

    /// Install the eviction collaborator.
    pub fn set_reclaim_hook(&mut self, hook: Box<dyn ReclaimHook>) {
        self.reclaim = hook;
    }

    /// Install the defragmentation collaborator.
    pub fn set_compaction_hook(&mut self, hook: Box<dyn CompactionHook>) {
        self.compaction = hook;
    }

    /// Install the OOM collaborator.
    pub fn set_oom_hook(&mut self, hook: Box<dyn OomHook>) {
        self.oom = hook;
    }

    /// Install the time source.
    pub fn set_clock(&mut self, clock: Box<dyn Clock>) {
        self.clock = clock;
    }

    /// Install (or remove) the allocation fault injector.
    pub fn set_fault_injector(&mut self, injector: Option<Box<dyn FaultInjector>>) {
        self.fault = injector;
    }

    /// The frame array
    pub(crate) fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Number of frames covered
    pub fn nr_pages(&self) -> usize {
        self.pages.len()
    }

    /// Whether `pfn` has a descriptor
    pub fn pfn_valid(&self, pfn: Pfn) -> bool {
        pfn < self.pages.len()
    }

    /// Configured nodes
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Zone accessor
    pub fn zone(&self, node: usize, zone_idx: usize) -> Option<&Zone> {
        self.nodes.get(node).and_then(|n| n.zone(zone_idx))
    }

    /// CPUs the pagesets shard over
    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// log2 pages per page-block
    pub fn pageblock_order(&self) -> usize {
        self.pageblock_order
    }

    /// Zone owning `pfn`, resolved through the descriptor's packed link.
    pub(crate) fn page_zone(&self, pfn: Pfn) -> Option<&Zone> {
        let page = self.pages.get(pfn)?;
        let zone = self.nodes.get(page.node_id())?.zone(page.zone_idx())?;
        zone.contains(pfn).then_some(zone)
    }

    /// Whether zone-local reclaim is preferred over remote fallback
    pub fn zone_reclaim_mode(&self) -> bool {
        self.zone_reclaim_mode.load(Ordering::Relaxed)
    }

    /// Suspend mode: reclaim cannot write anything out, so no-progress
    /// retries fail fast instead of looping.
    pub fn set_suspended_storage(&self, suspended: bool) {
        self.suspended_storage.store(suspended, Ordering::Relaxed);
    }

    pub(crate) fn suspended_storage(&self) -> bool {
        self.suspended_storage.load(Ordering::Relaxed)
    }

    /// Whether a bad-page report has tainted this context
    pub fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::Relaxed)
    }

    /// Take the OOM gate on behalf of an external killer. Returns false
    /// when another killer already holds it.
    pub fn try_set_oom(&self) -> bool {
        !self.oom_lock.swap(true, Ordering::Acquire)
    }

    /// Release the OOM gate taken with [`try_set_oom`](Self::try_set_oom).
    pub fn clear_oom(&self) {
        self.oom_lock.store(false, Ordering::Release);
    }

    /// Current dirty-ratio tunable, percent
    pub(crate) fn dirty_ratio(&self) -> usize {
        self.dirty_ratio.load(Ordering::Relaxed)
    }

    /// Pages withheld across all zones (high watermarks plus the largest
    /// lowmem reserves), which is also the dirty-balance exclusion.
    pub fn total_reserve_pages(&self) -> usize {
        self.total_reserve_pages.load(Ordering::Relaxed)
    }

    /// Read one global vm event counter
    pub fn vm_event(&self, event: VmEvent) -> u64 {
        self.vm_events.read(event)
    }

    /// Per-zone counter snapshot
    pub fn zone_counters(&self, node: usize, zone_idx: usize) -> Option<ZoneCounters> {
        Some(self.zone(node, zone_idx)?.counters())
    }

    /// Iterate every configured zone, node-major.
    pub(crate) fn zones_iter(&self) -> impl Iterator<Item = &Zone> {
        self.nodes.iter().flat_map(|n| n.zones.iter().flatten())
    }

    // ------------------------------------------------------------------
    // Boot release
    // ------------------------------------------------------------------

    /// Move a Reserved range into the buddy pool, in the largest aligned
    /// blocks the range and its zone allow. Returns pages released.
    pub fn release_bootmem(&self, range: PfnRange) -> Result<usize> {
        if range.end() > self.pages.len() {
            return Err(Error::OutOfRange(range.end() - 1));
        }
        for pfn in range.start..range.end() {
            if !self.pages[pfn].test(PageFlags::RESERVED) {
                return Err(Error::BadPageState(pfn));
            }
            // holes have descriptors but no backing memory
            if self.page_zone(pfn).is_none() || self.holes.iter().any(|h| h.contains(pfn)) {
                return Err(Error::OutOfRange(pfn));
            }
        }

        let mut released = 0;
        let mut pfn = range.start;
        while pfn < range.end() {
            let zone = self.page_zone(pfn).ok_or(Error::OutOfRange(pfn))?;

            let align = if pfn == 0 {
                MAX_ORDER - 1
            } else {
                (pfn.trailing_zeros() as usize).min(MAX_ORDER - 1)
            };
            let mut order = align;
            while order > 0
                && (pfn + (1 << order) > range.end() || !zone.contains(pfn + (1 << order) - 1))
            {
                order -= 1;
            }

            for p in pfn..pfn + (1 << order) {
                self.pages[p].clear_flags(PageFlags::RESERVED);
            }

            let mt = zone.get_pageblock_migratetype(pfn);
            {
                let mut inner = zone.lock();
                zone.free_one_page(&mut inner, &self.pages, pfn, order, mt);
            }
            zone.add_free_pages(1 << order);
            zone.count_free(1 << order);
            zone.note_free();

            released += 1 << order;
            pfn += 1 << order;
        }
        Ok(released)
    }

    // ------------------------------------------------------------------
    // Watermarks, reserves, zonelists
    // ------------------------------------------------------------------

    /// Recompute min/low/high for every zone from `min_free_kbytes`, then
    /// refresh each zone's migrate reserve.
    pub fn setup_per_zone_wmarks(&self) {
        let pages_min = self.min_free_kbytes.load(Ordering::Relaxed) >> (PAGE_SHIFT - 10);
        let lowmem_pages: usize = self
            .zones_iter()
            .filter(|z| !z.kind().is_highmem())
            .map(|z| z.present_pages())
            .sum();
        let lowmem_pages = lowmem_pages.max(1);

        for zone in self.zones_iter() {
            let tmp = pages_min * zone.present_pages() / lowmem_pages;
            if zone.kind().is_highmem() {
                // emergency reserves are useless in highmem; keep a token
                // floor for the low/high deltas that drive reclaim
                let min_pages = (zone.present_pages() / 1024).clamp(32, 128);
                zone.set_watermark(Watermark::Min, min_pages);
            } else {
                zone.set_watermark(Watermark::Min, tmp);
            }
            zone.set_watermark(Watermark::Low, zone.watermark(Watermark::Min) + tmp / 4);
            zone.set_watermark(Watermark::High, zone.watermark(Watermark::Min) + tmp / 2);
            self.setup_zone_migrate_reserve(zone);
        }

        self.calculate_reserve_pages();
    }

    /// Tag up to two page-blocks per zone as the migrate reserve, preferring
    /// movable blocks with no reserved pages, and hand back any excess.
    fn setup_zone_migrate_reserve(&self, zone: &Zone) {
        let block_pages = zone.pageblock_nr_pages();
        let start = round_up(zone.start_pfn(), block_pages);
        let end = zone.end_pfn();

        let mut reserve = (round_up(zone.watermark(Watermark::Min), block_pages)
            >> zone.pageblock_order())
        .min(2);

        let mut inner = zone.lock();
        let mut pfn = start;
        while pfn < end {
            if pfn >= self.pages.len() {
                break;
            }
            let page = &self.pages[pfn];
            if page.node_id() != zone.node() {
                pfn += block_pages;
                continue;
            }

            let block_mt = zone.get_pageblock_migratetype(pfn);
            if reserve > 0 {
                let block_end = (pfn + block_pages).min(end);
                if zone.pageblock_is_reserved(&self.pages, pfn, block_end) {
                    pfn += block_pages;
                    continue;
                }
                if block_mt == Migratetype::Reserve {
                    reserve -= 1;
                    pfn += block_pages;
                    continue;
                }
                if block_mt == Migratetype::Movable {
                    zone.set_pageblock_migratetype(pfn, Migratetype::Reserve);
                    zone.move_freepages_block(&mut inner, &self.pages, pfn, Migratetype::Reserve);
                    reserve -= 1;
                    pfn += block_pages;
                    continue;
                }
            } else if block_mt == Migratetype::Reserve {
                // quota satisfied: return the excess to the movable pool
                zone.set_pageblock_migratetype(pfn, Migratetype::Movable);
                zone.move_freepages_block(&mut inner, &self.pages, pfn, Migratetype::Movable);
            }
            pfn += block_pages;
        }
    }

    /// Recompute the cross-zone protection vector: each lower zone reserves
    /// `its share / ratio` pages from allocations aimed at higher zones.
    pub fn setup_per_zone_lowmem_reserve(&self) {
        for node in &self.nodes {
            for j in 0..MAX_NR_ZONES {
                let Some(zone_j) = node.zone(j) else { continue };
                zone_j.set_lowmem_reserve(j, 0);

                let mut running = zone_j.present_pages();
                for idx in (0..j).rev() {
                    let ratio = self.lowmem_reserve_ratio[idx]
                        .load(Ordering::Relaxed)
                        .max(1);
                    if let Some(lower) = node.zone(idx) {
                        lower.set_lowmem_reserve(j, running / ratio);
                        running += lower.present_pages();
                    }
                }
            }
        }
        self.calculate_reserve_pages();
    }

    /// Refresh per-zone dirty-balance reserves and the machine total: the
    /// high watermark plus the largest lowmem reserve is memory that writers
    /// must never be allowed to fill with dirty pages.
    fn calculate_reserve_pages(&self) {
        let mut total = 0usize;
        for zone in self.zones_iter() {
            let mut max = (zone.zone_idx()..MAX_NR_ZONES)
                .map(|j| zone.lowmem_reserve(j))
                .max()
                .unwrap_or(0);
            max += zone.watermark(Watermark::High);
            max = max.min(zone.present_pages());
            zone.set_dirty_balance_reserve(max);
            total += max;
        }
        self.total_reserve_pages.store(total, Ordering::Relaxed);
    }

    /// Rebuild and publish every node's zonelists under the construction
    /// mutex. Readers keep walking the old snapshots until the swap.
    pub fn build_all_zonelists(&self) {
        let _guard = self.zonelist_mutex.lock();

        let mut order = ZonelistOrder::from_raw(self.zonelist_order.load(Ordering::Relaxed));
        if order == ZonelistOrder::Default {
            order = default_zonelist_order(&self.nodes);
        }
        let with_cache = self.nodes.len() > 1;
        let mut node_load = vec![0u64; self.nodes.len()];
        let mut want_reclaim = false;

        for nid in 0..self.nodes.len() {
            let built = build_zonelists(&self.nodes, nid, order, &mut node_load, with_cache);
            want_reclaim |= built.want_zone_reclaim;
            *self.nodes[nid].zonelist.write() = built.fallback;
            *self.nodes[nid].thisnode.write() = built.thisnode;
        }

        self.zone_reclaim_mode.store(want_reclaim, Ordering::Relaxed);
        log::debug!(
            "built {} zonelists in {:?} order, zone_reclaim {}",
            self.nodes.len(),
            order,
            want_reclaim
        );
    }

    // ------------------------------------------------------------------
    // Runtime tunables
    // ------------------------------------------------------------------

    /// Change the free-page floor and rederive every watermark.
    pub fn set_min_free_kbytes(&self, kbytes: usize) {
        self.min_free_kbytes.store(kbytes, Ordering::Relaxed);
        self.setup_per_zone_wmarks();
        self.setup_per_zone_lowmem_reserve();
    }

    /// Current free-page floor
    pub fn min_free_kbytes(&self) -> usize {
        self.min_free_kbytes.load(Ordering::Relaxed)
    }

    /// Change one lowmem protection ratio and recompute the vectors.
    pub fn set_lowmem_reserve_ratio(&self, zone_idx: usize, ratio: usize) {
        self.lowmem_reserve_ratio[zone_idx].store(ratio, Ordering::Relaxed);
        self.setup_per_zone_lowmem_reserve();
    }

    /// Re-size every per-CPU list: `fraction == 0` restores batch-derived
    /// sizing, otherwise each list caps at `present / fraction` pages.
    pub fn set_percpu_pagelist_fraction(&self, fraction: usize) {
        self.percpu_pagelist_fraction
            .store(fraction, Ordering::Relaxed);
        if fraction == 0 {
            for zone in self.zones_iter() {
                let batch = crate::pcp::zone_batchsize(zone.present_pages());
                for cpu in 0..zone.nr_cpus() {
                    *zone.pageset(cpu).lock() = crate::pcp::PerCpuPages::new(batch);
                }
            }
        } else {
            self.apply_percpu_fraction(fraction);
        }
    }

    fn apply_percpu_fraction(&self, fraction: usize) {
        for zone in self.zones_iter() {
            let high = zone.present_pages() / fraction;
            for cpu in 0..zone.nr_cpus() {
                zone.pageset(cpu).lock().set_high_mark(high);
            }
        }
    }

    /// Change the zonelist policy and republish.
    pub fn set_zonelist_order(&self, order: ZonelistOrder) {
        self.zonelist_order.store(order as u8, Ordering::Relaxed);
        self.build_all_zonelists();
    }

    // ------------------------------------------------------------------
    // Consumer bookkeeping
    // ------------------------------------------------------------------

    /// Record that a consumer mlocked an allocated page.
    pub fn mlock_page(&self, pfn: Pfn) -> Result<()> {
        let zone = self.page_zone(pfn).ok_or(Error::OutOfRange(pfn))?;
        if !self.pages[pfn].test(PageFlags::MLOCKED) {
            self.pages[pfn].set_flags(PageFlags::MLOCKED);
            zone.add_mlock(1);
        }
        Ok(())
    }

    /// Record that a consumer released an mlock.
    pub fn munlock_page(&self, pfn: Pfn) -> Result<()> {
        let zone = self.page_zone(pfn).ok_or(Error::OutOfRange(pfn))?;
        if self.pages[pfn].test_and_clear(PageFlags::MLOCKED) {
            zone.add_mlock(-1);
        }
        Ok(())
    }

    /// Adjust a zone's dirty-page count (collaborators own dirtiness).
    pub fn account_dirty(&self, node: usize, zone_idx: usize, delta: isize) {
        if let Some(zone) = self.zone(node, zone_idx) {
            zone.add_dirty(delta);
        }
    }

    /// Quarantine the page-block containing `pfn`: tag it Isolate and pull
    /// its free pages off the allocation lists.
    pub fn isolate_pageblock(&self, pfn: Pfn) -> Result<usize> {
        let zone = self.page_zone(pfn).ok_or(Error::OutOfRange(pfn))?;
        let mut inner = zone.lock();
        zone.set_pageblock_migratetype(pfn, Migratetype::Isolate);
        let moved = zone.move_freepages_block(&mut inner, &self.pages, pfn, Migratetype::Isolate);
        zone.add_isolated(moved as isize);
        Ok(moved)
    }

    /// Release a quarantined page-block back to the movable pool.
    pub fn undo_isolate_pageblock(&self, pfn: Pfn) -> Result<usize> {
        let zone = self.page_zone(pfn).ok_or(Error::OutOfRange(pfn))?;
        let mut inner = zone.lock();
        zone.set_pageblock_migratetype(pfn, Migratetype::Movable);
        let moved = zone.move_freepages_block(&mut inner, &self.pages, pfn, Migratetype::Movable);
        zone.add_isolated(-(moved as isize));
        Ok(moved)
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Snapshot one zone's free blocks as (first frame, order, class)
    /// triples - the free-area view diagnostics and invariant checks want.
    pub fn free_blocks(&self, node: usize, zone_idx: usize) -> Vec<(Pfn, usize, Migratetype)> {
        let mut out = Vec::new();
        let Some(zone) = self.zone(node, zone_idx) else {
            return out;
        };
        let inner = zone.lock();
        for order in 0..MAX_ORDER {
            for mt in Migratetype::ALL {
                for pfn in inner.free_area[order].list(mt).iter(&self.pages) {
                    out.push((pfn, order, mt));
                }
            }
        }
        out
    }

    /// Emit one page's decoded state to the log.
    pub fn dump_page(&self, pfn: Pfn) {
        if let Some(page) = self.pages.get(pfn) {
            log::error!(
                "page pfn {:#x}: flags {:?} refcount {} mapcount {} private {:#x} node {} zone {}",
                pfn,
                page.flags(),
                page.refcount(),
                page.mapcount(),
                page.private(),
                page.node_id(),
                page.zone_idx()
            );
        } else {
            log::error!("page pfn {:#x}: no descriptor", pfn);
        }
    }

    /// Contain a page that failed integrity checks: report (rate-limited),
    /// taint the context, and reset enough metadata that the page leaks
    /// safely instead of corrupting the buddy structure.
    pub(crate) fn bad_page(&self, pfn: Pfn) {
        let page = &self.pages[pfn];

        if page.test(PageFlags::HWPOISON) {
            // expected containment path; no report, no taint
            page.clear_flags(PageFlags::BUDDY | PageFlags::GUARD);
            return;
        }

        self.vm_events.count(VmEvent::BadPage);
        if let Some(missed) = self.bad_page_rl.allow(self.clock.now_ticks()) {
            if missed > 0 {
                log::error!("BUG: bad page state: {} reports suppressed", missed);
            }
            log::error!("BUG: bad page state at pfn {:#x}", pfn);
            self.dump_page(pfn);
        }
        self.tainted.store(true, Ordering::Relaxed);

        page.set_mapcount(0);
        page.clear_flags(PageFlags::BUDDY | PageFlags::GUARD);
    }
}

fn holes_in(holes: &[PfnRange], start: Pfn, pages: usize) -> usize {
    let end = start + pages;
    holes
        .iter()
        .map(|h| h.end().min(end).saturating_sub(h.start.max(start)))
        .sum()
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

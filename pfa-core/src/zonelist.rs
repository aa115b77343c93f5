//! Zone lists and NUMA ordering
//!
//! Each node publishes an ordered sequence of (node, zone) references that
//! defines allocation fallback. Two orderings exist: node-ordered keeps all
//! local zones ahead of any remote ones (locality first, DMA exhaustion
//! risk), zone-ordered keeps all high zones of every node ahead of lower
//! ones (low-zone protection first, locality cost). The default picks
//! per-machine from the relative weight of the DMA-class zones.
//!
//! On NUMA builds a zonelist carries a "full zones" cache: a bitmap of
//! zones recently found full, zapped wholesale once a second, letting the
//! walker skip hopeless zones without touching their counters.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use pfa_api::NodeMask;

use crate::node::Node;
use crate::zone::MAX_NR_ZONES;

/// Nodes farther apart than this make zone-local reclaim worthwhile before
/// spilling to a remote node.
pub(crate) const RECLAIM_DISTANCE: u32 = 30;

/// Tie-break penalty steering allocations toward CPU-less nodes, which see
/// little local pressure of their own.
const PENALTY_FOR_NODE_WITH_CPUS: u32 = 1;

/// Zonelist construction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ZonelistOrder {
    /// Choose automatically from zone sizes
    Default = 0,
    /// All local zones before any remote zone
    Node = 1,
    /// All nodes' high zones before any lower zone
    Zone = 2,
}

impl ZonelistOrder {
    pub(crate) fn from_raw(raw: u8) -> ZonelistOrder {
        match raw {
            1 => ZonelistOrder::Node,
            2 => ZonelistOrder::Zone,
            _ => ZonelistOrder::Default,
        }
    }
}

/// One step of a zonelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ZoneRef {
    pub(crate) node: usize,
    pub(crate) zone_idx: usize,
}

/// Cache of zones recently observed full. One bit per zonelist position,
/// plus the tick of the last wholesale zap.
#[derive(Debug)]
pub(crate) struct ZonelistCache {
    fullzones: Vec<AtomicU64>,
    last_full_zap: AtomicU64,
}

impl ZonelistCache {
    fn new(len: usize) -> Self {
        Self {
            fullzones: (0..len.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
            last_full_zap: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_full(&self, idx: usize) -> bool {
        self.fullzones[idx / 64].load(Ordering::Relaxed) & (1 << (idx % 64)) != 0
    }

    pub(crate) fn mark_full(&self, idx: usize) {
        self.fullzones[idx / 64].fetch_or(1 << (idx % 64), Ordering::Relaxed);
    }

    /// Forget everything (reclaim made progress; zones deserve another look).
    pub(crate) fn clear(&self) {
        for word in &self.fullzones {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Age out the cache when more than a second of ticks has passed.
    pub(crate) fn maybe_zap(&self, now: u64, hz: u64) {
        let last = self.last_full_zap.load(Ordering::Relaxed);
        if now > last + hz {
            self.clear();
            self.last_full_zap.store(now, Ordering::Relaxed);
        }
    }
}

/// A published fallback ordering. Readers walk `refs` without any lock; a
/// new snapshot replaces the whole list on rebuild.
#[derive(Debug)]
pub(crate) struct Zonelist {
    refs: Vec<ZoneRef>,
    cache: Option<ZonelistCache>,
}

impl Zonelist {
    pub(crate) fn empty() -> Self {
        Self {
            refs: Vec::new(),
            cache: None,
        }
    }

    fn new(refs: Vec<ZoneRef>, with_cache: bool) -> Self {
        let cache = with_cache.then(|| ZonelistCache::new(refs.len()));
        Self { refs, cache }
    }

    pub(crate) fn refs(&self) -> &[ZoneRef] {
        &self.refs
    }

    pub(crate) fn cache(&self) -> Option<&ZonelistCache> {
        self.cache.as_ref()
    }

    /// First reference at or below `high_idx` allowed by `nodemask`.
    pub(crate) fn first_suitable(
        &self,
        high_idx: usize,
        nodemask: Option<&NodeMask>,
    ) -> Option<ZoneRef> {
        self.refs
            .iter()
            .find(|r| r.zone_idx <= high_idx && nodemask.is_none_or(|m| m.contains(r.node)))
            .copied()
    }
}

/// Greedy nearest-neighbour node ordering. The next node is the unused one
/// minimizing distance, with penalties nudging toward nodes without CPUs
/// and a rotating load term spreading ties so no single node absorbs every
/// neighbour's fallback pressure.
pub(crate) fn find_next_best_node(
    local: usize,
    nodes: &[Node],
    used: &mut NodeMask,
    node_load: &[u64],
) -> Option<usize> {
    if !used.contains(local) {
        used.set(local);
        return Some(local);
    }

    let mut best: Option<usize> = None;
    let mut min_val = u64::MAX;

    for (n, node) in nodes.iter().enumerate() {
        if used.contains(n) || !node.is_populated() {
            continue;
        }

        let mut val = nodes[local].distance_to(n) as u64;
        // favour the next node over earlier ones at equal distance
        val += (n < local) as u64;
        if node.nr_cpus() > 0 {
            val += PENALTY_FOR_NODE_WITH_CPUS as u64;
        }
        val *= (nodes.len() * nodes.len()) as u64;
        val += node_load[n];

        if val < min_val {
            min_val = val;
            best = Some(n);
        }
    }

    if let Some(n) = best {
        used.set(n);
    }
    best
}

/// Pick the ordering for machines that did not ask: node-ordered when any
/// node lacks a Normal zone or when DMA-class memory dominates (locally or
/// globally), zone-ordered otherwise.
pub(crate) fn default_zonelist_order(nodes: &[Node]) -> ZonelistOrder {
    let mut low_kmem = 0usize;
    let mut total = 0usize;

    for node in nodes {
        for zone_idx in 0..MAX_NR_ZONES {
            match node.zone(zone_idx) {
                Some(zone) => {
                    if zone_idx < crate::zone::ZoneKind::Normal.idx() {
                        low_kmem += zone.present_pages();
                    }
                    total += zone.present_pages();
                }
                None => {
                    if zone_idx == crate::zone::ZoneKind::Normal.idx() && node.is_populated() {
                        // a node with only low memory needs local kernel
                        // allocations to stay local
                        return ZonelistOrder::Node;
                    }
                }
            }
        }
    }

    if low_kmem == 0 || low_kmem > total / 2 {
        return ZonelistOrder::Node;
    }

    let populated = nodes.iter().filter(|n| n.is_populated()).count();
    let average = total / (populated + 1);
    for node in nodes {
        let mut node_low = 0usize;
        let mut node_total = 0usize;
        for zone_idx in 0..MAX_NR_ZONES {
            if let Some(zone) = node.zone(zone_idx) {
                if zone_idx < crate::zone::ZoneKind::Normal.idx() {
                    node_low += zone.present_pages();
                }
                node_total += zone.present_pages();
            }
        }
        if node_low > 0 && node_total > average && node_low > node_total * 70 / 100 {
            return ZonelistOrder::Node;
        }
    }

    ZonelistOrder::Zone
}

fn push_node_zones(refs: &mut Vec<ZoneRef>, nodes: &[Node], node: usize) {
    for zone_idx in (0..MAX_NR_ZONES).rev() {
        if nodes[node].zone(zone_idx).is_some() {
            refs.push(ZoneRef { node, zone_idx });
        }
    }
}

/// Output of one node's zonelist construction.
pub(crate) struct BuiltZonelists {
    pub(crate) fallback: Zonelist,
    pub(crate) thisnode: Zonelist,
    /// True when some usable node is distant enough that zone-local reclaim
    /// beats remote fallback.
    pub(crate) want_zone_reclaim: bool,
}

/// Build both zonelists for `local`. `node_load` persists across the nodes
/// of one rebuild so distance ties rotate rather than pile up.
pub(crate) fn build_zonelists(
    nodes: &[Node],
    local: usize,
    order: ZonelistOrder,
    node_load: &mut [u64],
    with_cache: bool,
) -> BuiltZonelists {
    debug_assert_ne!(order, ZonelistOrder::Default);

    let mut used = NodeMask::empty();
    let mut ordered = Vec::with_capacity(nodes.len());
    let mut load = nodes.len();
    let mut prev = local;
    let mut want_zone_reclaim = false;

    while let Some(n) = find_next_best_node(local, nodes, &mut used, node_load) {
        let distance = nodes[local].distance_to(n);
        if distance > RECLAIM_DISTANCE {
            want_zone_reclaim = true;
        }
        if distance != nodes[local].distance_to(prev) {
            node_load[n] = load as u64;
        }
        prev = n;
        load = load.saturating_sub(1);
        ordered.push(n);
    }

    let mut refs = Vec::new();
    match order {
        ZonelistOrder::Zone => {
            for zone_idx in (0..MAX_NR_ZONES).rev() {
                for &n in &ordered {
                    if nodes[n].zone(zone_idx).is_some() {
                        refs.push(ZoneRef { node: n, zone_idx });
                    }
                }
            }
        }
        _ => {
            for &n in &ordered {
                push_node_zones(&mut refs, nodes, n);
            }
        }
    }

    let mut thisnode_refs = Vec::new();
    push_node_zones(&mut thisnode_refs, nodes, local);

    BuiltZonelists {
        fallback: Zonelist::new(refs, with_cache),
        thisnode: Zonelist::new(thisnode_refs, false),
        want_zone_reclaim,
    }
}

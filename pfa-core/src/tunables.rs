//! Allocator tunables
//!
//! The knobs a running system may turn: watermark sizing, cross-zone
//! protection ratios, per-CPU pool sizing, zonelist ordering. Boot-time
//! settings (page-block order, guard pages, mobility override) live here
//! too but are fixed once a `PhysMemory` exists.

use crate::zone::MAX_NR_ZONES;
use crate::zonelist::ZonelistOrder;

/// Whether mobility grouping is in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MobilityGrouping {
    /// Disable when total memory is too small for grouping to matter
    #[default]
    Auto,
    /// Always group
    On,
    /// Never group
    Off,
}

/// Configuration knobs and their defaults.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Free-page floor driving the watermarks; `None` derives
    /// `sqrt(16 * lowmem_kbytes)` clamped to [128, 65536].
    pub min_free_kbytes: Option<usize>,
    /// Per zone pair: reserve `lower_present / ratio` pages of a lower zone
    /// from allocations targeting this zone or above.
    pub lowmem_reserve_ratio: [usize; MAX_NR_ZONES],
    /// When nonzero, each per-CPU list holds at most
    /// `present_pages / fraction` pages.
    pub percpu_pagelist_fraction: usize,
    /// Zonelist construction policy.
    pub zonelist_order: ZonelistOrder,
    /// log2 pages per page-block (the mobility-tag granule).
    pub pageblock_order: usize,
    /// Orders below this become guard pages when split off (0 disables).
    pub debug_guardpage_minorder: usize,
    /// Share of a zone's dirtyable memory that may be dirty, percent.
    pub dirty_ratio: usize,
    /// Mobility grouping override.
    pub mobility_grouping: MobilityGrouping,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            min_free_kbytes: None,
            lowmem_reserve_ratio: [256, 256, 32, 32, 32],
            percpu_pagelist_fraction: 0,
            zonelist_order: ZonelistOrder::Default,
            pageblock_order: 9,
            debug_guardpage_minorder: 0,
            dirty_ratio: 20,
            mobility_grouping: MobilityGrouping::Auto,
        }
    }
}

impl Tunables {
    /// Derive `min_free_kbytes` from the amount of low memory, when not set
    /// explicitly. Square-root scaling: doubling memory does not double the
    /// reserve, mirroring how network burst capacity actually grows.
    pub(crate) fn resolve_min_free_kbytes(&self, lowmem_kbytes: usize) -> usize {
        match self.min_free_kbytes {
            Some(v) => v,
            None => {
                let raw = libm::sqrt((lowmem_kbytes * 16) as f64) as usize;
                raw.clamp(128, 65536)
            }
        }
    }
}

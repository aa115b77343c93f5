//! Allocator laws
//!
//! Property tests over random alloc/free/drain interleavings: whatever the
//! history, a quiescent allocator must restore its free structure exactly,
//! keep the page accounting balanced at every step, and never leave two
//! mergeable buddies on its lists.

use proptest::collection::vec;
use proptest::prelude::*;

use pfa_api::GfpFlags;
use pfa_core::{
    AllocRequest, MemoryConfig, MobilityGrouping, PfnRange, PhysMemory, Tunables, ZoneKind,
};

const ZONE_PAGES: usize = 512;

#[derive(Debug, Clone, Copy)]
enum Op {
    Alloc { order: usize, mobility: u8, cold: bool },
    FreeOldest,
    FreeNewest,
    Drain,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..=4, 0u8..3, any::<bool>())
            .prop_map(|(order, mobility, cold)| Op::Alloc { order, mobility, cold }),
        2 => Just(Op::FreeOldest),
        2 => Just(Op::FreeNewest),
        1 => Just(Op::Drain),
    ]
}

fn boot() -> PhysMemory {
    let mut cfg = MemoryConfig::flat(ZONE_PAGES);
    cfg.tunables = Tunables {
        min_free_kbytes: Some(0),
        pageblock_order: 4,
        mobility_grouping: MobilityGrouping::On,
        ..Tunables::default()
    };
    let mem = PhysMemory::new(cfg).unwrap();
    mem.release_bootmem(PfnRange::new(0, ZONE_PAGES)).unwrap();
    mem
}

fn flags_for(mobility: u8, cold: bool) -> GfpFlags {
    let mut flags = GfpFlags::NOWARN;
    match mobility {
        1 => flags |= GfpFlags::RECLAIMABLE,
        2 => flags |= GfpFlags::MOVABLE,
        _ => {}
    }
    if cold {
        flags |= GfpFlags::COLD;
    }
    flags
}

/// Drive one op sequence, returning what is still held.
fn apply(mem: &PhysMemory, ops: &[Op]) -> Vec<(usize, usize)> {
    let mut held: Vec<(usize, usize)> = Vec::new();
    for &op in ops {
        match op {
            Op::Alloc { order, mobility, cold } => {
                let req = AllocRequest::new(order, flags_for(mobility, cold));
                if let Some(pfn) = mem.alloc_pages(&req) {
                    held.push((pfn, order));
                }
            }
            Op::FreeOldest => {
                if !held.is_empty() {
                    let (pfn, order) = held.remove(0);
                    mem.free_pages(0, pfn, order).unwrap();
                }
            }
            Op::FreeNewest => {
                if let Some((pfn, order)) = held.pop() {
                    mem.free_pages(0, pfn, order).unwrap();
                }
            }
            Op::Drain => mem.drain_all(),
        }
    }
    held
}

proptest! {
    /// Round-trip law: free everything and the original free structure
    /// reappears - one maximal block, nothing stranded anywhere.
    #[test]
    fn round_trip_restores_free_structure(ops in vec(op_strategy(), 1..80)) {
        let mem = boot();
        let held = apply(&mem, &ops);
        for (pfn, order) in held {
            mem.free_pages(0, pfn, order).unwrap();
        }
        mem.drain_all();

        let zone = mem.zone(0, ZoneKind::Normal.idx()).unwrap();
        prop_assert_eq!(zone.free_pages(), ZONE_PAGES);
        prop_assert_eq!(zone.pcp_pages(), 0);
        // 512 pages merge back into exactly one order-9 block
        prop_assert_eq!(zone.nr_free(9), 1);
        for order in 0..9 {
            prop_assert_eq!(zone.nr_free(order), 0);
        }
        prop_assert!(!mem.is_tainted());
    }

    /// Accounting law: free + cached + handed-out covers the zone exactly,
    /// at every step of any history.
    #[test]
    fn accounting_balances_at_every_step(ops in vec(op_strategy(), 1..80)) {
        let mem = boot();
        let zone = mem.zone(0, ZoneKind::Normal.idx()).unwrap();
        let mut held: Vec<(usize, usize)> = Vec::new();
        let mut out = 0usize;

        for &op in &ops {
            match op {
                Op::Alloc { order, mobility, cold } => {
                    let req = AllocRequest::new(order, flags_for(mobility, cold));
                    if let Some(pfn) = mem.alloc_pages(&req) {
                        held.push((pfn, order));
                        out += 1 << order;
                    }
                }
                Op::FreeOldest if !held.is_empty() => {
                    let (pfn, order) = held.remove(0);
                    mem.free_pages(0, pfn, order).unwrap();
                    out -= 1 << order;
                }
                Op::FreeNewest => {
                    if let Some((pfn, order)) = held.pop() {
                        mem.free_pages(0, pfn, order).unwrap();
                        out -= 1 << order;
                    }
                }
                Op::Drain => mem.drain_all(),
                _ => {}
            }
            prop_assert_eq!(
                zone.free_pages() + zone.pcp_pages() + out,
                ZONE_PAGES
            );
        }
    }

    /// Structure law: at any quiescent point, free blocks are aligned to
    /// their order and no two buddies are both free - coalescing would
    /// already have merged them.
    #[test]
    fn no_mergeable_buddies_left_behind(ops in vec(op_strategy(), 1..80)) {
        let mem = boot();
        let _held = apply(&mem, &ops);
        mem.drain_all();

        let blocks = mem.free_blocks(0, ZoneKind::Normal.idx());
        for &(pfn, order, _) in &blocks {
            prop_assert_eq!(pfn & ((1 << order) - 1), 0, "misaligned block");
        }
        for &(pfn, order, _) in &blocks {
            let buddy = pfn ^ (1 << order);
            prop_assert!(
                !blocks.iter().any(|&(p, o, _)| p == buddy && o == order),
                "buddies {:#x}/{:#x} both free at order {}", pfn, buddy, order
            );
        }
    }

    /// Drain law: a second drain changes nothing a first did not.
    #[test]
    fn drain_is_idempotent(ops in vec(op_strategy(), 1..60)) {
        let mem = boot();
        let _held = apply(&mem, &ops);
        let zone = mem.zone(0, ZoneKind::Normal.idx()).unwrap();

        mem.drain_all();
        let once: (usize, usize, Vec<usize>) = (
            zone.free_pages(),
            zone.pcp_pages(),
            (0..pfa_core::MAX_ORDER).map(|o| zone.nr_free(o)).collect(),
        );
        mem.drain_all();
        let twice = (
            zone.free_pages(),
            zone.pcp_pages(),
            (0..pfa_core::MAX_ORDER).map(|o| zone.nr_free(o)).collect(),
        );
        prop_assert_eq!(once, twice);
    }
}

//! Remap/move engine: grows or shrinks a mapping in place when possible,
//! and relocates it to a fresh address when the caller allows a move and
//! in-place growth does not fit.
//!
//! A move never copies page content: `Present`/`Swapped` PTEs carry their
//! `Mpn`/`SlotId` straight across to the new linear address. A TLB entry
//! is cheap to invalidate and rebuild; a physical frame is not, so the
//! move path only ever touches page-table state.

use alloc::vec::Vec;

use crate::collab::{MemScheduler, TlbShootdown};
use crate::error::{MmError, MmResult};
use crate::pte::{Pte, PteState};
use crate::ptable::CanonicalTree;
use crate::region::RegionMap;
use crate::swap::SwapEngine;
use crate::types::{align_up, lpn_of, pages_for, RemapFlags, VirtAddr};

#[allow(clippy::too_many_arguments)]
pub fn remap(
    regions: &mut RegionMap,
    tree: &mut CanonicalTree,
    swap: &mut SwapEngine,
    sched: &dyn MemScheduler,
    tlb: &dyn TlbShootdown,
    cartel_id: u64,
    world: u64,
    old_addr: VirtAddr,
    old_length: u64,
    new_length: u64,
    flags: RemapFlags,
) -> MmResult<VirtAddr> {
    let region_id = regions.find_covering(old_addr).ok_or(MmError::InvalidAddress)?;
    {
        let region = regions.get(region_id).unwrap();
        if region.start != old_addr || region.length != align_up(old_length) {
            return Err(MmError::BadParam);
        }
    }

    if new_length <= old_length {
        let new_end = old_addr + align_up(new_length);
        let old_end = old_addr + align_up(old_length);
        if new_end < old_end {
            let mut acc = Vec::new();
            regions.clear_range(tree, swap, lpn_of(new_end), pages_for(old_end - new_end), false, &mut acc)?;
        }
        regions.get_mut(region_id).unwrap().length = align_up(new_length);
        return Ok(old_addr);
    }

    let prot = regions.get(region_id).unwrap().prot;
    let pinned = regions.get(region_id).unwrap().pinned;
    if regions.try_extending(tree, sched, world, region_id, new_length, prot, pinned)? {
        return Ok(old_addr);
    }

    if !flags.contains(RemapFlags::MAY_MOVE) {
        return Err(MmError::NoMemory);
    }
    move_region(regions, tree, swap, sched, tlb, cartel_id, world, region_id, new_length)
}

#[allow(clippy::too_many_arguments)]
fn move_region(
    regions: &mut RegionMap,
    tree: &mut CanonicalTree,
    swap: &mut SwapEngine,
    sched: &dyn MemScheduler,
    tlb: &dyn TlbShootdown,
    cartel_id: u64,
    world: u64,
    region_id: crate::types::RegionId,
    new_length: u64,
) -> MmResult<VirtAddr> {
    let (old_start, old_pages, prot, backing, backing_handle, backing_offset, pinned, exec_flag) = {
        let r = regions.get(region_id).unwrap();
        (r.start, r.n_pages(), r.prot, r.backing, r.backing_handle, r.backing_offset, r.pinned, false)
    };

    // Snapshot the old PTEs before allocating the new region (which may
    // itself touch the same directory/table storage only if addresses
    // collide, which allocate_range's emptiness check already rules out).
    let mut snapshot: Vec<Pte> = Vec::with_capacity(old_pages as usize);
    for off in 0..old_pages {
        let pte = tree.pte(lpn_of(old_start) + off);
        if let PteState::Swapping { .. } = pte.decode() {
            return Err(MmError::Busy);
        }
        snapshot.push(pte);
    }

    let mut new_addr: VirtAddr = 0;
    let new_id = regions.allocate_range(
        tree, sched, world, &mut new_addr, false, new_length, prot, backing, backing_handle,
        backing_offset, pinned, exec_flag,
    )?;

    for (off, old_pte) in snapshot.iter().enumerate() {
        let new_lpn = lpn_of(new_addr) + off as u64;
        let slot = tree.pte_mut(new_lpn)?;
        match old_pte.decode() {
            PteState::Present { mpn, prot, pinned, .. } => {
                *slot = Pte::set_present(mpn, prot, pinned, false);
            }
            PteState::Swapped { slot: swap_slot, prot } => {
                *slot = Pte::set_swapped(swap_slot, prot);
            }
            PteState::InUse { .. } | PteState::Empty => {
                // Leave the freshly marked InUse entry as-is: nothing was
                // ever faulted in on the old side.
            }
            PteState::Swapping { .. } => unreachable!("rejected above"),
        }
    }

    let mut acc = Vec::new();
    regions.clear_range(tree, swap, lpn_of(old_start), old_pages, pinned, &mut acc)?;
    regions.destroy(region_id);
    tlb.flush_cartel(cartel_id);
    let _ = new_id;
    Ok(new_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::tests_support::mock_scheduler;
    use crate::types::{BackingKind, Prot, DATA_MMAP_BASE, PAGE_SIZE};
    use core::cell::RefCell;

    struct MockTlb {
        flushed: RefCell<u32>,
    }
    impl TlbShootdown for MockTlb {
        fn flush_cartel(&self, _cartel_id: u64) {
            *self.flushed.borrow_mut() += 1;
        }
        fn invalidate_page(&self, _cartel_id: u64, _va: u64) {}
    }

    #[test]
    fn shrink_in_place_truncates_region() {
        let mut regions = RegionMap::new();
        let mut tree = CanonicalTree::new();
        let mut swap = SwapEngine::new();
        let sched = mock_scheduler();
        let tlb = MockTlb { flushed: RefCell::new(0) };
        let mut addr = DATA_MMAP_BASE;
        regions
            .allocate_range(
                &mut tree, &sched, 1, &mut addr, false, 2 * PAGE_SIZE as u64, Prot::READ,
                BackingKind::Anonymous, None, 0, false, false,
            )
            .unwrap();
        let new_addr = remap(
            &mut regions, &mut tree, &mut swap, &sched, &tlb, 1, 1, addr, 2 * PAGE_SIZE as u64,
            PAGE_SIZE as u64, RemapFlags::empty(),
        )
        .unwrap();
        assert_eq!(new_addr, addr);
        let id = regions.find_covering(addr).unwrap();
        assert_eq!(regions.get(id).unwrap().length, PAGE_SIZE as u64);
    }

    #[test]
    fn grow_without_may_move_fails_when_blocked() {
        let mut regions = RegionMap::new();
        let mut tree = CanonicalTree::new();
        let mut swap = SwapEngine::new();
        let sched = mock_scheduler();
        let tlb = MockTlb { flushed: RefCell::new(0) };
        let mut addr = DATA_MMAP_BASE;
        regions
            .allocate_range(
                &mut tree, &sched, 1, &mut addr, false, PAGE_SIZE as u64, Prot::READ,
                BackingKind::Anonymous, None, 0, false, false,
            )
            .unwrap();
        let mut addr2 = addr + PAGE_SIZE as u64;
        regions
            .allocate_range(
                &mut tree, &sched, 1, &mut addr2, false, PAGE_SIZE as u64, Prot::READ,
                BackingKind::Anonymous, None, 0, false, false,
            )
            .unwrap();
        let err = remap(
            &mut regions, &mut tree, &mut swap, &sched, &tlb, 1, 1, addr, PAGE_SIZE as u64,
            2 * PAGE_SIZE as u64, RemapFlags::empty(),
        )
        .unwrap_err();
        assert_eq!(err, MmError::NoMemory);
    }

    #[test]
    fn move_relocates_present_page_without_copy() {
        let mut regions = RegionMap::new();
        let mut tree = CanonicalTree::new();
        let mut swap = SwapEngine::new();
        let sched = mock_scheduler();
        let tlb = MockTlb { flushed: RefCell::new(0) };
        let mut addr = DATA_MMAP_BASE;
        regions
            .allocate_range(
                &mut tree, &sched, 1, &mut addr, false, PAGE_SIZE as u64, Prot::READ,
                BackingKind::Anonymous, None, 0, false, false,
            )
            .unwrap();
        *tree.pte_mut(lpn_of(addr)).unwrap() = Pte::set_present(77, Prot::READ, false, false);
        let mut blocker_addr = addr + PAGE_SIZE as u64;
        regions
            .allocate_range(
                &mut tree, &sched, 1, &mut blocker_addr, false, PAGE_SIZE as u64, Prot::READ,
                BackingKind::Anonymous, None, 0, false, false,
            )
            .unwrap();
        let new_addr = remap(
            &mut regions, &mut tree, &mut swap, &sched, &tlb, 1, 1, addr, PAGE_SIZE as u64,
            2 * PAGE_SIZE as u64, RemapFlags::MAY_MOVE,
        )
        .unwrap();
        assert_ne!(new_addr, addr);
        assert!(tree.pte(lpn_of(new_addr)).is_present());
        assert!(tree.pte(lpn_of(addr)).is_empty());
        assert_eq!(*tlb.flushed.borrow(), 1);
    }
}

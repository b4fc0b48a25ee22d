//! Region map: an arena of region descriptors plus an ordered index over
//! their start addresses.
//!
//! Regions live in a stable-id arena and `InUse` PTEs carry the id, not a
//! pointer, so a region and the PTEs referencing it never form a
//! raw-pointer cycle. The map itself is a sorted `Vec` with overlap-aware
//! split/extend/admission operations over it.

use alloc::vec::Vec;

use crate::collab::MemScheduler;
use crate::error::{MmError, MmResult};
use crate::pte::{Pte, PteState};
use crate::ptable::CanonicalTree;
use crate::swap::SwapEngine;
use crate::types::{
    align_up, is_page_aligned, lpn_of, pages_for, BackingKind, Lpn, Prot, RegionId, UsageCategory,
    VirtAddr, CODE_MMAP_BASE, DATA_MMAP_BASE, MMAP_BAND_END, PAGE_SIZE,
};

#[derive(Debug, Clone)]
pub struct Region {
    pub start: VirtAddr,
    pub length: u64,
    pub prot: Prot,
    pub backing: BackingKind,
    pub backing_handle: Option<u64>,
    pub backing_offset: u64,
    pub pinned: bool,
    pub reserved_pages: u64,
    pub refcount: u32,
}

impl Region {
    pub fn end(&self) -> VirtAddr {
        self.start + self.length
    }

    pub fn n_pages(&self) -> u64 {
        pages_for(self.length)
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.start < end && start < self.end()
    }

    pub fn category(&self) -> UsageCategory {
        self.backing.usage_category()
    }
}

/// A PTE snapshot taken by [`RegionMap::clear_range`] so the caller can
/// flush the TLB and free any backing resources after the range is cleared,
/// rather than doing it page-by-page while still walking the tree.
#[derive(Debug, Clone, Copy)]
pub struct ClearedPte {
    pub lpn: Lpn,
    pub prev: PteState,
}

pub struct RegionMap {
    arena: Vec<Option<Region>>,
    /// Region ids, kept sorted by `arena[id].start`. Invariant 1: always
    /// sorted, non-overlapping, every start page-aligned.
    order: Vec<RegionId>,
}

impl RegionMap {
    pub fn new() -> Self {
        RegionMap { arena: Vec::new(), order: Vec::new() }
    }

    pub fn get(&self, id: RegionId) -> Option<&Region> {
        self.arena.get(id.0 as usize).and_then(|r| r.as_ref())
    }

    pub fn get_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.arena.get_mut(id.0 as usize).and_then(|r| r.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegionId, &Region)> {
        self.order.iter().filter_map(move |id| self.get(*id).map(|r| (*id, r)))
    }

    fn insert_order(&mut self, id: RegionId) {
        let start = self.get(id).unwrap().start;
        let pos = self.order.iter().position(|&o| self.get(o).unwrap().start > start).unwrap_or(self.order.len());
        self.order.insert(pos, id);
    }

    fn alloc_slot(&mut self, region: Region) -> RegionId {
        if let Some(idx) = self.arena.iter().position(|r| r.is_none()) {
            self.arena[idx] = Some(region);
            RegionId(idx as u32)
        } else {
            self.arena.push(Some(region));
            RegionId((self.arena.len() - 1) as u32)
        }
    }

    fn insert(&mut self, region: Region) -> RegionId {
        let id = self.alloc_slot(region);
        self.insert_order(id);
        id
    }

    fn remove(&mut self, id: RegionId) -> Option<Region> {
        self.order.retain(|&o| o != id);
        self.arena.get_mut(id.0 as usize).and_then(|slot| slot.take())
    }

    /// Region whose `[start, end)` contains `addr`, if any.
    pub fn find_covering(&self, addr: VirtAddr) -> Option<RegionId> {
        // order is sorted by start; linear scan is fine at this scale
        // (region counts per cartel are small relative to page counts).
        self.order.iter().copied().find(|&id| self.get(id).unwrap().contains(addr))
    }

    fn find_overlap(&self, start: VirtAddr, end: VirtAddr) -> Option<RegionId> {
        self.order.iter().copied().find(|&id| self.get(id).unwrap().overlaps(start, end))
    }

    // ---- 4.3 operations -------------------------------------------------

    /// `Ok` if every PTE in `[start_lpn, start_lpn+n_pages)` is Empty.
    pub fn check_empty(&self, tree: &CanonicalTree, start_lpn: Lpn, n_pages: u64) -> MmResult<()> {
        for off in 0..n_pages {
            if !tree.pte(start_lpn + off).is_empty() {
                return Err(MmError::AlreadyExists);
            }
        }
        Ok(())
    }

    /// Sets each Empty PTE in range to `InUse(region, prot)`. If
    /// `mm_info_only`, PTEs already Present are left untouched (used by
    /// `split` to retag PTEs belonging to one half without disturbing
    /// already-faulted-in pages).
    pub fn mark_in_use(
        &self,
        tree: &mut CanonicalTree,
        start_lpn: Lpn,
        n_pages: u64,
        prot: Prot,
        region: RegionId,
        mm_info_only: bool,
    ) -> MmResult<()> {
        tree.for_range(start_lpn, n_pages, |_lpn, pte| {
            match pte.decode() {
                PteState::Empty => {
                    *pte = Pte::set_in_use(prot, region);
                }
                PteState::Present { .. } if mm_info_only => {}
                PteState::InUse { .. } if mm_info_only => {
                    *pte = Pte::set_in_use(prot, region);
                }
                _ => {}
            }
            Ok(())
        })
    }

    /// Clears every PTE in range, appending a snapshot of anything that was
    /// Present/Swapping/Swapped to `pte_accumulator` for the caller to flush
    /// and free. Cancels any in-flight swap for a page in this range via
    /// `swap`. `is_region_pinned` lets the caller account pinned-page
    /// releases without re-deriving it per page.
    pub fn clear_range(
        &self,
        tree: &mut CanonicalTree,
        swap: &mut SwapEngine,
        start_lpn: Lpn,
        n_pages: u64,
        _is_region_pinned: bool,
        pte_accumulator: &mut Vec<ClearedPte>,
    ) -> MmResult<()> {
        tree.for_range(start_lpn, n_pages, |lpn, pte| {
            let prev = pte.decode();
            match prev {
                PteState::Present { .. } => {
                    pte_accumulator.push(ClearedPte { lpn, prev });
                    pte.clear();
                }
                PteState::Swapping { .. } => {
                    swap.cancel(lpn);
                    pte_accumulator.push(ClearedPte { lpn, prev });
                    pte.clear();
                }
                PteState::Swapped { .. } => {
                    pte_accumulator.push(ClearedPte { lpn, prev });
                    pte.clear();
                }
                PteState::InUse { .. } | PteState::Empty => {
                    pte.clear();
                }
            }
            Ok(())
        })?;
        for off in 0..n_pages {
            tree.gc_table(start_lpn + off);
        }
        Ok(())
    }

    fn admit_growth(
        sched: &dyn MemScheduler,
        world: u64,
        category: UsageCategory,
        delta_pages: u64,
    ) -> MmResult<()> {
        if delta_pages == 0 {
            return Ok(());
        }
        if sched.admit(world, category, delta_pages as i64) {
            Ok(())
        } else {
            Err(MmError::LimitExceeded)
        }
    }

    /// Either verifies a caller-chosen address range is empty (respecting
    /// `overwrite`), or first-fit scans the code/data mmap band.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate_range(
        &mut self,
        tree: &mut CanonicalTree,
        sched: &dyn MemScheduler,
        world: u64,
        addr_in_out: &mut VirtAddr,
        overwrite: bool,
        length: u64,
        prot: Prot,
        backing: BackingKind,
        backing_handle: Option<u64>,
        backing_offset: u64,
        pinned: bool,
        exec_flag: bool,
    ) -> MmResult<RegionId> {
        if length == 0 {
            return Err(MmError::BadParam);
        }
        let n_pages = pages_for(length);
        let category = backing.usage_category();
        Self::admit_growth(sched, world, category, n_pages)?;

        let start = if *addr_in_out != 0 {
            let start = *addr_in_out;
            if !is_page_aligned(start) {
                sched.admit(world, category, -(n_pages as i64));
                return Err(MmError::BadParam);
            }
            let end = start + align_up(length);
            if !overwrite && self.find_overlap(start, end).is_some() {
                sched.admit(world, category, -(n_pages as i64));
                return Err(MmError::AlreadyExists);
            }
            start
        } else {
            let band_base = if exec_flag { CODE_MMAP_BASE } else { DATA_MMAP_BASE };
            match self.first_fit(band_base, MMAP_BAND_END, align_up(length)) {
                Some(addr) => addr,
                None => {
                    sched.admit(world, category, -(n_pages as i64));
                    return Err(MmError::NoMemory);
                }
            }
        };

        let region = Region {
            start,
            length: align_up(length),
            prot,
            backing,
            backing_handle,
            backing_offset,
            pinned,
            reserved_pages: if pinned { n_pages } else { 0 },
            refcount: 0,
        };
        let id = self.insert(region);
        let start_lpn = lpn_of(start);
        if let Err(e) = self.mark_in_use(tree, start_lpn, n_pages, prot, id, false) {
            self.remove(id);
            sched.admit(world, category, -(n_pages as i64));
            return Err(e);
        }
        *addr_in_out = start;
        Ok(id)
    }

    fn first_fit(&self, band_base: VirtAddr, band_end: VirtAddr, length: u64) -> Option<VirtAddr> {
        let mut cursor = band_base;
        for (_, region) in self.iter() {
            if region.start < band_base || region.start >= band_end {
                continue;
            }
            if region.start >= cursor && region.start - cursor >= length {
                return Some(cursor);
            }
            cursor = cursor.max(region.end());
        }
        if band_end - cursor >= length {
            Some(cursor)
        } else {
            None
        }
    }

    /// Shrinks `region` to end at `split_addr`, creating a new region for
    /// the right half with identical attributes (both halves now reference
    /// the same `backing_handle`; this map does not itself track a backing
    /// object's open-file refcount — see `DESIGN.md`'s backing-lifecycle
    /// note for the gap and what would be needed to close it).
    pub fn split(&mut self, region: RegionId, split_addr: VirtAddr) -> MmResult<RegionId> {
        let (start, end, prot, backing, backing_handle, backing_offset, pinned) = {
            let r = self.get(region).ok_or(MmError::InvalidAddress)?;
            if !r.contains(split_addr) || split_addr == r.start {
                return Err(MmError::BadParam);
            }
            (r.start, r.end(), r.prot, r.backing, r.backing_handle, r.backing_offset, r.pinned)
        };
        let right_offset = if backing.usage_category() == UsageCategory::Shared {
            backing_offset + (split_addr - start)
        } else {
            backing_offset
        };
        let right = Region {
            start: split_addr,
            length: end - split_addr,
            prot,
            backing,
            backing_handle,
            backing_offset: right_offset,
            pinned,
            reserved_pages: 0,
            refcount: 0,
        };
        let right_id = self.insert(right);
        let left = self.get_mut(region).unwrap();
        left.length = split_addr - start;
        Ok(right_id)
    }

    /// If `region` is Anonymous with matching protection/pinning and no
    /// reservation, and the new end would not collide with the next
    /// region, extends it in place and marks the new PTEs in use.
    #[allow(clippy::too_many_arguments)]
    pub fn try_extending(
        &mut self,
        tree: &mut CanonicalTree,
        sched: &dyn MemScheduler,
        world: u64,
        region: RegionId,
        new_length: u64,
        prot: Prot,
        pinned: bool,
    ) -> MmResult<bool> {
        let (start, old_length, eligible) = {
            let r = self.get(region).ok_or(MmError::InvalidAddress)?;
            let eligible = r.backing == BackingKind::Anonymous
                && r.prot == prot
                && r.pinned == pinned
                && r.reserved_pages == 0;
            (r.start, r.length, eligible)
        };
        if !eligible || new_length <= old_length {
            return Ok(false);
        }
        let grown = align_up(new_length) - align_up(old_length);
        let new_end = start + align_up(new_length);
        if let Some(next) = self.order.iter().copied().find(|&id| self.get(id).unwrap().start > start) {
            if self.get(next).unwrap().start < new_end {
                return Ok(false);
            }
        }
        let n_new_pages = grown / PAGE_SIZE as u64;
        Self::admit_growth(sched, world, UsageCategory::Anonymous, n_new_pages)?;
        let old_pages = pages_for(old_length);
        if let Err(e) = self.mark_in_use(tree, lpn_of(start) + old_pages, n_new_pages, prot, region, false) {
            sched.admit(world, UsageCategory::Anonymous, -(n_new_pages as i64));
            return Err(e);
        }
        self.get_mut(region).unwrap().length = align_up(new_length);
        Ok(true)
    }

    /// Searches for an anonymous region ending exactly where a new
    /// `addr_in_out == 0` allocation of `length` could be appended, and
    /// extends it instead of creating a new region.
    pub fn extend_existing(
        &mut self,
        tree: &mut CanonicalTree,
        sched: &dyn MemScheduler,
        world: u64,
        length: u64,
        prot: Prot,
        pinned: bool,
        exec_flag: bool,
    ) -> MmResult<Option<(RegionId, VirtAddr)>> {
        let band_base = if exec_flag { CODE_MMAP_BASE } else { DATA_MMAP_BASE };
        let band_end = MMAP_BAND_END;
        let candidate = self
            .iter()
            .filter(|(_, r)| {
                r.start >= band_base
                    && r.start < band_end
                    && r.backing == BackingKind::Anonymous
                    && r.prot == prot
                    && r.pinned == pinned
                    && r.reserved_pages == 0
            })
            .map(|(id, r)| (id, r.length))
            .next();
        let Some((id, old_length)) = candidate else {
            return Ok(None);
        };
        let new_length = old_length + align_up(length);
        if self.try_extending(tree, sched, world, id, new_length, prot, pinned)? {
            let addr = self.get(id).unwrap().start;
            Ok(Some((id, addr)))
        } else {
            Ok(None)
        }
    }

    pub fn destroy(&mut self, id: RegionId) -> Option<Region> {
        self.remove(id)
    }
}

impl Default for RegionMap {
    fn default() -> Self {
        Self::new()
    }
}

//! Data-segment / `brk` management.
//!
//! A cartel's data segment is just another anonymous region, but one the
//! rest of the ABI expects to find at a fixed, remembered address and to be
//! able to grow or shrink in place by moving only its end. This module is
//! the thin policy layer over [`crate::region::RegionMap`] that gives the
//! segment that fixed identity.

use alloc::vec::Vec;

use crate::collab::MemScheduler;
use crate::error::{MmError, MmResult};
use crate::ptable::CanonicalTree;
use crate::region::RegionMap;
use crate::swap::SwapEngine;
use crate::types::{align_up, lpn_of, pages_for, BackingKind, Prot, RegionId, VirtAddr};

/// Tracks the data segment's region and its ABI-visible start/end. `start`
/// never moves once set; `end` is the current `brk`.
#[derive(Debug, Clone, Copy)]
pub struct DataSegment {
    region: Option<RegionId>,
    start: VirtAddr,
    end: VirtAddr,
}

impl DataSegment {
    pub fn new() -> Self {
        DataSegment { region: None, start: 0, end: 0 }
    }

    pub fn get_data_start(&self) -> VirtAddr {
        self.start
    }

    pub fn get_data_end(&self) -> VirtAddr {
        self.end
    }

    /// Fixes the segment's start address. Only valid before the segment has
    /// been grown; called once, early in cartel setup.
    pub fn set_data_start(&mut self, addr: VirtAddr) -> MmResult<()> {
        if self.region.is_some() {
            return Err(MmError::Busy);
        }
        self.start = addr;
        self.end = addr;
        Ok(())
    }

    /// Grows or shrinks the segment so `get_data_end()` becomes `new_end`.
    /// Growing reserves and maps new anonymous pages (demand-zero, faulted
    /// in lazily like any other anonymous region); shrinking clears and
    /// frees the pages beyond the new end.
    pub fn set_data_end(
        &mut self,
        map: &mut RegionMap,
        tree: &mut CanonicalTree,
        swap: &mut SwapEngine,
        sched: &dyn MemScheduler,
        world: u64,
        new_end: VirtAddr,
    ) -> MmResult<()> {
        if new_end < self.start {
            return Err(MmError::BadParam);
        }
        if new_end == self.end {
            return Ok(());
        }
        if new_end > self.end {
            self.grow(map, tree, sched, world, new_end)
        } else {
            self.shrink(map, tree, swap, new_end)
        }
    }

    fn grow(
        &mut self,
        map: &mut RegionMap,
        tree: &mut CanonicalTree,
        sched: &dyn MemScheduler,
        world: u64,
        new_end: VirtAddr,
    ) -> MmResult<()> {
        match self.region {
            None => {
                let mut addr = self.start;
                let id = map.allocate_range(
                    tree,
                    sched,
                    world,
                    &mut addr,
                    false,
                    new_end - self.start,
                    Prot::READ | Prot::WRITE,
                    BackingKind::Anonymous,
                    None,
                    0,
                    false,
                    false,
                )?;
                self.region = Some(id);
            }
            Some(id) => {
                let length = new_end - self.start;
                let grew = map.try_extending(
                    tree,
                    sched,
                    world,
                    id,
                    length,
                    Prot::READ | Prot::WRITE,
                    false,
                )?;
                if !grew {
                    return Err(MmError::LimitExceeded);
                }
            }
        }
        self.end = new_end;
        Ok(())
    }

    fn shrink(
        &mut self,
        map: &mut RegionMap,
        tree: &mut CanonicalTree,
        swap: &mut SwapEngine,
        new_end: VirtAddr,
    ) -> MmResult<()> {
        let id = self.region.ok_or(MmError::InvalidAddress)?;
        let cut_from = align_up(new_end);
        let old_end = map.get(id).ok_or(MmError::InvalidAddress)?.end();
        if cut_from < old_end {
            let mut acc = Vec::new();
            map.clear_range(tree, swap, lpn_of(cut_from), pages_for(old_end - cut_from), false, &mut acc)?;
            map.get_mut(id).unwrap().length = cut_from - self.start;
        }
        self.end = new_end;
        Ok(())
    }
}

impl Default for DataSegment {
    fn default() -> Self {
        Self::new()
    }
}

//! `CartelMemState`: the per-cartel memory manager instance and its
//! syscall-shaped surface (`map`, `unmap`, `protect`, `remap`, ...).
//!
//! Each cartel owns its own region map, page-table tree, and swap engine
//! rather than sharing one kernel-wide address space, so these are
//! inherent methods on one instance instead of free functions over a
//! global. Every method here assumes the caller already holds this
//! cartel's lock; `CartelMemState` itself holds no lock of its own — the
//! host's syscall dispatcher is responsible for taking it before calling
//! in.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::collab::{BackingStore, FrameSource, GuestPhys, MemScheduler, PageShare, SwapDevice, TlbShootdown};
use crate::dump::{self, MmapDataPage, MmapHeader};
use crate::error::{MmError, MmResult};
use crate::fault::{self, FaultContext, FaultOutcome};
use crate::protect;
use crate::pshare;
use crate::ptable::{CanonicalTree, PrivateRoot};
use crate::pte::PteState;
use crate::region::{ClearedPte, RegionMap};
use crate::remap;
use crate::segment::DataSegment;
use crate::swap::{SwapEngine, SwapStats};
use crate::log_info;
use crate::types::{align_up, lpn_of, BackingKind, MapFlags, Prot, RegionId, RemapFlags, VirtAddr, PAGE_SIZE};

pub struct CartelMemState {
    pub id: u64,
    regions: RegionMap,
    tree: CanonicalTree,
    swap: SwapEngine,
    data_segment: DataSegment,
    private_roots: BTreeMap<u64, PrivateRoot>,
}

impl CartelMemState {
    pub fn new(id: u64) -> Self {
        CartelMemState {
            id,
            regions: RegionMap::new(),
            tree: CanonicalTree::new(),
            swap: SwapEngine::new(),
            data_segment: DataSegment::new(),
            private_roots: BTreeMap::new(),
        }
    }

    pub fn swap_stats(&self) -> SwapStats {
        self.swap.stats()
    }

    fn backing_kind_for(flags: MapFlags) -> BackingKind {
        if flags.contains(MapFlags::ANON) {
            BackingKind::Anonymous
        } else {
            BackingKind::FileBacked
        }
    }

    /// `mmap`: establishes a new mapping. `addr` is a hint (or a fixed
    /// address if `flags` contains `FIXED`); `length` in bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn map(
        &mut self,
        sched: &dyn MemScheduler,
        world: u64,
        addr_hint: VirtAddr,
        length: u64,
        prot: Prot,
        flags: MapFlags,
        backing_handle: Option<u64>,
        backing_offset: u64,
        exec_flag: bool,
    ) -> MmResult<VirtAddr> {
        let backing = Self::backing_kind_for(flags);
        if backing == BackingKind::FileBacked && backing_handle.is_none() {
            return Err(MmError::BadParam);
        }
        let mut addr = addr_hint;
        let overwrite = flags.contains(MapFlags::FIXED);
        if !flags.contains(MapFlags::FIXED) {
            addr = 0;
        }
        self.regions.allocate_range(
            &mut self.tree,
            sched,
            world,
            &mut addr,
            overwrite,
            length,
            prot,
            backing,
            backing_handle,
            backing_offset,
            flags.contains(MapFlags::LOCKED),
            exec_flag,
        )?;
        log_info!("cartel {}: map {:#x}..{:#x}", self.id, addr, addr + align_up(length));
        Ok(addr)
    }

    /// Creates a guest-physical-backed mapping, used to expose a VMM
    /// leader's guest physical memory into this cartel's address space.
    pub fn setup_phys_mem_map(
        &mut self,
        sched: &dyn MemScheduler,
        world: u64,
        addr: VirtAddr,
        length: u64,
        vmm_leader: u64,
        guest_phys_offset: u64,
    ) -> MmResult<()> {
        let mut a = addr;
        self.regions.allocate_range(
            &mut self.tree,
            sched,
            world,
            &mut a,
            true,
            length,
            Prot::READ | Prot::WRITE,
            BackingKind::GuestPhysical,
            Some(vmm_leader),
            guest_phys_offset,
            false,
            false,
        )?;
        Ok(())
    }

    /// Creates a memory-test scratch mapping (uncounted against quota).
    pub fn memtest_map(&mut self, sched: &dyn MemScheduler, world: u64, addr: VirtAddr, length: u64) -> MmResult<()> {
        let mut a = addr;
        self.regions.allocate_range(
            &mut self.tree,
            sched,
            world,
            &mut a,
            true,
            length,
            Prot::READ | Prot::WRITE,
            BackingKind::MemTest,
            None,
            0,
            false,
            false,
        )?;
        Ok(())
    }

    /// `munmap`. Splits partial region boundaries, clears every PTE in
    /// range, releases shared/file/swap resources the cleared PTEs held,
    /// and frees the now-empty region slice(s).
    pub fn unmap(
        &mut self,
        sched: &dyn MemScheduler,
        world: u64,
        tlb: &dyn TlbShootdown,
        frames: &dyn FrameSource,
        share: &dyn PageShare,
        swap_dev: &dyn SwapDevice,
        addr: VirtAddr,
        length: u64,
    ) -> MmResult<()> {
        if length == 0 || addr % PAGE_SIZE as u64 != 0 {
            return Err(MmError::BadParam);
        }
        let end = addr + align_up(length);
        self.split_boundaries(addr, end)?;

        let affected: Vec<RegionId> =
            self.regions.iter().filter(|(_, r)| r.start >= addr && r.end() <= end).map(|(id, _)| id).collect();

        for id in affected {
            let (start, n_pages, category, pinned) = {
                let r = self.regions.get(id).unwrap();
                (r.start, r.n_pages(), r.category(), r.pinned)
            };
            let mut acc: Vec<ClearedPte> = Vec::new();
            self.regions.clear_range(&mut self.tree, &mut self.swap, lpn_of(start), n_pages, pinned, &mut acc)?;
            self.release_cleared(&acc, frames, share, swap_dev);
            sched.account(world, category, -(n_pages as i64));
            self.regions.destroy(id);
            tlb.invalidate_page(self.id, start);
        }
        tlb.flush_cartel(self.id);
        Ok(())
    }

    fn release_cleared(
        &self,
        acc: &[ClearedPte],
        frames: &dyn FrameSource,
        share: &dyn PageShare,
        swap_dev: &dyn SwapDevice,
    ) {
        for cleared in acc {
            match cleared.prev {
                PteState::Present { mpn, shared: true, .. } => pshare::drop_share_ref(frames, share, mpn),
                PteState::Present { mpn, shared: false, pinned, .. } => {
                    let _ = pinned;
                    frames.free_user_frame(mpn);
                }
                PteState::Swapped { slot, .. } => swap_dev.free_slot(slot),
                PteState::Swapping { mpn: Some(mpn), .. } => frames.free_user_frame(mpn),
                PteState::Swapping { mpn: None, .. } | PteState::InUse { .. } | PteState::Empty => {}
            }
        }
    }

    /// Splits any region straddling `addr` or `end` so every region either
    /// lies fully inside or fully outside `[addr, end)`.
    fn split_boundaries(&mut self, addr: VirtAddr, end: VirtAddr) -> MmResult<()> {
        if let Some(id) = self.regions.find_covering(addr) {
            let start = self.regions.get(id).unwrap().start;
            if start != addr {
                self.regions.split(id, addr)?;
            }
        }
        if let Some(id) = self.regions.find_covering(end.saturating_sub(1)) {
            let region_end = self.regions.get(id).unwrap().end();
            if region_end != end && end > self.regions.get(id).unwrap().start {
                self.regions.split(id, end)?;
            }
        }
        Ok(())
    }

    /// `mprotect`. Verifies every affected region against the protection
    /// manager's rules before mutating any of them, so a rejection (a
    /// `NONE` downgrade over a still-present page, or `WRITE` on a
    /// read-only file backing) leaves the whole range untouched rather
    /// than partially rewritten.
    pub fn protect(
        &mut self,
        tlb: &dyn TlbShootdown,
        backing: &dyn BackingStore,
        addr: VirtAddr,
        length: u64,
        new_prot: Prot,
    ) -> MmResult<()> {
        if length == 0 || addr % PAGE_SIZE as u64 != 0 {
            return Err(MmError::BadParam);
        }
        let end = addr + align_up(length);
        self.split_boundaries(addr, end)?;
        let affected: Vec<RegionId> =
            self.regions.iter().filter(|(_, r)| r.start >= addr && r.end() <= end).map(|(id, _)| id).collect();

        for &id in &affected {
            let r = self.regions.get(id).unwrap();
            protect::verify_protect_range(
                &self.tree, backing, lpn_of(r.start), r.n_pages(), new_prot, r.backing, r.backing_handle,
            )?;
        }

        for id in affected {
            let (start, n_pages) = {
                let r = self.regions.get(id).unwrap();
                (r.start, r.n_pages())
            };
            protect::protect_range(&mut self.tree, tlb, self.id, lpn_of(start), n_pages, new_prot)?;
            self.regions.get_mut(id).unwrap().prot = new_prot;
        }
        Ok(())
    }

    /// `mremap`.
    pub fn remap(
        &mut self,
        sched: &dyn MemScheduler,
        tlb: &dyn TlbShootdown,
        world: u64,
        old_addr: VirtAddr,
        old_length: u64,
        new_length: u64,
        flags: RemapFlags,
    ) -> MmResult<VirtAddr> {
        remap::remap(
            &mut self.regions, &mut self.tree, &mut self.swap, sched, tlb, self.id, world, old_addr,
            old_length, new_length, flags,
        )
    }

    pub fn set_data_start(&mut self, addr: VirtAddr) -> MmResult<()> {
        self.data_segment.set_data_start(addr)
    }

    pub fn get_data_start(&self) -> VirtAddr {
        self.data_segment.get_data_start()
    }

    pub fn get_data_end(&self) -> VirtAddr {
        self.data_segment.get_data_end()
    }

    pub fn set_data_end(&mut self, sched: &dyn MemScheduler, world: u64, new_end: VirtAddr) -> MmResult<()> {
        self.data_segment.set_data_end(&mut self.regions, &mut self.tree, &mut self.swap, sched, world, new_end)
    }

    /// Resolves a fault at `addr` for thread `thread_id`, materializing the
    /// thread's private page-table reference to the covering canonical
    /// table on the way: the first fault against a canonical table pulls
    /// it into the faulting thread's private root, so later faults in the
    /// same table don't need to look it up again.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_map_fault(
        &mut self,
        frames: &dyn FrameSource,
        share: &dyn PageShare,
        swap_dev: &dyn SwapDevice,
        backing: &dyn BackingStore,
        guest: &dyn GuestPhys,
        sched: &dyn MemScheduler,
        tlb: &dyn TlbShootdown,
        thread_id: u64,
        world: u64,
        addr: VirtAddr,
        write_access: bool,
        node_hint: u32,
    ) -> FaultOutcome {
        let lpn = lpn_of(addr);
        if self.tree.canonical_page_table(lpn).is_err() {
            return FaultOutcome::Fatal(MmError::InvalidAddress);
        }
        let mut ctx = FaultContext {
            tree: &mut self.tree,
            regions: &self.regions,
            swap: &mut self.swap,
            frames,
            share,
            swap_device: swap_dev,
            backing,
            guest,
            sched,
            tlb,
            cartel_id: self.id,
            world,
        };
        let outcome = fault::handle_fault(&mut ctx, lpn, write_access, node_hint);
        let root = self.private_roots.entry(thread_id).or_default();
        let mut refcount = 0usize;
        let _ = root.lookup_page_table(&self.tree, lpn, &mut refcount);
        outcome
    }

    /// Resolves the physical frame currently backing `addr`, if any
    /// (`Present` only — demand-paged-out or never-touched pages have none
    /// to report).
    pub fn lookup_mpn(&self, addr: VirtAddr) -> MmResult<u64> {
        match self.tree.pte(lpn_of(addr)).decode() {
            PteState::Present { mpn, .. } => Ok(mpn),
            _ => Err(MmError::InvalidAddress),
        }
    }

    pub fn dump_mmap_headers(&self) -> Vec<MmapHeader> {
        dump::dump_mmap_headers(&self.regions)
    }

    pub fn dump_map_types(&self) -> Vec<BackingKind> {
        dump::dump_map_types(&self.regions)
    }

    pub fn dump_mmap_data(&self, frames: &dyn FrameSource) -> Vec<MmapDataPage> {
        dump::dump_mmap_data(&self.regions, &self.tree, frames)
    }

    /// Releases a thread's private page-table references. Must be called
    /// before the thread's control block is freed; the cartel itself
    /// cannot be torn down while any thread still has references
    /// outstanding.
    pub fn drop_thread(&mut self, thread_id: u64) {
        self.private_roots.remove(&thread_id);
    }

    pub fn outstanding_table_refs(&self) -> usize {
        self.private_roots.values().map(|r| r.refs_held()).sum()
    }
}

//! Fault handler: resolves a user-mode memory access fault against one
//! cartel's region map and PTE state.
//!
//! A fault on an `InUse` PTE demand-pages the backing in; a write fault on
//! a `shared` Present PTE breaks the share; a fault on `Swapped` starts a
//! swap-in and blocks the caller until it completes; a fault racing an
//! in-flight `Swapping` entry just blocks and retries once the racer
//! finishes. Anything else (`Empty`, a protection violation) is a straight
//! error, not a retry loop.
//!
//! Every call here assumes the caller holds the cartel lock and will
//! release it around `sched.block_on`.

use crate::collab::{BackingStore, FrameSource, GuestPhys, MemScheduler, PageShare, SwapDevice, TlbShootdown};
use crate::error::{MmError, MmResult};
use crate::pshare;
use crate::pte::{Pte, PteState};
use crate::ptable::CanonicalTree;
use crate::region::RegionMap;
use crate::swap::SwapEngine;
use crate::types::{BackingKind, Lpn, Prot};

/// What the caller should do after a fault that this module cannot itself
/// resolve as a plain success or a plain retryable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Mapped and ready; re-execute the faulting instruction.
    Resolved,
    /// Nothing to do — the fault raced another thread's resolution of the
    /// same page. Re-execute, which will now either succeed or re-fault.
    AlreadyResolved,
    /// Unrecoverable for this cartel (e.g. backing store I/O failure on a
    /// required read). Anything other than `NoAccess`/`InvalidAddress` here
    /// means the host should tear the cartel down; this module does not do
    /// that itself.
    Fatal(MmError),
}

#[allow(clippy::too_many_arguments)]
pub struct FaultContext<'a> {
    pub tree: &'a mut CanonicalTree,
    pub regions: &'a RegionMap,
    pub swap: &'a mut SwapEngine,
    pub frames: &'a dyn FrameSource,
    pub share: &'a dyn PageShare,
    pub swap_device: &'a dyn SwapDevice,
    pub backing: &'a dyn BackingStore,
    pub guest: &'a dyn GuestPhys,
    pub sched: &'a dyn MemScheduler,
    pub tlb: &'a dyn TlbShootdown,
    pub cartel_id: u64,
    pub world: u64,
}

/// Resolves one fault at `lpn`. `write_access` distinguishes a write fault
/// (needed to decide COW-break vs plain page-in) from a read fault.
pub fn handle_fault(ctx: &mut FaultContext, lpn: Lpn, write_access: bool, node_hint: u32) -> FaultOutcome {
    let addr = lpn << crate::types::PAGE_SHIFT;
    let region_id = match ctx.regions.find_covering(addr) {
        Some(id) => id,
        None => return FaultOutcome::Fatal(MmError::InvalidAddress),
    };
    let region = ctx.regions.get(region_id).expect("find_covering returned a live id");
    let required = if write_access { Prot::WRITE } else { Prot::READ };
    if !region.prot.contains(required) {
        return FaultOutcome::Fatal(MmError::NoAccess);
    }

    loop {
        let pte = ctx.tree.pte(lpn);
        match pte.decode() {
            PteState::InUse { prot, .. } => {
                return match page_in(ctx, region.backing, region, lpn, prot) {
                    Ok(()) => FaultOutcome::Resolved,
                    Err(e) => FaultOutcome::Fatal(e),
                };
            }
            PteState::Present { shared: true, .. } if write_access => {
                return match pshare::break_share(ctx.tree, ctx.frames, ctx.share, lpn, node_hint) {
                    Ok(()) => FaultOutcome::Resolved,
                    Err(e) => FaultOutcome::Fatal(e),
                };
            }
            PteState::Present { hw_write_enabled: false, .. } if write_access => {
                // Re-fault-to-recheck case (e.g. after a protection
                // downgrade/upgrade cycle): just re-arm the bit.
                let mut p = pte;
                p.enable_write();
                if let Ok(slot) = ctx.tree.pte_mut(lpn) {
                    *slot = p;
                }
                return FaultOutcome::Resolved;
            }
            PteState::Present { .. } => return FaultOutcome::AlreadyResolved,
            PteState::Swapped { .. } => {
                let mpn = match ctx.frames.alloc_user_frame(node_hint, 0) {
                    Some(m) => m,
                    None => return FaultOutcome::Fatal(MmError::NoMemory),
                };
                match ctx.swap.swap_in(ctx.tree, ctx.swap_device, lpn, mpn) {
                    Ok(()) => return FaultOutcome::Resolved,
                    Err(e) => {
                        ctx.frames.free_user_frame(mpn);
                        return FaultOutcome::Fatal(e);
                    }
                }
            }
            PteState::Swapping { .. } => {
                let channel = crate::collab::wait_channel(ctx.cartel_id, lpn);
                ctx.sched.block_on(channel);
                // Loop and re-examine; the racing operation has released
                // the lock by the time block_on returns.
                continue;
            }
            PteState::Empty => return FaultOutcome::Fatal(MmError::InvalidAddress),
        }
    }
}

fn page_in(
    ctx: &mut FaultContext,
    backing: BackingKind,
    region: &crate::region::Region,
    lpn: Lpn,
    prot: Prot,
) -> MmResult<()> {
    match backing {
        BackingKind::Anonymous | BackingKind::ThreadData | BackingKind::MemTest => {
            let mpn = ctx.frames.alloc_user_frame(0, 0).ok_or(MmError::NoMemory)?;
            ctx.frames.zero_frame(mpn);
            *ctx.tree.pte_mut(lpn)? = Pte::set_present(mpn, prot, region.pinned, false);
            Ok(())
        }
        BackingKind::FileBacked => {
            let mpn = ctx.frames.alloc_user_frame(0, 0).ok_or(MmError::NoMemory)?;
            ctx.frames.zero_frame(mpn);
            let handle = region.backing_handle.ok_or(MmError::InvalidHandle)?;
            let page_offset = region.backing_offset + (lpn_page_delta(region, lpn) * 4096);
            let buf = ctx.frames.frame_bytes_mut(mpn);
            if let Err(e) = ctx.backing.read_page(handle, page_offset, buf) {
                ctx.frames.free_user_frame(mpn);
                return Err(e);
            }
            let mut pte = Pte::set_present(mpn, prot, region.pinned, false);
            if !ctx.backing.writable(handle) {
                pte.disable_write();
            }
            *ctx.tree.pte_mut(lpn)? = pte;
            Ok(())
        }
        BackingKind::GuestPhysical => {
            let ppn = region.backing_offset / 4096 + lpn_page_delta(region, lpn);
            let vmm_leader = region.backing_handle.ok_or(MmError::InvalidHandle)?;
            let mpn = ctx.guest.resolve(vmm_leader, ppn)?;
            *ctx.tree.pte_mut(lpn)? = Pte::set_present(mpn, prot, region.pinned, false);
            Ok(())
        }
        BackingKind::KernelText => {
            let mpn = region.backing_handle.ok_or(MmError::InvalidHandle)?;
            *ctx.tree.pte_mut(lpn)? = Pte::set_present(mpn, prot, true, false);
            Ok(())
        }
    }
}

fn lpn_page_delta(region: &crate::region::Region, lpn: Lpn) -> u64 {
    let region_start_lpn = region.start >> crate::types::PAGE_SHIFT;
    lpn - region_start_lpn
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionMap;
    use crate::swap::tests_support::{mock_scheduler, mock_swap_device};
    use crate::types::{lpn_of, DATA_MMAP_BASE, PAGE_SIZE};
    use alloc::collections::BTreeMap;
    use core::cell::RefCell;

    struct MockFrames {
        next: RefCell<u64>,
        scratch: RefCell<alloc::vec::Vec<u8>>,
    }
    impl FrameSource for MockFrames {
        fn alloc_user_frame(&self, _n: u32, _c: u32) -> Option<u64> {
            let m = *self.next.borrow();
            *self.next.borrow_mut() += 1;
            Some(m)
        }
        fn free_user_frame(&self, _mpn: u64) {}
        fn zero_frame(&self, _mpn: u64) {}
        fn copy_frame(&self, _src: u64, _dst: u64) {}
        fn frame_bytes_mut(&self, _mpn: u64) -> &mut [u8] {
            unsafe { (*(self.scratch.as_ptr() as *mut alloc::vec::Vec<u8>)).as_mut_slice() }
        }
    }

    struct MockShare;
    impl PageShare for MockShare {
        fn hash(&self, mpn: u64) -> u64 {
            mpn
        }
        fn add(&self, _key: u64, mpn: u64) -> (u64, u32) {
            (mpn, 1)
        }
        fn lookup_by_mpn(&self, _mpn: u64) -> Option<(u64, u32)> {
            None
        }
        fn remove(&self, _key: u64, _mpn: u64) -> u32 {
            0
        }
    }

    struct MockSwapDev;
    impl SwapDevice for MockSwapDev {
        fn write(&self, _w: u64, _h: Option<u32>, _l: u64, _m: u64) -> MmResult<u32> {
            Ok(0)
        }
        fn read(&self, _slot: u32, _mpn: u64) -> MmResult<()> {
            Ok(())
        }
        fn free_slot(&self, _slot: u32) {}
        fn enabled(&self) -> bool {
            true
        }
    }

    struct MockBacking;
    impl BackingStore for MockBacking {
        fn read_page(&self, _handle: u64, _offset: u64, _buf: &mut [u8]) -> MmResult<usize> {
            Ok(0)
        }
        fn writable(&self, _handle: u64) -> bool {
            true
        }
    }

    struct MockGuest;
    impl GuestPhys for MockGuest {
        fn resolve(&self, _vmm: u64, ppn: u64) -> MmResult<u64> {
            Ok(ppn)
        }
    }

    struct MockTlb;
    impl TlbShootdown for MockTlb {
        fn flush_cartel(&self, _c: u64) {}
        fn invalidate_page(&self, _c: u64, _va: u64) {}
    }

    #[test]
    fn fault_on_anonymous_in_use_pages_in() {
        let mut tree = CanonicalTree::new();
        let mut regions = RegionMap::new();
        let mut swap = SwapEngine::new();
        let sched = mock_scheduler();
        let dev = mock_swap_device();
        let frames = MockFrames { next: RefCell::new(1), scratch: RefCell::new(alloc::vec![0u8; PAGE_SIZE]) };
        let share = MockShare;
        let backing = MockBacking;
        let guest = MockGuest;
        let tlb = MockTlb;
        let _ = BTreeMap::<u64, u64>::new();

        let mut addr = DATA_MMAP_BASE;
        regions
            .allocate_range(
                &mut tree, &sched, 1, &mut addr, false, PAGE_SIZE as u64, Prot::READ | Prot::WRITE,
                BackingKind::Anonymous, None, 0, false, false,
            )
            .unwrap();

        let mut ctx = FaultContext {
            tree: &mut tree,
            regions: &regions,
            swap: &mut swap,
            frames: &frames,
            share: &share,
            swap_device: &dev,
            backing: &backing,
            guest: &guest,
            sched: &sched,
            tlb: &tlb,
            cartel_id: 1,
            world: 1,
        };
        let outcome = handle_fault(&mut ctx, lpn_of(addr), false, 0);
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(ctx.tree.pte(lpn_of(addr)).is_present());
    }

    #[test]
    fn fault_with_no_covering_region_is_fatal_invalid_address() {
        let mut tree = CanonicalTree::new();
        let regions = RegionMap::new();
        let mut swap = SwapEngine::new();
        let sched = mock_scheduler();
        let dev = mock_swap_device();
        let frames = MockFrames { next: RefCell::new(1), scratch: RefCell::new(alloc::vec![0u8; PAGE_SIZE]) };
        let share = MockShare;
        let backing = MockBacking;
        let guest = MockGuest;
        let tlb = MockTlb;

        let mut ctx = FaultContext {
            tree: &mut tree,
            regions: &regions,
            swap: &mut swap,
            frames: &frames,
            share: &share,
            swap_device: &dev,
            backing: &backing,
            guest: &guest,
            sched: &sched,
            tlb: &tlb,
            cartel_id: 1,
            world: 1,
        };
        let outcome = handle_fault(&mut ctx, 0, false, 0);
        assert_eq!(outcome, FaultOutcome::Fatal(MmError::InvalidAddress));
    }
}

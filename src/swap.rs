//! Swap engine: cancel-safe asynchronous swap-out and swap-in against a
//! pseudo-LRU eviction policy.
//!
//! A ring of in-flight requests tracks outstanding device I/O by page so a
//! concurrent `unmap` can mark a request cancelled before it completes.
//! Swap-out and swap-in release the cartel lock around the device I/O
//! itself, so a page's PTE can change out from under a request in flight —
//! the cancellation flag is how the completion handler notices and backs
//! off instead of racing a PTE write underneath whoever tore the mapping
//! down.

use alloc::vec::Vec;

use crate::collab::SwapDevice;
use crate::error::{MmError, MmResult};
use crate::pte::{Pte, PteState};
use crate::ptable::CanonicalTree;
use crate::types::{Lpn, Mpn, Prot, SlotId, SWAP_RING_SLOTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Out,
    In,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    lpn: Lpn,
    direction: Direction,
    cancelled: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SwapStats {
    pub pages_out: u64,
    pub pages_in: u64,
    pub slots_in_use: u64,
}

/// Tracks in-flight swap requests for one cartel so a concurrent `unmap`
/// can cancel them before the device I/O completes. Bounded to
/// [`SWAP_RING_SLOTS`] outstanding requests.
pub struct SwapEngine {
    ring: Vec<InFlight>,
    stats: SwapStats,
}

impl SwapEngine {
    pub fn new() -> Self {
        SwapEngine { ring: Vec::with_capacity(SWAP_RING_SLOTS), stats: SwapStats::default() }
    }

    pub fn stats(&self) -> SwapStats {
        self.stats
    }

    fn begin(&mut self, lpn: Lpn, direction: Direction) -> MmResult<()> {
        if self.ring.len() >= SWAP_RING_SLOTS {
            return Err(MmError::NoResources);
        }
        self.ring.push(InFlight { lpn, direction, cancelled: false });
        Ok(())
    }

    fn end(&mut self, lpn: Lpn, direction: Direction) -> bool {
        if let Some(pos) = self
            .ring
            .iter()
            .position(|r| r.lpn == lpn && r.direction == direction)
        {
            self.ring.remove(pos).cancelled
        } else {
            false
        }
    }

    /// Marks any in-flight request for `lpn` as cancelled. Called by
    /// [`crate::region::RegionMap::clear_range`] when a mapping is torn
    /// down out from under a swap in progress. A no-op if nothing is
    /// in-flight for this page.
    pub fn cancel(&mut self, lpn: Lpn) {
        for req in self.ring.iter_mut().filter(|r| r.lpn == lpn) {
            req.cancelled = true;
        }
    }

    /// Picks a swap-out candidate among Present, unpinned, unshared pages
    /// the caller offers, by pseudo-LRU: the first page whose accessed bit
    /// is clear, clearing accessed bits as it scans (standard clock-hand
    /// approximation of LRU, same idea as page-replacement code across the
    /// pack).
    pub fn pick_victim(tree: &mut CanonicalTree, candidates: &[Lpn]) -> Option<Lpn> {
        for &lpn in candidates {
            if let Ok(pte) = tree.pte_mut(lpn) {
                if let PteState::Present { pinned: false, shared: false, .. } = pte.decode() {
                    if !pte.clear_accessed_if_set() {
                        return Some(lpn);
                    }
                }
            }
        }
        candidates.iter().copied().find(|&lpn| {
            matches!(
                tree.pte(lpn).decode(),
                PteState::Present { pinned: false, shared: false, .. }
            )
        })
    }

    /// Begins evicting `lpn`: transitions Present -> Swapping(out), then
    /// performs the device write. On success transitions to Swapped; if a
    /// concurrent `unmap` cancelled the request, frees the slot instead and
    /// leaves the PTE however the cancellation path left it (Empty).
    pub fn swap_out(
        &mut self,
        tree: &mut CanonicalTree,
        dev: &dyn SwapDevice,
        cartel_id: u64,
        lpn: Lpn,
    ) -> MmResult<()> {
        if !dev.enabled() {
            return Err(MmError::NoMemory);
        }
        let pte = tree.pte(lpn);
        let (mpn, prot) = match pte.decode() {
            PteState::Present { mpn, prot, pinned: false, .. } => (mpn, prot),
            PteState::Present { pinned: true, .. } => return Err(MmError::Busy),
            _ => return Err(MmError::InvalidAddress),
        };
        self.begin(lpn, Direction::Out)?;
        *tree.pte_mut(lpn)? = Pte::set_swap_busy(Some(mpn), prot);

        let slot = dev.write(cartel_id, None, lpn, mpn);
        let cancelled = self.end(lpn, Direction::Out);

        match (cancelled, slot) {
            (true, Ok(slot)) => {
                dev.free_slot(slot);
                Ok(())
            }
            (true, Err(_)) => Ok(()),
            (false, Ok(slot)) => {
                if let Ok(cur) = tree.pte_mut(lpn) {
                    if cur.is_swapping() {
                        *cur = Pte::set_swapped(slot, prot);
                        self.stats.pages_out += 1;
                        self.stats.slots_in_use += 1;
                    } else {
                        dev.free_slot(slot);
                    }
                } else {
                    dev.free_slot(slot);
                }
                Ok(())
            }
            (false, Err(e)) => {
                if let Ok(cur) = tree.pte_mut(lpn) {
                    if cur.is_swapping() {
                        *cur = Pte::set_present(mpn, prot, false, false);
                    }
                }
                Err(e)
            }
        }
    }

    /// Begins paging `lpn` back in: transitions Swapped -> Swapping(in),
    /// reads the device content into `mpn`, then transitions to Present
    /// with the accessed bit set (a page that was just faulted back in
    /// must not look cold to the very next clock-hand scan, or
    /// [`pick_victim`](Self::pick_victim) could evict it again before it's
    /// ever touched). Cancellation (the mapping was torn down mid-read)
    /// just frees the newly allocated frame; the PTE was already cleared
    /// by the canceller.
    pub fn swap_in(
        &mut self,
        tree: &mut CanonicalTree,
        dev: &dyn SwapDevice,
        lpn: Lpn,
        mpn: Mpn,
    ) -> MmResult<()> {
        let pte = tree.pte(lpn);
        let (slot, prot) = match pte.decode() {
            PteState::Swapped { slot, prot } => (slot, prot),
            _ => return Err(MmError::InvalidAddress),
        };
        self.begin(lpn, Direction::In)?;
        *tree.pte_mut(lpn)? = Pte::set_swap_busy(None, prot);

        let result = dev.read(slot, mpn);
        let cancelled = self.end(lpn, Direction::In);

        if cancelled {
            return Ok(());
        }
        result?;
        if let Ok(cur) = tree.pte_mut(lpn) {
            if cur.is_swapping() {
                let mut pte = Pte::set_present(mpn, prot, false, false);
                pte.set_accessed(true);
                *cur = pte;
                dev.free_slot(slot);
                self.stats.pages_in += 1;
                self.stats.slots_in_use = self.stats.slots_in_use.saturating_sub(1);
            }
        }
        Ok(())
    }
}

impl Default for SwapEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub mod tests_support {
    use super::*;
    use crate::collab::MemScheduler;
    use crate::types::UsageCategory;
    use core::cell::Cell;

    pub struct MockScheduler {
        blocked: Cell<u32>,
    }

    impl MemScheduler for MockScheduler {
        fn admit(&self, _world: u64, _category: UsageCategory, _delta: i64) -> bool {
            true
        }
        fn pageable_usage(&self, _world: u64) -> u64 {
            0
        }
        fn shared_usage(&self, _world: u64) -> u64 {
            0
        }
        fn swapped_usage(&self, _world: u64) -> u64 {
            0
        }
        fn pinned_usage(&self, _world: u64) -> u64 {
            0
        }
        fn account(&self, _world: u64, _category: UsageCategory, _delta: i64) {}
        fn account_swapped(&self, _world: u64, _delta: i64) {}
        fn account_shared(&self, _world: u64, _delta: i64) {}
        fn account_pinned(&self, _world: u64, _delta: i64) {}
        fn block_on(&self, _channel: u64) {
            self.blocked.set(self.blocked.get() + 1);
        }
        fn wake_all(&self, _channel: u64) {}
    }

    pub fn mock_scheduler() -> MockScheduler {
        MockScheduler { blocked: Cell::new(0) }
    }

    pub struct MockSwapDevice {
        next_slot: Cell<SlotId>,
        fail_writes: Cell<bool>,
    }

    impl SwapDevice for MockSwapDevice {
        fn write(&self, _world: u64, _slot_hint: Option<SlotId>, _lpn: u64, _mpn: Mpn) -> MmResult<SlotId> {
            if self.fail_writes.get() {
                return Err(MmError::NoMemory);
            }
            let slot = self.next_slot.get();
            self.next_slot.set(slot + 1);
            Ok(slot)
        }
        fn read(&self, _slot: SlotId, _mpn: Mpn) -> MmResult<()> {
            Ok(())
        }
        fn free_slot(&self, _slot: SlotId) {}
        fn enabled(&self) -> bool {
            true
        }
    }

    pub fn mock_swap_device() -> MockSwapDevice {
        MockSwapDevice { next_slot: Cell::new(0), fail_writes: Cell::new(false) }
    }
}

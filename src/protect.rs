//! Protection manager: rewrites stored protection across a PTE range and
//! keeps the hardware-write bit and TLB state consistent with it.
//!
//! A protection change never touches a PTE's tag, only its stored `Prot`
//! (and, for Present entries, the hardware-write bit) — `Pte::rewrite_prot`
//! already encodes "preserve tag and payload", so this module is mostly
//! sequencing: walk the range, rewrite, and shoot down the TLB for anything
//! that lost a permission a CPU might already be caching.

use crate::collab::{BackingStore, TlbShootdown};
use crate::error::{MmError, MmResult};
use crate::pte::PteState;
use crate::ptable::CanonicalTree;
use crate::types::{BackingKind, Lpn, Prot};

/// Checks whether `[start_lpn, start_lpn+n_pages)` may legally be rewritten
/// to `new_prot`, without mutating anything. Two rules apply: dropping a
/// region to `NONE` while any of its pages is still `Present` is rejected
/// as `Busy` (a present page needs an explicit unmap, not a protection
/// change, to go away), and granting `WRITE` on a file-backed region whose
/// backing was not opened read-write is rejected as `NoAccess`.
pub fn verify_protect_range(
    tree: &CanonicalTree,
    backing: &dyn BackingStore,
    start_lpn: Lpn,
    n_pages: u64,
    new_prot: Prot,
    region_backing: BackingKind,
    backing_handle: Option<u64>,
) -> MmResult<()> {
    if new_prot == Prot::NONE {
        for off in 0..n_pages {
            if let PteState::Present { .. } = tree.pte(start_lpn + off).decode() {
                return Err(MmError::Busy);
            }
        }
    }
    if new_prot.contains(Prot::WRITE) && region_backing == BackingKind::FileBacked {
        let writable = backing_handle.is_some_and(|h| backing.writable(h));
        if !writable {
            return Err(MmError::NoAccess);
        }
    }
    Ok(())
}

/// Rewrites `[start_lpn, start_lpn+n_pages)` to `new_prot`. Present entries
/// that keep WRITE get the hardware-write bit re-armed only if it was
/// already armed (a downgrade-then-upgrade must still re-fault once, same
/// as a fresh Present entry would, to recheck for opportunistic sharing).
/// Any entry that loses a permission triggers an invalidate for that page;
/// the caller is expected to have already taken the cartel lock.
pub fn protect_range(
    tree: &mut CanonicalTree,
    tlb: &dyn TlbShootdown,
    cartel_id: u64,
    start_lpn: Lpn,
    n_pages: u64,
    new_prot: Prot,
) -> MmResult<()> {
    tree.for_range(start_lpn, n_pages, |lpn, pte| {
        let before = pte.decode();
        pte.rewrite_prot(new_prot);
        if let PteState::Present { hw_write_enabled: true, .. } = before {
            if !new_prot.contains(Prot::WRITE) {
                pte.disable_write();
            }
        }
        let lost_permission = match before {
            PteState::Present { prot, .. } => !prot.difference(new_prot).is_empty(),
            _ => false,
        };
        if lost_permission {
            tlb.invalidate_page(cartel_id, lpn << crate::types::PAGE_SHIFT);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pte::Pte;
    use crate::types::RegionId;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    struct MockTlb {
        invalidated: RefCell<Vec<u64>>,
    }
    impl TlbShootdown for MockTlb {
        fn flush_cartel(&self, _cartel_id: u64) {}
        fn invalidate_page(&self, _cartel_id: u64, va: u64) {
            self.invalidated.borrow_mut().push(va);
        }
    }

    #[test]
    fn downgrade_present_disables_hw_write_and_invalidates() {
        let mut tree = CanonicalTree::new();
        *tree.pte_mut(1).unwrap() = Pte::set_present(9, Prot::READ | Prot::WRITE, false, false);
        let tlb = MockTlb { invalidated: RefCell::new(Vec::new()) };
        protect_range(&mut tree, &tlb, 1, 1, 1, Prot::READ).unwrap();
        match tree.pte(1).decode() {
            PteState::Present { hw_write_enabled, prot, .. } => {
                assert!(!hw_write_enabled);
                assert_eq!(prot, Prot::READ);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tlb.invalidated.borrow().len(), 1);
    }

    #[test]
    fn upgrade_in_use_rewrites_without_tlb_hit() {
        let mut tree = CanonicalTree::new();
        *tree.pte_mut(1).unwrap() = Pte::set_in_use(Prot::READ, RegionId(0));
        let tlb = MockTlb { invalidated: RefCell::new(Vec::new()) };
        protect_range(&mut tree, &tlb, 1, 1, 1, Prot::READ | Prot::WRITE).unwrap();
        match tree.pte(1).decode() {
            PteState::InUse { prot, .. } => assert_eq!(prot, Prot::READ | Prot::WRITE),
            other => panic!("unexpected {:?}", other),
        }
        assert!(tlb.invalidated.borrow().is_empty());
    }
}

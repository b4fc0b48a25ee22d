//! Page-sharing helper: opportunistic content-addressed sharing of
//! read-only anonymous/file pages, and the copy-on-write break path a write
//! fault takes against a shared page.
//!
//! Refcount bookkeeping follows a plain hash-keyed table: add bumps a
//! count, remove decrements and frees at zero. The key is a content hash
//! rather than an object id, and "free at zero" means returning the frame
//! to the [`FrameSource`] rather than closing a handle.

use crate::collab::{FrameSource, PageShare};
use crate::error::{MmError, MmResult};
use crate::pte::{Pte, PteState};
use crate::ptable::CanonicalTree;
use crate::types::{Lpn, Mpn};

/// Folds `mpn`'s content into the share table and rewrites the PTE at
/// `lpn` to point at whatever frame the table says to use (itself, or an
/// existing identical frame — in which case the caller's original frame is
/// released back to `frames`). Marks the PTE `shared` and clears the
/// hardware-write bit so the next write re-faults into [`break_share`].
pub fn try_share(
    tree: &mut CanonicalTree,
    frames: &dyn FrameSource,
    share: &dyn PageShare,
    lpn: Lpn,
) -> MmResult<()> {
    let pte = tree.pte(lpn);
    let (mpn, prot, pinned) = match pte.decode() {
        PteState::Present { mpn, prot, pinned, shared: false, .. } if !pinned => (mpn, prot, pinned),
        PteState::Present { shared: true, .. } => return Ok(()),
        _ => return Err(MmError::InvalidAddress),
    };
    let key = share.hash(mpn);
    let (canonical_mpn, _count) = share.add(key, mpn);
    if canonical_mpn != mpn {
        frames.free_user_frame(mpn);
    }
    let mut new_pte = Pte::set_present(canonical_mpn, prot, pinned, true);
    new_pte.mark_shared(true);
    *tree.pte_mut(lpn)? = new_pte;
    Ok(())
}

/// Breaks a shared mapping on a write fault: allocates a private frame,
/// copies the shared content into it, removes this mapping's reference
/// from the share table (freeing the shared frame if the count drops to
/// zero), and rewrites the PTE as a private, writable Present entry.
pub fn break_share(
    tree: &mut CanonicalTree,
    frames: &dyn FrameSource,
    share: &dyn PageShare,
    lpn: Lpn,
    node_hint: u32,
) -> MmResult<()> {
    let pte = tree.pte(lpn);
    let (mpn, prot, pinned) = match pte.decode() {
        PteState::Present { mpn, prot, pinned, shared: true, .. } => (mpn, prot, pinned),
        PteState::Present { shared: false, .. } => return Ok(()),
        _ => return Err(MmError::InvalidAddress),
    };
    let new_mpn = frames.alloc_user_frame(node_hint, 0).ok_or(MmError::NoMemory)?;
    frames.copy_frame(mpn, new_mpn);

    if let Some((key, _)) = share.lookup_by_mpn(mpn) {
        if share.remove(key, mpn) == 0 {
            frames.free_user_frame(mpn);
        }
    }

    *tree.pte_mut(lpn)? = Pte::set_present(new_mpn, prot, pinned, false);
    Ok(())
}

/// Drops this mapping's share reference without copying, for the `unmap`
/// path: the page is going away, not being written to.
pub fn drop_share_ref(frames: &dyn FrameSource, share: &dyn PageShare, mpn: Mpn) {
    if let Some((key, _)) = share.lookup_by_mpn(mpn) {
        if share.remove(key, mpn) == 0 {
            frames.free_user_frame(mpn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Prot;
    use alloc::collections::BTreeMap;
    use core::cell::RefCell;

    struct MockFrames {
        next: RefCell<Mpn>,
        freed: RefCell<alloc::vec::Vec<Mpn>>,
        scratch: RefCell<[u8; 4096]>,
    }
    impl FrameSource for MockFrames {
        fn alloc_user_frame(&self, _node: u32, _color: u32) -> Option<Mpn> {
            let m = *self.next.borrow();
            *self.next.borrow_mut() += 1;
            Some(m)
        }
        fn free_user_frame(&self, mpn: Mpn) {
            self.freed.borrow_mut().push(mpn);
        }
        fn zero_frame(&self, _mpn: Mpn) {}
        fn copy_frame(&self, _src: Mpn, _dst: Mpn) {}
        fn frame_bytes_mut(&self, _mpn: Mpn) -> &mut [u8] {
            unsafe { &mut *self.scratch.as_ptr().cast_mut() }
        }
    }

    struct MockShare {
        table: RefCell<BTreeMap<u64, (Mpn, u32)>>,
        by_mpn: RefCell<BTreeMap<Mpn, u64>>,
    }
    impl PageShare for MockShare {
        fn hash(&self, mpn: Mpn) -> u64 {
            mpn // identity: distinct frames never collide in these tests
        }
        fn add(&self, key: u64, mpn: Mpn) -> (Mpn, u32) {
            let mut table = self.table.borrow_mut();
            let entry = table.entry(key).or_insert((mpn, 0));
            entry.1 += 1;
            self.by_mpn.borrow_mut().insert(entry.0, key);
            *entry
        }
        fn lookup_by_mpn(&self, mpn: Mpn) -> Option<(u64, u32)> {
            let key = *self.by_mpn.borrow().get(&mpn)?;
            self.table.borrow().get(&key).map(|&(m, c)| {
                let _ = m;
                (key, c)
            })
        }
        fn remove(&self, key: u64, _mpn: Mpn) -> u32 {
            let mut table = self.table.borrow_mut();
            if let Some(entry) = table.get_mut(&key) {
                entry.1 = entry.1.saturating_sub(1);
                entry.1
            } else {
                0
            }
        }
    }

    #[test]
    fn try_share_marks_shared_and_clears_hw_write() {
        let mut tree = CanonicalTree::new();
        *tree.pte_mut(1).unwrap() = Pte::set_present(7, Prot::READ | Prot::WRITE, false, false);
        let frames = MockFrames { next: RefCell::new(100), freed: RefCell::new(alloc::vec::Vec::new()), scratch: RefCell::new([0u8; 4096]) };
        let share = MockShare { table: RefCell::new(BTreeMap::new()), by_mpn: RefCell::new(BTreeMap::new()) };
        try_share(&mut tree, &frames, &share, 1).unwrap();
        match tree.pte(1).decode() {
            PteState::Present { shared, hw_write_enabled, .. } => {
                assert!(shared);
                assert!(!hw_write_enabled);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn break_share_gives_private_writable_copy() {
        let mut tree = CanonicalTree::new();
        *tree.pte_mut(1).unwrap() = Pte::set_present(7, Prot::READ | Prot::WRITE, false, false);
        let frames = MockFrames { next: RefCell::new(100), freed: RefCell::new(alloc::vec::Vec::new()), scratch: RefCell::new([0u8; 4096]) };
        let share = MockShare { table: RefCell::new(BTreeMap::new()), by_mpn: RefCell::new(BTreeMap::new()) };
        try_share(&mut tree, &frames, &share, 1).unwrap();
        break_share(&mut tree, &frames, &share, 1, 0).unwrap();
        match tree.pte(1).decode() {
            PteState::Present { shared, hw_write_enabled, mpn, .. } => {
                assert!(!shared);
                assert!(hw_write_enabled);
                assert_eq!(mpn, 100);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

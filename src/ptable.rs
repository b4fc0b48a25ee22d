//! Page-table walker.
//!
//! A 2-level canonical tree (directory of tables, each holding
//! [`types::TABLE_ENTRIES`] [`Pte`]s) shared by every thread of a cartel.
//! Per-thread private roots hold only a presence bitmap over directory
//! slots, so a thread's first touch of a directory range pulls the
//! canonical table in without copying it. Table allocation failure maps to
//! [`MmError::NoMemory`]; an out-of-range directory slot maps to
//! [`MmError::InvalidAddress`].
//!
//! Two levels rather than a full hardware-depth walk: this tree's job is
//! the policy around page-table entries, not driving a concrete MMU, so it
//! grows its directory lazily up to [`types::MAX_DIRECTORY_ENTRIES`] instead
//! of mirroring a fixed-depth hardware layout.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{MmError, MmResult};
use crate::pte::Pte;
use crate::types::{Lpn, MAX_DIRECTORY_ENTRIES, TABLE_ENTRIES};

#[derive(Clone)]
pub struct Table {
    ptes: Box<[Pte; TABLE_ENTRIES]>,
}

impl Table {
    fn new() -> Self {
        Table { ptes: Box::new([Pte::empty(); TABLE_ENTRIES]) }
    }

    pub fn get(&self, idx: usize) -> Pte {
        self.ptes[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Pte {
        &mut self.ptes[idx]
    }

    pub fn is_empty_table(&self) -> bool {
        self.ptes.iter().all(|p| p.is_empty())
    }
}

#[inline]
fn split(lpn: Lpn) -> (usize, usize) {
    let dir = (lpn / TABLE_ENTRIES as u64) as usize;
    let idx = (lpn % TABLE_ENTRIES as u64) as usize;
    (dir, idx)
}

/// The cartel-wide canonical page tree. Owns every page table; nothing else
/// is allowed to free one out from under a walk in progress (the cartel
/// lock already serializes all access, so this struct itself needs no
/// internal locking).
pub struct CanonicalTree {
    directory: Vec<Option<Table>>,
}

impl CanonicalTree {
    pub fn new() -> Self {
        CanonicalTree { directory: Vec::new() }
    }

    /// Locates or creates the page table covering `lpn`, returning it and
    /// its directory index (the "machine address" stand-in for this
    /// software tree). Grows the directory to cover `lpn` on demand, up to
    /// `MAX_DIRECTORY_ENTRIES`.
    pub fn canonical_page_table(&mut self, lpn: Lpn) -> MmResult<(&mut Table, usize)> {
        let (dir, _) = split(lpn);
        if dir >= MAX_DIRECTORY_ENTRIES {
            return Err(MmError::InvalidAddress);
        }
        if dir >= self.directory.len() {
            self.directory.resize_with(dir + 1, || None);
        }
        if self.directory[dir].is_none() {
            self.directory[dir] = Some(Table::new());
        }
        Ok((self.directory[dir].as_mut().unwrap(), dir))
    }

    /// Read-only table lookup; does not materialize a missing table.
    pub fn get_table(&self, lpn: Lpn) -> Option<&Table> {
        let (dir, _) = split(lpn);
        self.directory.get(dir).and_then(|t| t.as_ref())
    }

    pub fn get_table_mut(&mut self, lpn: Lpn) -> Option<&mut Table> {
        let (dir, _) = split(lpn);
        self.directory.get_mut(dir).and_then(|t| t.as_mut())
    }

    pub fn pte(&self, lpn: Lpn) -> Pte {
        let (_, idx) = split(lpn);
        self.get_table(lpn).map(|t| t.get(idx)).unwrap_or(Pte::empty())
    }

    /// Materializes the table for `lpn` if needed and returns a mutable
    /// handle to its entry.
    pub fn pte_mut(&mut self, lpn: Lpn) -> MmResult<&mut Pte> {
        let (_, idx) = split(lpn);
        let (table, _) = self.canonical_page_table(lpn)?;
        Ok(table.get_mut(idx))
    }

    /// Frees a directory's table if every entry in it has gone Empty.
    /// Called opportunistically after a range clear; never required for
    /// correctness (an empty table is harmless, just wasted space).
    pub fn gc_table(&mut self, lpn: Lpn) {
        let (dir, _) = split(lpn);
        if let Some(Some(table)) = self.directory.get(dir) {
            if table.is_empty_table() {
                self.directory[dir] = None;
            }
        }
    }

    /// Iterates `lpn..lpn+count`, yielding `(Lpn, &mut Pte)`. Materializes
    /// tables lazily, one directory crossing at a time — the walker never
    /// needs to hold more than one table "mapped" at once (here a no-op
    /// since the whole tree is already exclusively held under the cartel
    /// lock, but kept as an explicit loop boundary rather than a flat
    /// slice so a future SMP-aware implementation can insert a
    /// release/reacquire at each crossing).
    pub fn for_range<F>(&mut self, start: Lpn, count: u64, mut f: F) -> MmResult<()>
    where
        F: FnMut(Lpn, &mut Pte) -> MmResult<()>,
    {
        let mut lpn = start;
        let end = start + count;
        while lpn < end {
            let (dir, idx) = split(lpn);
            let (table, _) = self.canonical_page_table(lpn)?;
            let table_end = ((dir as u64 + 1) * TABLE_ENTRIES as u64).min(end);
            let mut i = idx;
            while lpn < table_end {
                f(lpn, table.get_mut(i))?;
                lpn += 1;
                i += 1;
            }
        }
        Ok(())
    }
}

impl Default for CanonicalTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread private root: a presence bitmap over canonical directory
/// slots. `lookup_page_table` pulls a canonical table in on first touch
/// (incrementing the outstanding-reference counter) rather than copying it.
pub struct PrivateRoot {
    present: Vec<bool>,
    refs_held: usize,
}

impl PrivateRoot {
    pub fn new() -> Self {
        PrivateRoot { present: Vec::new(), refs_held: 0 }
    }

    fn ensure_slot(&mut self, dir: usize) {
        if dir >= self.present.len() {
            self.present.resize(dir + 1, false);
        }
    }

    /// Returns the canonical table for `lpn`, pulling it into this private
    /// root's view if this is the first touch. `InvalidAddress` if the
    /// canonical tree has no table there yet (the caller — typically the
    /// fault handler — must materialize it first via `canonical_page_table`).
    pub fn lookup_page_table<'a>(
        &mut self,
        tree: &'a CanonicalTree,
        lpn: Lpn,
        refcount: &mut usize,
    ) -> MmResult<&'a Table> {
        let (dir, _) = split(lpn);
        let table = tree.get_table(lpn).ok_or(MmError::InvalidAddress)?;
        self.ensure_slot(dir);
        if !self.present[dir] {
            self.present[dir] = true;
            self.refs_held += 1;
            *refcount += 1;
        }
        Ok(table)
    }

    /// Releases this private root's reference to the table covering `lpn`.
    /// The cartel memory state must not be torn down while any private
    /// root (or the canonical tree itself) has references outstanding.
    pub fn release_page_table(&mut self, lpn: Lpn, refcount: &mut usize) {
        let (dir, _) = split(lpn);
        if dir >= self.present.len() {
            return;
        }
        if self.present[dir] {
            self.present[dir] = false;
            self.refs_held -= 1;
            *refcount -= 1;
        }
    }

    pub fn refs_held(&self) -> usize {
        self.refs_held
    }
}

impl Default for PrivateRoot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Prot;

    #[test]
    fn canonical_table_materializes_on_demand() {
        let mut tree = CanonicalTree::new();
        assert!(tree.get_table(5).is_none());
        tree.canonical_page_table(5).unwrap();
        assert!(tree.get_table(5).is_some());
    }

    #[test]
    fn pte_mut_roundtrip() {
        let mut tree = CanonicalTree::new();
        *tree.pte_mut(10).unwrap() = Pte::set_in_use(Prot::READ, crate::types::RegionId(1));
        assert!(tree.pte(10).is_in_use());
        assert!(tree.pte(11).is_empty());
    }

    #[test]
    fn for_range_crosses_directory_boundary() {
        let mut tree = CanonicalTree::new();
        let start = TABLE_ENTRIES as u64 - 2;
        let mut seen = Vec::new();
        tree.for_range(start, 4, |lpn, pte| {
            *pte = Pte::set_in_use(Prot::READ, crate::types::RegionId(1));
            seen.push(lpn);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, alloc::vec![start, start + 1, start + 2, start + 3]);
        for lpn in seen {
            assert!(tree.pte(lpn).is_in_use());
        }
    }

    #[test]
    fn gc_table_frees_empty_directory_slot() {
        let mut tree = CanonicalTree::new();
        tree.canonical_page_table(3).unwrap();
        assert!(tree.get_table(3).is_some());
        tree.gc_table(3);
        assert!(tree.get_table(3).is_none());
    }

    #[test]
    fn private_root_pulls_in_canonical_table_once() {
        let mut tree = CanonicalTree::new();
        tree.canonical_page_table(40).unwrap();
        let mut root = PrivateRoot::new();
        let mut refcount = 0usize;
        root.lookup_page_table(&tree, 40, &mut refcount).unwrap();
        assert_eq!(refcount, 1);
        root.lookup_page_table(&tree, 41, &mut refcount).unwrap(); // same directory
        assert_eq!(refcount, 1);
        root.release_page_table(40, &mut refcount);
        assert_eq!(refcount, 0);
    }

    #[test]
    fn private_root_lookup_missing_table_is_invalid_address() {
        let tree = CanonicalTree::new();
        let mut root = PrivateRoot::new();
        let mut refcount = 0usize;
        assert_eq!(
            root.lookup_page_table(&tree, 99, &mut refcount).unwrap_err(),
            MmError::InvalidAddress
        );
    }
}

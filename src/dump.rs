//! Core-dump enumerator: `dump_mmap_headers`/`dump_mmap_data`/`dump_map_types`.
//!
//! Pure read-only walk over the region map and PTE state; never faults a
//! page in, so dumping a cartel never perturbs its working set. A page
//! that is not `Present` contributes a header (so the dump's layout is
//! complete) but no data.

use alloc::vec::Vec;

use crate::collab::FrameSource;
use crate::ptable::CanonicalTree;
use crate::region::RegionMap;
use crate::types::{BackingKind, Prot, VirtAddr};

#[derive(Debug, Clone, Copy)]
pub struct MmapHeader {
    pub start: VirtAddr,
    pub length: u64,
    pub prot: Prot,
    pub backing: BackingKind,
}

/// One resident page's worth of dump data.
#[derive(Debug, Clone)]
pub struct MmapDataPage {
    pub addr: VirtAddr,
    pub bytes: Vec<u8>,
}

/// One header per region, in address order.
pub fn dump_mmap_headers(regions: &RegionMap) -> Vec<MmapHeader> {
    regions
        .iter()
        .map(|(_, r)| MmapHeader { start: r.start, length: r.length, prot: r.prot, backing: r.backing })
        .collect()
}

/// The distinct backing kinds in use, for a dump's type table.
pub fn dump_map_types(regions: &RegionMap) -> Vec<BackingKind> {
    let mut kinds = Vec::new();
    for (_, r) in regions.iter() {
        if !kinds.contains(&r.backing) {
            kinds.push(r.backing);
        }
    }
    kinds
}

/// Copies every currently-resident page's content out. `frames` supplies
/// the byte view of each physical frame; pages that are `InUse`, `Swapped`,
/// or mid-swap are skipped (a consumer wanting their content must fault
/// them in first, which a core dump deliberately does not do).
pub fn dump_mmap_data(regions: &RegionMap, tree: &CanonicalTree, frames: &dyn FrameSource) -> Vec<MmapDataPage> {
    let mut pages = Vec::new();
    for (_, region) in regions.iter() {
        let start_lpn = crate::types::lpn_of(region.start);
        for off in 0..region.n_pages() {
            let lpn = start_lpn + off;
            if let crate::pte::PteState::Present { mpn, .. } = tree.pte(lpn).decode() {
                let bytes = frames.frame_bytes_mut(mpn).to_vec();
                pages.push(MmapDataPage { addr: region.start + off * crate::types::PAGE_SIZE as u64, bytes });
            }
        }
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::MemScheduler;
    use crate::swap::tests_support::mock_scheduler;
    use crate::types::{DATA_MMAP_BASE, PAGE_SIZE};
    use core::cell::RefCell;

    struct MockFrames {
        scratch: RefCell<Vec<u8>>,
    }
    impl FrameSource for MockFrames {
        fn alloc_user_frame(&self, _n: u32, _c: u32) -> Option<u64> {
            Some(1)
        }
        fn free_user_frame(&self, _mpn: u64) {}
        fn zero_frame(&self, _mpn: u64) {}
        fn copy_frame(&self, _src: u64, _dst: u64) {}
        fn frame_bytes_mut(&self, _mpn: u64) -> &mut [u8] {
            unsafe { (*(self.scratch.as_ptr() as *mut Vec<u8>)).as_mut_slice() }
        }
    }

    fn sched() -> impl MemScheduler {
        mock_scheduler()
    }

    #[test]
    fn headers_and_types_reflect_regions() {
        let mut regions = RegionMap::new();
        let mut tree = CanonicalTree::new();
        let s = sched();
        let mut addr = DATA_MMAP_BASE;
        regions
            .allocate_range(
                &mut tree, &s, 1, &mut addr, false, PAGE_SIZE as u64, Prot::READ,
                BackingKind::Anonymous, None, 0, false, false,
            )
            .unwrap();
        let headers = dump_mmap_headers(&regions);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].start, addr);
        assert_eq!(dump_map_types(&regions), alloc::vec![BackingKind::Anonymous]);
    }

    #[test]
    fn data_dump_skips_non_present_pages() {
        let mut regions = RegionMap::new();
        let mut tree = CanonicalTree::new();
        let s = sched();
        let mut addr = DATA_MMAP_BASE;
        regions
            .allocate_range(
                &mut tree, &s, 1, &mut addr, false, PAGE_SIZE as u64, Prot::READ,
                BackingKind::Anonymous, None, 0, false, false,
            )
            .unwrap();
        let frames = MockFrames { scratch: RefCell::new(alloc::vec![7u8; PAGE_SIZE]) };
        assert!(dump_mmap_data(&regions, &tree, &frames).is_empty());
        *tree.pte_mut(crate::types::lpn_of(addr)).unwrap() =
            crate::pte::Pte::set_present(1, Prot::READ, false, false);
        let data = dump_mmap_data(&regions, &tree, &frames);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].addr, addr);
        assert_eq!(data[0].bytes.len(), PAGE_SIZE);
    }
}

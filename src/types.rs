//! Shared scalar types and layout constants.
//!
//! Constants live here as `pub const`s near the types that use them, rather
//! than behind a config crate.

use bitflags::bitflags;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Entries per page directory / page table in the 2-level canonical tree.
pub const TABLE_ENTRIES: usize = 512;

/// Upper bound on directory slots a canonical tree will grow to, a sanity
/// cap rather than a real limit: covers linear addresses up to
/// `MAX_DIRECTORY_ENTRIES * TABLE_ENTRIES * PAGE_SIZE` (2 TiB at the
/// constants above), well past `MMAP_BAND_END`.
pub const MAX_DIRECTORY_ENTRIES: usize = 1 << 20;

/// Start of the code-segment (executable) mmap band.
pub const CODE_MMAP_BASE: u64 = 0x0000_1000_0000;
/// Start of the data-segment (non-executable) mmap band.
pub const DATA_MMAP_BASE: u64 = 0x0000_4000_0000;
/// One past the end of the usable cartel address space.
pub const MMAP_BAND_END: u64 = 0x0000_8000_0000;

/// Number of slots in a cartel's swap request ring.
pub const SWAP_RING_SLOTS: usize = 64;

/// Machine page number (physical frame index).
pub type Mpn = u64;
/// Guest physical page number.
pub type Ppn = u64;
/// Linear page number within a cartel's address space.
pub type Lpn = u64;
/// Identifier for a swap-device slot.
pub type SlotId = u32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

impl Prot {
    pub const NONE: Prot = Prot::empty();
}

/// Linear address, always handled page-aligned at API boundaries.
pub type VirtAddr = u64;

/// Stable arena index for a region descriptor. `InUse` PTEs carry this
/// instead of a pointer, so a region and the PTEs pointing into it never
/// form a raw-pointer cycle that would complicate teardown ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub u32);

#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE as u64 - 1) == 0
}

#[inline]
pub const fn align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

#[inline]
pub const fn align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

#[inline]
pub const fn pages_for(len: u64) -> u64 {
    align_up(len) / PAGE_SIZE as u64
}

#[inline]
pub const fn lpn_of(va: VirtAddr) -> Lpn {
    va >> PAGE_SHIFT
}

/// What category of usage quota a region's backing charges against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageCategory {
    Anonymous,
    Shared,
    Kernel,
    Uncounted,
}

/// How a region's pages are materialized on first touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    Anonymous,
    FileBacked,
    GuestPhysical,
    MemTest,
    KernelText,
    ThreadData,
}

impl BackingKind {
    pub fn usage_category(self) -> UsageCategory {
        match self {
            BackingKind::Anonymous | BackingKind::ThreadData => UsageCategory::Anonymous,
            BackingKind::FileBacked | BackingKind::GuestPhysical => UsageCategory::Shared,
            BackingKind::KernelText => UsageCategory::Kernel,
            BackingKind::MemTest => UsageCategory::Uncounted,
        }
    }
}

bitflags! {
    /// `mmap` request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const FIXED   = 1 << 0;
        const ANON    = 1 << 1;
        const LOCKED  = 1 << 2;
        const PRIVATE = 1 << 3;
        const SHARED  = 1 << 4;
    }
}

bitflags! {
    /// `mremap` request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RemapFlags: u32 {
        const MAY_MOVE = 1 << 0;
    }
}

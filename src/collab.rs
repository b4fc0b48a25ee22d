//! Traits for the external collaborators the core consumes.
//!
//! Physical memory allocation policy, swap device layout, NUMA placement,
//! and backing-object I/O all live outside this crate; the core only needs
//! to call them. A hosting hypervisor wires concrete implementations; tests
//! wire in-memory mocks (see each module's `#[cfg(test)]` section).

use crate::error::MmResult;
use crate::types::{Mpn, Ppn, SlotId, UsageCategory};

/// Physical frame allocation, reached for every fault page-in and COW copy.
pub trait FrameSource {
    fn alloc_user_frame(&self, node_hint: u32, color_hint: u32) -> Option<Mpn>;
    fn free_user_frame(&self, mpn: Mpn);
    /// Zero a frame's contents in place. Used for anonymous page-in.
    fn zero_frame(&self, mpn: Mpn);
    /// Copy `src` into `dst`, both full pages. Used by COW break.
    fn copy_frame(&self, src: Mpn, dst: Mpn);
    /// A host-mapped byte view of `mpn`'s contents, one page long. The core
    /// never holds a raw pointer to physical memory itself; this is the one
    /// seam where a file-backed page-in writes content into a frame.
    fn frame_bytes_mut(&self, mpn: Mpn) -> &mut [u8];
}

/// Opaque key identifying the content of a page for opportunistic sharing.
pub type PshareKey = u64;

/// Content-addressed sharing of identical read-only anonymous/file pages.
pub trait PageShare {
    fn hash(&self, mpn: Mpn) -> PshareKey;
    /// Folds `mpn` into the share table under `key`, returning the frame to
    /// map (may be a different, already-shared frame) and the new refcount.
    fn add(&self, key: PshareKey, mpn: Mpn) -> (Mpn, u32);
    fn lookup_by_mpn(&self, mpn: Mpn) -> Option<(PshareKey, u32)>;
    /// Removes one reference; returns the remaining count.
    fn remove(&self, key: PshareKey, mpn: Mpn) -> u32;
}

/// The swap device: durable storage for evicted pages.
pub trait SwapDevice {
    fn write(&self, world: u64, slot_hint: Option<SlotId>, lpn: u64, mpn: Mpn) -> MmResult<SlotId>;
    fn read(&self, slot: SlotId, mpn: Mpn) -> MmResult<()>;
    fn free_slot(&self, slot: SlotId);
    fn enabled(&self) -> bool;
}

/// Per-world usage accounting and admission control, plus the blocking
/// primitives the fault handler / swap engine use at suspension points.
/// `block_on`/`wake_all` stand in for "release the cartel lock and sleep on
/// a scheduler wait channel" — the core never talks to a real CPU scheduler
/// directly.
pub trait MemScheduler {
    fn admit(&self, world: u64, category: UsageCategory, delta: i64) -> bool;
    fn pageable_usage(&self, world: u64) -> u64;
    fn shared_usage(&self, world: u64) -> u64;
    fn swapped_usage(&self, world: u64) -> u64;
    fn pinned_usage(&self, world: u64) -> u64;
    fn account(&self, world: u64, category: UsageCategory, delta: i64);
    fn account_swapped(&self, world: u64, delta: i64);
    fn account_shared(&self, world: u64, delta: i64);
    fn account_pinned(&self, world: u64, delta: i64);

    /// Block the calling thread on `channel` until woken. Must be called
    /// with the cartel lock already released by the caller.
    fn block_on(&self, channel: u64);
    fn wake_all(&self, channel: u64);
}

/// TLB coherence. Must be called after any mutation that clears or demotes
/// a PTE visible to another CPU, before the frame is reused.
pub trait TlbShootdown {
    fn flush_cartel(&self, cartel_id: u64);
    fn invalidate_page(&self, cartel_id: u64, va: u64);
}

/// File-backed region content.
pub trait BackingStore {
    /// Reads up to one page's worth of bytes at `offset` into `buf`,
    /// returning the number of bytes actually read (short reads are
    /// zero-padded by the caller).
    fn read_page(&self, handle: u64, offset: u64, buf: &mut [u8]) -> MmResult<usize>;
    fn writable(&self, handle: u64) -> bool;
}

/// Guest-physical-memory resolution for virtualized guests.
pub trait GuestPhys {
    fn resolve(&self, vmm_leader: u64, ppn: Ppn) -> MmResult<Mpn>;
}

/// Hash used to key swap-engine wait channels: `hash(cartel_id, lpn)`.
#[inline]
pub fn wait_channel(cartel_id: u64, lpn: u64) -> u64 {
    // FNV-1a, good enough for a wait-channel key (no adversarial input).
    let mut h: u64 = 0xcbf29ce484222325;
    for byte in cartel_id.to_le_bytes().iter().chain(lpn.to_le_bytes().iter()) {
        h ^= *byte as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

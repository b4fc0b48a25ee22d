//! PTE codec — pure, leaf utility.
//!
//! Packs the semantic PTE state into one `u64` word. Low bits carry a tag
//! plus small flags; the high bits carry whichever payload the tag implies
//! (MPN, region id, or swap slot) — a region pointer and a swap slot never
//! collide because the tag is checked first.
//!
//! Every mutation replaces the whole word in one assignment, so a concurrent
//! reader (another CPU walking the same table) never observes a torn state.

use crate::types::{Mpn, Prot, RegionId, SlotId};

const TAG_BITS: u64 = 3;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

const TAG_EMPTY: u64 = 0;
const TAG_IN_USE: u64 = 1;
const TAG_PRESENT: u64 = 2;
const TAG_SWAPPING: u64 = 3;
const TAG_SWAPPED: u64 = 4;

const PROT_SHIFT: u64 = 3;
const PROT_MASK: u64 = 0b111;

const PINNED_BIT: u64 = 1 << 6;
const SHARED_BIT: u64 = 1 << 7;
const HW_WRITE_BIT: u64 = 1 << 8;
const ACCESSED_BIT: u64 = 1 << 9;
const SWAP_HAS_MPN_BIT: u64 = 1 << 10;

const PAYLOAD_SHIFT: u64 = 16;

/// One page-table entry, as a single atomic-sized word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Pte(u64);

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Pte").field(&self.decode()).finish()
    }
}

/// Decoded, ergonomic view of a [`Pte`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteState {
    Empty,
    InUse { region: RegionId, prot: Prot },
    Present {
        mpn: Mpn,
        prot: Prot,
        pinned: bool,
        shared: bool,
        hw_write_enabled: bool,
        accessed: bool,
    },
    /// `mpn.is_some()` ⇒ outbound (content still resident); `None` ⇒ inbound.
    Swapping { mpn: Option<Mpn>, prot: Prot },
    Swapped { slot: SlotId, prot: Prot },
}

impl Default for Pte {
    fn default() -> Self {
        Pte::empty()
    }
}

impl Pte {
    pub const fn empty() -> Self {
        Pte(TAG_EMPTY)
    }

    #[inline]
    fn tag(self) -> u64 {
        self.0 & TAG_MASK
    }

    #[inline]
    fn payload(self) -> u64 {
        self.0 >> PAYLOAD_SHIFT
    }

    #[inline]
    fn prot(self) -> Prot {
        Prot::from_bits_truncate(((self.0 >> PROT_SHIFT) & PROT_MASK) as u8)
    }

    pub fn is_empty(self) -> bool {
        self.tag() == TAG_EMPTY
    }

    pub fn is_present(self) -> bool {
        self.tag() == TAG_PRESENT
    }

    pub fn is_in_use(self) -> bool {
        self.tag() == TAG_IN_USE
    }

    pub fn is_swapping(self) -> bool {
        self.tag() == TAG_SWAPPING
    }

    pub fn is_swapped(self) -> bool {
        self.tag() == TAG_SWAPPED
    }

    pub fn decode(self) -> PteState {
        match self.tag() {
            TAG_EMPTY => PteState::Empty,
            TAG_IN_USE => PteState::InUse {
                region: RegionId(self.payload() as u32),
                prot: self.prot(),
            },
            TAG_PRESENT => PteState::Present {
                mpn: self.payload(),
                prot: self.prot(),
                pinned: self.0 & PINNED_BIT != 0,
                shared: self.0 & SHARED_BIT != 0,
                hw_write_enabled: self.0 & HW_WRITE_BIT != 0,
                accessed: self.0 & ACCESSED_BIT != 0,
            },
            TAG_SWAPPING => PteState::Swapping {
                mpn: if self.0 & SWAP_HAS_MPN_BIT != 0 {
                    Some(self.payload())
                } else {
                    None
                },
                prot: self.prot(),
            },
            TAG_SWAPPED => PteState::Swapped {
                slot: self.payload() as u32,
                prot: self.prot(),
            },
            _ => unreachable!("only 5 tags are ever stored"),
        }
    }

    /// Present fault: `mpn`, `prot`, `pinned`. If `defer_write` and `prot`
    /// includes WRITE, the hardware-write bit stays clear so the first
    /// write re-faults (forces COW-break evaluation / latent share check).
    pub fn set_present(mpn: Mpn, prot: Prot, pinned: bool, defer_write: bool) -> Pte {
        let hw_write = prot.contains(Prot::WRITE) && !defer_write;
        Pte::present_raw(mpn, prot, pinned, false, hw_write, false)
    }

    fn present_raw(
        mpn: Mpn,
        prot: Prot,
        pinned: bool,
        shared: bool,
        hw_write_enabled: bool,
        accessed: bool,
    ) -> Pte {
        let mut word = TAG_PRESENT | ((prot.bits() as u64 & PROT_MASK) << PROT_SHIFT);
        if pinned {
            word |= PINNED_BIT;
        }
        if shared {
            word |= SHARED_BIT;
        }
        if hw_write_enabled {
            word |= HW_WRITE_BIT;
        }
        if accessed {
            word |= ACCESSED_BIT;
        }
        word |= mpn << PAYLOAD_SHIFT;
        Pte(word)
    }

    pub fn set_in_use(prot: Prot, region: RegionId) -> Pte {
        let word = TAG_IN_USE
            | ((prot.bits() as u64 & PROT_MASK) << PROT_SHIFT)
            | ((region.0 as u64) << PAYLOAD_SHIFT);
        Pte(word)
    }

    pub fn set_swap_busy(maybe_mpn: Option<Mpn>, saved_prot: Prot) -> Pte {
        let mut word = TAG_SWAPPING | ((saved_prot.bits() as u64 & PROT_MASK) << PROT_SHIFT);
        if let Some(mpn) = maybe_mpn {
            word |= SWAP_HAS_MPN_BIT;
            word |= mpn << PAYLOAD_SHIFT;
        }
        Pte(word)
    }

    pub fn set_swapped(slot: SlotId, prot: Prot) -> Pte {
        let word = TAG_SWAPPED
            | ((prot.bits() as u64 & PROT_MASK) << PROT_SHIFT)
            | ((slot as u64) << PAYLOAD_SHIFT);
        Pte(word)
    }

    pub fn clear(&mut self) {
        *self = Pte::empty();
    }

    /// Sets the hardware-write bit. Returns whether this changed the state
    /// (i.e. a TLB flush is owed) — a no-op on a non-Present PTE.
    pub fn enable_write(&mut self) -> bool {
        match self.decode() {
            PteState::Present { hw_write_enabled: false, mpn, prot, pinned, shared, accessed } => {
                *self = Pte::present_raw(mpn, prot, pinned, shared, true, accessed);
                true
            }
            _ => false,
        }
    }

    /// Clears the hardware-write bit. Returns whether this changed the state.
    pub fn disable_write(&mut self) -> bool {
        match self.decode() {
            PteState::Present { hw_write_enabled: true, mpn, prot, pinned, shared, accessed } => {
                *self = Pte::present_raw(mpn, prot, pinned, shared, false, accessed);
                true
            }
            _ => false,
        }
    }

    pub fn set_accessed(&mut self, accessed: bool) {
        if let PteState::Present { mpn, prot, pinned, shared, hw_write_enabled, .. } = self.decode() {
            *self = Pte::present_raw(mpn, prot, pinned, shared, hw_write_enabled, accessed);
        }
    }

    pub fn clear_accessed_if_set(&mut self) -> bool {
        if let PteState::Present { accessed: true, .. } = self.decode() {
            self.set_accessed(false);
            true
        } else {
            false
        }
    }

    pub fn mark_shared(&mut self, shared: bool) {
        if let PteState::Present { mpn, prot, pinned, hw_write_enabled, accessed, .. } = self.decode() {
            *self = Pte::present_raw(mpn, prot, pinned, shared, hw_write_enabled, accessed);
        }
    }

    /// Rewrites the stored protection in place, preserving tag and payload.
    /// A no-op on an Empty PTE (there is nothing to rewrite).
    pub fn rewrite_prot(&mut self, prot: Prot) {
        match self.decode() {
            PteState::InUse { region, .. } => *self = Pte::set_in_use(prot, region),
            PteState::Present { mpn, pinned, shared, hw_write_enabled, accessed, .. } => {
                *self = Pte::present_raw(mpn, prot, pinned, shared, hw_write_enabled, accessed);
            }
            PteState::Swapping { mpn, .. } => *self = Pte::set_swap_busy(mpn, prot),
            PteState::Swapped { slot, .. } => *self = Pte::set_swapped(slot, prot),
            PteState::Empty => {}
        }
    }

    pub fn prot_of(self) -> Option<Prot> {
        match self.decode() {
            PteState::Empty => None,
            PteState::InUse { prot, .. }
            | PteState::Present { prot, .. }
            | PteState::Swapping { prot, .. }
            | PteState::Swapped { prot, .. } => Some(prot),
        }
    }
}

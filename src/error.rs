//! Error kinds for the cartel memory manager.
//!
//! A plain `Copy` enum with a hand-written `Display`, no `std::error::Error`
//! impl — this crate is `no_std` and has no use for an error-derive crate.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// Alignment, zero length, address wraparound, invalid prot combination.
    BadParam,
    /// No region covers this address, or the PTE raced back to Empty.
    InvalidAddress,
    /// Backing object was closed underneath an in-flight operation.
    InvalidHandle,
    /// Protection forbids the requested operation.
    NoAccess,
    /// Out of kernel heap, frames, or swap slots.
    NoMemory,
    /// Out of kernel resources needed to materialize a page directory/table.
    NoResources,
    /// Transient: caller should free-then-retry (raised by `clear_range`).
    NoMemoryRetry,
    /// Quota or address-space limit exceeded.
    LimitExceeded,
    /// Range already mapped and overwrite was not requested.
    AlreadyExists,
    /// Refcount non-zero, object in use, or a swap-in is racing a move.
    Busy,
    /// Non-blocking operation could not complete synchronously.
    WouldBlock,
    /// Connect/operation already in progress.
    Pending,
    /// Internal: a swap request was cancelled. Never surfaced to callers.
    Cancelled,
    /// Operation unreachable for this region type.
    NotSupported,
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub type MmResult<T> = Result<T, MmError>;

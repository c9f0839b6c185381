// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory primitives for Sv39: frames, page tables, address spaces and
//! the demand-paging fault path.

pub mod address_space;
pub mod fault;
pub mod frame;
pub mod page_table;

pub use address_space::{AddressSpace, GrowError};
pub use fault::{handle_fault, FaultError, FaultPolicy, LazyPolicy, LocalityPolicy, Policy};
pub use frame::{Frame, FrameAllocator, FrameError, FramePool, Memory, PhysMemory};
pub use page_table::{MapError, PageFlags, PageTable};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// First address above the user region; everything from here up belongs to the kernel.
pub const USER_TOP: usize = 0x8000_0000;

/// Rounds `addr` down to its page boundary.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary.
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    addr.saturating_add(PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests_prop;

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table implementation with lazy allocation of intermediate levels.
//!
//! Table pages are ordinary frames obtained from the caller's allocator and
//! entries live inside them, so a table is only meaningful together with the
//! [`Memory`] it was built in.

use alloc::vec::Vec;

use bitflags::bitflags;

use super::frame::{Frame, FrameAllocator, FrameError, Memory, PhysMemory};
use super::{page_round_down, PAGE_SIZE};

/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
const PPN_SHIFT: usize = 10;
const FLAG_MASK: usize = (1 << PPN_SHIFT) - 1;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

/// Permissions for ordinary user data pages.
pub const USER_RW: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::USER);

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Physical address was not page aligned.
    #[error("physical address not page aligned")]
    Unaligned,
    /// Mapping extends beyond the canonical Sv39 range.
    #[error("mapping outside canonical Sv39 range")]
    OutOfRange,
    /// Mapping violates the W^X policy.
    #[error("mapping would be both writable and executable")]
    PermissionDenied,
    /// Flags do not describe a valid leaf entry.
    #[error("flags do not describe a leaf entry")]
    InvalidFlags,
    /// An intermediate table frame could not be allocated.
    #[error("out of frames for page-table pages")]
    AllocationFailure,
}

impl From<FrameError> for MapError {
    fn from(_: FrameError) -> Self {
        Self::AllocationFailure
    }
}

/// Three-level Sv39 page table allocating intermediate levels on demand.
#[derive(Debug)]
pub struct PageTable {
    root: Frame,
    tables: Vec<Frame>,
}

impl PageTable {
    /// Creates an empty page table with a fresh, zeroed root page.
    pub fn new<M: Memory + ?Sized>(mem: &M) -> Result<Self, FrameError> {
        let root = mem.acquire()?;
        mem.fill(root, 0);
        Ok(Self { root, tables: Vec::new() })
    }

    /// Root table frame.
    pub fn root(&self) -> Frame {
        self.root
    }

    /// Returns the physical page number of the root page suitable for SATP.
    pub fn root_ppn(&self) -> usize {
        self.root.ppn()
    }

    /// Number of frames used by table pages, root included.
    pub fn table_frames(&self) -> usize {
        1 + self.tables.len()
    }

    /// Returns the raw leaf entry for the page containing `va`, if present.
    pub fn lookup<M: PhysMemory + ?Sized>(&self, mem: &M, va: usize) -> Option<usize> {
        let (table, index) = self.walk(mem, va)?;
        let entry = mem.read_word(table, index) as usize;
        (entry & PageFlags::VALID.bits() != 0).then_some(entry)
    }

    /// Translates `va` to its physical address and leaf flags.
    pub fn translate<M: PhysMemory + ?Sized>(&self, mem: &M, va: usize) -> Option<(usize, PageFlags)> {
        let entry = self.lookup(mem, va)?;
        let pa = Frame::from_ppn(entry >> PPN_SHIFT).addr() + va % PAGE_SIZE;
        Some((pa, PageFlags::from_bits_truncate(entry & FLAG_MASK)))
    }

    /// Whether the page containing `va` has a present mapping.
    pub fn is_mapped<M: PhysMemory + ?Sized>(&self, mem: &M, va: usize) -> bool {
        self.lookup(mem, va).is_some()
    }

    /// Maps every page covering `[va, va + len)` to consecutive frames from `pa`.
    ///
    /// `va` need not be aligned; `pa` must be. `VALID` is added to `flags`.
    /// Pages written before a failure stay mapped; callers treat any error as
    /// leaving the address space dirty.
    ///
    /// # Panics
    ///
    /// Panics if a covered page is already present. Double mapping means frame
    /// bookkeeping is corrupt.
    pub fn map<M: Memory + ?Sized>(
        &mut self,
        mem: &M,
        va: usize,
        len: usize,
        pa: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if len == 0 {
            return Ok(());
        }
        if pa % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        let end = va.checked_add(len - 1).ok_or(MapError::OutOfRange)?;
        if !is_canonical_sv39(va) || !is_canonical_sv39(end) || (va >> 38) != (end >> 38) {
            return Err(MapError::OutOfRange);
        }
        if flags.intersection(LEAF_PERMS).is_empty() {
            return Err(MapError::InvalidFlags);
        }
        if flags.contains(PageFlags::WRITE) && flags.contains(PageFlags::EXECUTE) {
            return Err(MapError::PermissionDenied);
        }

        let flags = flags | PageFlags::VALID;
        let last = page_round_down(end);
        let mut page = page_round_down(va);
        let mut frame = pa;
        loop {
            let (table, index) = self.walk_create(mem, page)?;
            if mem.read_word(table, index) as usize & PageFlags::VALID.bits() != 0 {
                panic!("remap: va {page:#x} already mapped");
            }
            mem.write_word(table, index, ((frame / PAGE_SIZE) << PPN_SHIFT | flags.bits()) as u64);
            if page == last {
                return Ok(());
            }
            page += PAGE_SIZE;
            frame += PAGE_SIZE;
        }
    }

    /// Clears the leaf entry for the page containing `va`, returning the frame it mapped.
    pub fn unmap<M: PhysMemory + ?Sized>(&mut self, mem: &M, va: usize) -> Option<Frame> {
        let (table, index) = self.walk(mem, va)?;
        let entry = mem.read_word(table, index) as usize;
        if entry & PageFlags::VALID.bits() == 0 {
            return None;
        }
        mem.write_word(table, index, 0);
        Some(Frame::from_ppn(entry >> PPN_SHIFT))
    }

    /// Releases every table page. Leaf frames must already have been released.
    pub fn teardown<A: FrameAllocator + ?Sized>(self, alloc: &A) {
        for table in self.tables {
            alloc.release(table);
        }
        alloc.release(self.root);
    }

    fn walk<M: PhysMemory + ?Sized>(&self, mem: &M, va: usize) -> Option<(Frame, usize)> {
        if !is_canonical_sv39(va) {
            return None;
        }
        let indices = vpn_indices(va);
        let mut table = self.root;
        for &index in &indices[..2] {
            let entry = mem.read_word(table, index) as usize;
            if entry & PageFlags::VALID.bits() == 0 || entry & LEAF_PERMS.bits() != 0 {
                return None;
            }
            table = Frame::from_ppn(entry >> PPN_SHIFT);
        }
        Some((table, indices[2]))
    }

    fn walk_create<M: Memory + ?Sized>(&mut self, mem: &M, va: usize) -> Result<(Frame, usize), MapError> {
        let indices = vpn_indices(va);
        let mut table = self.root;
        for &index in &indices[..2] {
            let entry = mem.read_word(table, index) as usize;
            if entry & PageFlags::VALID.bits() != 0 {
                if entry & LEAF_PERMS.bits() != 0 {
                    panic!("remap: va {va:#x} covered by a superpage");
                }
                table = Frame::from_ppn(entry >> PPN_SHIFT);
                continue;
            }
            let next = mem.acquire()?;
            mem.fill(next, 0);
            self.tables.push(next);
            mem.write_word(table, index, (next.ppn() << PPN_SHIFT | PageFlags::VALID.bits()) as u64);
            table = next;
        }
        Ok((table, indices[2]))
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// Table indices for `va`, root level first.
fn vpn_indices(va: usize) -> [usize; 3] {
    let vpn2 = (va >> 30) & (PT_ENTRIES - 1);
    let vpn1 = (va >> 21) & (PT_ENTRIES - 1);
    let vpn0 = (va >> 12) & (PT_ENTRIES - 1);
    [vpn2, vpn1, vpn0]
}

fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}

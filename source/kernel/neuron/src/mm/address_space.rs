// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process user address space and its growth contract
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, GrowError
//! INVARIANTS:
//!   - Every present user mapping lies below `page_round_up(size)`
//!   - `floor <= size`; the loaded image is never released by shrinking
//!   - Growing never maps frames; shrinking unmaps and releases immediately
//!
//! Pages in `[floor, size)` may legitimately be unmapped until first touch;
//! `mm::fault` materializes them.

use super::frame::{Frame, FrameError, Memory, PhysMemory};
use super::page_table::{MapError, PageFlags, PageTable, USER_RW};
use super::{page_round_up, PAGE_SIZE, USER_TOP};

/// Errors reported by the growth contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GrowError {
    /// Shrinking would release part of the loaded image.
    #[error("shrink below loaded image")]
    ShrinkBelowFloor,
    /// Growth would reach into the kernel region.
    #[error("growth beyond user address range")]
    OutOfRange,
    /// Frames ran out while loading or mapping.
    #[error("out of memory")]
    OutOfMemory,
}

impl From<FrameError> for GrowError {
    fn from(_: FrameError) -> Self {
        Self::OutOfMemory
    }
}

impl From<MapError> for GrowError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::AllocationFailure => Self::OutOfMemory,
            _ => Self::OutOfRange,
        }
    }
}

/// User address space: page table plus logical size.
#[derive(Debug)]
pub struct AddressSpace {
    page_table: PageTable,
    size: usize,
    floor: usize,
}

impl AddressSpace {
    /// Creates an empty address space.
    pub fn new<M: Memory + ?Sized>(mem: &M) -> Result<Self, FrameError> {
        Ok(Self { page_table: PageTable::new(mem)?, size: 0, floor: 0 })
    }

    /// Creates an address space with `image` eagerly mapped from address 0.
    ///
    /// The image region becomes the floor that shrinking may not cross.
    pub fn with_image<M: Memory + ?Sized>(mem: &M, image: &[u8]) -> Result<Self, GrowError> {
        if image.len() > USER_TOP {
            return Err(GrowError::OutOfRange);
        }
        let mut space = Self::new(mem)?;
        for (index, chunk) in image.chunks(PAGE_SIZE).enumerate() {
            let va = index * PAGE_SIZE;
            if let Err(err) = space.load_page(mem, va, chunk) {
                log::error!(target: "mm", "image load failed at {va:#x}: {err}");
                space.destroy(mem);
                return Err(err);
            }
            space.size = va + PAGE_SIZE;
        }
        space.size = page_round_up(image.len());
        space.floor = space.size;
        Ok(space)
    }

    fn load_page<M: Memory + ?Sized>(&mut self, mem: &M, va: usize, bytes: &[u8]) -> Result<(), GrowError> {
        let frame = mem.acquire()?;
        mem.fill(frame, 0);
        mem.write(frame, 0, bytes);
        if let Err(err) = self.page_table.map(mem, va, PAGE_SIZE, frame.addr(), USER_RW) {
            mem.release(frame);
            return Err(err.into());
        }
        Ok(())
    }

    /// Logical end of valid user addresses.
    pub fn size(&self) -> usize {
        self.size
    }

    /// End of the loaded image.
    pub fn floor(&self) -> usize {
        self.floor
    }

    /// Borrows the page table for read-only inspection.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub(crate) fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    /// Whether the page containing `va` is backed by a frame.
    pub fn is_resident<M: PhysMemory + ?Sized>(&self, mem: &M, va: usize) -> bool {
        self.page_table.is_mapped(mem, va)
    }

    /// Number of backed pages below the logical size.
    pub fn resident_pages<M: PhysMemory + ?Sized>(&self, mem: &M) -> usize {
        (0..page_round_up(self.size))
            .step_by(PAGE_SIZE)
            .filter(|&va| self.is_resident(mem, va))
            .count()
    }

    /// Translates `va` through the page table.
    pub fn translate<M: PhysMemory + ?Sized>(&self, mem: &M, va: usize) -> Option<(usize, PageFlags)> {
        self.page_table.translate(mem, va)
    }

    /// Changes the logical size by `delta` bytes and returns the previous size.
    ///
    /// Positive growth only moves `size`; frames arrive on first touch.
    /// Negative growth unmaps and releases every frame in the relinquished
    /// pages before returning.
    pub fn grow<M: Memory + ?Sized>(&mut self, mem: &M, delta: isize) -> Result<usize, GrowError> {
        let old = self.size;
        if delta >= 0 {
            let new = old
                .checked_add(delta.unsigned_abs())
                .filter(|&new| new <= USER_TOP)
                .ok_or(GrowError::OutOfRange)?;
            self.size = new;
        } else {
            let new = old
                .checked_sub(delta.unsigned_abs())
                .filter(|&new| new >= self.floor)
                .ok_or(GrowError::ShrinkBelowFloor)?;
            let released = self.release_range(mem, new, old);
            self.size = new;
            log::debug!(target: "mm", "shrink released {released} frames");
        }
        log::debug!(target: "mm", "grow {old:#x} -> {:#x}", self.size);
        Ok(old)
    }

    /// Unmaps and releases the frames of pages in `[round_up(from), round_up(to))`.
    fn release_range<M: Memory + ?Sized>(&mut self, mem: &M, from: usize, to: usize) -> usize {
        let mut released = 0;
        let mut va = page_round_up(from);
        while va < to {
            if let Some(frame) = self.page_table.unmap(mem, va) {
                mem.release(frame);
                released += 1;
            }
            va += PAGE_SIZE;
        }
        released
    }

    /// Releases every user frame and table page.
    pub fn destroy<M: Memory + ?Sized>(mut self, mem: &M) {
        let released = self.release_range(mem, 0, self.size);
        log::debug!(target: "mm", "destroy released {released} user frames");
        self.page_table.teardown(mem);
    }

    /// Frame backing the page containing `va`, if any.
    pub fn frame_at<M: PhysMemory + ?Sized>(&self, mem: &M, va: usize) -> Option<Frame> {
        self.translate(mem, va).map(|(pa, _)| Frame::containing(pa))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::{FrameAllocator, FramePool};

    #[test]
    fn growth_is_lazy() {
        let pool = FramePool::new(8);
        let mut space = AddressSpace::new(&pool).expect("space");
        let free = pool.free_frames();
        assert_eq!(space.grow(&pool, 4 * PAGE_SIZE as isize), Ok(0));
        assert_eq!(space.size(), 4 * PAGE_SIZE);
        assert_eq!(pool.free_frames(), free);
        assert_eq!(space.resident_pages(&pool), 0);
    }

    #[test]
    fn growth_past_user_top_rejected() {
        let pool = FramePool::new(2);
        let mut space = AddressSpace::new(&pool).expect("space");
        assert_eq!(space.grow(&pool, USER_TOP as isize + 1), Err(GrowError::OutOfRange));
        assert_eq!(space.size(), 0);
    }

    #[test]
    fn image_sets_floor_and_is_resident() {
        let pool = FramePool::new(8);
        let space = AddressSpace::with_image(&pool, &[0xaa; PAGE_SIZE + 10]).expect("image");
        assert_eq!(space.size(), 2 * PAGE_SIZE);
        assert_eq!(space.floor(), 2 * PAGE_SIZE);
        assert_eq!(space.resident_pages(&pool), 2);
        let frame = space.frame_at(&pool, PAGE_SIZE).expect("mapped");
        let mut tail = [0u8; 2];
        pool.read(frame, 9, &mut tail);
        assert_eq!(tail, [0xaa, 0]);
    }

    #[test]
    fn shrink_below_floor_rejected_without_side_effects() {
        let pool = FramePool::new(8);
        let mut space = AddressSpace::with_image(&pool, &[1; PAGE_SIZE]).expect("image");
        space.grow(&pool, PAGE_SIZE as isize).expect("grow");
        assert_eq!(space.grow(&pool, -(2 * PAGE_SIZE as isize)), Err(GrowError::ShrinkBelowFloor));
        assert_eq!(space.size(), 2 * PAGE_SIZE);
        assert!(space.is_resident(&pool, 0));
    }

    #[test]
    fn shrink_releases_relinquished_frames() {
        let pool = FramePool::new(8);
        let mut space = AddressSpace::new(&pool).expect("space");
        space.grow(&pool, 3 * PAGE_SIZE as isize).expect("grow");
        for va in [0, PAGE_SIZE, 2 * PAGE_SIZE] {
            let frame = pool.acquire().expect("frame");
            space.page_table_mut().map(&pool, va, PAGE_SIZE, frame.addr(), USER_RW).expect("map");
        }
        let free = pool.free_frames();
        assert_eq!(space.grow(&pool, -(2 * PAGE_SIZE as isize)), Ok(3 * PAGE_SIZE));
        assert_eq!(pool.free_frames(), free + 2);
        assert!(space.is_resident(&pool, 0));
        assert!(!space.is_resident(&pool, PAGE_SIZE));
    }

    #[test]
    fn partial_page_shrink_keeps_straddling_page() {
        let pool = FramePool::new(8);
        let mut space = AddressSpace::new(&pool).expect("space");
        space.grow(&pool, 2 * PAGE_SIZE as isize).expect("grow");
        let frame = pool.acquire().expect("frame");
        space.page_table_mut().map(&pool, 0, PAGE_SIZE, frame.addr(), USER_RW).expect("map");
        space.grow(&pool, -(PAGE_SIZE as isize + 100)).expect("shrink");
        assert_eq!(space.size(), PAGE_SIZE - 100);
        assert!(space.is_resident(&pool, 0));
    }

    #[test]
    fn destroy_returns_every_frame() {
        let pool = FramePool::new(16);
        let mut space = AddressSpace::with_image(&pool, &[7; 3 * PAGE_SIZE]).expect("image");
        space.grow(&pool, PAGE_SIZE as isize).expect("grow");
        space.destroy(&pool);
        assert_eq!(pool.free_frames(), pool.capacity());
    }

    #[test]
    fn image_load_failure_leaks_nothing() {
        // root + two intermediate tables + one data page fit; the second page does not.
        let pool = FramePool::new(4);
        let err = AddressSpace::with_image(&pool, &[0; 2 * PAGE_SIZE]).expect_err("oom");
        assert_eq!(err, GrowError::OutOfMemory);
        assert_eq!(pool.free_frames(), pool.capacity());
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame allocation and byte access
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Frame, FrameAllocator, PhysMemory, Memory, FramePool
//! INVARIANTS:
//!   - A frame is owned by at most one holder between `acquire` and `release`
//!   - Releasing a frame the pool does not consider owned is a kernel bug (panic)
//!   - Released and never-used frames hold junk bytes, never stale zeroes
//!
//! The pool simulates physical RAM starting at [`POOL_BASE`]. Page tables store
//! real physical page numbers, so every walk goes through [`PhysMemory`].

use alloc::{vec, vec::Vec};

use spin::Mutex;
use static_assertions::const_assert_eq;

use super::PAGE_SIZE;

// Page-table entries are read back as 64-bit words.
const_assert_eq!(core::mem::size_of::<usize>(), 8);

/// Physical address of the first frame in a [`FramePool`].
pub const POOL_BASE: usize = 0x8800_0000;
/// Fill byte for frames not currently owned.
pub const JUNK_BYTE: u8 = 0x01;

/// Page-aligned physical frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(usize);

impl Frame {
    /// Frame starting at `pa`, if page aligned.
    pub const fn from_addr(pa: usize) -> Option<Self> {
        if pa % PAGE_SIZE == 0 {
            Some(Self(pa))
        } else {
            None
        }
    }

    /// Frame containing `pa`.
    pub const fn containing(pa: usize) -> Self {
        Self(pa & !(PAGE_SIZE - 1))
    }

    /// Frame with physical page number `ppn`.
    pub const fn from_ppn(ppn: usize) -> Self {
        Self(ppn * PAGE_SIZE)
    }

    /// Physical base address.
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Physical page number.
    pub const fn ppn(self) -> usize {
        self.0 / PAGE_SIZE
    }
}

/// Allocation failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// No free frame remains.
    #[error("out of physical frames")]
    OutOfMemory,
}

/// Narrow acquire/release capability over physical frames.
pub trait FrameAllocator {
    /// Hands out a frame no other holder owns.
    fn acquire(&self) -> Result<Frame, FrameError>;

    /// Returns `frame`. The caller must own it.
    fn release(&self, frame: Frame);
}

/// Byte access to physical frames.
pub trait PhysMemory {
    /// Sets every byte of `frame` to `byte`.
    fn fill(&self, frame: Frame, byte: u8);

    /// Copies `buf.len()` bytes starting at `offset` within `frame`.
    fn read(&self, frame: Frame, offset: usize, buf: &mut [u8]);

    /// Copies `data` into `frame` at `offset`.
    fn write(&self, frame: Frame, offset: usize, data: &[u8]);

    /// Reads the little-endian word at `index`.
    fn read_word(&self, frame: Frame, index: usize) -> u64 {
        let mut raw = [0u8; 8];
        self.read(frame, index * 8, &mut raw);
        u64::from_le_bytes(raw)
    }

    /// Writes `value` as the little-endian word at `index`.
    fn write_word(&self, frame: Frame, index: usize, value: u64) {
        self.write(frame, index * 8, &value.to_le_bytes());
    }
}

/// Everything a mapping path needs: allocation plus byte access.
pub trait Memory: FrameAllocator + PhysMemory {}

impl<T: FrameAllocator + PhysMemory + ?Sized> Memory for T {}

struct PoolState {
    free: Vec<usize>,
    owned: Vec<bool>,
}

/// Fixed-capacity frame pool with a LIFO free list.
pub struct FramePool {
    base: usize,
    state: Mutex<PoolState>,
    memory: Mutex<Vec<[u8; PAGE_SIZE]>>,
}

impl FramePool {
    /// Creates a pool of `frames` frames, all free and junk filled.
    pub fn new(frames: usize) -> Self {
        // Lowest frame on top of the stack so allocation order is predictable.
        let free = (0..frames).rev().collect();
        Self {
            base: POOL_BASE,
            state: Mutex::new(PoolState { free, owned: vec![false; frames] }),
            memory: Mutex::new(vec![[JUNK_BYTE; PAGE_SIZE]; frames]),
        }
    }

    /// Total number of frames.
    pub fn capacity(&self) -> usize {
        self.state.lock().owned.len()
    }

    /// Number of frames currently free.
    pub fn free_frames(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Whether `frame` is currently handed out.
    pub fn is_owned(&self, frame: Frame) -> bool {
        let state = self.state.lock();
        self.slot(frame, state.owned.len()).map_or(false, |slot| state.owned[slot])
    }

    fn slot(&self, frame: Frame, frames: usize) -> Option<usize> {
        let offset = frame.addr().checked_sub(self.base)?;
        let slot = offset / PAGE_SIZE;
        (slot < frames).then_some(slot)
    }

    fn slot_or_panic(&self, frame: Frame) -> usize {
        let frames = self.memory.lock().len();
        match self.slot(frame, frames) {
            Some(slot) => slot,
            None => panic!("frame {:#x} outside pool", frame.addr()),
        }
    }
}

impl FrameAllocator for FramePool {
    fn acquire(&self) -> Result<Frame, FrameError> {
        let mut state = self.state.lock();
        let slot = state.free.pop().ok_or(FrameError::OutOfMemory)?;
        state.owned[slot] = true;
        Ok(Frame(self.base + slot * PAGE_SIZE))
    }

    fn release(&self, frame: Frame) {
        let slot = self.slot_or_panic(frame);
        let mut state = self.state.lock();
        if !state.owned[slot] {
            panic!("release of unowned frame {:#x}", frame.addr());
        }
        state.owned[slot] = false;
        self.memory.lock()[slot].fill(JUNK_BYTE);
        state.free.push(slot);
    }
}

impl PhysMemory for FramePool {
    fn fill(&self, frame: Frame, byte: u8) {
        let slot = self.slot_or_panic(frame);
        self.memory.lock()[slot].fill(byte);
    }

    fn read(&self, frame: Frame, offset: usize, buf: &mut [u8]) {
        let slot = self.slot_or_panic(frame);
        buf.copy_from_slice(&self.memory.lock()[slot][offset..offset + buf.len()]);
    }

    fn write(&self, frame: Frame, offset: usize, data: &[u8]) {
        let slot = self.slot_or_panic(frame);
        self.memory.lock()[slot][offset..offset + data.len()].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_lowest_first_and_lifo() {
        let pool = FramePool::new(4);
        let a = pool.acquire().expect("frame");
        let b = pool.acquire().expect("frame");
        assert_eq!(a.addr(), POOL_BASE);
        assert_eq!(b.addr(), POOL_BASE + PAGE_SIZE);
        pool.release(a);
        assert!(!pool.is_owned(a));
        assert!(pool.is_owned(b));
        assert_eq!(pool.acquire().expect("frame"), a);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let pool = FramePool::new(1);
        let _held = pool.acquire().expect("frame");
        assert_eq!(pool.acquire(), Err(FrameError::OutOfMemory));
        assert_eq!(pool.free_frames(), 0);
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn released_frames_are_junk_filled() {
        let pool = FramePool::new(1);
        let frame = pool.acquire().expect("frame");
        pool.fill(frame, 0);
        pool.release(frame);
        let frame = pool.acquire().expect("frame");
        let mut byte = [0u8; 1];
        pool.read(frame, 123, &mut byte);
        assert_eq!(byte[0], JUNK_BYTE);
    }

    #[test]
    #[should_panic(expected = "release of unowned frame")]
    fn double_release_panics() {
        let pool = FramePool::new(2);
        let frame = pool.acquire().expect("frame");
        pool.release(frame);
        pool.release(frame);
    }

    #[test]
    fn words_round_trip_little_endian() {
        let pool = FramePool::new(1);
        let frame = pool.acquire().expect("frame");
        pool.write_word(frame, 3, 0x1122_3344_5566_7788);
        let mut raw = [0u8; 1];
        pool.read(frame, 24, &mut raw);
        assert_eq!(raw[0], 0x88);
        assert_eq!(pool.read_word(frame, 3), 0x1122_3344_5566_7788);
    }
}

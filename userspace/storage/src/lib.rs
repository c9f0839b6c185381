// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Block device and inode-store abstractions for the kernel file layer
//! OWNERS: @runtime
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (memfs) + host integration tests in downstream crates
//!
//! PUBLIC API:
//!   - BlockDevice / MemBlockDevice: raw fixed-size block access
//!   - InodeStore: read/write/update primitives plus transaction brackets
//!   - Transaction: scoped guard that ends the transaction on every exit path
//!   - FsParams / InodeLayout: format limits (max file size, per-op block budget)
//!   - MemFs: in-memory inode layer with block mapping and a bounded transaction log

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

pub mod inode;
pub mod memfs;

pub use inode::{
    FsParams, InodeId, InodeKind, InodeLayout, InodeStat, InodeStore, StorageError, Transaction,
    BLOCK_SIZE, MAX_OP_BLOCKS, NINDIRECT,
};
pub use memfs::MemFs;

/// Block device error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// Read/write failed.
    IoError,
    /// Block index out of range.
    OutOfRange,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::IoError => f.write_str("block i/o error"),
            BlockError::OutOfRange => f.write_str("block index out of range"),
        }
    }
}

/// Fixed-size block access underneath the inode layer.
pub trait BlockDevice {
    /// Block size in bytes (typically 512).
    fn block_size(&self) -> usize;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Read a single block into buffer.
    fn read_block(&self, block_idx: u64, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Write a single block from buffer.
    fn write_block(&mut self, block_idx: u64, buf: &[u8]) -> Result<(), BlockError>;
}

/// In-memory block device for testing.
pub struct MemBlockDevice {
    block_size: usize,
    blocks: Vec<Vec<u8>>,
}

impl MemBlockDevice {
    /// Create a new memory block device with given block size and count.
    pub fn new(block_size: usize, block_count: u64) -> Self {
        let blocks = (0..block_count).map(|_| vec![0u8; block_size]).collect();
        Self { block_size, blocks }
    }
}

impl BlockDevice for MemBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.blocks.len() as u64
    }

    fn read_block(&self, block_idx: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let idx = block_idx as usize;
        if idx >= self.blocks.len() {
            return Err(BlockError::OutOfRange);
        }
        if buf.len() < self.block_size {
            return Err(BlockError::IoError);
        }
        buf[..self.block_size].copy_from_slice(&self.blocks[idx]);
        Ok(())
    }

    fn write_block(&mut self, block_idx: u64, buf: &[u8]) -> Result<(), BlockError> {
        let idx = block_idx as usize;
        if idx >= self.blocks.len() {
            return Err(BlockError::OutOfRange);
        }
        if buf.len() < self.block_size {
            return Err(BlockError::IoError);
        }
        self.blocks[idx].copy_from_slice(&buf[..self.block_size]);
        Ok(())
    }
}

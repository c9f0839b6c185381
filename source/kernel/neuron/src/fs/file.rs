// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Open-file objects with sparse growth and transaction-chunked writes
//! OWNERS: @kernel-fs-team
//! PUBLIC API: File (open/seek/read/write/stat), OpenFlags, FileError
//! DEPENDS_ON: storage::{InodeStore, Transaction, FsParams}
//! INVARIANTS:
//!   - Every storage mutation happens inside a `Transaction` guard
//!   - No transaction writes more than `FsParams::write_chunk()` bytes
//!   - After a successful seek, `offset <= size`
//!   - A write reported short by the store is a fatal consistency violation
//!
//! Seeking past end of file does not leave a sparse region: the inode size is
//! committed first, then the gap is zero-filled chunk by chunk. A failure in
//! the middle leaves the file logically larger with a partly filled tail.

use core::cmp;

use bitflags::bitflags;
use storage::{InodeId, InodeKind, InodeStat, InodeStore, StorageError, Transaction, BLOCK_SIZE};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Open mode. No access bits means read-only.
    pub struct OpenFlags: u32 {
        const WRONLY = 0x001;
        const RDWR = 0x002;
        const CREATE = 0x200;
    }
}

/// File-layer failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FileError {
    /// Seek would move the cursor before the start of the file.
    #[error("negative file offset")]
    NegativeOffset,
    /// Growth beyond the storage format's maximum file size.
    #[error("size {requested} exceeds limit {limit}")]
    SizeLimitExceeded { requested: u64, limit: u64 },
    /// Only regular files grow by seeking.
    #[error("inode is not a regular file")]
    NotSeekable,
    /// Zero-filling a seek-created gap stopped short at `at`.
    #[error("zero fill stopped at offset {at}")]
    IncompleteFill { at: u64 },
    /// File not opened for reading.
    #[error("file not readable")]
    NotReadable,
    /// File not opened for writing.
    #[error("file not writable")]
    NotWritable,
    /// Storage layer failure.
    #[error("storage: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for FileError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

/// Open file: an inode plus a cursor and access mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct File {
    ino: InodeId,
    readable: bool,
    writable: bool,
    offset: u64,
}

impl File {
    /// Opens `ino` with the cursor at 0.
    pub fn open(ino: InodeId, flags: OpenFlags) -> Self {
        Self {
            ino,
            readable: !flags.contains(OpenFlags::WRONLY),
            writable: flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR),
            offset: 0,
        }
    }

    pub fn inode(&self) -> InodeId {
        self.ino
    }

    /// Current cursor.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Inode metadata.
    pub fn stat<S: InodeStore + ?Sized>(&self, store: &S) -> Result<InodeStat, FileError> {
        Ok(store.stat(self.ino)?)
    }

    /// Moves the cursor by `relative` bytes, growing the file if it lands past the end.
    ///
    /// On error the cursor does not move.
    pub fn seek<S: InodeStore + ?Sized>(&mut self, store: &mut S, relative: i64) -> Result<u64, FileError> {
        let target = i128::from(self.offset) + i128::from(relative);
        if target < 0 {
            return Err(FileError::NegativeOffset);
        }
        let limit = store.params().max_file_size();
        let target = u64::try_from(target)
            .map_err(|_| FileError::SizeLimitExceeded { requested: u64::MAX, limit })?;
        let stat = store.stat(self.ino)?;
        if target > stat.size {
            if stat.kind != InodeKind::File {
                return Err(FileError::NotSeekable);
            }
            grow(store, self.ino, stat.size, target)?;
        }
        self.offset = target;
        Ok(target)
    }

    /// Writes `buf` at the cursor in transaction-sized chunks.
    ///
    /// The cursor advances by each completed chunk, so an error part way
    /// leaves it after the last chunk that made it to storage.
    ///
    /// # Panics
    ///
    /// Panics if the store reports writing fewer bytes than asked without an error.
    pub fn write<S: InodeStore + ?Sized>(&mut self, store: &mut S, buf: &[u8]) -> Result<usize, FileError> {
        if !self.writable {
            return Err(FileError::NotWritable);
        }
        let chunk = store.params().write_chunk();
        let mut done = 0;
        while done < buf.len() {
            let n = cmp::min(chunk, buf.len() - done);
            let written = {
                let mut tx = Transaction::begin(&mut *store);
                tx.write_at(self.ino, self.offset, &buf[done..done + n])?
            };
            if written != n {
                panic!("short filewrite: {written} of {n} bytes at offset {}", self.offset);
            }
            self.offset += written as u64;
            done += written;
        }
        log::trace!(target: "fs", "ino {} wrote {done} bytes", self.ino.as_raw());
        Ok(done)
    }

    /// Reads into `buf` from the cursor and advances it by the bytes read.
    pub fn read<S: InodeStore + ?Sized>(&mut self, store: &S, buf: &mut [u8]) -> Result<usize, FileError> {
        if !self.readable {
            return Err(FileError::NotReadable);
        }
        let n = store.read_at(self.ino, self.offset, buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

/// Extends `ino` from `old` to `new` bytes and zero-fills the gap.
fn grow<S: InodeStore + ?Sized>(store: &mut S, ino: InodeId, old: u64, new: u64) -> Result<(), FileError> {
    let params = store.params();
    let limit = params.max_file_size();
    if new > limit {
        log::debug!(target: "fs", "ino {} growth to {new} refused, limit {limit}", ino.as_raw());
        return Err(FileError::SizeLimitExceeded { requested: new, limit });
    }

    {
        let mut tx = Transaction::begin(&mut *store);
        tx.set_size(ino, new)?;
        tx.update_inode(ino)?;
    }

    let zeros = [0u8; BLOCK_SIZE];
    let chunk = params.write_chunk() as u64;
    let mut pos = old;
    while pos < new {
        let mut tx = Transaction::begin(&mut *store);
        let end = cmp::min(new, pos + chunk);
        while pos < end {
            let n = cmp::min(zeros.len() as u64, end - pos) as usize;
            let written = match tx.write_at(ino, pos, &zeros[..n]) {
                Ok(written) => written,
                Err(err) => {
                    log::error!(target: "fs", "ino {} zero fill failed at {pos}: {err}", ino.as_raw());
                    return Err(err.into());
                }
            };
            if written != n {
                log::error!(target: "fs", "ino {} zero fill short at {pos}: {written} of {n}", ino.as_raw());
                return Err(FileError::IncompleteFill { at: pos + written as u64 });
            }
            pos += n as u64;
        }
    }
    log::debug!(target: "fs", "ino {} grown {old} -> {new}", ino.as_raw());
    Ok(())
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-process open-file table.

use super::file::File;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Descriptor table failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FdError {
    /// Descriptor is out of range or not open.
    #[error("bad file descriptor {0}")]
    BadDescriptor(usize),
    /// Every slot is in use.
    #[error("too many open files")]
    TableFull,
}

/// Fixed-size table mapping descriptors to open files.
#[derive(Debug, Default)]
pub struct FdTable {
    slots: [Option<File>; NOFILE],
}

impl FdTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `file` in the lowest free slot.
    pub fn install(&mut self, file: File) -> Result<usize, FdError> {
        let fd = self.slots.iter().position(Option::is_none).ok_or(FdError::TableFull)?;
        self.slots[fd] = Some(file);
        Ok(fd)
    }

    pub fn get(&self, fd: usize) -> Result<&File, FdError> {
        self.slots.get(fd).and_then(Option::as_ref).ok_or(FdError::BadDescriptor(fd))
    }

    pub fn get_mut(&mut self, fd: usize) -> Result<&mut File, FdError> {
        self.slots.get_mut(fd).and_then(Option::as_mut).ok_or(FdError::BadDescriptor(fd))
    }

    /// Removes and returns the file at `fd`.
    pub fn close(&mut self, fd: usize) -> Result<File, FdError> {
        self.slots.get_mut(fd).and_then(Option::take).ok_or(FdError::BadDescriptor(fd))
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

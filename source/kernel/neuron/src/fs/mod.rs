// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! File layer: open files over an inode store, and per-process descriptor tables.

pub mod fd;
pub mod file;

pub use fd::{FdError, FdTable, NOFILE};
pub use file::{File, FileError, OpenFlags};

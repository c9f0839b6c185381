// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process state consumed by the memory subsystem
//! OWNERS: @kernel-sched-team
//! STATUS: Functional (host-first)
//! PUBLIC API: ProcessContext, Process
//! DEPENDS_ON: mm::AddressSpace, fs::FdTable, types::Pid
//!
//! Scheduling is not modelled. A process is its address space, its open files
//! and a kill flag that the trap path sets and the (external) scheduler honours.

use crate::fs::FdTable;
use crate::mm::{AddressSpace, FrameError, GrowError, Memory};
use crate::types::Pid;

/// What the fault and growth paths need from the running process.
pub trait ProcessContext {
    /// Identifier used in diagnostics.
    fn pid(&self) -> Pid;
    /// Current address space.
    fn address_space(&self) -> &AddressSpace;
    /// Current address space, mutably.
    fn address_space_mut(&mut self) -> &mut AddressSpace;
    /// Marks the process for termination.
    fn terminate(&mut self);
    /// Whether the process has been marked for termination.
    fn is_killed(&self) -> bool;
    /// Records one trapped page fault.
    fn note_fault(&mut self) {}
}

/// User process.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    space: AddressSpace,
    files: FdTable,
    killed: bool,
    faults: usize,
}

impl Process {
    /// Process with an empty address space.
    pub fn new<M: Memory + ?Sized>(mem: &M, pid: Pid) -> Result<Self, FrameError> {
        Ok(Self::from_space(pid, AddressSpace::new(mem)?))
    }

    /// Process whose address space starts with `image` loaded at address 0.
    pub fn with_image<M: Memory + ?Sized>(mem: &M, pid: Pid, image: &[u8]) -> Result<Self, GrowError> {
        Ok(Self::from_space(pid, AddressSpace::with_image(mem, image)?))
    }

    fn from_space(pid: Pid, space: AddressSpace) -> Self {
        Self { pid, space, files: FdTable::new(), killed: false, faults: 0 }
    }

    /// Open-file table.
    pub fn files(&self) -> &FdTable {
        &self.files
    }

    /// Open-file table, mutably.
    pub fn files_mut(&mut self) -> &mut FdTable {
        &mut self.files
    }

    /// Page faults trapped so far.
    pub fn fault_count(&self) -> usize {
        self.faults
    }

    /// Tears the process down, returning every frame it owned.
    pub fn exit<M: Memory + ?Sized>(self, mem: &M) {
        log::debug!(target: "mm", "pid {} exit after {} faults", self.pid, self.faults);
        self.space.destroy(mem);
    }
}

impl ProcessContext for Process {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    fn address_space_mut(&mut self) -> &mut AddressSpace {
        &mut self.space
    }

    fn terminate(&mut self) {
        self.killed = true;
    }

    fn is_killed(&self) -> bool {
        self.killed
    }

    fn note_fault(&mut self) {
        self.faults += 1;
    }
}

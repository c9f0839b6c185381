// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Demand-paging fault handler and allocation policies
//! OWNERS: @kernel-mm-team
//! PUBLIC API: handle_fault, FaultPolicy, LazyPolicy, LocalityPolicy, Policy, FaultError
//! INVARIANTS:
//!   - Only addresses below the logical size and the kernel boundary are backed
//!   - A page that is already present is never remapped (faults are idempotent)
//!   - A frame acquired for a page is released again if mapping it fails
//!   - Pages installed before a Locality failure stay mapped
//!
//! The fault handler itself never retries the faulting access and never kills
//! anyone; `trap::page_fault` decides what an error means for the process.

use super::address_space::AddressSpace;
use super::frame::{FrameError, Memory};
use super::page_table::{MapError, USER_RW};
use super::{page_round_down, PAGE_SIZE, USER_TOP};

/// Pages materialized per Locality fault: the faulting page and two forward neighbours.
pub const LOCALITY_WINDOW: usize = 3;

/// Fault handling failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    /// No frame was available for the page or its page-table levels.
    #[error("out of memory")]
    OutOfMemory,
    /// Address lies outside the backable user range.
    #[error("address {0:#x} outside backable range")]
    InvalidAddress(usize),
    /// Page table rejected the mapping.
    #[error("mapping failed: {0}")]
    Mapping(MapError),
}

impl From<FrameError> for FaultError {
    fn from(_: FrameError) -> Self {
        Self::OutOfMemory
    }
}

impl From<MapError> for FaultError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::AllocationFailure => Self::OutOfMemory,
            other => Self::Mapping(other),
        }
    }
}

/// Strategy for backing a faulting page.
pub trait FaultPolicy {
    /// Backs `page` (page aligned, below the size, not yet present) and returns
    /// how many pages were installed.
    fn materialize<M: Memory + ?Sized>(
        &self,
        space: &mut AddressSpace,
        mem: &M,
        page: usize,
    ) -> Result<usize, FaultError>;
}

/// Backs exactly the faulting page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LazyPolicy;

impl FaultPolicy for LazyPolicy {
    fn materialize<M: Memory + ?Sized>(
        &self,
        space: &mut AddressSpace,
        mem: &M,
        page: usize,
    ) -> Result<usize, FaultError> {
        log::debug!(target: "fault", "lazy: page {page:#x}");
        install_zeroed_page(space, mem, page)?;
        Ok(1)
    }
}

/// Backs the faulting page and up to `window - 1` forward neighbours.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalityPolicy {
    window: usize,
}

impl LocalityPolicy {
    /// Policy materializing up to `window` consecutive pages.
    pub const fn new(window: usize) -> Self {
        Self { window }
    }

    /// Pages considered per fault.
    pub const fn window(&self) -> usize {
        self.window
    }
}

impl Default for LocalityPolicy {
    fn default() -> Self {
        Self::new(LOCALITY_WINDOW)
    }
}

impl FaultPolicy for LocalityPolicy {
    fn materialize<M: Memory + ?Sized>(
        &self,
        space: &mut AddressSpace,
        mem: &M,
        page: usize,
    ) -> Result<usize, FaultError> {
        let mut installed = 0;
        for step in 0..self.window {
            let va = page + step * PAGE_SIZE;
            if va >= space.size() {
                log::debug!(target: "fault", "locality: stop at {va:#x}, size {:#x}", space.size());
                break;
            }
            if space.is_resident(mem, va) {
                log::debug!(target: "fault", "locality: {va:#x} already mapped");
                continue;
            }
            if let Err(err) = install_zeroed_page(space, mem, va) {
                log::debug!(target: "fault", "locality: {va:#x} failed after {installed} pages: {err}");
                return Err(err);
            }
            installed += 1;
        }
        log::debug!(target: "fault", "locality: installed {installed} pages from {page:#x}");
        Ok(installed)
    }
}

/// Policy selected at kernel start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    Lazy(LazyPolicy),
    Locality(LocalityPolicy),
}

impl FaultPolicy for Policy {
    fn materialize<M: Memory + ?Sized>(
        &self,
        space: &mut AddressSpace,
        mem: &M,
        page: usize,
    ) -> Result<usize, FaultError> {
        match self {
            Policy::Lazy(policy) => policy.materialize(space, mem, page),
            Policy::Locality(policy) => policy.materialize(space, mem, page),
        }
    }
}

/// Handles a fault at `va`, returning the number of pages installed.
///
/// Returns `Ok(0)` when the page is already present, e.g. prefetched by an
/// earlier Locality fault. On success the caller may retry the access.
pub fn handle_fault<P: FaultPolicy + ?Sized, M: Memory + ?Sized>(
    space: &mut AddressSpace,
    mem: &M,
    policy: &P,
    va: usize,
) -> Result<usize, FaultError> {
    if va >= space.size() || va >= USER_TOP {
        return Err(FaultError::InvalidAddress(va));
    }
    let page = page_round_down(va);
    if space.is_resident(mem, page) {
        log::debug!(target: "fault", "{page:#x} already resident");
        return Ok(0);
    }
    policy.materialize(space, mem, page)
}

/// Acquires a frame, zeroes it and maps it user read/write at `page`.
fn install_zeroed_page<M: Memory + ?Sized>(
    space: &mut AddressSpace,
    mem: &M,
    page: usize,
) -> Result<(), FaultError> {
    let frame = mem.acquire()?;
    mem.fill(frame, 0);
    if let Err(err) = space.page_table_mut().map(mem, page, PAGE_SIZE, frame.addr(), USER_RW) {
        mem.release(frame);
        return Err(err.into());
    }
    Ok(())
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User page-fault dispatch and escalation
//! OWNERS: @kernel-team
//! PUBLIC API: page_fault, FaultDisposition, KillReason
//! INVARIANTS:
//!   - Faults on the low guard page, above the logical size or in kernel space are never backed
//!   - Any failure kills the faulting process; nothing is retried here

use crate::mm::{handle_fault, FaultError, FaultPolicy, Memory, PAGE_SIZE, USER_TOP};
use crate::task::ProcessContext;

/// Why a process was killed by the trap path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillReason {
    /// No frame was left to back the faulting page.
    OutOfMemory,
    /// Access outside the backable user range.
    BadAddress(usize),
    /// Access violated the page's permissions.
    Protection(usize),
}

/// Outcome of a user page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Backing exists now; retry the access.
    Resolved { installed: usize },
    /// The process has been marked for termination.
    Killed(KillReason),
}

/// Handles a user page fault at `va` on behalf of `proc`.
pub fn page_fault<P, M, F>(proc: &mut P, mem: &M, policy: &F, va: usize) -> FaultDisposition
where
    P: ProcessContext + ?Sized,
    M: Memory + ?Sized,
    F: FaultPolicy + ?Sized,
{
    proc.note_fault();
    if va < PAGE_SIZE || va >= USER_TOP || va >= proc.address_space().size() {
        return kill(proc, KillReason::BadAddress(va));
    }
    match handle_fault(proc.address_space_mut(), mem, policy, va) {
        Ok(installed) => FaultDisposition::Resolved { installed },
        Err(FaultError::OutOfMemory) => kill(proc, KillReason::OutOfMemory),
        Err(FaultError::InvalidAddress(va)) => kill(proc, KillReason::BadAddress(va)),
        Err(FaultError::Mapping(err)) => {
            log::error!(target: "trap", "pid {} fault at {va:#x}: {err}", proc.pid());
            kill(proc, KillReason::BadAddress(va))
        }
    }
}

/// Marks `proc` for termination after a protection violation at `va`.
pub fn protection_fault<P: ProcessContext + ?Sized>(proc: &mut P, va: usize) -> KillReason {
    let reason = KillReason::Protection(va);
    kill(proc, reason);
    reason
}

fn kill<P: ProcessContext + ?Sized>(proc: &mut P, reason: KillReason) -> FaultDisposition {
    log::warn!(target: "trap", "pid {} killed: {reason:?}", proc.pid());
    proc.terminate();
    FaultDisposition::Killed(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{FramePool, LazyPolicy};
    use crate::task::Process;
    use crate::types::Pid;

    fn process(pool: &FramePool, pages: usize) -> Process {
        let mut proc = Process::new(pool, Pid::from_raw(1)).expect("process");
        proc.address_space_mut().grow(pool, (pages * PAGE_SIZE) as isize).expect("grow");
        proc
    }

    #[test]
    fn resolved_fault_is_counted() {
        let pool = FramePool::new(8);
        let mut proc = process(&pool, 4);
        let disposition = page_fault(&mut proc, &pool, &LazyPolicy, 2 * PAGE_SIZE);
        assert_eq!(disposition, FaultDisposition::Resolved { installed: 1 });
        assert_eq!(proc.fault_count(), 1);
        assert!(!proc.is_killed());
    }

    #[test]
    fn guard_page_fault_kills() {
        let pool = FramePool::new(8);
        let mut proc = process(&pool, 4);
        assert_eq!(
            page_fault(&mut proc, &pool, &LazyPolicy, 12),
            FaultDisposition::Killed(KillReason::BadAddress(12))
        );
        assert!(proc.is_killed());
    }

    #[test]
    fn fault_above_size_kills() {
        let pool = FramePool::new(8);
        let mut proc = process(&pool, 2);
        let va = 2 * PAGE_SIZE;
        assert_eq!(
            page_fault(&mut proc, &pool, &LazyPolicy, va),
            FaultDisposition::Killed(KillReason::BadAddress(va))
        );
        assert_eq!(proc.address_space().resident_pages(&pool), 0);
    }

    #[test]
    fn out_of_memory_kills() {
        let pool = FramePool::new(1);
        let mut proc = process(&pool, 2);
        assert_eq!(
            page_fault(&mut proc, &pool, &LazyPolicy, PAGE_SIZE),
            FaultDisposition::Killed(KillReason::OutOfMemory)
        );
        assert!(proc.is_killed());
    }
}

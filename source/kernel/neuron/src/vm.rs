// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual-memory facade tying the growth contract, the fault path and user access together
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vm (grow_address_space, handle_fault, load_byte/store_byte, read_bytes/write_bytes), AccessError
//! DEPENDS_ON: mm, trap, task::ProcessContext, config::VmConfig
//!
//! User loads and stores are emulated: translate through the page table, trap
//! on a missing entry, then retry once. This is what makes the "first touch
//! faults exactly once" behaviour observable on the host.

use crate::config::VmConfig;
use crate::mm::{
    page_round_down, Frame, GrowError, Memory, PageFlags, Policy, PAGE_SIZE,
};
use crate::task::ProcessContext;
use crate::trap::{self, FaultDisposition, KillReason};

/// Failures of emulated user accesses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    /// The access killed the process.
    #[error("process killed: {0:?}")]
    Killed(KillReason),
    /// The process was already marked for termination.
    #[error("process already terminated")]
    Terminated,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    Load,
    Store,
}

impl Access {
    fn required(self) -> PageFlags {
        match self {
            Access::Load => PageFlags::READ | PageFlags::USER,
            Access::Store => PageFlags::WRITE | PageFlags::USER,
        }
    }
}

/// Virtual-memory subsystem bound to a physical memory pool and a fault policy.
pub struct Vm<'a, M: Memory + ?Sized> {
    mem: &'a M,
    config: VmConfig,
    policy: Policy,
}

impl<'a, M: Memory + ?Sized> Vm<'a, M> {
    /// Binds `mem` with the policy described by `config`.
    pub fn new(mem: &'a M, config: VmConfig) -> Self {
        let policy = config.fault_policy();
        log::info!(target: "mm", "fault policy {:?}", config.policy);
        Self { mem, config, policy }
    }

    /// Active configuration.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Backing memory pool.
    pub fn memory(&self) -> &'a M {
        self.mem
    }

    /// The sbrk contract: changes the size of `proc` by `delta` and returns the old size.
    pub fn grow_address_space<P: ProcessContext + ?Sized>(
        &self,
        proc: &mut P,
        delta: isize,
    ) -> Result<usize, GrowError> {
        let result = proc.address_space_mut().grow(self.mem, delta);
        if let Err(err) = result {
            log::debug!(target: "mm", "pid {} grow by {delta} failed: {err}", proc.pid());
        }
        result
    }

    /// Fault entry point used by the trap dispatcher.
    pub fn handle_fault<P: ProcessContext + ?Sized>(&self, proc: &mut P, va: usize) -> FaultDisposition {
        trap::page_fault(proc, self.mem, &self.policy, va)
    }

    /// Emulates a user byte load.
    pub fn load_byte<P: ProcessContext + ?Sized>(&self, proc: &mut P, va: usize) -> Result<u8, AccessError> {
        let mut byte = [0u8; 1];
        self.read_bytes(proc, va, &mut byte)?;
        Ok(byte[0])
    }

    /// Emulates a user byte store.
    pub fn store_byte<P: ProcessContext + ?Sized>(
        &self,
        proc: &mut P,
        va: usize,
        value: u8,
    ) -> Result<(), AccessError> {
        self.write_bytes(proc, va, &[value])
    }

    /// Copies user memory at `va` into `buf`, faulting pages in as needed.
    pub fn read_bytes<P: ProcessContext + ?Sized>(
        &self,
        proc: &mut P,
        va: usize,
        buf: &mut [u8],
    ) -> Result<(), AccessError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va + done;
            let (frame, offset) = self.resolve(proc, addr, Access::Load)?;
            let n = (PAGE_SIZE - offset).min(buf.len() - done);
            self.mem.read(frame, offset, &mut buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Copies `data` into user memory at `va`, faulting pages in as needed.
    pub fn write_bytes<P: ProcessContext + ?Sized>(
        &self,
        proc: &mut P,
        va: usize,
        data: &[u8],
    ) -> Result<(), AccessError> {
        let mut done = 0;
        while done < data.len() {
            let addr = va + done;
            let (frame, offset) = self.resolve(proc, addr, Access::Store)?;
            let n = (PAGE_SIZE - offset).min(data.len() - done);
            self.mem.write(frame, offset, &data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn resolve<P: ProcessContext + ?Sized>(
        &self,
        proc: &mut P,
        va: usize,
        access: Access,
    ) -> Result<(Frame, usize), AccessError> {
        if proc.is_killed() {
            return Err(AccessError::Terminated);
        }
        if let Some(hit) = self.translate(proc, va, access)? {
            return Ok(hit);
        }
        if let FaultDisposition::Killed(reason) = self.handle_fault(proc, va) {
            return Err(AccessError::Killed(reason));
        }
        self.translate(proc, va, access)?
            .ok_or(AccessError::Killed(KillReason::BadAddress(page_round_down(va))))
    }

    fn translate<P: ProcessContext + ?Sized>(
        &self,
        proc: &mut P,
        va: usize,
        access: Access,
    ) -> Result<Option<(Frame, usize)>, AccessError> {
        let Some((pa, flags)) = proc.address_space().translate(self.mem, va) else {
            return Ok(None);
        };
        if !flags.contains(access.required()) {
            return Err(AccessError::Killed(trap::protection_fault(proc, va)));
        }
        Ok(Some((Frame::containing(pa), pa % PAGE_SIZE)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyKind;
    use crate::mm::{FrameAllocator, FramePool};
    use crate::task::Process;
    use crate::types::Pid;

    fn setup(pool: &FramePool, policy: PolicyKind) -> (Vm<'_, FramePool>, Process) {
        let vm = Vm::new(pool, VmConfig::with_policy(policy));
        let proc = Process::with_image(pool, Pid::from_raw(7), &[0x11; 16]).expect("process");
        (vm, proc)
    }

    #[test]
    fn first_touch_faults_once() {
        let pool = FramePool::new(16);
        let (vm, mut proc) = setup(&pool, PolicyKind::Lazy);
        assert_eq!(vm.grow_address_space(&mut proc, 2 * PAGE_SIZE as isize), Ok(PAGE_SIZE));
        assert_eq!(vm.load_byte(&mut proc, PAGE_SIZE + 5), Ok(0));
        assert_eq!(proc.fault_count(), 1);
        vm.store_byte(&mut proc, PAGE_SIZE + 6, 9).expect("store");
        assert_eq!(vm.load_byte(&mut proc, PAGE_SIZE + 6), Ok(9));
        assert_eq!(proc.fault_count(), 1);
    }

    #[test]
    fn image_reads_without_faulting() {
        let pool = FramePool::new(16);
        let (vm, mut proc) = setup(&pool, PolicyKind::Lazy);
        assert_eq!(vm.load_byte(&mut proc, 3), Ok(0x11));
        assert_eq!(vm.load_byte(&mut proc, 16), Ok(0));
        assert_eq!(proc.fault_count(), 0);
    }

    #[test]
    fn access_beyond_size_kills() {
        let pool = FramePool::new(16);
        let (vm, mut proc) = setup(&pool, PolicyKind::Lazy);
        let va = 4 * PAGE_SIZE;
        assert_eq!(vm.load_byte(&mut proc, va), Err(AccessError::Killed(KillReason::BadAddress(va))));
        assert_eq!(vm.load_byte(&mut proc, 0), Err(AccessError::Terminated));
    }

    #[test]
    fn protection_violation_kills() {
        let pool = FramePool::new(16);
        let (vm, mut proc) = setup(&pool, PolicyKind::Lazy);
        vm.grow_address_space(&mut proc, PAGE_SIZE as isize).expect("grow");
        let frame = pool.acquire().expect("frame");
        proc.address_space_mut()
            .page_table_mut()
            .map(&pool, PAGE_SIZE, PAGE_SIZE, frame.addr(), PageFlags::READ | PageFlags::USER)
            .expect("map");
        assert_eq!(vm.load_byte(&mut proc, PAGE_SIZE), Ok(0x01));
        assert_eq!(
            vm.store_byte(&mut proc, PAGE_SIZE, 1),
            Err(AccessError::Killed(KillReason::Protection(PAGE_SIZE)))
        );
        assert!(proc.is_killed());
    }

    #[test]
    fn locality_prefetch_spares_later_faults() {
        let pool = FramePool::new(16);
        let (vm, mut proc) = setup(&pool, PolicyKind::Locality);
        vm.grow_address_space(&mut proc, 3 * PAGE_SIZE as isize).expect("grow");
        for page in 1..4 {
            vm.store_byte(&mut proc, page * PAGE_SIZE, page as u8).expect("store");
        }
        assert_eq!(proc.fault_count(), 1);
    }

    #[test]
    fn multi_page_copy_crosses_boundaries() {
        let pool = FramePool::new(16);
        let (vm, mut proc) = setup(&pool, PolicyKind::Lazy);
        vm.grow_address_space(&mut proc, 2 * PAGE_SIZE as isize).expect("grow");
        let data = [0x5au8; 100];
        vm.write_bytes(&mut proc, 2 * PAGE_SIZE - 50, &data).expect("write");
        let mut back = [0u8; 100];
        vm.read_bytes(&mut proc, 2 * PAGE_SIZE - 50, &mut back).expect("read");
        assert_eq!(back, data);
        assert_eq!(proc.fault_count(), 2);
    }
}

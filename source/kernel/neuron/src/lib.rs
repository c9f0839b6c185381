// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: NEURON memory subsystem (demand paging + sparse file growth)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, proptests in `mm::tests_prop`, host integration tests in `tests/`
//!
//! PUBLIC API:
//!   - mm: frames, Sv39 page tables, address spaces, fault handler and policies
//!   - vm: `Vm` facade (sbrk contract, fault entry, simulated user loads/stores)
//!   - trap: page-fault escalation to process termination
//!   - fs: open files with sparse growth on seek and transaction-chunked writes
//!   - syscall: xv6-style shims returning -1 on error
//!
//! DEPENDS_ON: storage (inode store + transactions)

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

pub mod config;
pub mod fs;
pub mod mm;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod types;
pub mod vm;

pub use config::{PolicyKind, VmConfig};
pub use types::Pid;
pub use vm::Vm;

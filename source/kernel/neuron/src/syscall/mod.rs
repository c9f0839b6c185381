// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory and file syscall shims
//! OWNERS: @kernel-team
//! PUBLIC API: sys_sbrk, sys_lseek, sys_write, sys_read, sys_fstat, Stat
//! DEPENDS_ON: vm::Vm, fs, task::Process
//! INVARIANTS: Every failure maps to -1; argument decoding happens in the (external) dispatcher
//!
//! Errors are logged at debug level under the subsystem target before being
//! flattened, since the user-visible return value carries no detail.

use storage::InodeStore;

use crate::fs::{File, FileError};
use crate::mm::Memory;
use crate::task::Process;
use crate::vm::Vm;

/// Classic syscall failure value.
pub const SYS_ERR: isize = -1;

/// `fstat` result as laid out for user space.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub ino: u32,
    pub kind: u16,
    pub size: u64,
}

/// Grows or shrinks the calling process by `delta` bytes; returns the old size.
pub fn sys_sbrk<M: Memory + ?Sized>(vm: &Vm<'_, M>, proc: &mut Process, delta: isize) -> isize {
    match vm.grow_address_space(proc, delta) {
        Ok(old) => old as isize,
        Err(_) => SYS_ERR,
    }
}

/// Moves the cursor of `fd` by `offset`, zero-filling any gap past end of file.
pub fn sys_lseek<S: InodeStore + ?Sized>(proc: &mut Process, store: &mut S, fd: usize, offset: i64) -> i64 {
    file_op(proc, fd, |file| file.seek(store, offset)).map_or(SYS_ERR as i64, |new| new as i64)
}

/// Writes `buf` at the cursor of `fd`.
pub fn sys_write<S: InodeStore + ?Sized>(proc: &mut Process, store: &mut S, fd: usize, buf: &[u8]) -> isize {
    file_op(proc, fd, |file| file.write(store, buf)).map_or(SYS_ERR, |n| n as isize)
}

/// Reads into `buf` from the cursor of `fd`.
pub fn sys_read<S: InodeStore + ?Sized>(proc: &mut Process, store: &S, fd: usize, buf: &mut [u8]) -> isize {
    file_op(proc, fd, |file| file.read(store, buf)).map_or(SYS_ERR, |n| n as isize)
}

/// Fills `st` with the metadata of `fd`.
pub fn sys_fstat<S: InodeStore + ?Sized>(proc: &mut Process, store: &S, fd: usize, st: &mut Stat) -> isize {
    match file_op(proc, fd, |file| file.stat(store)) {
        Some(stat) => {
            *st = Stat { ino: stat.ino.as_raw(), kind: stat.kind.to_raw(), size: stat.size };
            0
        }
        None => SYS_ERR,
    }
}

/// Runs `op` on the open file at `fd`, logging and flattening any failure.
fn file_op<T>(
    proc: &mut Process,
    fd: usize,
    op: impl FnOnce(&mut File) -> Result<T, FileError>,
) -> Option<T> {
    let file = match proc.files_mut().get_mut(fd) {
        Ok(file) => file,
        Err(err) => {
            log::debug!(target: "fs", "{err}");
            return None;
        }
    };
    match op(file) {
        Ok(value) => Some(value),
        Err(err) => {
            log::debug!(target: "fs", "fd {fd}: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyKind, VmConfig};
    use crate::fs::OpenFlags;
    use crate::mm::{FramePool, PAGE_SIZE};
    use crate::types::Pid;
    use storage::{FsParams, InodeKind, MemFs};

    fn setup(pool: &FramePool) -> (Process, MemFs, usize) {
        let mut fs = MemFs::new(FsParams::default(), 256);
        let ino = fs.create(InodeKind::File).expect("create");
        let mut proc = Process::with_image(pool, Pid::from_raw(3), &[0; 32]).expect("process");
        let fd = proc.files_mut().install(File::open(ino, OpenFlags::RDWR)).expect("fd");
        (proc, fs, fd)
    }

    #[test]
    fn sbrk_returns_old_size_and_minus_one_on_error() {
        let pool = FramePool::new(16);
        let (mut proc, _fs, _fd) = setup(&pool);
        let vm = Vm::new(&pool, VmConfig::with_policy(PolicyKind::Lazy));
        assert_eq!(sys_sbrk(&vm, &mut proc, PAGE_SIZE as isize), PAGE_SIZE as isize);
        assert_eq!(sys_sbrk(&vm, &mut proc, -(3 * PAGE_SIZE as isize)), SYS_ERR);
        assert_eq!(sys_sbrk(&vm, &mut proc, 0), 2 * PAGE_SIZE as isize);
    }

    #[test]
    fn lseek_write_read_round_trip() {
        let pool = FramePool::new(16);
        let (mut proc, mut fs, fd) = setup(&pool);
        assert_eq!(sys_write(&mut proc, &mut fs, fd, b"hello"), 5);
        assert_eq!(sys_lseek(&mut proc, &mut fs, fd, 5), 10);
        assert_eq!(sys_write(&mut proc, &mut fs, fd, b"world"), 5);
        assert_eq!(sys_lseek(&mut proc, &mut fs, fd, -15), 0);
        let mut buf = [0xffu8; 16];
        assert_eq!(sys_read(&mut proc, &fs, fd, &mut buf), 15);
        assert_eq!(&buf[..15], b"hello\0\0\0\0\0world");

        let mut st = Stat::default();
        assert_eq!(sys_fstat(&mut proc, &fs, fd, &mut st), 0);
        assert_eq!(st.size, 15);
        assert_eq!(st.kind, 2);
    }

    #[test]
    fn bad_descriptor_and_negative_seek_fail() {
        let pool = FramePool::new(16);
        let (mut proc, mut fs, fd) = setup(&pool);
        assert_eq!(sys_write(&mut proc, &mut fs, fd + 1, b"x"), SYS_ERR);
        assert_eq!(sys_lseek(&mut proc, &mut fs, fd, -1), -1);
        let mut st = Stat::default();
        assert_eq!(sys_fstat(&mut proc, &fs, 99, &mut st), SYS_ERR);
    }
}

// Copyright (c) 2025 LazyMig Authors. All rights reserved.
//
// LazyMig is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};

/// This function returns the caller's thread ID(TID).
pub fn gettid() -> u64 {
    // SAFETY: No memory is touched, the syscall only reads the thread id.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Return the host page size in bytes.
pub fn host_page_size() -> u64 {
    // SAFETY: sysconf has no side effect on the process.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

/// Create a close-on-exec pipe and return its (read, write) ends.
pub fn pipe_pair() -> Result<(OwnedFd, OwnedFd)> {
    let (read_fd, write_fd) =
        nix::unistd::pipe2(OFlag::O_CLOEXEC).with_context(|| "Failed to create pipe")?;
    // SAFETY: pipe2 just returned both descriptors, nothing else owns them.
    Ok(unsafe { (OwnedFd::from_raw_fd(read_fd), OwnedFd::from_raw_fd(write_fd)) })
}

/// Switch a descriptor between blocking and non-blocking mode.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).with_context(|| "Failed to get fd flags")?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(fd, FcntlArg::F_SETFL(flags)).with_context(|| "Failed to set fd flags")?;
    Ok(())
}

/// Whether the descriptor was opened for both reading and writing.
pub fn is_read_write(fd: RawFd) -> Result<bool> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).with_context(|| "Failed to get fd flags")?;
    Ok(flags & libc::O_ACCMODE == libc::O_RDWR)
}

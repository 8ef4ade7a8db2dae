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

//! Destination-VMM side of the inner pipes.
//!
//! The daemon writes into guest RAM through its own mapping, so the VMM's
//! page tables do not know about fresh pages yet. The fault ingestor reads
//! "now cached" host-page offsets from the daemon, touches one byte of each
//! page to materialize it locally, and echoes the offsets back so the
//! daemon may release the waiting vCPU. [`IncomingControl`] is the VMM end
//! of the single-byte control pipes.

use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::slice::{from_raw_parts, from_raw_parts_mut};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use nix::errno::Errno;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

use crate::incoming::{read_byte, write_byte};
use crate::protocol::{DAEMON_ERROR, DAEMON_QUIT, DAEMON_READY, QEMU_QUIT, QEMU_READY};
use crate::MigrationError;

// Quit progress of the VMM-side control state.
pub const PIS_QUIT_RECEIVED: u32 = 0x01;
pub const PIS_QUIT_QUEUED: u32 = 0x02;
pub const PIS_QUIT_SENT: u32 = 0x04;

/// Read access to the guest RAM mappings of the VMM process.
pub trait GuestRamAccess: Send + Sync {
    /// Host pointer backing the guest-physical address, if mapped.
    fn ram_ptr(&self, addr: u64) -> Option<*const u8>;
}

/// Machine hooks the control pipe needs from the enclosing VMM.
pub trait VmLifecycle: Send + Sync {
    /// Pause the guest with an I/O-error run state.
    fn stop_on_io_error(&self);
}

fn echo_full(fd: RawFd, mut bytes: &[u8]) -> Result<()> {
    while !bytes.is_empty() {
        // atomic pipe writes, 8-byte aligned
        let chunk = bytes.len().min(libc::PIPE_BUF) & !7;
        match nix::unistd::write(fd, &bytes[..chunk]) {
            Ok(n) => bytes = &bytes[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("fault echo pipe"),
        }
    }
    Ok(())
}

fn ingest_loop(read_fd: &OwnedFd, write_fd: &OwnedFd, host_page_size: u64, ram: &dyn GuestRamAccess) {
    let host_page_shift = host_page_size.trailing_zeros();
    let mut buf = vec![0_u64; libc::PIPE_BUF / 8];
    let buf_len = buf.len() * 8;
    let mut filled = 0_usize;

    loop {
        // SAFETY: the u64 buffer is viewed as bytes for pipe I/O, `filled`
        // always stays within it.
        let bytes = unsafe { from_raw_parts_mut(buf.as_mut_ptr() as *mut u8, buf_len) };
        let nread = match nix::unistd::read(read_fd.as_raw_fd(), &mut bytes[filled..]) {
            Ok(0) => break,
            Ok(nread) => nread,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("fault pipe read failed: {}", e);
                break;
            }
        };
        filled += nread;
        let nreq = filled / 8;
        if nreq == 0 {
            continue;
        }

        // Make the pages present by forcibly triggering the fault.
        for &pgoff in &buf[..nreq] {
            if let Some(ptr) = ram.ram_ptr(pgoff << host_page_shift) {
                // SAFETY: ram_ptr vouches for the mapping; reading a single
                // byte is enough to populate the page table entry.
                unsafe {
                    std::ptr::read_volatile(ptr);
                }
            }
        }

        let consumed = nreq * 8;
        // SAFETY: as above, an aligned byte view of the offset buffer.
        let bytes = unsafe { from_raw_parts(buf.as_ptr() as *const u8, buf_len) };
        if let Err(e) = echo_full(write_fd.as_raw_fd(), &bytes[..consumed]) {
            warn!("fault echo failed: {:?}", e);
            break;
        }
        // SAFETY: as above.
        let bytes = unsafe { from_raw_parts_mut(buf.as_mut_ptr() as *mut u8, buf_len) };
        bytes.copy_within(consumed..filled, 0);
        filled -= consumed;
    }
}

/// Spawn the fault ingestor thread. It exits, closing both pipe ends, when
/// either pipe reports end-of-file or an error.
pub fn spawn_fault_ingestor(
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    ram: Arc<dyn GuestRamAccess>,
) -> Result<JoinHandle<()>> {
    spawn_fault_ingestor_sized(read_fd, write_fd, util::unix::host_page_size(), ram)
}

/// As [`spawn_fault_ingestor`], with an explicit host page granule.
pub fn spawn_fault_ingestor_sized(
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    host_page_size: u64,
    ram: Arc<dyn GuestRamAccess>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("postcopy-ingest".to_string())
        .spawn(move || {
            // the daemon may close its end first, do not die on EPIPE
            let mut mask = SigSet::empty();
            mask.add(Signal::SIGPIPE);
            if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), None) {
                warn!("failed to mask SIGPIPE: {}", e);
            }
            ingest_loop(&read_fd, &write_fd, host_page_size, ram.as_ref());
            info!("fault ingestor exits");
        })
        .with_context(|| "Failed to spawn fault ingestor")
}

/// VMM end of the daemon control pipes.
///
/// The enclosing main loop polls `from_umemd` and calls
/// [`handle_daemon_msg`] on readability; quit progress is tracked in a
/// small set-once bitset like on the daemon side.
///
/// [`handle_daemon_msg`]: IncomingControl::handle_daemon_msg
pub struct IncomingControl {
    state: u32,
    to_umemd: Option<OwnedFd>,
    from_umemd: Option<OwnedFd>,
    vm: Arc<dyn VmLifecycle>,
}

impl IncomingControl {
    pub fn new(to_umemd: OwnedFd, from_umemd: OwnedFd, vm: Arc<dyn VmLifecycle>) -> Self {
        IncomingControl {
            state: 0,
            to_umemd: Some(to_umemd),
            from_umemd: Some(from_umemd),
            vm,
        }
    }

    pub fn state(&self) -> u32 {
        self.state
    }

    /// Descriptor the VMM main loop should watch for daemon messages.
    pub fn poll_fd(&self) -> Option<RawFd> {
        self.from_umemd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Block until the daemon announced itself on the control pipe.
    pub fn wait_daemon_ready(&mut self) -> Result<()> {
        let from_umemd = self
            .from_umemd
            .as_ref()
            .ok_or(MigrationError::FaultPipeClosed)?;
        match read_byte(from_umemd.as_raw_fd())? {
            Some(DAEMON_READY) => Ok(()),
            Some(other) => bail!(MigrationError::UnknownPipeCommand(other)),
            None => bail!(MigrationError::FaultPipeClosed),
        }
    }

    /// Tell the daemon the migration channel is disowned and safe to use.
    pub fn send_ready(&mut self) -> Result<()> {
        let to_umemd = self
            .to_umemd
            .as_ref()
            .ok_or(MigrationError::FaultPipeClosed)?;
        write_byte(to_umemd.as_raw_fd(), QEMU_READY)
    }

    /// Consume one message from the daemon.
    pub fn handle_daemon_msg(&mut self) -> Result<()> {
        let byte = match self.from_umemd.as_ref() {
            Some(from_umemd) => read_byte(from_umemd.as_raw_fd())?,
            None => return Ok(()),
        };
        match byte {
            Some(DAEMON_QUIT) | None => {
                info!("daemon finished, completing the quit handshake");
                self.recv_quit();
                self.queue_quit();
            }
            Some(DAEMON_ERROR) => {
                // the daemon hit trouble, keep the guest from running on
                // partially present memory
                warn!("daemon reported an error, stopping the guest");
                self.vm.stop_on_io_error();
            }
            Some(other) => bail!(MigrationError::UnknownPipeCommand(other)),
        }
        self.check_quit_queued();
        Ok(())
    }

    /// Ask the daemon to tear down, e.g. when the VMM exits before the
    /// migration completed.
    pub fn cleanup(&mut self) {
        if self.to_umemd.is_some() {
            self.queue_quit();
            self.check_quit_queued();
        }
    }

    fn recv_quit(&mut self) {
        if self.state & PIS_QUIT_RECEIVED != 0 {
            return;
        }
        self.state |= PIS_QUIT_RECEIVED;
        self.from_umemd = None;
    }

    fn queue_quit(&mut self) {
        if self.state & PIS_QUIT_QUEUED != 0 {
            return;
        }
        if let Some(to_umemd) = &self.to_umemd {
            if let Err(e) = write_byte(to_umemd.as_raw_fd(), QEMU_QUIT) {
                warn!("failed to send quit to the daemon: {:?}", e);
            }
        }
        self.state |= PIS_QUIT_QUEUED;
    }

    fn check_quit_queued(&mut self) {
        if self.state & PIS_QUIT_QUEUED != 0 && self.state & PIS_QUIT_SENT == 0 {
            self.state |= PIS_QUIT_SENT;
            self.to_umemd = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use util::unix::pipe_pair;

    struct VecRam {
        base: u64,
        bytes: Vec<u8>,
        reads: AtomicUsize,
    }

    impl GuestRamAccess for VecRam {
        fn ram_ptr(&self, addr: u64) -> Option<*const u8> {
            if addr < self.base || addr >= self.base + self.bytes.len() as u64 {
                return None;
            }
            self.reads.fetch_add(1, Ordering::SeqCst);
            Some(&self.bytes[(addr - self.base) as usize] as *const u8)
        }
    }

    #[test]
    fn test_ingestor_echoes_offsets() {
        let (fault_read, fault_write) = pipe_pair().unwrap();
        let (echo_read, echo_write) = pipe_pair().unwrap();
        let ram = Arc::new(VecRam {
            base: 0x10000,
            bytes: vec![0_u8; 16 * 4096],
            reads: AtomicUsize::new(0),
        });
        let handle =
            spawn_fault_ingestor_sized(fault_read, echo_write, 4096, ram.clone()).unwrap();

        let offsets = [0x10_u64, 0x13, 0x1f];
        for pgoff in offsets {
            nix::unistd::write(fault_write.as_raw_fd(), &pgoff.to_ne_bytes()).unwrap();
        }
        let mut echoed = [0_u8; 24];
        let mut got = 0;
        while got < echoed.len() {
            got += nix::unistd::read(echo_read.as_raw_fd(), &mut echoed[got..]).unwrap();
        }
        for (i, pgoff) in offsets.iter().enumerate() {
            assert_eq!(
                u64::from_ne_bytes(echoed[i * 8..i * 8 + 8].try_into().unwrap()),
                *pgoff
            );
        }
        assert_eq!(ram.reads.load(Ordering::SeqCst), 3);

        // Closing the daemon side ends the thread and both its pipes.
        drop(fault_write);
        handle.join().unwrap();
        let mut buf = [0_u8; 8];
        assert_eq!(nix::unistd::read(echo_read.as_raw_fd(), &mut buf), Ok(0));
    }

    struct StopFlag(AtomicBool);

    impl VmLifecycle for StopFlag {
        fn stop_on_io_error(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_control_quit_handshake() {
        let (from_umemd_read, from_umemd_write) = pipe_pair().unwrap();
        let (to_umemd_read, to_umemd_write) = pipe_pair().unwrap();
        let vm = Arc::new(StopFlag(AtomicBool::new(false)));
        let mut control = IncomingControl::new(to_umemd_write, from_umemd_read, vm.clone());

        // Daemon side announces, VMM releases the channel.
        write_byte(from_umemd_write.as_raw_fd(), DAEMON_READY).unwrap();
        control.wait_daemon_ready().unwrap();
        control.send_ready().unwrap();
        assert_eq!(
            read_byte(to_umemd_read.as_raw_fd()).unwrap(),
            Some(QEMU_READY)
        );

        // Daemon quits; the VMM echoes the quit and closes its pipes.
        write_byte(from_umemd_write.as_raw_fd(), DAEMON_QUIT).unwrap();
        control.handle_daemon_msg().unwrap();
        assert_eq!(
            read_byte(to_umemd_read.as_raw_fd()).unwrap(),
            Some(QEMU_QUIT)
        );
        assert_eq!(
            control.state(),
            PIS_QUIT_RECEIVED | PIS_QUIT_QUEUED | PIS_QUIT_SENT
        );
        assert!(control.poll_fd().is_none());
        // after QUIT_SENT the daemon-facing write end is gone
        assert_eq!(read_byte(to_umemd_read.as_raw_fd()).unwrap(), None);
        assert!(!vm.0.load(Ordering::SeqCst));

        // cleanup is idempotent once the handshake ran
        control.cleanup();
        assert_eq!(
            control.state(),
            PIS_QUIT_RECEIVED | PIS_QUIT_QUEUED | PIS_QUIT_SENT
        );
    }

    #[test]
    fn test_control_error_stops_guest() {
        let (from_umemd_read, from_umemd_write) = pipe_pair().unwrap();
        let (_to_umemd_read, to_umemd_write) = pipe_pair().unwrap();
        let vm = Arc::new(StopFlag(AtomicBool::new(false)));
        let mut control = IncomingControl::new(to_umemd_write, from_umemd_read, vm.clone());

        write_byte(from_umemd_write.as_raw_fd(), DAEMON_ERROR).unwrap();
        control.handle_daemon_msg().unwrap();
        assert!(vm.0.load(Ordering::SeqCst));
        // an error alone does not complete the quit handshake
        assert_eq!(control.state(), 0);
    }
}

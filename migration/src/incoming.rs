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

//! Destination-side umem daemon.
//!
//! The daemon owns the UMEM devices backing guest RAM and runs five worker
//! threads: mig-read receives page payloads and stores them into shared
//! memory, mig-write turns guest faults into upstream page requests, the
//! pipe thread speaks the single-byte control protocol with the VMM, the
//! fault thread releases vCPUs once the VMM acknowledged a page, and the
//! pending-clean thread drains notifications that did not fit into the
//! fault-write pipe. With pre-copy, a sixth short-lived thread walks the
//! clean bitmap before demand paging starts.
//!
//! All coordination goes through one shared [`UmemDaemon`] record handed to
//! every thread at construction; the [`DaemonState`] bitset drives the
//! collective shutdown.

use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;
use std::slice::{from_raw_parts, from_raw_parts_mut};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::{error, info, trace, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};

use crate::config::IncomingConfig;
use crate::protocol::{
    self, UmemReq, DAEMON_ERROR, DAEMON_QUIT, DAEMON_READY, QEMU_QUIT, QEMU_READY,
    RAM_SAVE_FLAG_COMPRESS, RAM_SAVE_FLAG_CONTINUE, RAM_SAVE_FLAG_EOS, RAM_SAVE_FLAG_MEM_SIZE,
    RAM_SAVE_FLAG_PAGE, RAM_SAVE_FLAG_XBZRLE,
};
use crate::status::{self, DaemonState};
use crate::umem::{PageSizes, UmemBlock, UmemPages, MAX_REQUESTS};
use crate::MigrationError;
use util::unix::{is_read_write, set_nonblocking};

/// Offsets per fault-pipe write; each write stays within `PIPE_BUF` so that
/// concurrent writers never interleave inside one batch.
const PIPE_MAX_OFFS: usize = libc::PIPE_BUF / 8;

/// Timeout of the mig-write and pipe thread waits, so that flags set by
/// other threads are noticed without a dedicated wakeup channel.
const WORKER_POLL_MS: i32 = 1000;

fn pgoffs_as_bytes(pgoffs: &[u64]) -> &[u8] {
    // SAFETY: reinterpreting an aligned u64 slice as its raw bytes.
    unsafe { from_raw_parts(pgoffs.as_ptr() as *const u8, pgoffs.len() * 8) }
}

/// Reject migration channels that cannot carry the request stream back to
/// the source.
pub fn check_incoming_channel(fd: RawFd) -> Result<()> {
    if !is_read_write(fd)? {
        bail!(MigrationError::NonDuplexChannel);
    }
    Ok(())
}

struct PendingTotals {
    nr: u64,
    exit: bool,
}

struct PendingClean {
    totals: Mutex<PendingTotals>,
    cond: Condvar,
}

#[derive(Default)]
struct LateThreads {
    bitmap: Option<JoinHandle<()>>,
    pending_clean: Option<JoinHandle<()>>,
}

/// Shared state of the destination daemon, one instance per migration.
pub struct UmemDaemon {
    state: DaemonState,
    sizes: PageSizes,
    precopy_enabled: bool,
    blocks: Vec<Arc<UmemBlock>>,
    fault_write: Mutex<Option<Arc<OwnedFd>>>,
    pending: PendingClean,
    threads: Mutex<LateThreads>,
}

impl UmemDaemon {
    /// Build the daemon record from the incoming configuration, with the
    /// host page granule of the running kernel.
    pub fn new(
        blocks: Vec<Arc<UmemBlock>>,
        config: &IncomingConfig,
        precopy_enabled: bool,
        fault_write: OwnedFd,
    ) -> Result<Arc<Self>> {
        config.check()?;
        Self::with_sizes(
            blocks,
            PageSizes::new(config.target_page_size)?,
            precopy_enabled,
            fault_write,
        )
    }

    /// As [`new`] with an explicit page geometry. `fault_write` is the
    /// daemon end of the pipe towards the VMM ingestor; it is switched to
    /// non-blocking here since the mig-read thread must never stall on it.
    ///
    /// [`new`]: UmemDaemon::new
    pub fn with_sizes(
        blocks: Vec<Arc<UmemBlock>>,
        sizes: PageSizes,
        precopy_enabled: bool,
        fault_write: OwnedFd,
    ) -> Result<Arc<Self>> {
        set_nonblocking(fault_write.as_raw_fd(), true)?;
        Ok(Arc::new(UmemDaemon {
            state: DaemonState::new(),
            sizes,
            precopy_enabled,
            blocks,
            fault_write: Mutex::new(Some(Arc::new(fault_write))),
            pending: PendingClean {
                totals: Mutex::new(PendingTotals { nr: 0, exit: false }),
                cond: Condvar::new(),
            },
            threads: Mutex::new(LateThreads::default()),
        }))
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    pub fn blocks(&self) -> &[Arc<UmemBlock>] {
        &self.blocks
    }

    fn error_req(&self) {
        self.state.set(status::ERROR_REQ);
    }

    fn req_eoc(&self) {
        self.state.set(status::EOC_SEND_REQ);
    }

    fn eos_received(&self) {
        self.state.set(status::QUIT_QUEUED | status::EOS_RECEIVED);
    }

    /// Every page is resident; ask the source to finish and queue the quit
    /// handshake with the VMM.
    fn done(&self) {
        self.state.set(status::EOC_SEND_REQ | status::QUIT_QUEUED);
    }

    fn fault_write_fd(&self) -> Option<Arc<OwnedFd>> {
        self.fault_write.lock().unwrap().clone()
    }

    fn close_fault_write(&self) {
        self.fault_write.lock().unwrap().take();
        // a drain stuck on pipe room must notice the closure
        self.pending.cond.notify_all();
    }

    fn find_block(&self, addr: u64) -> Option<&Arc<UmemBlock>> {
        self.blocks.iter().find(|b| b.contains(addr))
    }

    /// Write guest-global host-page offsets to the fault-write pipe.
    ///
    /// In non-blocking mode, offsets that do not fit are parked in the
    /// per-block `pending_clean_bitmap` for the pending-clean thread; only
    /// offsets not yet written are parked, so no offset ever travels twice.
    fn fault_request(&self, pgoffs: &[u64], nonblock: bool) -> Result<()> {
        let mut rest = pgoffs;
        while !rest.is_empty() {
            let fd = self
                .fault_write_fd()
                .ok_or(MigrationError::FaultPipeClosed)?;
            let chunk = rest.len().min(PIPE_MAX_OFFS);
            match nix::unistd::write(fd.as_raw_fd(), pgoffs_as_bytes(&rest[..chunk])) {
                Ok(n) => rest = &rest[n / 8..],
                Err(Errno::EAGAIN) => {
                    if nonblock {
                        self.mark_pending_clean(rest);
                        return Ok(());
                    }
                    if !self.wait_fault_writable() {
                        bail!(MigrationError::FaultPipeClosed);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("fault-write pipe"),
            }
        }
        Ok(())
    }

    /// Block until the fault-write pipe accepts data again. False when the
    /// pipe is gone.
    fn wait_fault_writable(&self) -> bool {
        loop {
            let fd = match self.fault_write_fd() {
                Some(fd) => fd,
                None => return false,
            };
            let mut fds = [PollFd::new(fd.as_raw_fd(), PollFlags::POLLOUT)];
            match poll(&mut fds, -1) {
                Err(Errno::EINTR) => continue,
                Err(_) => return false,
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                        return false;
                    }
                    if revents.contains(PollFlags::POLLOUT) {
                        return true;
                    }
                }
            }
        }
    }

    /// Acknowledge block-local host pages to the UMEM device and notify the
    /// VMM ingestor. Pages some other path already acknowledged are dropped
    /// from the batch, keeping the per-page "cached" call exactly-once
    /// across demand load, the fast fault ack and the clean-bitmap walk.
    fn mark_cached(
        &self,
        block: &UmemBlock,
        pages: &mut UmemPages,
        global: &mut Vec<u64>,
    ) -> Result<()> {
        pages
            .pgoffs
            .retain(|&pgoff| !block.cached_bitmap.test_and_set(pgoff as usize).unwrap_or(true));
        if pages.pgoffs.is_empty() {
            return Ok(());
        }
        block.umem.mark_page_cached(pages)?;

        let base = block.host_pgoff_base(&self.sizes);
        global.clear();
        global.extend(pages.pgoffs.iter().map(|pgoff| base + pgoff));
        self.fault_request(global, true)
    }

    /// Record undeliverable notifications for the pending-clean thread.
    fn mark_pending_clean(&self, pgoffs: &[u64]) {
        let mut wakeup = false;
        let mut totals = self.pending.totals.lock().unwrap();
        for &pgoff in pgoffs {
            let addr = pgoff << self.sizes.host_page_shift;
            match self.find_block(addr) {
                Some(block) => {
                    let bit = ((addr - block.offset) >> self.sizes.host_page_shift) as usize;
                    if !block.pending_clean_bitmap.test_and_set(bit).unwrap_or(true) {
                        block.nr_pending_clean.fetch_add(1, Ordering::SeqCst);
                        totals.nr += 1;
                        wakeup = true;
                    }
                }
                None => warn!("pending host page 0x{:x} outside every block", pgoff),
            }
        }
        drop(totals);
        if wakeup {
            self.pending.cond.notify_all();
        }
    }

    /// Flush parked notifications into the fault-write pipe, blocking on
    /// pipe room. Bits are cleared before each write; anything mig-read
    /// parks meanwhile is caught by the next round.
    fn drain_pending_clean(&self) -> Result<()> {
        let max_nr = PIPE_MAX_OFFS - 1;
        let mut batch = Vec::with_capacity(max_nr);
        for block in &self.blocks {
            let base = block.host_pgoff_base(&self.sizes);
            loop {
                batch.clear();
                {
                    let mut totals = self.pending.totals.lock().unwrap();
                    if block.nr_pending_clean.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                    let mut bit = 0_usize;
                    while let Some(found) = block.pending_clean_bitmap.find_next(bit) {
                        block.pending_clean_bitmap.clear(found)?;
                        block.nr_pending_clean.fetch_sub(1, Ordering::SeqCst);
                        totals.nr -= 1;
                        batch.push(base + found as u64);
                        if batch.len() == max_nr {
                            break;
                        }
                        bit = found + 1;
                    }
                }
                if batch.is_empty() {
                    break;
                }
                self.fault_request(&batch, false)?;
            }
        }
        Ok(())
    }

    /// Unmap every finished block; once all are finished, start the orderly
    /// shutdown. Returns whether everything is done.
    fn check_umem_done(&self) -> bool {
        for block in &self.blocks {
            if !block.umem.shmem_finished() {
                return false;
            }
            if !block.unmapped.swap(true, Ordering::SeqCst) {
                if let Err(e) = block.umem.unmap_shmem() {
                    warn!("failed to unmap block {}: {:?}", block.idstr, e);
                }
            }
        }
        info!("all blocks resident, requesting shutdown");
        self.done();
        true
    }

    fn spawn_pending_clean(self: &Arc<Self>) {
        let daemon = self.clone();
        match thread::Builder::new()
            .name("mig-pending-clean".to_string())
            .spawn(move || pending_clean_loop(&daemon))
        {
            Ok(handle) => self.threads.lock().unwrap().pending_clean = Some(handle),
            Err(e) => {
                error!("failed to spawn pending-clean thread: {:?}", e);
                self.error_req();
            }
        }
    }

    fn spawn_bitmap_thread(self: &Arc<Self>) {
        let daemon = self.clone();
        match thread::Builder::new()
            .name("mig-bitmap".to_string())
            .spawn(move || {
                if let Err(e) = walk_clean_bitmap(&daemon) {
                    error!("clean bitmap walk failed: {:?}", e);
                    daemon.close_fault_write();
                }
                // the walk floods the pipe, a backlog is likely by now
                daemon.spawn_pending_clean();
            }) {
            Ok(handle) => self.threads.lock().unwrap().bitmap = Some(handle),
            Err(e) => {
                error!("failed to spawn bitmap thread: {:?}", e);
                self.error_req();
            }
        }
    }

    /// Run the daemon to completion.
    ///
    /// `mig_read`/`mig_write` are the two halves of the duplex migration
    /// channel, `to_qemu`/`from_qemu` the control pipes, and `fault_read`
    /// the echo pipe from the VMM ingestor. The call returns once every
    /// worker thread converged on the shutdown mask.
    pub fn run(
        self: &Arc<Self>,
        mig_read: Box<dyn Read + Send>,
        mig_write: Box<dyn Write + Send>,
        to_qemu: OwnedFd,
        from_qemu: OwnedFd,
        fault_read: OwnedFd,
    ) -> Result<()> {
        info!(
            "umem daemon starts: {} blocks, precopy {}",
            self.blocks.len(),
            self.precopy_enabled
        );

        let fault = FaultWorker {
            daemon: self.clone(),
            fault_read,
            buf: vec![0_u64; PIPE_MAX_OFFS],
            filled: 0,
        };
        let fault_handle = thread::Builder::new()
            .name("mig-fault".to_string())
            .spawn(move || fault.run())
            .with_context(|| "Failed to spawn fault thread")?;

        let mut reader = MigReadWorker::new(self.clone(), mig_read);
        let read_handle = thread::Builder::new()
            .name("mig-read".to_string())
            .spawn(move || {
                let daemon = reader.daemon.clone();
                if let Err(e) = reader.init() {
                    error!("mig-read init failed: {:?}", e);
                    daemon.error_req();
                    return;
                }
                worker_loop(&daemon, "mig-read", || reader.body());
            })
            .with_context(|| "Failed to spawn mig-read thread")?;

        let mut writer = MigWriteWorker::new(self.clone(), mig_write)?;
        let write_handle = thread::Builder::new()
            .name("mig-write".to_string())
            .spawn(move || {
                let daemon = writer.daemon.clone();
                worker_loop(&daemon, "mig-write", || writer.body());
            })
            .with_context(|| "Failed to spawn mig-write thread")?;

        let mut pipe = PipeWorker {
            daemon: self.clone(),
            to_qemu: Some(to_qemu),
            from_qemu: Some(from_qemu),
        };
        let pipe_handle = thread::Builder::new()
            .name("mig-pipe".to_string())
            .spawn(move || {
                let daemon = pipe.daemon.clone();
                if let Err(e) = pipe.init() {
                    error!("pipe thread init failed: {:?}", e);
                    daemon.error_req();
                    return;
                }
                worker_loop(&daemon, "mig-pipe", || pipe.body());
            })
            .with_context(|| "Failed to spawn pipe thread")?;

        let _ = read_handle.join();
        if let Some(handle) = self.threads.lock().unwrap().bitmap.take() {
            let _ = handle.join();
        }
        let _ = write_handle.join();
        let _ = pipe_handle.join();

        {
            let mut totals = self.pending.totals.lock().unwrap();
            totals.exit = true;
        }
        self.pending.cond.notify_all();
        if let Some(handle) = self.threads.lock().unwrap().pending_clean.take() {
            let _ = handle.join();
        }

        // Closing the fault-write pipe tells the VMM ingestor to exit, which
        // closes the echo pipe in turn and lets the fault thread drain out.
        self.close_fault_write();
        let _ = fault_handle.join();

        for block in &self.blocks {
            if !block.unmapped.swap(true, Ordering::SeqCst) {
                if let Err(e) = block.umem.unmap_shmem() {
                    warn!("failed to unmap block {}: {:?}", block.idstr, e);
                }
            }
        }

        let leftover = self.pending.totals.lock().unwrap().nr;
        if leftover != 0 {
            warn!("{} pending-clean pages were never delivered", leftover);
        }
        info!("umem daemon done, state 0x{:x}", self.state.snapshot());
        Ok(())
    }
}

/// Shared worker shape: run `body` until the end mask is reached, the body
/// asks to stop, or it fails (which requests the error notification).
fn worker_loop<F>(daemon: &Arc<UmemDaemon>, name: &str, mut body: F)
where
    F: FnMut() -> Result<bool>,
{
    loop {
        if daemon.state.end_reached() {
            break;
        }
        match body() {
            Ok(false) => {}
            Ok(true) => break,
            Err(e) => {
                error!("{} thread failed: {:?}", name, e);
                daemon.error_req();
                break;
            }
        }
    }
    info!("{} thread exits", name);
}

enum LoadOutcome {
    Progress,
    Eos,
}

/// Receives page payloads from the source and lands them in shared memory.
struct MigReadWorker {
    daemon: Arc<UmemDaemon>,
    stream: Option<Box<dyn Read + Send>>,
    last_block: Option<usize>,
    page_cached: UmemPages,
    global: Vec<u64>,
}

impl MigReadWorker {
    fn new(daemon: Arc<UmemDaemon>, stream: Box<dyn Read + Send>) -> Self {
        let worst_batch = daemon.sizes.nr_host_per_target() as usize;
        MigReadWorker {
            daemon,
            stream: Some(stream),
            last_block: None,
            page_cached: UmemPages::new(worst_batch),
            global: Vec::with_capacity(worst_batch),
        }
    }

    /// With pre-copy, consume the clean bitmap and fast-path it before the
    /// response stream starts; otherwise only arm the overflow drain.
    fn init(&mut self) -> Result<()> {
        if !self.daemon.precopy_enabled {
            self.daemon.spawn_pending_clean();
            return Ok(());
        }
        self.read_clean_bitmap()?;
        self.daemon.spawn_bitmap_thread();
        self.daemon.check_umem_done();
        Ok(())
    }

    fn read_clean_bitmap(&mut self) -> Result<()> {
        let daemon = self.daemon.clone();
        let stream: &mut (dyn Read + Send) = self
            .stream
            .as_mut()
            .ok_or(MigrationError::NoBlockToContinue)?
            .as_mut();
        loop {
            let rec = match protocol::recv_clean_bitmap_record(&mut *stream)? {
                Some(rec) => rec,
                None => break,
            };
            let block = daemon
                .blocks
                .iter()
                .find(|b| b.idstr == rec.idstr)
                .ok_or_else(|| anyhow!(MigrationError::UnknownBlock(rec.idstr.clone())))?;
            if rec.words.len() != block.phys_received.word_count() {
                bail!(MigrationError::BitmapMismatch(
                    rec.words.len() as u64 * 8,
                    block.length
                ));
            }
            // The wire carries clean bits, which ARE the received pages.
            for (index, word) in rec.words.iter().enumerate() {
                block.phys_received.store_word(index, *word)?;
            }
            block.phys_requested.copy_from(&block.phys_received)?;
            if let Some(clean) = &block.clean_bitmap {
                clean.copy_from(&block.phys_received)?;
            }
            trace!(
                "clean bitmap for {}: {} pages already present",
                block.idstr,
                block.phys_received.count()
            );
        }
        info!("clean bitmap received");
        Ok(())
    }

    fn body(&mut self) -> Result<bool> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => return Ok(true),
        };
        match self.load_one(stream.as_mut()) {
            Ok(LoadOutcome::Progress) => {
                self.stream = Some(stream);
                Ok(false)
            }
            Ok(LoadOutcome::Eos) => {
                // the reader is dropped here, the source gets EOC next
                self.daemon.req_eoc();
                self.daemon.eos_received();
                Ok(true)
            }
            Err(e) => {
                self.stream = Some(stream);
                Err(e)
            }
        }
    }

    fn load_one(&mut self, stream: &mut (dyn Read + Send)) -> Result<LoadOutcome> {
        let sizes = self.daemon.sizes;
        let (offset, flags) = protocol::recv_page_header(&mut *stream, sizes.target_page_size)?;
        if flags & RAM_SAVE_FLAG_EOS != 0 {
            info!("EOS received");
            return Ok(LoadOutcome::Eos);
        }
        if flags & RAM_SAVE_FLAG_MEM_SIZE != 0 {
            // The memory-size record belongs before hand-off; here it means
            // the two sides disagree about the stream position.
            bail!(MigrationError::UnexpectedFlags(flags));
        }
        if flags & (RAM_SAVE_FLAG_COMPRESS | RAM_SAVE_FLAG_PAGE | RAM_SAVE_FLAG_XBZRLE) == 0 {
            trace!("ignoring flags 0x{:x}", flags);
            return Ok(LoadOutcome::Progress);
        }

        let block_idx = if flags & RAM_SAVE_FLAG_CONTINUE != 0 {
            self.last_block.ok_or(MigrationError::NoBlockToContinue)?
        } else {
            let idstr = protocol::recv_block_id(&mut *stream)?;
            let idx = self
                .daemon
                .blocks
                .iter()
                .position(|b| b.idstr == idstr)
                .ok_or(MigrationError::UnknownBlock(idstr))?;
            self.last_block = Some(idx);
            idx
        };
        let block = self.daemon.blocks[block_idx].clone();
        if offset + sizes.target_page_size > block.length {
            bail!(MigrationError::PageOutOfRange(offset));
        }

        // SAFETY: the offset was bounds-checked against the block above and
        // the mig-read thread is the only writer of the shared mapping.
        let dst = unsafe {
            from_raw_parts_mut(
                (block.umem.shmem_host_addr() + offset) as *mut u8,
                sizes.target_page_size as usize,
            )
        };
        protocol::recv_page_payload(&mut *stream, flags, dst)?;

        self.ram_loaded(&block, offset)?;
        Ok(LoadOutcome::Progress)
    }

    /// A target page landed in shared memory at block-local `offset`; tell
    /// UMEM and the VMM about every host page that became whole.
    fn ram_loaded(&mut self, block: &UmemBlock, offset: u64) -> Result<()> {
        let daemon = self.daemon.clone();
        let sizes = daemon.sizes;
        let bit = (offset >> sizes.target_page_shift) as usize;

        self.page_cached.pgoffs.clear();
        if !block.phys_received.test_and_set(bit)? {
            if sizes.target_covers_host() {
                let pgoff = offset >> sizes.host_page_shift;
                for i in 0..sizes.nr_host_per_target() {
                    self.page_cached.pgoffs.push(pgoff + i);
                }
            } else {
                let ratio = sizes.nr_target_per_host() as usize;
                let base = bit & !(ratio - 1);
                let mut whole = true;
                for i in 0..ratio {
                    if !block.phys_received.contain(base + i)? {
                        whole = false;
                        break;
                    }
                }
                if whole {
                    self.page_cached.pgoffs.push(offset >> sizes.host_page_shift);
                }
            }
        }

        if !self.page_cached.pgoffs.is_empty() {
            daemon.mark_cached(block, &mut self.page_cached, &mut self.global)?;
        }
        Ok(())
    }
}

/// Turns guest faults pulled from the UMEM devices into upstream requests.
struct MigWriteWorker {
    daemon: Arc<UmemDaemon>,
    stream: Option<Box<dyn Write + Send>>,
    epoll: Epoll,
    ready_events: Vec<EpollEvent>,
    last_block: Option<usize>,
    page_request: UmemPages,
    page_clean: UmemPages,
    req_pgoffs: Vec<u64>,
}

impl MigWriteWorker {
    fn new(daemon: Arc<UmemDaemon>, stream: Box<dyn Write + Send>) -> Result<Self> {
        let epoll = Epoll::new().with_context(|| "Failed to create epoll")?;
        for (index, block) in daemon.blocks.iter().enumerate() {
            epoll
                .ctl(
                    ControlOperation::Add,
                    block.umem.as_raw_fd(),
                    EpollEvent::new(EventSet::IN, index as u64),
                )
                .with_context(|| format!("Failed to watch umem fd of {}", block.idstr))?;
        }
        let nr_events = daemon.blocks.len().max(1);
        let clean_batch = MAX_REQUESTS
            * daemon
                .sizes
                .nr_host_per_target()
                .max(daemon.sizes.nr_target_per_host()) as usize;
        Ok(MigWriteWorker {
            daemon,
            stream: Some(stream),
            epoll,
            ready_events: vec![EpollEvent::default(); nr_events],
            last_block: None,
            page_request: UmemPages::new(MAX_REQUESTS),
            page_clean: UmemPages::new(clean_batch),
            req_pgoffs: Vec::with_capacity(clean_batch),
        })
    }

    fn body(&mut self) -> Result<bool> {
        let nr = match self.epoll.wait(WORKER_POLL_MS, &mut self.ready_events) {
            Ok(nr) => nr,
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => 0,
            Err(e) => return Err(e).context("umem fd wait"),
        };
        let ready: Vec<usize> = self.ready_events[..nr]
            .iter()
            .map(|ev| ev.data() as usize)
            .collect();
        for block_idx in ready {
            self.send_page_req(block_idx)?;
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.flush()?;
        }
        self.check_eoc_req();
        Ok(false)
    }

    /// Serve one batch of faults from one block: already-present pages get
    /// a fast local ack, the rest are marked requested and sent upstream.
    fn send_page_req(&mut self, block_idx: usize) -> Result<()> {
        let daemon = self.daemon.clone();
        let sizes = daemon.sizes;
        let block = &daemon.blocks[block_idx];

        block
            .umem
            .get_page_request(&mut self.page_request, MAX_REQUESTS)?;
        if self.page_request.pgoffs.is_empty() {
            return Ok(());
        }
        trace!(
            "{} faults on {}, first 0x{:x}",
            self.page_request.pgoffs.len(),
            block.idstr,
            self.page_request.pgoffs[0]
        );

        self.page_clean.pgoffs.clear();
        self.req_pgoffs.clear();
        if sizes.target_covers_host() {
            for &pgoff in &self.page_request.pgoffs {
                let tp = sizes.target_pgoff_of_host(pgoff) as usize;
                // Racing with the clean-bitmap transfer or a ram load here
                // is fine, it only costs a redundant request or ack.
                let known = block
                    .clean_bitmap
                    .as_ref()
                    .map_or(false, |clean| clean.contain(tp).unwrap_or(false))
                    || block.phys_received.contain(tp)?;
                if known {
                    let host_base = sizes.host_pgoff_of_target(tp as u64);
                    for i in 0..sizes.nr_host_per_target() {
                        self.page_clean.pgoffs.push(host_base + i);
                    }
                } else if !block.phys_requested.test_and_set(tp)? {
                    self.req_pgoffs.push(tp as u64);
                }
            }
        } else {
            let ratio = sizes.nr_target_per_host() as usize;
            for &pgoff in &self.page_request.pgoffs {
                let tp0 = sizes.target_pgoff_of_host(pgoff) as usize;
                let mut known = true;
                for i in 0..ratio {
                    let present = block
                        .clean_bitmap
                        .as_ref()
                        .map_or(false, |clean| clean.contain(tp0 + i).unwrap_or(false))
                        || block.phys_received.contain(tp0 + i)?;
                    if !present {
                        known = false;
                        break;
                    }
                }
                if known {
                    self.page_clean.pgoffs.push(pgoff);
                } else {
                    for i in 0..ratio {
                        if !block.phys_requested.test_and_set(tp0 + i)? {
                            self.req_pgoffs.push((tp0 + i) as u64);
                        }
                    }
                }
            }
        }

        if !self.page_clean.pgoffs.is_empty() {
            // Fast ack without a network round-trip. Deduplicate against
            // acks the clean-bitmap walk may have issued concurrently.
            self.page_clean
                .pgoffs
                .retain(|&pgoff| !block.cached_bitmap.test_and_set(pgoff as usize).unwrap_or(true));
            if !self.page_clean.pgoffs.is_empty() {
                block.umem.mark_page_cached(&self.page_clean)?;
            }
        }
        if !self.req_pgoffs.is_empty() {
            if let Some(stream) = self.stream.as_mut() {
                let req = if self.last_block == Some(block_idx) {
                    UmemReq::PageCont {
                        pgoffs: self.req_pgoffs.clone(),
                    }
                } else {
                    UmemReq::Page {
                        idstr: block.idstr.clone(),
                        pgoffs: self.req_pgoffs.clone(),
                    }
                };
                protocol::send_request(stream.as_mut(), &req)?;
                self.last_block = Some(block_idx);
            }
        }
        Ok(())
    }

    /// Send the final EOC once requested, then close the upstream writer.
    /// Send errors are only logged: the source may already be gone and the
    /// shutdown must still converge.
    fn check_eoc_req(&mut self) {
        if !self.daemon.state.transition(
            status::EOC_SEND_REQ,
            status::EOC_SENDING | status::EOC_SENT,
            status::EOC_SENDING,
        ) {
            return;
        }
        if let Some(mut stream) = self.stream.take() {
            let result = protocol::send_request(stream.as_mut(), &UmemReq::Eoc)
                .map_err(anyhow::Error::from)
                .and_then(|_| stream.flush().map_err(anyhow::Error::from));
            if let Err(e) = result {
                warn!("EOC send failed: {:?}", e);
            }
        }
        self.daemon.state.set(status::EOC_SENT);
        info!("EOC sent");
    }
}

/// Speaks the single-byte control protocol with the VMM main process.
struct PipeWorker {
    daemon: Arc<UmemDaemon>,
    to_qemu: Option<OwnedFd>,
    from_qemu: Option<OwnedFd>,
}

impl PipeWorker {
    /// Announce readiness, then wait for the VMM to disown the migration
    /// channel before any worker touches it.
    fn init(&mut self) -> Result<()> {
        let to_qemu = self
            .to_qemu
            .as_ref()
            .ok_or(MigrationError::FaultPipeClosed)?;
        write_byte(to_qemu.as_raw_fd(), DAEMON_READY)?;
        let from_qemu = self
            .from_qemu
            .as_ref()
            .ok_or(MigrationError::FaultPipeClosed)?;
        match read_byte(from_qemu.as_raw_fd())? {
            Some(QEMU_READY) => Ok(()),
            Some(other) => bail!(MigrationError::UnknownPipeCommand(other)),
            None => bail!(MigrationError::FaultPipeClosed),
        }
    }

    fn body(&mut self) -> Result<bool> {
        match self.from_qemu.as_ref().map(|fd| fd.as_raw_fd()) {
            Some(from_fd) => {
                let mut fds = [PollFd::new(from_fd, PollFlags::POLLIN)];
                match poll(&mut fds, WORKER_POLL_MS) {
                    Err(Errno::EINTR) => return Ok(false),
                    Err(e) => return Err(e).context("control pipe wait"),
                    Ok(_) => {}
                }
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
                    match read_byte(from_fd)? {
                        Some(QEMU_QUIT) => {
                            info!("VMM requested quit");
                            self.recv_quit();
                            self.daemon.done();
                        }
                        Some(other) => bail!(MigrationError::UnknownPipeCommand(other)),
                        None => self.from_qemu = None,
                    }
                }
            }
            // keep pacing the flag checks below once the pipe is gone
            None => thread::sleep(Duration::from_millis(WORKER_POLL_MS as u64)),
        }

        if let Some(to_qemu) = &self.to_qemu {
            if self
                .daemon
                .state
                .transition(status::ERROR_REQ, status::ERROR_SENDING, status::ERROR_SENDING)
            {
                write_byte(to_qemu.as_raw_fd(), DAEMON_ERROR)?;
                self.daemon.state.set(status::ERROR_SENT);
                warn!("daemon error reported to the VMM");
            }
        }
        if self.to_qemu.is_some()
            && self.daemon.state.transition(
                status::QUIT_QUEUED,
                status::QUIT_SENDING | status::QUIT_SENT,
                status::QUIT_SENDING,
            )
        {
            if let Some(to_qemu) = self.to_qemu.take() {
                write_byte(to_qemu.as_raw_fd(), DAEMON_QUIT)?;
            }
            self.daemon.state.set(status::QUIT_SENT);
            info!("quit sent to the VMM");
        }
        Ok(false)
    }

    fn recv_quit(&mut self) {
        if self
            .daemon
            .state
            .transition(0, status::QUIT_RECEIVED, status::QUIT_RECEIVED)
        {
            self.from_qemu = None;
            self.daemon.state.set(status::QUIT_HANDLED);
        }
    }
}

/// Consumes page acknowledgements echoed back by the VMM ingestor and
/// releases the vCPUs waiting on them.
struct FaultWorker {
    daemon: Arc<UmemDaemon>,
    fault_read: OwnedFd,
    buf: Vec<u64>,
    filled: usize,
}

impl FaultWorker {
    fn run(mut self) {
        loop {
            match self.step() {
                Ok(false) => {}
                Ok(true) => break,
                Err(e) => {
                    error!("fault thread failed: {:?}", e);
                    self.daemon.error_req();
                    break;
                }
            }
        }
        info!("fault thread exits");
    }

    fn step(&mut self) -> Result<bool> {
        let len = self.buf.len() * 8;
        // SAFETY: the u64 buffer is viewed as bytes for the pipe read; the
        // carry arithmetic below keeps `filled` within it.
        let bytes =
            unsafe { from_raw_parts_mut(self.buf.as_mut_ptr() as *mut u8, len) };
        let nread = match nix::unistd::read(
            self.fault_read.as_raw_fd(),
            &mut bytes[self.filled..],
        ) {
            Ok(0) => return Ok(true),
            Ok(nread) => nread,
            Err(Errno::EINTR) => return Ok(false),
            Err(e) => return Err(e).context("fault-read pipe"),
        };
        self.filled += nread;

        let nreq = self.filled / 8;
        for i in 0..nreq {
            let pgoff = self.buf[i];
            let addr = pgoff << self.daemon.sizes.host_page_shift;
            let block = self
                .daemon
                .find_block(addr)
                .ok_or(MigrationError::UnknownHostPage(pgoff))?;
            block
                .umem
                .remove_shmem(addr - block.offset, self.daemon.sizes.host_page_size)?;
        }

        // keep a torn trailing offset for the next read
        let consumed = nreq * 8;
        let remainder = self.filled - consumed;
        // SAFETY: same buffer view as above, both ranges are in bounds.
        let bytes = unsafe { from_raw_parts_mut(self.buf.as_mut_ptr() as *mut u8, len) };
        bytes.copy_within(consumed..self.filled, 0);
        self.filled = remainder;

        if nreq > 0 && self.daemon.check_umem_done() {
            return Ok(true);
        }
        Ok(false)
    }
}

/// Overflow drain for the fault-write pipe. Parked notifications are pushed
/// once the pipe has room again; a one second nap batches what mig-read
/// keeps parking meanwhile.
fn pending_clean_loop(daemon: &Arc<UmemDaemon>) {
    info!("pending-clean thread starts");
    loop {
        let do_sleep;
        {
            let mut totals = daemon.pending.totals.lock().unwrap();
            while totals.nr == 0 && !totals.exit {
                totals = daemon.pending.cond.wait(totals).unwrap();
            }
            if totals.nr == 0 && totals.exit {
                break;
            }
            do_sleep = !totals.exit;
        }

        if !daemon.wait_fault_writable() {
            break;
        }
        if do_sleep {
            thread::sleep(Duration::from_secs(1));
        }
        if let Err(e) = daemon.drain_pending_clean() {
            error!("pending-clean drain failed: {:?}", e);
            daemon.close_fault_write();
            break;
        }
    }
    info!("pending-clean thread exits");
}

/// Acknowledge every page the clean bitmap reports as already present, in
/// `PIPE_BUF` sized batches, before demand paging begins.
fn walk_clean_bitmap(daemon: &Arc<UmemDaemon>) -> Result<()> {
    let sizes = daemon.sizes;
    let needed = if sizes.target_covers_host() {
        sizes.nr_host_per_target() as usize
    } else {
        1
    };
    let mut pages = UmemPages::new(PIPE_MAX_OFFS);
    let mut global = Vec::with_capacity(PIPE_MAX_OFFS);

    for block in &daemon.blocks {
        let clean = match &block.clean_bitmap {
            Some(clean) => clean,
            None => continue,
        };
        let nbits = block.nr_target_pages(&sizes) as usize;
        pages.pgoffs.clear();
        let mut bit = 0_usize;
        while let Some(found) = clean.find_next(bit) {
            if found >= nbits {
                // padding bits past the block tail
                break;
            }
            if sizes.target_covers_host() {
                let pgoff = sizes.host_pgoff_of_target(found as u64);
                for i in 0..sizes.nr_host_per_target() {
                    pages.pgoffs.push(pgoff + i);
                }
                bit = found + 1;
            } else {
                let ratio = sizes.nr_target_per_host() as usize;
                if found % ratio != 0 {
                    // skip to the next host page boundary
                    bit = (found | (ratio - 1)) + 1;
                    continue;
                }
                let mut whole = true;
                for i in 0..ratio {
                    if !clean.contain(found + i)? {
                        whole = false;
                        break;
                    }
                }
                if whole {
                    pages.pgoffs.push(sizes.host_pgoff_of_target(found as u64));
                }
                bit = found + 1;
            }
            if PIPE_MAX_OFFS - pages.pgoffs.len() < needed {
                daemon.mark_cached(block, &mut pages, &mut global)?;
                pages.pgoffs.clear();
            }
        }
        if !pages.pgoffs.is_empty() {
            daemon.mark_cached(block, &mut pages, &mut global)?;
            pages.pgoffs.clear();
        }
        trace!("clean bitmap of {} walked", block.idstr);
    }
    Ok(())
}

pub(crate) fn write_byte(fd: RawFd, byte: u8) -> Result<()> {
    loop {
        match nix::unistd::write(fd, &[byte]) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("control pipe write"),
        }
    }
}

/// Read one byte; `None` is end-of-file.
pub(crate) fn read_byte(fd: RawFd) -> Result<Option<u8>> {
    let mut byte = [0_u8; 1];
    loop {
        match nix::unistd::read(fd, &mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("control pipe read"),
        }
    }
}

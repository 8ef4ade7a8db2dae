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

//! Source-side post-copy engine.
//!
//! After hand-off the source turns into a page server: a single thread
//! multiplexes demand requests from the destination with a rate-limited
//! background stream of the remaining dirty pages over one duplex channel.
//! Demand always wins; the background scan yields as soon as a request is
//! pending or the channel back-pressures.

use std::fs::File;
use std::io::Write;
use std::os::fd::FromRawFd;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use log::{info, trace, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use crate::config::OutgoingConfig;
use crate::protocol::{self, CleanBitmapRecord, RequestDecoder, UmemReq};
use crate::status::OutgoingState;
use crate::MigrationError;
use util::leak_bucket::LeakBucket;
use util::unix::{is_read_write, set_nonblocking};

/// Cap on how long one background slice may hold the RAM list.
const MAX_BACKGROUND_WAIT: Duration = Duration::from_millis(50);

/// Immutable description of one guest RAM block on the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RamBlockMeta {
    pub idstr: String,
    pub offset: u64,
    pub length: u64,
}

/// RAM-save machinery of the enclosing migration framework.
///
/// The engine decides *which* page goes out next; the implementor owns the
/// dirty bitmaps and the page encoding (raw, fill or delta, see
/// [`protocol`]).
pub trait RamSaveOps: Send {
    /// All guest RAM blocks, in migration order.
    fn blocks(&self) -> Vec<RamBlockMeta>;

    /// Look a block up by its id string.
    fn find_block(&self, idstr: &str) -> Option<RamBlockMeta>;

    /// Dirty bitmap of `block`: one bit per target page, 64 pages per word.
    fn dirty_bitmap(&self, block: &RamBlockMeta) -> Vec<u64>;

    /// Transmit the page at byte `offset` within `block`. Returns the bytes
    /// put on the wire.
    fn save_page(
        &mut self,
        w: &mut dyn Write,
        block: &RamBlockMeta,
        offset: u64,
    ) -> Result<usize>;

    /// Transmit the next still-dirty page of the background scan. `None`
    /// once no dirty page remains.
    fn save_background(&mut self, w: &mut dyn Write) -> Result<Option<usize>>;

    /// Move the background scan cursor near the demand working set.
    fn set_last_seen(&mut self, block: &RamBlockMeta, offset: u64);

    /// Dirty bytes still to transfer.
    fn bytes_remaining(&self) -> u64;

    /// Run one pre-copy iteration. `true` once the stage is complete.
    fn save_iterate(&mut self, w: &mut dyn Write) -> Result<bool>;

    /// Final dirty-bitmap sync; dirty logging stops here.
    fn sync_and_stop_dirty_log(&mut self) -> Result<()>;

    /// Mark all of RAM dirty when pre-copy never ran.
    fn init_dirty_bitmap(&mut self) -> Result<()>;

    /// Reset the bulk-stage bookkeeping at the end of pre-copy.
    fn reset_bulk_stage(&mut self);
}

/// The source-side post-copy session.
pub struct PostcopyOutgoing<W: Write + AsRawFd> {
    config: OutgoingConfig,
    state: OutgoingState,
    channel: W,
    read_file: File,
    decoder: RequestDecoder,
    ram: Box<dyn RamSaveOps>,
    limit: LeakBucket,
    last_block_read: Option<RamBlockMeta>,
    iterations: u32,
    force_postcopy: bool,
    no_background: bool,
}

impl<W: Write + AsRawFd> PostcopyOutgoing<W> {
    /// Wrap the duplex migration channel. The read side is a dup'ed
    /// descriptor dedicated to the request stream; channels not opened
    /// read/write are rejected.
    pub fn new(channel: W, ram: Box<dyn RamSaveOps>, config: OutgoingConfig) -> Result<Self> {
        config.check()?;
        if !is_read_write(channel.as_raw_fd())? {
            bail!(MigrationError::NonDuplexChannel);
        }
        let read_fd =
            nix::unistd::dup(channel.as_raw_fd()).with_context(|| "Failed to dup channel")?;
        // SAFETY: dup just returned the descriptor, nothing else owns it.
        let read_file = unsafe { File::from_raw_fd(read_fd) };
        set_nonblocking(read_fd, true)?;
        let no_background = config.no_background;
        Ok(PostcopyOutgoing {
            limit: LeakBucket::new(config.bandwidth)?,
            config,
            state: OutgoingState::Active,
            channel,
            read_file,
            decoder: RequestDecoder::new(),
            ram,
            last_block_read: None,
            iterations: 0,
            force_postcopy: false,
            no_background,
        })
    }

    pub fn state(&self) -> OutgoingState {
        self.state
    }

    /// Stop iterating pre-copy and switch to post-copy at the next stage
    /// boundary.
    pub fn force_postcopy_phase(&mut self) {
        self.force_postcopy = true;
    }

    /// Enable or disable the background stream at runtime.
    pub fn set_background(&mut self, enable: bool) {
        self.no_background = !enable;
    }

    /// Announce the post-copy hand-off in the migration stream.
    pub fn send_init_section(&mut self) -> Result<()> {
        protocol::send_init_section(&mut self.channel, self.config.precopy_count > 0)?;
        Ok(())
    }

    /// Ship the opaque device state captured by the enclosing framework.
    pub fn send_device_state(&mut self, state: &[u8]) -> Result<()> {
        protocol::send_device_state_section(&mut self.channel, state)?;
        self.channel.flush()?;
        Ok(())
    }

    /// Begin the post-copy phase: transfer the clean bitmap if pre-copy
    /// ran, then reset the rate limiter.
    pub fn begin(&mut self) -> Result<()> {
        self.force_postcopy = false;
        if self.config.precopy_count > 0 {
            self.send_clean_bitmap()?;
        }
        self.channel.flush()?;
        self.limit.reset();
        self.state = OutgoingState::Active;
        info!(
            "postcopy begins: prefault forward {} backward {}",
            self.config.prefault_forward, self.config.prefault_backward
        );
        Ok(())
    }

    /// One pre-copy iteration; forwards to the ordinary dirty-page
    /// iterator. `true` once the pre-copy stage is over.
    pub fn save_iterate(&mut self) -> Result<bool> {
        if self.config.precopy_count == 0 || self.force_postcopy {
            protocol::send_eos(&mut self.channel)?;
            return Ok(true);
        }
        if self.ram.save_iterate(&mut self.channel)? {
            return Ok(true);
        }
        if self.ram.bytes_remaining() == 0 {
            return Ok(true);
        }
        self.iterations += 1;
        Ok(self.iterations >= self.config.precopy_count)
    }

    /// End of pre-copy: settle the dirty bitmap and mark the stream.
    pub fn save_complete(&mut self) -> Result<()> {
        if self.config.precopy_count > 0 {
            self.ram.sync_and_stop_dirty_log()?;
        } else {
            self.ram.init_dirty_bitmap()?;
        }
        self.ram.reset_bulk_stage();
        protocol::send_eos(&mut self.channel)?;
        self.channel.flush()?;
        Ok(())
    }

    /// Bytes the rate limiter should still account for, zero once the
    /// pre-copy stage is done.
    pub fn save_pending(&mut self) -> u64 {
        if self.config.precopy_count > 0
            && self.iterations < self.config.precopy_count
            && !self.force_postcopy
        {
            self.ram.bytes_remaining()
        } else {
            0
        }
    }

    /// The post-copy scheduler loop. Returns the terminal state, i.e.
    /// [`OutgoingState::Completed`] or [`OutgoingState::ErrorReceive`].
    pub fn run(&mut self) -> Result<OutgoingState> {
        while self.state != OutgoingState::Completed && self.state != OutgoingState::ErrorReceive {
            self.loop_once()?;
        }
        info!("postcopy outgoing done: {}", self.state);
        Ok(self.state)
    }

    fn set_state(&mut self, new_state: OutgoingState) -> Result<()> {
        info!("outgoing state {} -> {}", self.state, new_state);
        self.state = self.state.transfer(new_state)?;
        Ok(())
    }

    fn send_clean_bitmap(&mut self) -> Result<()> {
        for block in self.ram.blocks() {
            let dirty = self.ram.dirty_bitmap(&block);
            // invert on the wire: a set bit means clean / already present
            let rec = CleanBitmapRecord {
                idstr: block.idstr.clone(),
                offset: block.offset,
                length: block.length,
                words: dirty.iter().map(|word| !word).collect(),
            };
            protocol::send_clean_bitmap_record(&mut self.channel, &rec)?;
        }
        protocol::send_clean_bitmap_terminator(&mut self.channel)?;
        info!("clean bitmap sent");
        Ok(())
    }

    fn loop_once(&mut self) -> Result<()> {
        let mut fds = Vec::with_capacity(2);
        let mut read_idx = None;
        let mut write_idx = None;
        let mut timeout = -1_i32;

        if matches!(
            self.state,
            OutgoingState::Active | OutgoingState::AllPagesSent
        ) {
            fds.push(PollFd::new(self.read_file.as_raw_fd(), PollFlags::POLLIN));
            read_idx = Some(fds.len() - 1);
        }
        if matches!(
            self.state,
            OutgoingState::Active | OutgoingState::EocReceived
        ) {
            if self.limit.throttled(0) {
                timeout = self
                    .limit
                    .residual_sleep()
                    .as_millis()
                    .clamp(1, i32::MAX as u128) as i32;
            } else {
                fds.push(PollFd::new(self.channel.as_raw_fd(), PollFlags::POLLOUT));
                write_idx = Some(fds.len() - 1);
            }
        }

        match poll(&mut fds, timeout) {
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(e).context("postcopy select"),
            Ok(_) => {}
        }
        let ready = |idx: Option<usize>, flags: PollFlags| {
            idx.map_or(false, |i| {
                fds[i]
                    .revents()
                    .map_or(false, |revents| revents.intersects(flags))
            })
        };
        if ready(
            read_idx,
            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
        ) {
            return self.recv_handler();
        }
        if ready(write_idx, PollFlags::POLLOUT) {
            return self.save_background_slice();
        }
        Ok(())
    }

    /// Drain and serve the request stream until it runs dry or EOC.
    fn recv_handler(&mut self) -> Result<()> {
        if let Err(e) = self.decoder.fill_from(&mut self.read_file) {
            warn!("request stream failed: {}", e);
            self.recv_failed();
            return Ok(());
        }
        loop {
            match self.decoder.decode() {
                Ok(None) => break,
                Ok(Some(req)) => match self.handle_req(&req) {
                    Ok(false) => {}
                    Ok(true) => break,
                    Err(e) => {
                        warn!("request failed: {:?}", e);
                        self.recv_failed();
                        break;
                    }
                },
                Err(e) => {
                    warn!("malformed request: {}", e);
                    self.recv_failed();
                    break;
                }
            }
        }
        self.channel
            .flush()
            .with_context(|| "Failed to flush migration channel")?;
        Ok(())
    }

    /// A failing request stream ends the session; when every page is
    /// already out it simply completes.
    fn recv_failed(&mut self) {
        let next = match self.state {
            OutgoingState::Active => OutgoingState::ErrorReceive,
            OutgoingState::AllPagesSent => OutgoingState::Completed,
            state => state,
        };
        if next != self.state {
            // both edges are legal, transfer() cannot fail here
            let _ = self.set_state(next);
        }
    }

    /// Returns `true` when the drain loop should stop (EOC).
    fn handle_req(&mut self, req: &UmemReq) -> Result<bool> {
        match req {
            UmemReq::Eoc => {
                let next = if self.state == OutgoingState::AllPagesSent {
                    OutgoingState::Completed
                } else {
                    OutgoingState::EocReceived
                };
                self.set_state(next)?;
                Ok(true)
            }
            UmemReq::Page { idstr, pgoffs } => {
                let block = self
                    .ram
                    .find_block(idstr)
                    .ok_or_else(|| anyhow!(MigrationError::UnknownBlock(idstr.clone())))?;
                self.last_block_read = Some(block);
                self.handle_pgoffs(pgoffs)?;
                Ok(false)
            }
            UmemReq::PageCont { pgoffs } => {
                self.handle_pgoffs(pgoffs)?;
                Ok(false)
            }
        }
    }

    fn handle_pgoffs(&mut self, pgoffs: &[u64]) -> Result<()> {
        if self.state == OutgoingState::AllPagesSent {
            // the background stream already delivered everything
            return Ok(());
        }
        let block = self
            .last_block_read
            .clone()
            .ok_or(MigrationError::NoBlockToContinue)?;
        trace!("serving {} demanded pages of {}", pgoffs.len(), block.idstr);

        for &pgoff in pgoffs {
            self.save_page_at(&block, pgoff, true, 0)?;
        }
        for delta in 1..=self.config.prefault_forward {
            for &pgoff in pgoffs {
                self.save_page_at(&block, pgoff, true, delta)?;
            }
        }
        if self.config.move_background && !pgoffs.is_empty() {
            let tps = self.config.target_page_size;
            let last = pgoffs[pgoffs.len() - 1].saturating_add(self.config.prefault_forward);
            let last_offset = last.saturating_mul(tps).min(block.length - tps);
            self.ram.set_last_seen(&block, last_offset);
        }
        for delta in 1..=self.config.prefault_backward {
            for &pgoff in pgoffs {
                self.save_page_at(&block, pgoff, false, delta)?;
            }
        }
        Ok(())
    }

    /// Send the page `delta` pages forward/backward of `pgoff`, clipping
    /// prefault at the block boundaries.
    fn save_page_at(
        &mut self,
        block: &RamBlockMeta,
        pgoff: u64,
        forward: bool,
        delta: u64,
    ) -> Result<()> {
        let pgoff = if forward {
            pgoff.saturating_add(delta)
        } else {
            if pgoff < delta {
                return Ok(());
            }
            pgoff - delta
        };
        let offset = match pgoff.checked_mul(self.config.target_page_size) {
            Some(offset) if offset < block.length => offset,
            _ => return Ok(()),
        };
        let sent = self.ram.save_page(&mut self.channel, block, offset)?;
        self.limit.throttled(sent as u64);
        Ok(())
    }

    fn all_pages_sent(&mut self) -> Result<()> {
        self.set_state(OutgoingState::AllPagesSent)?;
        // tell the destination that every page is out
        protocol::send_eos(&mut self.channel)?;
        self.channel.flush()?;
        Ok(())
    }

    /// Push background pages while the demand side is idle. Yields on a
    /// pending request, on channel back-pressure, on the rate limit, and
    /// after [`MAX_BACKGROUND_WAIT`] of wall time.
    fn save_background_slice(&mut self) -> Result<()> {
        match self.state {
            OutgoingState::Active => {}
            OutgoingState::EocReceived => {
                protocol::send_eos(&mut self.channel)?;
                self.channel.flush()?;
                self.set_state(OutgoingState::Completed)?;
                return Ok(());
            }
            _ => return Ok(()),
        }

        if self.no_background {
            if self.ram.bytes_remaining() == 0 {
                self.all_pages_sent()?;
            }
            return Ok(());
        }

        let start = Instant::now();
        let mut nr_sent = 0_u32;
        while !self.limit.throttled(0) {
            match self.ram.save_background(&mut self.channel)? {
                None => {
                    self.all_pages_sent()?;
                    break;
                }
                Some(sent) => {
                    self.limit.throttled(sent as u64);
                }
            }

            // A pending request, or a channel that stopped accepting data,
            // hands control back to the demand path.
            let mut fds = [
                PollFd::new(self.read_file.as_raw_fd(), PollFlags::POLLIN),
                PollFd::new(self.channel.as_raw_fd(), PollFlags::POLLOUT),
            ];
            if poll(&mut fds, 0).is_ok() {
                let read_pending = fds[0].revents().map_or(false, |revents| {
                    revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)
                });
                let writable = fds[1]
                    .revents()
                    .map_or(false, |revents| revents.contains(PollFlags::POLLOUT));
                if read_pending || !writable {
                    trace!("background slice preempted after {} pages", nr_sent + 1);
                    break;
                }
            }

            nr_sent += 1;
            if nr_sent & 63 == 0 && start.elapsed() > MAX_BACKGROUND_WAIT {
                break;
            }
        }
        self.channel
            .flush()
            .with_context(|| "Failed to flush migration channel")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::os::unix::net::UnixStream;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::protocol::{
        RAM_SAVE_FLAG_CONTINUE, RAM_SAVE_FLAG_EOS,
    };

    const TPS: u64 = 4096;

    struct MockRam {
        blocks: Vec<RamBlockMeta>,
        dirty: Vec<Vec<bool>>,
        last_sent_block: Option<String>,
        sent: Arc<Mutex<Vec<(String, u64)>>>,
        last_seen: Arc<Mutex<Vec<(String, u64)>>>,
        dirty_log_stopped: Arc<Mutex<bool>>,
    }

    impl MockRam {
        fn new(blocks: &[(&str, u64, u64)]) -> Self {
            let metas: Vec<RamBlockMeta> = blocks
                .iter()
                .map(|(idstr, offset, length)| RamBlockMeta {
                    idstr: idstr.to_string(),
                    offset: *offset,
                    length: *length,
                })
                .collect();
            let dirty = metas
                .iter()
                .map(|meta| vec![true; (meta.length / TPS) as usize])
                .collect();
            MockRam {
                blocks: metas,
                dirty,
                last_sent_block: None,
                sent: Arc::new(Mutex::new(Vec::new())),
                last_seen: Arc::new(Mutex::new(Vec::new())),
                dirty_log_stopped: Arc::new(Mutex::new(false)),
            }
        }

        fn block_index(&self, idstr: &str) -> usize {
            self.blocks.iter().position(|b| b.idstr == idstr).unwrap()
        }

        fn clear_dirty(&mut self, idstr: &str, pages: &[usize]) {
            let index = self.block_index(idstr);
            for page in pages {
                self.dirty[index][*page] = false;
            }
        }
    }

    impl RamSaveOps for MockRam {
        fn blocks(&self) -> Vec<RamBlockMeta> {
            self.blocks.clone()
        }

        fn find_block(&self, idstr: &str) -> Option<RamBlockMeta> {
            self.blocks.iter().find(|b| b.idstr == idstr).cloned()
        }

        fn dirty_bitmap(&self, block: &RamBlockMeta) -> Vec<u64> {
            let pages = &self.dirty[self.block_index(&block.idstr)];
            let mut words = vec![0_u64; (pages.len() + 63) / 64];
            for (page, dirty) in pages.iter().enumerate() {
                if *dirty {
                    words[page / 64] |= 1 << (page % 64);
                }
            }
            words
        }

        fn save_page(
            &mut self,
            w: &mut dyn Write,
            block: &RamBlockMeta,
            offset: u64,
        ) -> Result<usize> {
            let index = self.block_index(&block.idstr);
            let page = (offset / TPS) as usize;
            self.dirty[index][page] = false;

            let idstr = if self.last_sent_block.as_deref() == Some(block.idstr.as_str()) {
                None
            } else {
                Some(block.idstr.as_str())
            };
            let data = vec![page as u8; TPS as usize];
            let sent = protocol::send_raw_page(w, idstr, offset, &data)?;
            self.last_sent_block = Some(block.idstr.clone());
            self.sent.lock().unwrap().push((block.idstr.clone(), offset));
            Ok(sent)
        }

        fn save_background(&mut self, w: &mut dyn Write) -> Result<Option<usize>> {
            for index in 0..self.blocks.len() {
                if let Some(page) = self.dirty[index].iter().position(|dirty| *dirty) {
                    let block = self.blocks[index].clone();
                    let sent = self.save_page(w, &block, page as u64 * TPS)?;
                    return Ok(Some(sent));
                }
            }
            Ok(None)
        }

        fn set_last_seen(&mut self, block: &RamBlockMeta, offset: u64) {
            self.last_seen
                .lock()
                .unwrap()
                .push((block.idstr.clone(), offset));
        }

        fn bytes_remaining(&self) -> u64 {
            self.dirty
                .iter()
                .map(|pages| pages.iter().filter(|dirty| **dirty).count() as u64 * TPS)
                .sum()
        }

        fn save_iterate(&mut self, w: &mut dyn Write) -> Result<bool> {
            for _ in 0..2 {
                if self.save_background(w)?.is_none() {
                    return Ok(true);
                }
            }
            Ok(self.bytes_remaining() == 0)
        }

        fn sync_and_stop_dirty_log(&mut self) -> Result<()> {
            *self.dirty_log_stopped.lock().unwrap() = true;
            Ok(())
        }

        fn init_dirty_bitmap(&mut self) -> Result<()> {
            for pages in self.dirty.iter_mut() {
                pages.iter_mut().for_each(|dirty| *dirty = true);
            }
            Ok(())
        }

        fn reset_bulk_stage(&mut self) {}
    }

    /// Destination stand-in decoding the response stream.
    struct RecordReader {
        stream: UnixStream,
        last_id: Option<String>,
    }

    impl RecordReader {
        /// `None` is the EOS marker.
        fn read_page(&mut self) -> Option<(String, u64)> {
            let (offset, flags) = protocol::recv_page_header(&mut self.stream, TPS).unwrap();
            if flags & RAM_SAVE_FLAG_EOS != 0 {
                return None;
            }
            let idstr = if flags & RAM_SAVE_FLAG_CONTINUE != 0 {
                self.last_id.clone().unwrap()
            } else {
                let idstr = protocol::recv_block_id(&mut self.stream).unwrap();
                self.last_id = Some(idstr.clone());
                idstr
            };
            let mut page = vec![0_u8; TPS as usize];
            protocol::recv_page_payload(&mut self.stream, flags, &mut page).unwrap();
            assert!(page.iter().all(|b| *b == (offset / TPS) as u8));
            Some((idstr, offset))
        }

        fn read_until_eos(&mut self) -> Vec<(String, u64)> {
            let mut pages = Vec::new();
            while let Some(page) = self.read_page() {
                pages.push(page);
            }
            pages
        }
    }

    fn write_reqs(peer: &mut UnixStream, reqs: &[UmemReq]) {
        let mut bytes = Vec::new();
        for req in reqs {
            protocol::send_request(&mut bytes, req).unwrap();
        }
        peer.write_all(&bytes).unwrap();
    }

    fn page_req(idstr: &str, pgoffs: &[u64]) -> UmemReq {
        UmemReq::Page {
            idstr: idstr.to_string(),
            pgoffs: pgoffs.to_vec(),
        }
    }

    #[test]
    fn test_rejects_non_duplex_channel() {
        let (read_end, _write_end) = util::unix::pipe_pair().unwrap();
        let ram = MockRam::new(&[("pc.ram", 0, 4 * TPS)]);
        let result = PostcopyOutgoing::new(
            File::from(read_end),
            Box::new(ram),
            OutgoingConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_prefault_window() {
        // Fault at 5 -> [5, 6, 4]; at 0 -> [0, 1] (no backward page);
        // at 9 -> [9, 8] (forward clipped at the block end).
        let (channel, mut peer) = UnixStream::pair().unwrap();
        let ram = MockRam::new(&[("pc.ram", 0, 10 * TPS)]);
        let sent = ram.sent.clone();
        let config = OutgoingConfig {
            prefault_forward: 1,
            prefault_backward: 1,
            no_background: true,
            ..Default::default()
        };
        let mut outgoing = PostcopyOutgoing::new(channel, Box::new(ram), config).unwrap();

        write_reqs(
            &mut peer,
            &[
                page_req("pc.ram", &[5]),
                UmemReq::PageCont { pgoffs: vec![0] },
                UmemReq::PageCont { pgoffs: vec![9] },
                UmemReq::Eoc,
            ],
        );
        assert_eq!(outgoing.run().unwrap(), OutgoingState::Completed);

        let offsets: Vec<u64> = sent.lock().unwrap().iter().map(|(_, o)| o / TPS).collect();
        assert_eq!(offsets, vec![5, 6, 4, 0, 1, 9, 8]);

        // All demand pages followed by the final EOS.
        let mut reader = RecordReader {
            stream: peer,
            last_id: None,
        };
        let pages = reader.read_until_eos();
        assert_eq!(pages.len(), 7);
        assert_eq!(pages[0], ("pc.ram".to_string(), 5 * TPS));
    }

    #[test]
    fn test_demand_then_background_completion() {
        // A demanded page goes first, the background stream delivers the
        // rest exactly once, EOC completes the session.
        let (channel, peer) = UnixStream::pair().unwrap();
        let ram = MockRam::new(&[("pc.ram", 0, 4 * TPS)]);
        let sent = ram.sent.clone();
        let mut outgoing =
            PostcopyOutgoing::new(channel, Box::new(ram), OutgoingConfig::default()).unwrap();

        let mut request_side = peer.try_clone().unwrap();
        write_reqs(&mut request_side, &[page_req("pc.ram", &[2])]);

        let runner = std::thread::spawn(move || {
            let state = outgoing.run().unwrap();
            (state, outgoing)
        });

        let mut reader = RecordReader {
            stream: peer,
            last_id: None,
        };
        let pages = reader.read_until_eos();
        assert_eq!(pages[0], ("pc.ram".to_string(), 2 * TPS));
        assert_eq!(pages.len(), 4);
        let distinct: HashSet<u64> = pages.iter().map(|(_, o)| *o).collect();
        assert_eq!(distinct.len(), 4);

        write_reqs(&mut request_side, &[UmemReq::Eoc]);
        let (state, _outgoing) = runner.join().unwrap();
        assert_eq!(state, OutgoingState::Completed);
        assert_eq!(sent.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_background_yields_to_pending_request() {
        // With a request already queued on the read side, one slice sends
        // at most a single background page before deferring.
        let (channel, mut peer) = UnixStream::pair().unwrap();
        let ram = MockRam::new(&[("pc.ram", 0, 64 * TPS)]);
        let sent = ram.sent.clone();
        let mut outgoing =
            PostcopyOutgoing::new(channel, Box::new(ram), OutgoingConfig::default()).unwrap();

        write_reqs(&mut peer, &[page_req("pc.ram", &[60])]);
        // let the request reach our socket buffer
        std::thread::sleep(Duration::from_millis(50));
        outgoing.save_background_slice().unwrap();
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_requests_ignored_after_all_pages_sent() {
        let (channel, mut peer) = UnixStream::pair().unwrap();
        let ram = MockRam::new(&[("pc.ram", 0, 2 * TPS)]);
        let sent = ram.sent.clone();
        let mut outgoing =
            PostcopyOutgoing::new(channel, Box::new(ram), OutgoingConfig::default()).unwrap();

        // Drain the background until every page is out.
        while outgoing.state() == OutgoingState::Active {
            outgoing.save_background_slice().unwrap();
        }
        assert_eq!(outgoing.state(), OutgoingState::AllPagesSent);
        assert_eq!(sent.lock().unwrap().len(), 2);

        // A late request must not resend anything; EOC completes.
        write_reqs(&mut peer, &[page_req("pc.ram", &[0]), UmemReq::Eoc]);
        assert_eq!(outgoing.run().unwrap(), OutgoingState::Completed);
        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_block_fails_session() {
        let (channel, mut peer) = UnixStream::pair().unwrap();
        let ram = MockRam::new(&[("pc.ram", 0, 2 * TPS)]);
        let config = OutgoingConfig {
            no_background: true,
            ..Default::default()
        };
        let mut outgoing = PostcopyOutgoing::new(channel, Box::new(ram), config).unwrap();

        write_reqs(&mut peer, &[page_req("vanished", &[0])]);
        assert_eq!(outgoing.run().unwrap(), OutgoingState::ErrorReceive);
    }

    #[test]
    fn test_move_background_repositions_cursor() {
        let (channel, mut peer) = UnixStream::pair().unwrap();
        let ram = MockRam::new(&[("pc.ram", 0, 10 * TPS)]);
        let last_seen = ram.last_seen.clone();
        let config = OutgoingConfig {
            prefault_forward: 2,
            move_background: true,
            no_background: true,
            ..Default::default()
        };
        let mut outgoing = PostcopyOutgoing::new(channel, Box::new(ram), config).unwrap();

        write_reqs(
            &mut peer,
            &[
                page_req("pc.ram", &[4]),
                page_req("pc.ram", &[9]),
                UmemReq::Eoc,
            ],
        );
        assert_eq!(outgoing.run().unwrap(), OutgoingState::Completed);

        let seen = last_seen.lock().unwrap();
        // 4 + forward window, then clipped to the last page of the block
        assert_eq!(seen[0], ("pc.ram".to_string(), 6 * TPS));
        assert_eq!(seen[1], ("pc.ram".to_string(), 9 * TPS));
    }

    #[test]
    fn test_precopy_stage_and_clean_bitmap() {
        let (channel, mut peer) = UnixStream::pair().unwrap();
        let mut ram = MockRam::new(&[("pc.ram", 0x100000, 128 * TPS)]);
        // Pre-copy already moved the even pages.
        let clean: Vec<usize> = (0..128).step_by(2).collect();
        ram.clear_dirty("pc.ram", &clean);
        let dirty_log_stopped = ram.dirty_log_stopped.clone();
        let config = OutgoingConfig {
            precopy_count: 2,
            ..Default::default()
        };
        let mut outgoing = PostcopyOutgoing::new(channel, Box::new(ram), config).unwrap();

        assert_eq!(outgoing.save_pending(), 64 * TPS);
        // Two pages per iteration, far from done after one.
        assert!(!outgoing.save_iterate().unwrap());
        assert_eq!(outgoing.save_pending(), 62 * TPS);
        // The iteration budget is exhausted after the second round.
        assert!(outgoing.save_iterate().unwrap());
        outgoing.save_complete().unwrap();
        assert!(*dirty_log_stopped.lock().unwrap());

        outgoing.begin().unwrap();

        // Skip the four pre-copy page records, then the stage EOS.
        let mut reader = RecordReader {
            stream: peer.try_clone().unwrap(),
            last_id: None,
        };
        let precopy_pages = reader.read_until_eos();
        assert_eq!(precopy_pages.len(), 4);
        peer = reader.stream;

        // The clean bitmap follows: dirty bits inverted, one record per
        // block, then the terminator.
        let rec = protocol::recv_clean_bitmap_record(&mut peer)
            .unwrap()
            .unwrap();
        assert_eq!(rec.idstr, "pc.ram");
        assert_eq!(rec.offset, 0x100000);
        assert_eq!(rec.length, 128 * TPS);
        assert_eq!(rec.words.len(), 2);
        for word in 0..2 {
            for page in 0..64 {
                let absolute = word * 64 + page;
                let is_clean = rec.words[word] & (1 << page) != 0;
                // even pages were clean, plus whatever pre-copy sent
                let precopy_sent = precopy_pages
                    .iter()
                    .any(|(_, offset)| offset / TPS == absolute as u64);
                assert_eq!(is_clean, absolute % 2 == 0 || precopy_sent);
            }
        }
        assert!(protocol::recv_clean_bitmap_record(&mut peer)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_init_section_announces_precopy() {
        let (channel, mut peer) = UnixStream::pair().unwrap();
        let ram = MockRam::new(&[("pc.ram", 0, 2 * TPS)]);
        let config = OutgoingConfig {
            precopy_count: 1,
            ..Default::default()
        };
        let mut outgoing = PostcopyOutgoing::new(channel, Box::new(ram), config).unwrap();
        outgoing.send_init_section().unwrap();
        outgoing.send_device_state(&[1, 2, 3]).unwrap();

        assert_eq!(
            protocol::recv_postcopy_section(&mut peer).unwrap(),
            protocol::PostcopySection::Init {
                precopy_enabled: true
            }
        );
        assert_eq!(
            protocol::recv_postcopy_section(&mut peer).unwrap(),
            protocol::PostcopySection::DeviceState(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_forced_postcopy_ends_iteration() {
        let (channel, _peer) = UnixStream::pair().unwrap();
        let ram = MockRam::new(&[("pc.ram", 0, 8 * TPS)]);
        let config = OutgoingConfig {
            precopy_count: 100,
            ..Default::default()
        };
        let mut outgoing = PostcopyOutgoing::new(channel, Box::new(ram), config).unwrap();

        assert!(outgoing.save_pending() > 0);
        outgoing.force_postcopy_phase();
        assert_eq!(outgoing.save_pending(), 0);
        assert!(outgoing.save_iterate().unwrap());
    }
}

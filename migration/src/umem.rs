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

//! The userspace-fault memory collaborator and the per-block page state.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::MigrationError;
use util::bitmap::AtomicBitmap;
use util::num_ops::round_up;

/// Upper bound of fault offsets pulled from one UMEM device per iteration,
/// sized for the maximum vCPU count times the async page faults each can
/// have in flight, plus one synchronous fault.
pub const MAX_REQUESTS: usize = 512 * 65;

/// A batch of host-page offsets exchanged with a UMEM device.
///
/// Offsets are block-local host page numbers.
pub struct UmemPages {
    pub pgoffs: Vec<u64>,
}

impl UmemPages {
    pub fn new(capacity: usize) -> Self {
        UmemPages {
            pgoffs: Vec::with_capacity(capacity),
        }
    }
}

/// Capabilities of the userspace-fault memory object backing one block of
/// guest RAM on the destination.
///
/// The device is a collaborator: its kernel half is out of scope here. All
/// offsets crossing this interface are block-local host pages.
pub trait UmemDevice: Send + Sync {
    /// Descriptor whose readability signals pending guest faults.
    fn as_raw_fd(&self) -> RawFd;

    /// Drain up to `max_nr` pending fault offsets into `pages`.
    fn get_page_request(&self, pages: &mut UmemPages, max_nr: usize) -> Result<()>;

    /// Tell the device the listed pages now hold valid data, releasing any
    /// vCPU blocked on them.
    fn mark_page_cached(&self, pages: &UmemPages) -> Result<()>;

    /// Drop the daemon-side backing of a now-resident page range.
    fn remove_shmem(&self, offset: u64, size: u64) -> Result<()>;

    /// Whether every page of this device became resident.
    fn shmem_finished(&self) -> bool;

    /// Base host address of the shared mapping the daemon writes pages into.
    fn shmem_host_addr(&self) -> u64;

    /// Unmap the shared mapping once the device reports finished.
    fn unmap_shmem(&self) -> Result<()>;
}

/// Guest page geometry of a migration session. Target and host granules are
/// both powers of two but need not be equal in either direction.
#[derive(Copy, Clone, Debug)]
pub struct PageSizes {
    pub target_page_size: u64,
    pub target_page_shift: u32,
    pub host_page_size: u64,
    pub host_page_shift: u32,
}

impl PageSizes {
    pub fn new(target_page_size: u64) -> Result<Self> {
        Self::with_host(target_page_size, util::unix::host_page_size())
    }

    pub fn with_host(target_page_size: u64, host_page_size: u64) -> Result<Self> {
        if target_page_size == 0 || !target_page_size.is_power_of_two() {
            return Err(anyhow!(MigrationError::BadPageSize(target_page_size)));
        }
        if host_page_size == 0 || !host_page_size.is_power_of_two() {
            return Err(anyhow!(MigrationError::BadPageSize(host_page_size)));
        }
        Ok(PageSizes {
            target_page_size,
            target_page_shift: target_page_size.trailing_zeros(),
            host_page_size,
            host_page_shift: host_page_size.trailing_zeros(),
        })
    }

    /// Whether one target page covers one or more whole host pages.
    pub fn target_covers_host(&self) -> bool {
        self.target_page_size >= self.host_page_size
    }

    /// Host pages per target page (1 when the target page is smaller).
    pub fn nr_host_per_target(&self) -> u64 {
        (self.target_page_size / self.host_page_size).max(1)
    }

    /// Target pages per host page (1 when the host page is smaller).
    pub fn nr_target_per_host(&self) -> u64 {
        (self.host_page_size / self.target_page_size).max(1)
    }

    /// First host page covering the given target page.
    pub fn host_pgoff_of_target(&self, target_pgoff: u64) -> u64 {
        if self.target_covers_host() {
            target_pgoff << (self.target_page_shift - self.host_page_shift)
        } else {
            target_pgoff >> (self.host_page_shift - self.target_page_shift)
        }
    }

    /// First target page covering the given host page.
    pub fn target_pgoff_of_host(&self, host_pgoff: u64) -> u64 {
        if self.target_covers_host() {
            host_pgoff >> (self.target_page_shift - self.host_page_shift)
        } else {
            host_pgoff << (self.host_page_shift - self.target_page_shift)
        }
    }
}

/// One contiguous block of guest RAM under post-copy on the destination.
///
/// The bitmaps are indexed by block-local page offsets: target pages for the
/// request/receive state, host pages for the fault-pipe bookkeeping. Page
/// state bits only ever go 0 -> 1; `pending_clean_bitmap` is the single
/// exception and is additionally guarded by the daemon's pending-clean mutex.
pub struct UmemBlock {
    pub idstr: String,
    /// Guest-physical offset of the block.
    pub offset: u64,
    /// Length in bytes, a multiple of the target page size.
    pub length: u64,
    pub umem: Arc<dyn UmemDevice>,
    /// Target pages a demand request has been emitted for.
    pub phys_requested: AtomicBitmap,
    /// Target pages whose payload reached shared memory.
    pub phys_received: AtomicBitmap,
    /// Target pages already present at hand-off; only with pre-copy.
    pub clean_bitmap: Option<AtomicBitmap>,
    /// Host pages already acknowledged to the UMEM device.
    pub cached_bitmap: AtomicBitmap,
    /// Host pages whose "now cached" notification still has to be pushed
    /// into the fault-write pipe.
    pub pending_clean_bitmap: AtomicBitmap,
    /// Population count of `pending_clean_bitmap`, kept under the
    /// pending-clean mutex.
    pub nr_pending_clean: AtomicU64,
    /// The shared mapping has been released.
    pub unmapped: AtomicBool,
}

impl UmemBlock {
    pub fn new(
        idstr: &str,
        offset: u64,
        length: u64,
        umem: Arc<dyn UmemDevice>,
        sizes: &PageSizes,
        precopy_enabled: bool,
    ) -> Result<Self> {
        if idstr.is_empty() || idstr.len() > crate::protocol::MAX_ID_LEN {
            return Err(anyhow!(MigrationError::IdOverflow(idstr.len())));
        }
        // The clean bitmap travels as an array of 64-bit words, keep the
        // in-memory bitmaps padded the same way.
        let nr_target_bits =
            round_up(length >> sizes.target_page_shift, 64).unwrap_or(u64::MAX) as usize;
        let nr_host_bits = (length >> sizes.host_page_shift) as usize;
        Ok(UmemBlock {
            idstr: idstr.to_string(),
            offset,
            length,
            umem,
            phys_requested: AtomicBitmap::new(nr_target_bits),
            phys_received: AtomicBitmap::new(nr_target_bits),
            clean_bitmap: precopy_enabled.then(|| AtomicBitmap::new(nr_target_bits)),
            cached_bitmap: AtomicBitmap::new(nr_host_bits),
            pending_clean_bitmap: AtomicBitmap::new(nr_host_bits),
            nr_pending_clean: AtomicU64::new(0),
            unmapped: AtomicBool::new(false),
        })
    }

    /// Number of target pages the block holds.
    pub fn nr_target_pages(&self, sizes: &PageSizes) -> u64 {
        self.length >> sizes.target_page_shift
    }

    /// Number of host pages the block holds.
    pub fn nr_host_pages(&self, sizes: &PageSizes) -> u64 {
        self.length >> sizes.host_page_shift
    }

    /// First guest-global host page of the block.
    pub fn host_pgoff_base(&self, sizes: &PageSizes) -> u64 {
        self.offset >> sizes.host_page_shift
    }

    /// Whether the guest-physical address falls into this block.
    pub fn contains(&self, addr: u64) -> bool {
        self.offset <= addr && addr < self.offset + self.length
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_sizes_equal() {
        let sizes = PageSizes::with_host(4096, 4096).unwrap();
        assert!(sizes.target_covers_host());
        assert_eq!(sizes.nr_host_per_target(), 1);
        assert_eq!(sizes.nr_target_per_host(), 1);
        assert_eq!(sizes.host_pgoff_of_target(5), 5);
        assert_eq!(sizes.target_pgoff_of_host(5), 5);
    }

    #[test]
    fn test_page_sizes_target_larger() {
        let sizes = PageSizes::with_host(16384, 4096).unwrap();
        assert!(sizes.target_covers_host());
        assert_eq!(sizes.nr_host_per_target(), 4);
        assert_eq!(sizes.nr_target_per_host(), 1);
        assert_eq!(sizes.host_pgoff_of_target(2), 8);
        assert_eq!(sizes.target_pgoff_of_host(9), 2);
    }

    #[test]
    fn test_page_sizes_target_smaller() {
        let sizes = PageSizes::with_host(4096, 16384).unwrap();
        assert!(!sizes.target_covers_host());
        assert_eq!(sizes.nr_host_per_target(), 1);
        assert_eq!(sizes.nr_target_per_host(), 4);
        assert_eq!(sizes.host_pgoff_of_target(7), 1);
        assert_eq!(sizes.target_pgoff_of_host(1), 4);
    }

    #[test]
    fn test_page_sizes_rejects_bad_granule() {
        assert!(PageSizes::with_host(0, 4096).is_err());
        assert!(PageSizes::with_host(4096, 3000).is_err());
    }

    #[test]
    fn test_block_bitmap_shapes() {
        let sizes = PageSizes::with_host(4096, 4096).unwrap();
        let umem = mock::MockUmem::new(40 * 4096, 4096);
        let block = UmemBlock::new("pc.ram", 0x100000, 40 * 4096, umem, &sizes, true).unwrap();

        assert_eq!(block.nr_target_pages(&sizes), 40);
        assert_eq!(block.nr_host_pages(&sizes), 40);
        assert_eq!(block.host_pgoff_base(&sizes), 0x100);
        // Target-page bitmaps are padded to whole 64-bit words.
        assert_eq!(block.phys_requested.vol(), 64);
        assert!(block.clean_bitmap.is_some());
        assert!(block.contains(0x100000));
        assert!(block.contains(0x100000 + 40 * 4096 - 1));
        assert!(!block.contains(0x100000 + 40 * 4096));
    }
}

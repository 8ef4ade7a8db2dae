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

use thiserror::Error;

use crate::status::OutgoingState;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Io")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("Unknown request command {0}")]
    UnknownReqCommand(u8),
    #[error("Zero-length block id in PAGE request")]
    EmptyBlockId,
    #[error("Request carries {0} offsets, exceeding the frame limit")]
    TooManyOffsets(u32),
    #[error("Block id length {0} overflows the 255-byte limit")]
    IdOverflow(usize),
    #[error("Unknown memory block: {0}")]
    UnknownBlock(String),
    #[error("No block to continue from in the stream")]
    NoBlockToContinue,
    #[error("Unexpected flags 0x{0:x} in post-handoff ram stream")]
    UnexpectedFlags(u64),
    #[error("Failed to transfer outgoing state from {0} to {1}")]
    InvalidStatusTransfer(OutgoingState, OutgoingState),
    #[error("Clean bitmap length 0x{0:x} is not a multiple of 8 bytes")]
    BitmapLength(u64),
    #[error("Clean bitmap length 0x{0:x} does not fit block of length 0x{1:x}")]
    BitmapMismatch(u64, u64),
    #[error("Postcopy device section size 0x{0:x} overflows the 16 MiB limit")]
    SectionOverflow(u32),
    #[error("Unknown postcopy section subtype {0}")]
    UnknownSubtype(u8),
    #[error("Unknown postcopy options 0x{0:x}")]
    UnknownOptions(u64),
    #[error("Bad postcopy init section length {0}")]
    BadInitLength(u32),
    #[error("Postcopy requires a read/write migration channel")]
    NonDuplexChannel,
    #[error("Malformed XBZRLE page data at byte {0}")]
    XbzrleCorrupt(usize),
    #[error("Page size {0} is not a non-zero power of two")]
    BadPageSize(u64),
    #[error("Unknown command {0} on the daemon control pipe")]
    UnknownPipeCommand(u8),
    #[error("Host page offset 0x{0:x} is outside every memory block")]
    UnknownHostPage(u64),
    #[error("Page offset 0x{0:x} is outside the block bounds")]
    PageOutOfRange(u64),
    #[error("The fault-write pipe is already closed")]
    FaultPipeClosed,
}

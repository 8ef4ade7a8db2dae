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

//! # Migration
//!
//! Post-copy live migration engine. The guest is resumed on the destination
//! before its memory has been transferred; a helper daemon owning the UMEM
//! device then faults pages in from the source on demand while the source
//! keeps pushing the remaining pages in the background.
//!
//! The crate is split along the process boundary of the migration:
//! - [`outgoing`]: the source-side scheduler serving page requests.
//! - [`incoming`]: the destination-side umem daemon and its worker threads.
//! - [`ingestor`]: the destination-VMM side of the inner fault pipes.
//! - [`protocol`]: the wire codec shared by both ends.

pub mod config;
mod error;
pub mod incoming;
pub mod ingestor;
pub mod outgoing;
pub mod protocol;
pub mod status;
pub mod umem;

pub use error::MigrationError;

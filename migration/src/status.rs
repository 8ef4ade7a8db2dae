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

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use log::trace;

use crate::MigrationError;

/// State of the source-side post-copy session.
///
/// # Notes
///
/// State transfer:
/// Active ---------> AllPagesSent: the background stream ran dry.
/// Active ---------> EocReceived: destination asked to finish first.
/// Active ---------> ErrorReceive: the request stream broke down.
/// AllPagesSent ---> Completed: destination acknowledged with EOC.
/// EocReceived ----> Completed: final EOS emitted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutgoingState {
    /// Serving demand requests, background pages still left.
    Active,
    /// Every page has been pushed, waiting for the destination's EOC.
    AllPagesSent,
    /// Destination sent EOC while pages were still left.
    EocReceived,
    /// Session finished cleanly.
    Completed,
    /// The request stream failed while the session was active.
    ErrorReceive,
}

impl std::fmt::Display for OutgoingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                OutgoingState::Active => "active",
                OutgoingState::AllPagesSent => "all-pages-sent",
                OutgoingState::EocReceived => "eoc-received",
                OutgoingState::Completed => "completed",
                OutgoingState::ErrorReceive => "error-receive",
            }
        )
    }
}

impl OutgoingState {
    /// Check and transfer the session state.
    pub fn transfer(self, new_state: OutgoingState) -> Result<OutgoingState> {
        match self {
            OutgoingState::Active => match new_state {
                OutgoingState::AllPagesSent
                | OutgoingState::EocReceived
                | OutgoingState::ErrorReceive => Ok(new_state),
                _ => Err(anyhow!(MigrationError::InvalidStatusTransfer(
                    self, new_state
                ))),
            },
            OutgoingState::AllPagesSent | OutgoingState::EocReceived => match new_state {
                OutgoingState::Completed => Ok(new_state),
                _ => Err(anyhow!(MigrationError::InvalidStatusTransfer(
                    self, new_state
                ))),
            },
            OutgoingState::Completed | OutgoingState::ErrorReceive => Err(anyhow!(
                MigrationError::InvalidStatusTransfer(self, new_state)
            )),
        }
    }
}

// Flags shared with the source over the migration channel.
pub const EOS_RECEIVED: u32 = 0x01;
pub const EOC_SEND_REQ: u32 = 0x02;
pub const EOC_SENDING: u32 = 0x04;
pub const EOC_SENT: u32 = 0x08;

// Flags shared with the destination VMM over the control pipes.
pub const QUIT_RECEIVED: u32 = 0x10;
pub const QUIT_HANDLED: u32 = 0x20;
pub const QUIT_QUEUED: u32 = 0x40;
pub const QUIT_SENDING: u32 = 0x80;
pub const QUIT_SENT: u32 = 0x100;

// Daemon error notification progress.
pub const ERROR_REQ: u32 = 0x1000;
pub const ERROR_SENDING: u32 = 0x2000;
pub const ERROR_SENT: u32 = 0x4000;

pub const QUIT_MASK: u32 = QUIT_RECEIVED | QUIT_HANDLED | QUIT_QUEUED | QUIT_SENDING | QUIT_SENT;
pub const END_MASK: u32 = EOS_RECEIVED | EOC_SEND_REQ | EOC_SENDING | EOC_SENT | QUIT_MASK;

/// Shared flag bitset coordinating the umem daemon's worker threads.
///
/// Every flag is set once and never cleared; a worker thread exits its loop
/// once all bits of [`END_MASK`] are present.
pub struct DaemonState {
    state: Mutex<u32>,
}

impl DaemonState {
    pub fn new() -> Self {
        DaemonState {
            state: Mutex::new(0),
        }
    }

    /// Current value of the bitset.
    pub fn snapshot(&self) -> u32 {
        *self.state.lock().unwrap()
    }

    /// Set `flags`, returning the previous value.
    pub fn set(&self, flags: u32) -> u32 {
        let mut state = self.state.lock().unwrap();
        let old = *state;
        *state |= flags;
        if old != *state {
            trace!("daemon state 0x{:x} -> 0x{:x}", old, *state);
        }
        old
    }

    /// Whether all bits of `mask` are set.
    pub fn test_all(&self, mask: u32) -> bool {
        self.snapshot() & mask == mask
    }

    /// Whether any bit of `mask` is set.
    pub fn test_any(&self, mask: u32) -> bool {
        self.snapshot() & mask != 0
    }

    /// Atomically set `set` if every bit of `require` is present and no bit
    /// of `exclude` is. Returns whether the transition happened; a `false`
    /// means another thread already owns (or finished) this step.
    pub fn transition(&self, require: u32, exclude: u32, set: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state & require != require || *state & exclude != 0 {
            return false;
        }
        let old = *state;
        *state |= set;
        trace!("daemon state 0x{:x} -> 0x{:x}", old, *state);
        true
    }

    /// Whether the collective shutdown condition has been reached.
    pub fn end_reached(&self) -> bool {
        self.test_all(END_MASK)
    }
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_transfer() {
        let state = OutgoingState::Active;

        let state = state.transfer(OutgoingState::AllPagesSent).unwrap();
        let state = state.transfer(OutgoingState::Completed).unwrap();
        assert_eq!(state, OutgoingState::Completed);

        let state = OutgoingState::Active;
        let state = state.transfer(OutgoingState::EocReceived).unwrap();
        let state = state.transfer(OutgoingState::Completed).unwrap();
        assert_eq!(state, OutgoingState::Completed);
    }

    #[test]
    fn test_abnormal_transfer_with_error() {
        let state = OutgoingState::Active;
        if let Err(e) = state.transfer(OutgoingState::Completed) {
            assert_eq!(
                e.to_string(),
                format!(
                    "Failed to transfer outgoing state from {} to {}",
                    OutgoingState::Active,
                    OutgoingState::Completed
                )
            );
        } else {
            panic!("active must not complete without an intermediate state");
        }

        let state = OutgoingState::Completed;
        assert!(state.transfer(OutgoingState::Active).is_err());

        let state = OutgoingState::ErrorReceive;
        assert!(state.transfer(OutgoingState::Completed).is_err());
    }

    #[test]
    fn test_daemon_state_transition() {
        let state = DaemonState::new();
        state.set(EOC_SEND_REQ);

        // First taker wins the sending step.
        assert!(state.transition(EOC_SEND_REQ, EOC_SENDING | EOC_SENT, EOC_SENDING));
        assert!(!state.transition(EOC_SEND_REQ, EOC_SENDING | EOC_SENT, EOC_SENDING));
        state.set(EOC_SENT);

        assert!(!state.end_reached());
        state.set(EOS_RECEIVED | QUIT_MASK);
        assert!(state.end_reached());
    }

    #[test]
    fn test_daemon_state_flags_disjoint() {
        let flags = [
            EOS_RECEIVED,
            EOC_SEND_REQ,
            EOC_SENDING,
            EOC_SENT,
            QUIT_RECEIVED,
            QUIT_HANDLED,
            QUIT_QUEUED,
            QUIT_SENDING,
            QUIT_SENT,
            ERROR_REQ,
            ERROR_SENDING,
            ERROR_SENT,
        ];
        let mut seen = 0_u32;
        for flag in flags {
            assert_eq!(seen & flag, 0);
            seen |= flag;
        }
    }
}

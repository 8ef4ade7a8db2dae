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

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::MigrationError;

/// Tunables of the source-side post-copy scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutgoingConfig {
    /// Pages speculatively sent after each demanded page.
    pub prefault_forward: u64,
    /// Pages speculatively sent before each demanded page.
    pub prefault_backward: u64,
    /// Reposition the background scan cursor near the demand working set.
    pub move_background: bool,
    /// Disable the background stream entirely; every page travels on demand.
    pub no_background: bool,
    /// Number of pre-copy iterations to run before switching to post-copy.
    /// Zero skips the pre-copy phase.
    pub precopy_count: u32,
    /// Bandwidth limit in bytes per second, 0 means unlimited.
    pub bandwidth: u64,
    /// Guest page size in bytes.
    pub target_page_size: u64,
}

impl Default for OutgoingConfig {
    fn default() -> Self {
        OutgoingConfig {
            prefault_forward: 0,
            prefault_backward: 0,
            move_background: false,
            no_background: false,
            precopy_count: 0,
            bandwidth: 0,
            target_page_size: 4096,
        }
    }
}

impl OutgoingConfig {
    pub fn check(&self) -> Result<()> {
        check_page_size(self.target_page_size)
    }
}

/// Tunables of the destination-side umem daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IncomingConfig {
    /// Guest page size in bytes.
    pub target_page_size: u64,
}

impl Default for IncomingConfig {
    fn default() -> Self {
        IncomingConfig {
            target_page_size: 4096,
        }
    }
}

impl IncomingConfig {
    pub fn check(&self) -> Result<()> {
        check_page_size(self.target_page_size)
    }
}

fn check_page_size(size: u64) -> Result<()> {
    if size == 0 || !size.is_power_of_two() {
        return Err(anyhow!(MigrationError::BadPageSize(size)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OutgoingConfig::default();
        assert_eq!(config.target_page_size, 4096);
        assert_eq!(config.precopy_count, 0);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_config_parse() {
        let config: OutgoingConfig = serde_json::from_str(
            r#"{"prefault_forward": 2, "prefault_backward": 1, "bandwidth": 1048576}"#,
        )
        .unwrap();
        assert_eq!(config.prefault_forward, 2);
        assert_eq!(config.prefault_backward, 1);
        assert_eq!(config.bandwidth, 1048576);
        assert!(!config.move_background);

        assert!(serde_json::from_str::<OutgoingConfig>(r#"{"bogus_knob": 1}"#).is_err());
    }

    #[test]
    fn test_bad_page_size_rejected() {
        let config = IncomingConfig {
            target_page_size: 3000,
        };
        assert!(config.check().is_err());
    }
}

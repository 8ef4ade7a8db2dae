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

/// We use Leaky Bucket Algorithm to limit the bandwidth of the migration
/// stream. Unlike a device iothread, the migration scheduler drives a plain
/// `select`-style loop, so instead of arming a timer the bucket reports the
/// residual sleep needed before more data may be sent.
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::error::UtilError;

/// Used to improve the accuracy of bucket level.
const ACCURACY_SCALE: u64 = 1000;
const NANOSECONDS_PER_SECOND: u64 = 1_000_000_000;

/// Structure used to describe a Leaky Bucket.
pub struct LeakBucket {
    /// Indicate the capacity of bucket, which is config by user.
    capacity: u64,
    /// Current water level.
    level: u64,
    /// Internal used to calculate the delay of timer.
    prev_time: Instant,
}

impl LeakBucket {
    /// Construct function
    ///
    /// # Arguments
    ///
    /// * `units_ps` - units per second, 0 means unlimited.
    pub fn new(units_ps: u64) -> Result<Self> {
        Ok(LeakBucket {
            capacity: units_ps
                .checked_mul(ACCURACY_SCALE)
                .ok_or(UtilError::CapacityOverflow(units_ps))?,
            level: 0,
            prev_time: Instant::now(),
        })
    }

    /// Return true if the bucket is full, and caller must back off instead of
    /// sending more data. Otherwise `need_units` units are charged to the
    /// bucket and the caller may proceed.
    pub fn throttled(&mut self, need_units: u64) -> bool {
        // capacity value is zero, indicating that there is no need to limit
        if self.capacity == 0 {
            return false;
        }

        self.update_level();
        if self.level > self.capacity {
            return true;
        }

        let scaled_need = need_units.saturating_mul(ACCURACY_SCALE);
        self.level = self.level.saturating_add(scaled_need);

        false
    }

    /// Time the caller should sleep before the bucket stops throttling.
    /// Zero when the bucket is not full.
    pub fn residual_sleep(&mut self) -> Duration {
        if self.capacity == 0 {
            return Duration::ZERO;
        }

        self.update_level();
        if self.level <= self.capacity {
            return Duration::ZERO;
        }

        let nanos = u128::from(self.level - self.capacity)
            * u128::from(NANOSECONDS_PER_SECOND)
            / u128::from(self.capacity);
        Duration::from_nanos(nanos as u64)
    }

    /// Drain the bucket, e.g. when a new migration stage begins.
    pub fn reset(&mut self) {
        self.level = 0;
        self.prev_time = Instant::now();
    }

    // update the water level
    fn update_level(&mut self) {
        let now = Instant::now();
        let nanos = (now - self.prev_time).as_nanos();
        let throttle_timeout =
            u128::from(self.level) * u128::from(NANOSECONDS_PER_SECOND) / u128::from(self.capacity);
        if nanos > throttle_timeout {
            self.level = 0;
        } else {
            self.level -=
                (nanos * u128::from(self.capacity) / u128::from(NANOSECONDS_PER_SECOND)) as u64;
        }
        self.prev_time = now;
    }
}

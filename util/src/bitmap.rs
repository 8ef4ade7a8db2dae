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

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;

use crate::error::UtilError;

/// Bitmap with word-level atomic operations.
///
/// Bits are set and tested with a single `fetch_or`/`load` on the containing
/// 64-bit word, so concurrent writers never need a lock. Losing a race on
/// `test_and_set` is reported as "already set", which is exactly what callers
/// tracking monotonic 0->1 page state want.
pub struct AtomicBitmap {
    map: Vec<AtomicU64>,
    vol: usize,
}

impl AtomicBitmap {
    /// Create a bitmap able to hold `nbits` bits, all cleared.
    pub fn new(nbits: usize) -> Self {
        let size = (nbits + 63) / 64;
        AtomicBitmap {
            map: (0..size).map(|_| AtomicU64::new(0)).collect(),
            vol: nbits,
        }
    }

    /// Return the number of bits this bitmap holds.
    pub fn vol(&self) -> usize {
        self.vol
    }

    /// Return the number of 64-bit words backing the bitmap.
    pub fn word_count(&self) -> usize {
        self.map.len()
    }

    /// Set the bit at `num`.
    pub fn set(&self, num: usize) -> Result<()> {
        self.test_and_set(num)?;
        Ok(())
    }

    /// Set the bit at `num` and return whether it was already set.
    pub fn test_and_set(&self, num: usize) -> Result<bool> {
        if num >= self.vol {
            return Err(UtilError::OutOfBound(num as u64, self.vol as u64).into());
        }
        let old = self.map[num >> 6].fetch_or(1 << (num & 63), Ordering::SeqCst);
        Ok(old & (1 << (num & 63)) != 0)
    }

    /// Clear the bit at `num`.
    pub fn clear(&self, num: usize) -> Result<()> {
        if num >= self.vol {
            return Err(UtilError::OutOfBound(num as u64, self.vol as u64).into());
        }
        self.map[num >> 6].fetch_and(!(1 << (num & 63)), Ordering::SeqCst);
        Ok(())
    }

    /// Query whether the bit at `num` is set.
    pub fn contain(&self, num: usize) -> Result<bool> {
        if num >= self.vol {
            return Err(UtilError::OutOfBound(num as u64, self.vol as u64).into());
        }
        Ok(self.map[num >> 6].load(Ordering::SeqCst) & (1 << (num & 63)) != 0)
    }

    /// Count the set bits.
    pub fn count(&self) -> usize {
        self.map
            .iter()
            .map(|w| w.load(Ordering::SeqCst).count_ones() as usize)
            .sum()
    }

    /// Find the first set bit at or after `from`, if any.
    pub fn find_next(&self, from: usize) -> Option<usize> {
        if from >= self.vol {
            return None;
        }
        let mut index = from >> 6;
        let mut word = self.map[index].load(Ordering::SeqCst) & (!0_u64 << (from & 63));
        loop {
            if word != 0 {
                let bit = (index << 6) + word.trailing_zeros() as usize;
                return if bit < self.vol { Some(bit) } else { None };
            }
            index += 1;
            if index >= self.map.len() {
                return None;
            }
            word = self.map[index].load(Ordering::SeqCst);
        }
    }

    /// Overwrite the 64-bit word at `index`.
    pub fn store_word(&self, index: usize, value: u64) -> Result<()> {
        if index >= self.map.len() {
            return Err(UtilError::OutOfBound(index as u64, self.map.len() as u64).into());
        }
        self.map[index].store(value, Ordering::SeqCst);
        Ok(())
    }

    /// Copy all words from `other`, which must have the same volume.
    pub fn copy_from(&self, other: &AtomicBitmap) -> Result<()> {
        if self.vol != other.vol {
            return Err(UtilError::OutOfBound(other.vol as u64, self.vol as u64).into());
        }
        for (dst, src) in self.map.iter().zip(other.map.iter()) {
            dst.store(src.load(Ordering::SeqCst), Ordering::SeqCst);
        }
        Ok(())
    }
}

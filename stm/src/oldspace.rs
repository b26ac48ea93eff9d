// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Long-lived object storage.
//!
//! Small objects come from per-size pools, refilled by carving page sized chunks.
//! Everything larger is served first-fit from a coalescing free list, falling back
//! to a bump pointer. The old space only hands out addresses; object content lives
//! in the segments' pages.
//!
//! A dead object is retired rather than freed while commit log entries a segment
//! may still replay carry its content. Its address is handed out again once every
//! segment moved past the revision it died at.

use crate::object::WORD;
use rustc_hash::FxHashMap;
use std::{collections::BTreeMap, ops::Range};

/// Objects up to this size are served from the size class pools
pub(crate) const SMALL_OBJECT_LIMIT: usize = 256;

pub(crate) struct OldSpace {
    range: Range<u64>,
    chunk_size: usize,
    pools: Vec<Vec<u64>>,
    free: BTreeMap<u64, u64>,
    bump: u64,

    /// every allocated object and its size
    objects: FxHashMap<u64, usize>,

    /// dead objects and the head revision at their death
    retired: FxHashMap<u64, u64>,
    used: usize,
    since_major: usize,
}

impl OldSpace {
    pub fn new(range: Range<u64>, chunk_size: usize) -> Self {
        Self {
            bump: range.start,
            range,
            chunk_size,
            pools: vec![Vec::new(); SMALL_OBJECT_LIMIT / WORD + 1],
            free: BTreeMap::new(),
            objects: FxHashMap::default(),
            retired: FxHashMap::default(),
            used: 0,
            since_major: 0,
        }
    }

    /// Allocates `size` bytes (a multiple of the word size). Returns `None`, if the
    /// old space is exhausted.
    pub fn alloc(&mut self, size: usize) -> Option<u64> {
        debug_assert_eq!(size % WORD, 0);
        let addr = if size <= SMALL_OBJECT_LIMIT {
            self.alloc_small(size)?
        } else {
            self.alloc_large(size as u64)?
        };

        self.objects.insert(addr, size);
        self.used += size;
        self.since_major += size;
        Some(addr)
    }

    fn alloc_small(&mut self, size: usize) -> Option<u64> {
        let class = size / WORD;
        if self.pools[class].is_empty() {
            let chunk = self.alloc_large(self.chunk_size as u64)?;
            let count = self.chunk_size / size;
            // hand out the lowest addresses first
            self.pools[class].extend((0..count as u64).rev().map(|n| chunk + n * size as u64));
        }
        self.pools[class].pop()
    }

    fn alloc_large(&mut self, size: u64) -> Option<u64> {
        let fit = self.free.iter().find(|(_, len)| **len >= size).map(|(&addr, &len)| (addr, len));
        if let Some((addr, len)) = fit {
            self.free.remove(&addr);
            if len > size {
                self.free.insert(addr + size, len - size);
            }
            return Some(addr);
        }

        if self.bump + size > self.range.end {
            return None;
        }
        let addr = self.bump;
        self.bump += size;
        Some(addr)
    }

    /// Releases an object. Returns its size, or `None` if `addr` was not allocated.
    pub fn free(&mut self, addr: u64) -> Option<usize> {
        let size = self.objects.remove(&addr)?;
        self.retired.remove(&addr);
        self.used -= size;

        if size <= SMALL_OBJECT_LIMIT {
            self.pools[size / WORD].push(addr);
        } else {
            self.free_large(addr, size as u64);
        }
        Some(size)
    }

    fn free_large(&mut self, mut addr: u64, mut len: u64) {
        if let Some((&prev, &prev_len)) = self.free.range(..addr).next_back() {
            if prev + prev_len == addr {
                self.free.remove(&prev);
                addr = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(addr + len)) {
            len += next_len;
        }

        if addr + len == self.bump {
            self.bump = addr;
        } else {
            self.free.insert(addr, len);
        }
    }

    /// Takes a dead object out of use without releasing its address. Returns
    /// `false`, if `addr` was not allocated.
    pub fn retire(&mut self, addr: u64, revision: u64) -> bool {
        if !self.objects.contains_key(&addr) {
            return false;
        }
        self.retired.insert(addr, revision);
        true
    }

    /// Frees every retired object that died at or before `oldest`, the lowest
    /// revision any segment reflects. Returns the number of freed objects.
    pub fn release_retired(&mut self, oldest: u64) -> usize {
        let ready: Vec<u64> = self
            .retired
            .iter()
            .filter(|(_, died)| **died <= oldest)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &ready {
            self.retired.remove(addr);
            self.free(*addr);
        }
        ready.len()
    }

    pub fn retired(&self) -> usize {
        self.retired.len()
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.objects.contains_key(&addr)
    }

    pub fn size_of(&self, addr: u64) -> Option<usize> {
        self.objects.get(&addr).copied()
    }

    /// Addresses of all objects not retired
    pub fn objects(&self) -> impl Iterator<Item = u64> + '_ {
        let retired = &self.retired;
        self.objects.keys().copied().filter(move |addr| !retired.contains_key(addr))
    }

    pub fn count(&self) -> usize {
        self.objects.len() - self.retired.len()
    }

    /// Bytes held by live allocations
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes allocated since the last major collection
    pub fn since_major(&self) -> usize {
        self.since_major
    }

    pub fn reset_pressure(&mut self) {
        self.since_major = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 4096;

    fn space(pages: u64) -> OldSpace {
        OldSpace::new(BASE..BASE + pages * 256, 256)
    }

    #[test]
    fn test_small_pools() {
        let mut old = space(4);
        let a = old.alloc(16).expect("pool refill failed");
        let b = old.alloc(16).expect("pool refill failed");
        assert_eq!(a, BASE);
        assert_eq!(b, BASE + 16);

        assert_eq!(old.free(a), Some(16));
        assert_eq!(old.free(a), None);
        assert_eq!(old.alloc(16), Some(a));

        // a different size class carves its own chunk
        let c = old.alloc(24).expect("pool refill failed");
        assert_eq!(c, BASE + 256);
        assert_eq!(old.count(), 3);
        assert_eq!(old.used(), 56);
    }

    #[test]
    fn test_large_coalescing() {
        let mut old = space(16);
        let a = old.alloc(512).expect("out of space");
        let b = old.alloc(512).expect("out of space");
        let c = old.alloc(512).expect("out of space");
        let _d = old.alloc(512).expect("out of space");

        old.free(a);
        old.free(c);
        old.free(b);

        // a, b and c merged into one free block
        let big = old.alloc(1536).expect("coalescing failed");
        assert_eq!(big, a);
    }

    #[test]
    fn test_exhaustion() {
        let mut old = space(4);
        assert!(old.alloc(1024).is_some());
        assert!(old.alloc(264).is_none());
        assert!(old.alloc(16).is_none());
    }

    #[test]
    fn test_bump_rewinds() {
        let mut old = space(8);
        let a = old.alloc(512).expect("out of space");
        old.free(a);
        assert_eq!(old.alloc(1024), Some(a));
        assert_eq!(old.since_major(), 1536);
        old.reset_pressure();
        assert_eq!(old.since_major(), 0);
    }

    #[test]
    fn test_retired_addresses_wait() {
        let mut old = space(16);
        let a = old.alloc(512).expect("out of space");
        let b = old.alloc(16).expect("pool refill failed");

        assert!(old.retire(a, 5));
        assert!(old.retire(b, 7));
        assert!(!old.retire(BASE + 8, 7));
        assert_eq!(old.count(), 0);
        assert_eq!(old.retired(), 2);
        assert_eq!(old.objects().count(), 0);

        // neither address is handed out again yet
        assert_ne!(old.alloc(512), Some(a));
        assert_ne!(old.alloc(16), Some(b));

        assert_eq!(old.release_retired(6), 1);
        assert_eq!(old.retired(), 1);
        assert_eq!(old.alloc(512), Some(a));

        assert_eq!(old.release_retired(7), 1);
        assert_eq!(old.alloc(16), Some(b));
        assert_eq!(old.retired(), 0);
    }
}

// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.
//!
//! Every field has a default that can be overridden by an environment variable
//! (`STM_SEGMENTS`, `STM_PAGE_SIZE`, `STM_HEAP_PAGES`, `STM_NURSERY_PAGES`,
//! `STM_LARGE_OBJECT`, `STM_ROOT_STACK`, `STM_MAJOR_THRESHOLD`,
//! `STM_LOG_TRIM`, `STM_LOG_MAX`). The environment is read once per process.

use crate::{object::HEADER_SIZE, StmError};
use lazy_static::lazy_static;
use log::*;

/// Upper bound on segments handed to threads
pub const MAX_SEGMENTS: usize = 254;

lazy_static! {
    static ref DEFAULT_CONFIG: Config = Config::from_env();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of segments threads can run transactions in. Bounds parallelism.
    pub num_segments: usize,

    /// Size of a heap page in bytes. Must be a power of two and at least 256.
    pub page_size: usize,

    /// Total number of pages of the logical heap, including the null page and
    /// every segment's nursery.
    pub heap_pages: usize,

    /// Pages per segment nursery
    pub nursery_pages: usize,

    /// Objects above this size are allocated outside the nursery
    pub large_object_threshold: usize,

    /// Maximum number of entries on a thread's root stack
    pub root_stack_depth: usize,

    /// Old space bytes allocated since the last major collection before the
    /// next one is requested
    pub major_threshold_bytes: usize,

    /// Commit log length that requests a major collection (which trims the log)
    pub log_trim_threshold: usize,

    /// Hard limit on retained commit log entries
    pub max_log_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        DEFAULT_CONFIG.clone()
    }
}

impl Config {
    /// The built-in defaults, ignoring the environment
    pub fn builtin() -> Self {
        Self {
            num_segments: 4,
            page_size: 4096,
            heap_pages: 4096,
            nursery_pages: 64,
            large_object_threshold: 8192,
            root_stack_depth: 16 * 1024,
            major_threshold_bytes: 4 * 1024 * 1024,
            log_trim_threshold: 4096,
            max_log_entries: 1 << 20,
        }
    }

    /// The built-in defaults with every `STM_*` override applied
    pub fn from_env() -> Self {
        let mut config = Self::builtin();

        override_from_env("STM_SEGMENTS", &mut config.num_segments);
        override_from_env("STM_PAGE_SIZE", &mut config.page_size);
        override_from_env("STM_HEAP_PAGES", &mut config.heap_pages);
        override_from_env("STM_NURSERY_PAGES", &mut config.nursery_pages);
        override_from_env("STM_LARGE_OBJECT", &mut config.large_object_threshold);
        override_from_env("STM_ROOT_STACK", &mut config.root_stack_depth);
        override_from_env("STM_MAJOR_THRESHOLD", &mut config.major_threshold_bytes);
        override_from_env("STM_LOG_TRIM", &mut config.log_trim_threshold);
        override_from_env("STM_LOG_MAX", &mut config.max_log_entries);

        config
    }

    pub fn with_segments(mut self, num_segments: usize) -> Self {
        self.num_segments = num_segments;
        self
    }

    pub fn with_heap_pages(mut self, heap_pages: usize) -> Self {
        self.heap_pages = heap_pages;
        self
    }

    pub fn with_nursery_pages(mut self, nursery_pages: usize) -> Self {
        self.nursery_pages = nursery_pages;
        self
    }

    pub fn with_major_threshold(mut self, bytes: usize) -> Self {
        self.major_threshold_bytes = bytes;
        self
    }

    /// Size of one nursery in bytes
    pub fn nursery_size(&self) -> usize {
        self.nursery_pages * self.page_size
    }

    /// Number of pages left for old space
    pub fn old_pages(&self) -> usize {
        self.heap_pages
            .saturating_sub(1 + self.num_segments * self.nursery_pages)
    }

    pub fn validate(&self) -> Result<(), StmError> {
        let fail = |msg: &str| Err(StmError::Config(msg.to_string()));

        if self.num_segments == 0 || self.num_segments > MAX_SEGMENTS {
            return fail("num_segments must be within 1..=254");
        }
        if !self.page_size.is_power_of_two() || self.page_size < 256 {
            return fail("page_size must be a power of two of at least 256 bytes");
        }
        if self.nursery_pages == 0 {
            return fail("nursery_pages must be > 0");
        }
        if self.old_pages() < 4 {
            return fail("heap_pages leaves no room for old space");
        }
        if self.large_object_threshold < HEADER_SIZE * 2 || self.large_object_threshold > self.nursery_size() / 2 {
            return fail("large_object_threshold must fit twice into a nursery");
        }
        if u32::try_from(self.heap_pages as u64 * self.page_size as u64).is_err() {
            return fail("heap must be addressable with 32 bit object sizes");
        }
        if self.root_stack_depth == 0 {
            return fail("root_stack_depth must be > 0");
        }
        if self.max_log_entries < self.log_trim_threshold {
            return fail("max_log_entries must not be below log_trim_threshold");
        }

        Ok(())
    }
}

fn override_from_env(name: &str, target: &mut usize) {
    if let Ok(value) = std::env::var(name) {
        match value.trim().parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(e) => warn!("ignoring {}={:?}: {}", name, value, e),
        }
    }
}

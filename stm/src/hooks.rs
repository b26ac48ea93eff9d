// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Optional diagnostic hooks. The engine reports notable events together with
//! their timings; an embedder can forward them to its own profiler.

use crate::StmError;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TransactionStart { revision: u64 },
    TransactionCommit { revision: u64 },
    TransactionAbort { cause: StmError },
    BecameInevitable,
    WaitedForSegment { elapsed: Duration },
    PageFault { page: usize, is_write: bool, undone: usize },
    MinorCollection { promoted: usize, elapsed: Duration },
    MajorCollection { marked: usize, freed: usize, elapsed: Duration },
}

pub trait Hooks: Send + Sync {
    fn on_event(&self, segment: usize, event: &Event);
}

/// Snapshot of the engine's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub commits: u64,
    pub aborts: u64,
    pub page_faults: u64,
    pub minor_collections: u64,
    pub major_collections: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    commits: AtomicU64,
    aborts: AtomicU64,
    page_faults: AtomicU64,
    minor_collections: AtomicU64,
    major_collections: AtomicU64,
}

impl Counters {
    pub(crate) fn count(&self, event: &Event) {
        let counter = match event {
            Event::TransactionCommit { .. } => &self.commits,
            Event::TransactionAbort { .. } => &self.aborts,
            Event::PageFault { .. } => &self.page_faults,
            Event::MinorCollection { .. } => &self.minor_collections,
            Event::MajorCollection { .. } => &self.major_collections,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            page_faults: self.page_faults.load(Ordering::Relaxed),
            minor_collections: self.minor_collections.load(Ordering::Relaxed),
            major_collections: self.major_collections.load(Ordering::Relaxed),
        }
    }
}

// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-segment bookkeeping.
//!
//! Locks of a segment are always taken in this order: the privatization lock
//! (`pages`), then the modification lock (`modified`), then `local`. Privatization
//! locks of several segments are taken in increasing segment number.

use crate::{
    commit_log::{Backup, Slice},
    pages::{HeapLayout, PageTable},
    thread::RootStack,
    ObjRef,
};
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::{
    ops::Range,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};

/// The sharing segment, holding the latest committed content
pub const SHARING: usize = 0;

pub(crate) const SIGNAL_NONE: u8 = 0;
pub(crate) const SIGNAL_PAUSE: u8 = 1;
pub(crate) const SIGNAL_ABORT: u8 = 2;

/// Read markers cover the old space in granules of this many bytes
const MARKER_GRANULE: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    None,
    Regular,
    Inevitable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModKind {
    /// A committed object changed by this transaction
    Written,

    /// An old-space object created by this transaction
    New,
}

#[derive(Debug)]
pub(crate) struct Modified {
    pub kind: ModKind,
    pub backup: Backup,
}

/// Objects changed in the running transaction, with the content they had at the
/// segment's revision.
#[derive(Default)]
pub(crate) struct ModifiedList {
    entries: Vec<Modified>,
    index: FxHashMap<ObjRef, usize>,
}

impl ModifiedList {
    pub fn push(&mut self, kind: ModKind, backup: Backup) {
        debug_assert!(!self.index.contains_key(&backup.obj), "object recorded twice");
        self.index.insert(backup.obj, self.entries.len());
        self.entries.push(Modified { kind, backup });
    }

    pub fn contains(&self, obj: ObjRef) -> bool {
        self.index.contains_key(&obj)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Modified> {
        self.entries.iter()
    }

    pub fn objects(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.entries.iter().map(|m| m.backup.obj)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Modified> + '_ {
        self.index.clear();
        self.entries.drain(..)
    }

    /// Reverts every backed up slice lying in `range` (a page's addresses)
    pub fn undo_page(&self, range: &Range<u64>, page: &mut [u8]) -> usize {
        self.entries
            .iter()
            .flat_map(|m| m.backup.slices.iter())
            .filter(|slice| slice.restore_into(range, page))
            .count()
    }
}

/// Byte markers recording which old objects the running transaction read.
pub(crate) struct ReadMarkers {
    base: u64,
    version: u8,
    markers: Vec<u8>,
}

impl ReadMarkers {
    pub fn new(old: Range<u64>) -> Self {
        Self {
            base: old.start,
            version: 0,
            markers: vec![0; ((old.end - old.start) / MARKER_GRANULE) as usize],
        }
    }

    fn slot(&self, obj: ObjRef) -> Option<usize> {
        let offset = obj.addr().checked_sub(self.base)?;
        let slot = (offset / MARKER_GRANULE) as usize;
        (slot < self.markers.len()).then_some(slot)
    }

    /// Starts a new read set. Stale markers are only wiped once the version wraps.
    pub fn next_version(&mut self) {
        self.version = self.version.wrapping_add(1);
        if self.version == 0 {
            self.markers.iter_mut().for_each(|m| *m = 0);
            self.version = 1;
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn mark(&mut self, obj: ObjRef) {
        if let Some(slot) = self.slot(obj) {
            self.markers[slot] = self.version;
        }
    }

    pub fn was_read(&self, obj: ObjRef) -> bool {
        self.slot(obj).map_or(false, |slot| self.markers[slot] == self.version)
    }

    pub fn clear(&mut self, obj: ObjRef) {
        if let Some(slot) = self.slot(obj) {
            self.markers[slot] = 0;
        }
    }
}

/// State only touched by the thread running in the segment, or by a collector
/// while that thread is paused.
pub(crate) struct SegmentLocal {
    pub state: TxState,
    pub base_revision: u64,
    pub nursery: Range<u64>,
    pub nursery_cursor: u64,
    pub read_markers: ReadMarkers,

    /// Young objects whose identity was observed, mapped to their future address
    pub shadows: FxHashMap<ObjRef, ObjRef>,

    /// Root stack of the thread owning the segment
    pub owner_roots: Option<Arc<Mutex<RootStack>>>,
    pub inevitable_reason: Option<String>,
}

impl SegmentLocal {
    pub fn nursery_used(&self) -> u64 {
        self.nursery_cursor - self.nursery.start
    }
}

pub(crate) struct Segment {
    pub num: usize,

    /// privatization lock
    pub pages: Mutex<PageTable>,

    /// modification lock
    pub modified: RwLock<ModifiedList>,

    pub local: Mutex<SegmentLocal>,
    revision: AtomicU64,
    signal: CachePadded<AtomicU8>,
}

impl Segment {
    pub fn new(num: usize, layout: &HeapLayout) -> Self {
        let mut pages = PageTable::new(layout.num_pages(), layout.page_size());
        let (nursery, old) = match num {
            SHARING => (0..0, 0..0),
            _ => (layout.nursery_range(num), layout.old_range()),
        };

        if num != SHARING {
            for page in layout.pages_of(nursery.clone()) {
                pages.mark_accessible(page, vec![0; layout.page_size()].into_boxed_slice());
            }
        }

        Self {
            num,
            pages: Mutex::new(pages),
            modified: RwLock::new(ModifiedList::default()),
            local: Mutex::new(SegmentLocal {
                state: TxState::None,
                base_revision: 0,
                nursery_cursor: nursery.start,
                nursery,
                read_markers: ReadMarkers::new(old),
                shadows: FxHashMap::default(),
                owner_roots: None,
                inevitable_reason: None,
            }),
            revision: AtomicU64::new(0),
            signal: CachePadded::new(AtomicU8::new(SIGNAL_NONE)),
        }
    }

    /// The last revision this segment's private pages reflect
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn set_revision(&self, revision: u64) {
        self.revision.store(revision, Ordering::Release);
    }

    pub fn signal(&self) -> u8 {
        self.signal.load(Ordering::Acquire)
    }

    pub fn raise(&self, signal: u8) {
        self.signal.fetch_or(signal, Ordering::AcqRel);
    }

    /// Clears `signal`. Returns `true`, if it was raised.
    pub fn lower(&self, signal: u8) -> bool {
        self.signal.fetch_and(!signal, Ordering::AcqRel) & signal != 0
    }
}

/// Builds page-bounded slices out of an object's bytes
pub(crate) fn slices_of(layout: &HeapLayout, addr: u64, bytes: &[u8]) -> Vec<Slice> {
    layout
        .chunks(addr, bytes.len())
        .map(|chunk| Slice {
            addr: addr + chunk.start as u64,
            bytes: bytes[chunk.start..chunk.start + chunk.len].into(),
        })
        .collect()
}

// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Commit Log
//!
//! The commit log is a totally ordered chain of committed transactions. Every entry
//! carries the undo information of the objects the transaction wrote: for each
//! object a list of page-bounded slices holding the content *before* the commit.
//!
//! Entries are immutable and stored in an arena ordered by revision. The tail is a
//! single atomic word holding the latest revision; its most significant bit is the
//! sentinel of an in-progress inevitable transaction. Only the committing
//! transaction advances the tail, by compare-and-swap.

use crate::{ObjRef, Resource, StmError};
use parking_lot::RwLock;
use std::{
    collections::VecDeque,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Sentinel bit marking an inevitable transaction in progress
const INEVITABLE: u64 = 1 << 63;

/// A copy of a page-bounded part of an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Slice {
    pub addr: u64,
    pub bytes: Box<[u8]>,
}

impl Slice {
    pub fn end(&self) -> u64 {
        self.addr + self.bytes.len() as u64
    }

    /// Copies this slice into `page`, if it lies within `range` (the page's addresses)
    pub fn restore_into(&self, range: &Range<u64>, page: &mut [u8]) -> bool {
        if !range.contains(&self.addr) {
            return false;
        }
        let offset = (self.addr - range.start) as usize;
        page[offset..offset + self.bytes.len()].copy_from_slice(&self.bytes);
        true
    }
}

/// An object together with the backup of its content
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Backup {
    pub obj: ObjRef,
    pub slices: Vec<Slice>,
}

#[derive(Debug)]
pub struct CommitEntry {
    revision: u64,
    segment: usize,
    pub(crate) written: Vec<Backup>,
}

impl CommitEntry {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The segment that committed this entry
    pub fn segment(&self) -> usize {
        self.segment
    }

    /// The objects written by this commit
    pub fn objects(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.written.iter().map(|backup| backup.obj)
    }
}

pub(crate) struct CommitLog {
    tail: AtomicU64,
    entries: RwLock<VecDeque<Arc<CommitEntry>>>,
}

impl Default for CommitLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitLog {
    pub fn new() -> Self {
        Self {
            tail: AtomicU64::new(0),
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Returns the revision of the latest commit
    pub fn head(&self) -> u64 {
        self.tail.load(Ordering::Acquire) & !INEVITABLE
    }

    /// Returns `true`, if an inevitable transaction is in progress
    pub fn is_inevitable(&self) -> bool {
        self.tail.load(Ordering::Acquire) & INEVITABLE != 0
    }

    /// Installs the inevitable sentinel on the current head
    pub fn mark_inevitable(&self) -> Result<(), StmError> {
        let head = self.head();
        self.tail
            .compare_exchange(head, head | INEVITABLE, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| StmError::Protocol("another transaction is inevitable"))
    }

    /// Removes the inevitable sentinel without appending an entry
    pub fn clear_inevitable(&self) {
        self.tail.fetch_and(!INEVITABLE, Ordering::AcqRel);
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Appends a new entry and returns it. The caller must hold the sharing segment's
    /// privatization lock, so that the head never runs ahead of the shared content.
    pub fn append(
        &self,
        segment: usize,
        written: Vec<Backup>,
        inevitable: bool,
        limit: usize,
    ) -> Result<Arc<CommitEntry>, StmError> {
        let mut entries = self.entries.write();
        if entries.len() >= limit {
            return Err(StmError::Exhausted(Resource::CommitLog));
        }

        let head = self.head();
        let expected = if inevitable { head | INEVITABLE } else { head };
        let entry = Arc::new(CommitEntry {
            revision: head + 1,
            segment,
            written,
        });

        entries.push_back(entry.clone());
        if self
            .tail
            .compare_exchange(expected, head + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            entries.pop_back();
            return Err(StmError::Protocol("commit log tail changed during commit"));
        }

        Ok(entry)
    }

    /// Returns all entries with `after < revision <= upto`, oldest first
    pub fn between(&self, after: u64, upto: u64) -> Vec<Arc<CommitEntry>> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|entry| entry.revision > after && entry.revision <= upto)
            .cloned()
            .collect()
    }

    /// Reverts `page` (covering the addresses `range`) from revision `from` back to
    /// revision `target` by applying the backups of every entry in between, newest
    /// first. Returns the number of restored slices.
    pub fn undo_page(&self, target: u64, from: u64, range: &Range<u64>, page: &mut [u8]) -> usize {
        let entries = self.entries.read();
        let first = match entries.front() {
            Some(entry) => entry.revision,
            None => return 0,
        };

        debug_assert!(target + 1 >= first || from <= target, "commit log trimmed too far");

        let mut undone = 0;
        let mut revision = from;
        while revision > target && revision >= first {
            let entry = &entries[(revision - first) as usize];
            debug_assert_eq!(entry.revision, revision);
            for backup in &entry.written {
                for slice in &backup.slices {
                    if slice.restore_into(range, page) {
                        undone += 1;
                    }
                }
            }
            revision -= 1;
        }

        undone
    }

    /// Drops every entry with `revision <= upto`. Returns the number of dropped entries.
    pub fn trim(&self, upto: u64) -> usize {
        let mut entries = self.entries.write();
        let mut dropped = 0;
        while entries.front().map_or(false, |entry| entry.revision <= upto) {
            entries.pop_front();
            dropped += 1;
        }
        dropped
    }
}

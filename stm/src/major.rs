// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Major Collection
//!
//! A stop-the-world mark and sweep over old space. It runs only after every other
//! segment reached a safe point, and after each segment emptied its nursery.
//!
//! Committed objects are marked with [`FLAG_VISITED`] in the sharing segment's copy
//! of their header. An unmodified object is identical in every segment, so one bit
//! suffices. Objects without a committed copy (created by a running transaction, or
//! reserved as a shadow) are marked in a side set instead.
//!
//! Roots are the permanent roots, the root stack of every registered thread (with
//! the slots saved at transaction start) and the modified list of every segment. An object is traced in its committed form and in
//! every private form a running transaction gave it.
//!
//! Dead objects are retired: their addresses are reused only after every segment
//! reflects the revision of the sweep, so no replayed commit log entry can write
//! stale content over a new object.
//!
//! Afterwards idle segments drop their private pages and fast-forward to the head,
//! and commit log entries no segment can need anymore are trimmed.

use crate::{
    object::{read_word, Header, ObjRef, ObjectView, FLAG_VISITED, HEADER_SIZE},
    pages::PageStatus,
    segment::{ModKind, TxState},
    Engine, Event, Result,
};
use log::*;
use rustc_hash::FxHashSet;
use std::{
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

struct Marker<'a> {
    engine: &'a Engine,

    /// every allocated old space address
    allocated: FxHashSet<u64>,

    /// objects without a committed copy
    uncommitted: FxHashSet<ObjRef>,

    /// marks of uncommitted objects
    side: FxHashSet<ObjRef>,
    gray: Vec<ObjRef>,
    marked: usize,
}

impl<'a> Marker<'a> {
    fn committed_header(&self, obj: ObjRef) -> Header {
        let mut bytes = [0u8; HEADER_SIZE];
        self.engine.read_committed(obj.addr(), &mut bytes);
        Header::decode(&bytes)
    }

    fn mark(&mut self, obj: ObjRef) {
        if !self.allocated.contains(&obj.addr()) {
            return;
        }

        if self.uncommitted.contains(&obj) {
            if self.side.insert(obj) {
                self.marked += 1;
                self.gray.push(obj);
            }
            return;
        }

        let mut header = self.committed_header(obj);
        if header.has(FLAG_VISITED) {
            return;
        }
        header.flags |= FLAG_VISITED;
        self.engine.write_committed(obj.addr(), &header.encode());
        self.marked += 1;
        self.gray.push(obj);
    }

    /// Collects the committed and private versions of `obj`
    fn versions(&self, obj: ObjRef) -> Vec<Vec<u8>> {
        let engine = self.engine;
        let mut versions = Vec::new();

        if !self.uncommitted.contains(&obj) {
            let header = self.committed_header(obj);
            let mut bytes = vec![0u8; engine.model.size_of(&header)];
            engine.read_committed(obj.addr(), &mut bytes);
            versions.push(bytes);
        }

        for segment in engine.segments.iter().skip(1) {
            if segment.modified.read().contains(obj) {
                versions.push(engine.read_object(segment.num, obj));
            }
        }
        versions
    }

    fn drain(&mut self) {
        while let Some(obj) = self.gray.pop() {
            for bytes in self.versions(obj) {
                if bytes.len() < HEADER_SIZE {
                    continue;
                }
                let mut slots = Vec::new();
                self.engine
                    .model
                    .trace(&ObjectView::new(obj, &bytes), &mut |offset| slots.push(offset));
                for offset in slots {
                    self.mark(ObjRef::from_addr(read_word(&bytes[HEADER_SIZE..], offset)));
                }
            }
        }
    }
}

impl Engine {
    /// Stops every other segment and collects old space. Without `forced`, the
    /// collection is skipped if another thread ran one while this one waited.
    pub(crate) fn major_collection(&self, seg: usize, forced: bool) -> Result<()> {
        let started = Instant::now();
        self.request_pause(seg);
        let result = match forced || self.major_pending() {
            true => self.collect_stopped(seg, started),
            false => Ok(()),
        };
        self.release_pause(seg);
        result
    }

    fn collect_stopped(&self, seg: usize, started: Instant) -> Result<()> {
        for segment in self.segments.iter().skip(1) {
            if segment.local.lock().nursery_used() > 0 {
                self.minor_collection(segment.num)?;
            }
        }

        let mut marker = Marker {
            engine: self,
            allocated: self.old.lock().objects().collect(),
            uncommitted: FxHashSet::default(),
            side: FxHashSet::default(),
            gray: Vec::new(),
            marked: 0,
        };

        let mut roots: Vec<ObjRef> = self.permanent.lock().clone();
        let stacks: Vec<_> = self.threads.lock().values().cloned().collect();
        for stack in stacks {
            let stack = stack.lock();
            roots.extend(stack.slots());
            roots.extend(stack.saved());
        }

        let mut shadows = Vec::new();
        for segment in self.segments.iter().skip(1) {
            let modified = segment.modified.read();
            for entry in modified.iter() {
                if entry.kind == ModKind::New {
                    marker.uncommitted.insert(entry.backup.obj);
                }
                roots.push(entry.backup.obj);
            }
            drop(modified);
            shadows.extend(segment.local.lock().shadows.values().copied());
        }

        // shadows hold no content yet
        for shadow in shadows {
            marker.uncommitted.insert(shadow);
            if marker.side.insert(shadow) {
                marker.marked += 1;
            }
        }

        for root in roots {
            marker.mark(root);
        }
        marker.drain();

        let marked = marker.marked;
        let freed = self.sweep(&marker);
        drop(marker);

        self.release_idle_pages();

        let oldest = self
            .segments
            .iter()
            .skip(1)
            .map(|segment| segment.revision())
            .min()
            .unwrap_or_else(|| self.log.head());
        let trimmed = self.log.trim(oldest);
        let released = self.old.lock().release_retired(oldest);

        self.old.lock().reset_pressure();
        self.major_pending.store(false, Ordering::Release);

        let elapsed: Duration = started.elapsed();
        info!(
            "SEGMENT ({}): MAJOR COLLECTION MARKED ({}) FREED ({}) RELEASED ({}) TRIMMED ({}) IN {:?}",
            seg, marked, freed, released, trimmed, elapsed
        );
        self.emit(seg, Event::MajorCollection { marked, freed, elapsed });
        Ok(())
    }

    /// Retires every unmarked object and clears the marks of the others
    fn sweep(&self, marker: &Marker<'_>) -> usize {
        let head = self.log.head();
        let mut dead = Vec::new();
        for &addr in &marker.allocated {
            let obj = ObjRef::from_addr(addr);
            if marker.uncommitted.contains(&obj) {
                if !marker.side.contains(&obj) {
                    dead.push(obj);
                }
                continue;
            }

            let mut header = marker.committed_header(obj);
            if header.has(FLAG_VISITED) {
                header.flags &= !FLAG_VISITED;
                self.write_committed(addr, &header.encode());
            } else {
                dead.push(obj);
            }
        }

        for &obj in &dead {
            self.retire_old(obj, head);
            for segment in self.segments.iter().skip(1) {
                segment.local.lock().read_markers.clear(obj);
            }
        }
        dead.len()
    }

    /// Segments without a transaction drop every private old space page and move to
    /// the head of the commit log. Their next access rebuilds pages on demand.
    fn release_idle_pages(&self) {
        let head = self.log.head();
        let old_pages = self.layout.pages_of(self.layout.old_range());

        for segment in self.segments.iter().skip(1) {
            if segment.local.lock().state != TxState::None {
                continue;
            }
            let mut pages = segment.pages.lock();
            let mut released = 0;
            for page in old_pages.clone() {
                if pages.status(page) != PageStatus::Inaccessible {
                    pages.mark_inaccessible(page);
                    released += 1;
                }
            }
            segment.set_revision(head);
            drop(pages);
            trace!("SEGMENT ({}): RELEASED ({}) PAGES", segment.num, released);
        }
    }
}

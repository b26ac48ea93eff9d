// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Nursery and Minor Collection
//!
//! Every segment bump-allocates young objects in its own nursery. Young objects
//! are only visible to their segment, so they need no barriers. A minor collection
//! copies every young object reachable from the owner's root stack or from an object
//! in the modified list into old space:
//!
//! 1. forward the roots, leaving a forwarding address in each moved object
//! 2. fix the references of every modified object
//! 3. drain the worklist of promoted objects, whose references are fixed in turn
//! 4. zero the nursery and reset its cursor
//!
//! Promoted objects enter the modified list as new objects, so they are published
//! with the next commit. An object whose identity was observed gets a shadow in old
//! space up front, and moves there.

use crate::{
    commit_log::Backup,
    object::{
        read_word, round_size, Header, ObjRef, ObjectView, FLAG_FORWARDED, FLAG_HAS_SHADOW, FLAG_WRITE_BARRIER,
        HEADER_SIZE,
    },
    segment::{slices_of, ModKind},
    Engine, Event, Resource, Result, StmError,
};
use log::*;
use std::time::Instant;

impl Engine {
    /// Allocates an object of `size` bytes (header included), tagged with `tag`.
    /// Allocation is a safe point and may run a minor or major collection.
    pub(crate) fn allocate(&self, seg: usize, size: usize, tag: u16) -> Result<ObjRef> {
        self.check_signals(seg)?;
        if self.major_pending() {
            self.major_collection(seg, false)?;
        }

        let size = round_size(size);
        if u32::try_from(size).is_err() {
            return Err(StmError::Exhausted(Resource::Heap));
        }
        if size > self.config.large_object_threshold {
            return self.allocate_old_object(seg, size, tag);
        }

        let obj = match self.bump(seg, size) {
            Some(obj) => obj,
            None => {
                self.minor_collection(seg)?;
                self.bump(seg, size).ok_or(StmError::Exhausted(Resource::Nursery))?
            }
        };
        self.write_header(seg, obj, Header::new(size, tag));
        Ok(obj)
    }

    fn bump(&self, seg: usize, size: usize) -> Option<ObjRef> {
        let mut local = self.segments[seg].local.lock();
        let addr = local.nursery_cursor;
        if addr + size as u64 > local.nursery.end {
            return None;
        }
        local.nursery_cursor += size as u64;
        Some(ObjRef::from_addr(addr))
    }

    /// Moves `size` bytes at `obj` into the modified list as a new object, backing up
    /// the content the pages had before.
    fn record_new(&self, seg: usize, obj: ObjRef, size: usize) {
        self.privatize(seg, obj.addr(), size);
        let mut before = vec![0u8; size];
        self.read_bytes(seg, obj.addr(), &mut before);
        self.segments[seg].modified.write().push(
            ModKind::New,
            Backup {
                obj,
                slices: slices_of(&self.layout, obj.addr(), &before),
            },
        );
    }

    fn allocate_old_object(&self, seg: usize, size: usize, tag: u16) -> Result<ObjRef> {
        let obj = self.alloc_old(size)?;
        self.record_new(seg, obj, size);

        let mut fresh = vec![0u8; size];
        fresh[..HEADER_SIZE].copy_from_slice(&Header::new(size, tag).encode());
        self.write_bytes(seg, obj.addr(), &fresh);
        trace!("TX({}): LARGE OBJECT {:?} ({} BYTES)", seg, obj, size);
        Ok(obj)
    }

    /// Promotes every live young object of `seg` to old space
    pub(crate) fn minor_collection(&self, seg: usize) -> Result<()> {
        let started = Instant::now();
        let roots = {
            let local = self.segments[seg].local.lock();
            if local.nursery_used() == 0 {
                return Ok(());
            }
            local.owner_roots.clone()
        };

        let mut worklist = Vec::new();
        if let Some(roots) = roots {
            let mut roots = roots.lock();
            for slot in roots.slots_mut() {
                *slot = self.forward(seg, *slot, &mut worklist)?;
            }
        }

        let modified: Vec<ObjRef> = self.segments[seg].modified.read().objects().collect();
        for obj in modified {
            self.fix_references(seg, obj, &mut worklist)?;
        }

        let mut promoted = 0;
        while let Some(obj) = worklist.pop() {
            self.fix_references(seg, obj, &mut worklist)?;
            promoted += 1;
        }

        self.reset_nursery(seg);

        let elapsed = started.elapsed();
        debug!("TX({}): MINOR COLLECTION PROMOTED ({}) IN {:?}", seg, promoted, elapsed);
        self.emit(seg, Event::MinorCollection { promoted, elapsed });
        Ok(())
    }

    /// Returns the old space address of `obj`, copying it there first if it is
    /// young and not yet forwarded
    fn forward(&self, seg: usize, obj: ObjRef, worklist: &mut Vec<ObjRef>) -> Result<ObjRef> {
        if !self.layout.in_nursery(seg, obj.addr()) {
            return Ok(obj);
        }

        let mut header = self.read_header(seg, obj);
        if header.has(FLAG_FORWARDED) {
            return Ok(ObjRef::from_addr(self.read_word(seg, obj.field_addr(0))));
        }

        let size = self.model.size_of(&header);
        let shadow = match header.has(FLAG_HAS_SHADOW) {
            true => self.segments[seg].local.lock().shadows.remove(&obj),
            false => None,
        };
        let moved = match shadow {
            Some(shadow) => shadow,
            None => self.alloc_old(size)?,
        };
        self.record_new(seg, moved, size);

        let mut copy = vec![0u8; size];
        self.read_bytes(seg, obj.addr(), &mut copy);
        let mut clean = header;
        clean.flags &= !(FLAG_HAS_SHADOW | FLAG_FORWARDED | FLAG_WRITE_BARRIER);
        copy[..HEADER_SIZE].copy_from_slice(&clean.encode());
        self.write_bytes(seg, moved.addr(), &copy);

        header.flags |= FLAG_FORWARDED;
        self.write_header(seg, obj, header);
        self.write_word(seg, obj.field_addr(0), moved.addr());

        worklist.push(moved);
        Ok(moved)
    }

    /// Forwards every young object referenced by `obj`
    fn fix_references(&self, seg: usize, obj: ObjRef, worklist: &mut Vec<ObjRef>) -> Result<()> {
        let bytes = self.read_object(seg, obj);
        let mut slots = Vec::new();
        self.model
            .trace(&ObjectView::new(obj, &bytes), &mut |offset| slots.push(offset));

        for offset in slots {
            let target = ObjRef::from_addr(read_word(&bytes[HEADER_SIZE..], offset));
            if self.layout.in_nursery(seg, target.addr()) {
                let moved = self.forward(seg, target, worklist)?;
                self.write_word(seg, obj.field_addr(offset), moved.addr());
            }
        }
        Ok(())
    }

    /// Zeroes the used part of the nursery and frees the shadows of young objects
    /// that did not survive
    pub(crate) fn reset_nursery(&self, seg: usize) {
        let (used, leftover) = {
            let mut local = self.segments[seg].local.lock();
            let used = local.nursery.start..local.nursery_cursor;
            local.nursery_cursor = local.nursery.start;
            let leftover: Vec<ObjRef> = local.shadows.drain().map(|(_, shadow)| shadow).collect();
            (used, leftover)
        };

        {
            let mut pages = self.segments[seg].pages.lock();
            for chunk in self.layout.chunks(used.start, (used.end - used.start) as usize) {
                pages.clear(chunk.page, chunk.offset, chunk.len);
            }
        }

        for shadow in leftover {
            self.free_old(shadow);
        }
    }

    /// Returns an address identifying `obj` for its whole lifetime. A young object
    /// gets a shadow in old space, which becomes its address once it is promoted.
    pub(crate) fn id_of(&self, seg: usize, obj: ObjRef) -> Result<u64> {
        if !self.layout.in_nursery(seg, obj.addr()) {
            return Ok(obj.addr());
        }
        if let Some(shadow) = self.segments[seg].local.lock().shadows.get(&obj) {
            return Ok(shadow.addr());
        }

        let mut header = self.read_header(seg, obj);
        let shadow = self.alloc_old(self.model.size_of(&header))?;
        header.flags |= FLAG_HAS_SHADOW;
        self.write_header(seg, obj, header);
        self.segments[seg].local.lock().shadows.insert(obj, shadow);
        Ok(shadow.addr())
    }
}

// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Read and write barriers.
//!
//! The read barrier stamps the object's read marker with the segment's current read
//! version. The write barrier runs its slow path once per object and transaction:
//! committed objects carry [`FLAG_WRITE_BARRIER`], and the first write privatizes
//! the object's pages, records a backup of its content in the modified list and
//! clears the flag. Young objects never need a barrier.

use crate::{
    commit_log::Backup,
    object::{ObjRef, FLAG_WRITE_BARRIER},
    segment::{slices_of, ModKind},
    Engine,
};
use log::*;

impl Engine {
    pub(crate) fn read_barrier(&self, seg: usize, obj: ObjRef) {
        if self.layout.is_old(obj.addr()) {
            self.segments[seg].local.lock().read_markers.mark(obj);
        }
    }

    /// Returns `true`, if the running transaction read `obj`
    pub(crate) fn was_read(&self, seg: usize, obj: ObjRef) -> bool {
        self.segments[seg].local.lock().read_markers.was_read(obj)
    }

    pub(crate) fn write_barrier(&self, seg: usize, obj: ObjRef) {
        if !self.layout.is_old(obj.addr()) {
            return;
        }

        let mut header = self.read_header(seg, obj);
        if !header.has(FLAG_WRITE_BARRIER) {
            return;
        }

        let size = self.model.size_of(&header);
        self.privatize(seg, obj.addr(), size);

        let mut bytes = vec![0u8; size];
        self.read_bytes(seg, obj.addr(), &mut bytes);
        let backup = Backup {
            obj,
            slices: slices_of(&self.layout, obj.addr(), &bytes),
        };

        // before the first private write: segments copying our pages undo from it
        self.segments[seg].modified.write().push(ModKind::Written, backup);

        header.flags &= !FLAG_WRITE_BARRIER;
        self.write_header(seg, obj, header);
        self.segments[seg].local.lock().read_markers.mark(obj);
        trace!("TX({}): WRITE BARRIER {:?}", seg, obj);
    }
}

// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transaction Lifecycle
//!
//! A transaction runs in one segment and moves through the states
//! `None -> Regular -> (Inevitable) -> None`.
//!
//! - **start**: fast-forwards the segment to the head of the commit log by importing
//!   every object committed since the segment's revision into its private pages.
//! - **validate**: checks every entry committed since the segment's revision against
//!   the read markers and the modified list, then imports as on start. A conflict
//!   rolls the transaction back before the import.
//! - **commit**: runs a minor collection, validates under the global mutex, publishes
//!   the modified objects to the sharing segment and appends an entry carrying their
//!   backups to the commit log.
//! - **abort**: restores every backup over the segment's private pages and discards
//!   the nursery.

use crate::{
    commit_log::Backup,
    object::{Header, ObjRef, FLAG_WRITE_BARRIER, HEADER_SIZE},
    pages::{PageStatus, PageTable},
    sched::Cond,
    segment::{ModKind, TxState, SHARING, SIGNAL_ABORT},
    thread::RootStack,
    AbortReason, Engine, Event, Resource, Result, StmError,
};
use log::*;
use parking_lot::{Mutex, MutexGuard};
use std::sync::{atomic::Ordering, Arc};

impl Engine {
    /// Starts a transaction in `seg`, owned by the thread with the root stack `roots`
    pub(crate) fn begin(&self, seg: usize, roots: Arc<Mutex<RootStack>>) -> Result<u64> {
        {
            let mut local = self.segments[seg].local.lock();
            if local.state != TxState::None {
                return Err(StmError::Protocol("segment already runs a transaction"));
            }
            local.state = TxState::Regular;
            local.read_markers.next_version();
            local.owner_roots = Some(roots);
        }

        self.validate(seg, false)?;

        let revision = self.segments[seg].revision();
        self.segments[seg].local.lock().base_revision = revision;
        debug!("TX({}): START AT REVISION ({})", seg, revision);
        self.emit(seg, Event::TransactionStart { revision });
        Ok(revision)
    }

    /// Brings `seg` up to the head of the commit log. With `check`, every newer
    /// entry is checked for conflicts first; a conflicting transaction is rolled
    /// back and the reason returned.
    pub(crate) fn validate(&self, seg: usize, check: bool) -> Result<()> {
        let segment = &self.segments[seg];
        let mut shared = self.segments[SHARING].pages.lock();
        let mut own = segment.pages.lock();

        let revision = segment.revision();
        let head = self.log.head();
        if revision == head {
            return Ok(());
        }

        let entries = self.log.between(revision, head);
        let conflict = match check {
            true => {
                let modified = segment.modified.read();
                let local = segment.local.lock();
                entries.iter().flat_map(|entry| entry.objects()).find_map(|obj| {
                    if modified.contains(obj) {
                        Some(AbortReason::WriteWriteConflict)
                    } else if local.read_markers.was_read(obj) {
                        Some(AbortReason::ReadWriteConflict)
                    } else {
                        None
                    }
                })
            }
            false => None,
        };

        let created = match conflict {
            Some(_) => self.rollback_locked(seg, &mut own),
            None => Vec::new(),
        };

        let mut imported = 0;
        for slice in entries.iter().flat_map(|entry| &entry.written).flat_map(|backup| &backup.slices) {
            let page = self.layout.page_of(slice.addr);
            if own.status(page) != PageStatus::Accessible {
                continue;
            }
            let offset = self.layout.page_offset(slice.addr);
            let committed = &shared.zeroed(page)[offset..offset + slice.bytes.len()];
            own.write(page, offset, committed);
            imported += 1;
        }
        segment.set_revision(head);
        drop(own);
        drop(shared);

        trace!(
            "TX({}): IMPORTED ({}) SLICES FROM REVISION ({}) TO ({})",
            seg,
            imported,
            revision,
            head
        );

        for obj in created {
            self.free_old(obj);
        }
        match conflict {
            Some(reason) => {
                debug!("TX({}): CONFLICT ({:?})", seg, reason);
                Err(reason.into())
            }
            None => Ok(()),
        }
    }

    /// Restores every backup of `seg` into its private pages and empties the modified
    /// list. Returns the objects the transaction created, which the caller must free.
    fn rollback_locked(&self, seg: usize, own: &mut PageTable) -> Vec<ObjRef> {
        let mut modified = self.segments[seg].modified.write();
        let mut created = Vec::new();

        for entry in modified.drain() {
            for slice in &entry.backup.slices {
                let page = self.layout.page_of(slice.addr);
                let offset = self.layout.page_offset(slice.addr);
                own.write(page, offset, &slice.bytes);
            }
            if entry.kind == ModKind::New {
                created.push(entry.backup.obj);
            }
        }
        created
    }

    /// Commits the transaction in `seg` and releases the segment. On error the
    /// transaction is still running and must be aborted by the caller.
    pub(crate) fn commit(&self, seg: usize) -> Result<u64> {
        self.check_signals(seg)?;
        self.minor_collection(seg)?;

        let mut sync = self.sched.lock();
        sync.waiting_committers += 1;
        while sync.paused_by_other(seg) || sync.inevitable_other(seg) {
            let cond = match sync.paused_by_other(seg) {
                true => Cond::RequestRemoved,
                false => Cond::InevitableDone,
            };
            self.wait_at_safe_point(&mut sync, seg, cond);
        }
        sync.waiting_committers -= 1;

        let inevitable = self.segments[seg].local.lock().state == TxState::Inevitable;
        let result = match inevitable {
            false if self.segments[seg].lower(SIGNAL_ABORT) => Err(AbortReason::Requested.into()),
            _ => self.validate(seg, !inevitable).and_then(|_| self.publish(seg, inevitable)),
        };
        if result.is_ok() && inevitable {
            sync.inevitable = None;
        }
        drop(sync);
        self.sched.broadcast(Cond::InevitableDone);

        let revision = result?;
        {
            let mut local = self.segments[seg].local.lock();
            local.state = TxState::None;
            local.owner_roots = None;
            local.inevitable_reason = None;
        }
        debug!("TX({}): COMMITTED REVISION ({})", seg, revision);
        self.emit(seg, Event::TransactionCommit { revision });

        if self.log.len() > self.config.log_trim_threshold {
            self.major_pending.store(true, Ordering::Release);
        }
        if self.major_pending() {
            if let Err(e) = self.major_collection(seg, false) {
                warn!("TX({}): MAJOR COLLECTION AFTER COMMIT FAILED: {}", seg, e);
            }
        }

        self.release_segment(seg);
        Ok(revision)
    }

    /// Publishes the modified objects of `seg` to the sharing segment and appends a
    /// commit log entry holding their previous content.
    fn publish(&self, seg: usize, inevitable: bool) -> Result<u64> {
        let mut guards: Vec<MutexGuard<'_, PageTable>> = self.segments.iter().map(|s| s.pages.lock()).collect();
        let mut modified = self.segments[seg].modified.write();

        if modified.is_empty() {
            if inevitable {
                self.log.clear_inevitable();
            }
            return Ok(self.log.head());
        }
        if self.log.len() >= self.config.max_log_entries {
            return Err(StmError::Exhausted(Resource::CommitLog));
        }

        let (shared, others) = guards.split_at_mut(1);
        let shared = &mut shared[0];
        let own_index = seg - 1;

        let mut written = Vec::with_capacity(modified.len());
        for entry in modified.drain() {
            let Backup { obj, mut slices } = entry.backup;

            // the committed copy needs the write barrier again
            let page = self.layout.page_of(obj.addr());
            let offset = self.layout.page_offset(obj.addr());
            let mut header = [0u8; HEADER_SIZE];
            if others[own_index].read(page, offset, &mut header) {
                let mut decoded = Header::decode(&header);
                decoded.flags |= FLAG_WRITE_BARRIER;
                others[own_index].write(page, offset, &decoded.encode());
            }

            for slice in slices.iter_mut() {
                let page = self.layout.page_of(slice.addr);
                let offset = self.layout.page_offset(slice.addr);
                let len = slice.bytes.len();
                let committed = shared.zeroed(page);

                if entry.kind == ModKind::New {
                    slice.bytes.copy_from_slice(&committed[offset..offset + len]);
                }
                if let Some(data) = others[own_index].data(page) {
                    committed[offset..offset + len].copy_from_slice(&data[offset..offset + len]);
                }

                // read only views of the old content are stale now
                for (index, pages) in others.iter_mut().enumerate() {
                    if index != own_index && pages.status(page) == PageStatus::ReadOnly {
                        pages.mark_inaccessible(page);
                    }
                }
            }
            written.push(Backup { obj, slices });
        }

        let entry = self
            .log
            .append(seg, written, inevitable, self.config.max_log_entries)?;
        self.segments[seg].set_revision(entry.revision());
        Ok(entry.revision())
    }

    /// Rolls back the transaction in `seg`, discards its nursery and releases the
    /// segment.
    pub(crate) fn abort(&self, seg: usize, cause: StmError) {
        let segment = &self.segments[seg];
        if segment.local.lock().state == TxState::None {
            self.release_segment(seg);
            return;
        }

        let created = {
            let mut own = segment.pages.lock();
            self.rollback_locked(seg, &mut own)
        };
        for obj in created {
            self.free_old(obj);
        }
        self.reset_nursery(seg);

        let was_inevitable = {
            let mut local = segment.local.lock();
            let was_inevitable = local.state == TxState::Inevitable;
            local.state = TxState::None;
            local.owner_roots = None;
            local.inevitable_reason = None;
            was_inevitable
        };
        if was_inevitable {
            let mut sync = self.sched.lock();
            self.log.clear_inevitable();
            sync.inevitable = None;
            drop(sync);
            self.sched.broadcast(Cond::InevitableDone);
        }

        debug!("TX({}): ABORTED ({})", seg, cause);
        self.emit(seg, Event::TransactionAbort { cause });
        self.release_segment(seg);
    }

    /// Makes the transaction in `seg` inevitable: it is guaranteed to commit, and no
    /// other transaction commits before it does.
    pub(crate) fn become_inevitable(&self, seg: usize, reason: &str) -> Result<()> {
        if self.segments[seg].local.lock().state == TxState::Inevitable {
            return Ok(());
        }
        self.check_signals(seg)?;

        let mut sync = self.sched.lock();
        loop {
            let cond = if sync.paused_by_other(seg) {
                Cond::RequestRemoved
            } else if sync.inevitable_other(seg) || sync.waiting_committers > 0 {
                Cond::InevitableDone
            } else {
                break;
            };
            self.wait_at_safe_point(&mut sync, seg, cond);
        }

        self.validate(seg, true)?;
        self.log.mark_inevitable()?;
        sync.inevitable = Some(seg);
        drop(sync);

        {
            let mut local = self.segments[seg].local.lock();
            local.state = TxState::Inevitable;
            local.inevitable_reason = Some(reason.to_string());
        }
        info!("TX({}): INEVITABLE ({})", seg, reason);
        self.emit(seg, Event::BecameInevitable);
        Ok(())
    }
}

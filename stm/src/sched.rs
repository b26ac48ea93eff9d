// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Segment Scheduling and Safe Points
//!
//! A bounded pool of segments is shared among any number of threads. All global
//! coordination goes through one mutex guarding [`SyncState`], together with a
//! condition variable per [`Cond`]:
//!
//! - a thread without a free segment waits for [`Cond::SegmentFree`]
//! - a thread requesting a global pause raises [`SIGNAL_PAUSE`] in every running
//!   segment and waits for [`Cond::AtSafePoint`] until no other segment runs
//! - paused threads wait for [`Cond::RequestRemoved`]
//! - committers and threads wanting to become inevitable wait for
//!   [`Cond::InevitableDone`]
//!
//! Every wait of a thread holding a segment is a safe point.

use crate::{
    segment::{TxState, SIGNAL_ABORT, SIGNAL_PAUSE},
    AbortReason, Engine, Event, Result,
};
use log::*;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentRun {
    Free,
    Running,
    SafePoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cond {
    SegmentFree,
    AtSafePoint,
    RequestRemoved,
    InevitableDone,
}

pub(crate) struct SyncState {
    /// run state per segment, index 0 (the sharing segment) is unused
    pub runs: Vec<SegmentRun>,

    /// thread currently owning each segment
    pub owners: Vec<Option<usize>>,

    /// segment whose thread requested a global pause
    pub pause_requested: Option<usize>,

    /// segment running the inevitable transaction
    pub inevitable: Option<usize>,

    /// committers blocked by a pause or an inevitable transaction
    pub waiting_committers: usize,
}

impl SyncState {
    /// Returns `true`, if a pause requested by another segment is pending
    pub fn paused_by_other(&self, seg: usize) -> bool {
        matches!(self.pause_requested, Some(requester) if requester != seg)
    }

    pub fn inevitable_other(&self, seg: usize) -> bool {
        matches!(self.inevitable, Some(owner) if owner != seg)
    }

    pub fn running_other(&self, seg: usize) -> bool {
        self.runs
            .iter()
            .enumerate()
            .skip(1)
            .any(|(num, run)| num != seg && *run == SegmentRun::Running)
    }
}

pub(crate) struct Scheduler {
    sync: Mutex<SyncState>,
    conds: [Condvar; 4],
}

impl Scheduler {
    pub fn new(num_segments: usize) -> Self {
        Self {
            sync: Mutex::new(SyncState {
                runs: vec![SegmentRun::Free; num_segments + 1],
                owners: vec![None; num_segments + 1],
                pause_requested: None,
                inevitable: None,
                waiting_committers: 0,
            }),
            conds: [Condvar::new(), Condvar::new(), Condvar::new(), Condvar::new()],
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.sync.lock()
    }

    pub fn wait(&self, guard: &mut MutexGuard<'_, SyncState>, cond: Cond) {
        self.conds[cond as usize].wait(guard);
    }

    pub fn broadcast(&self, cond: Cond) {
        self.conds[cond as usize].notify_all();
    }
}

impl Engine {
    /// Marks `seg` as being at a safe point while waiting for `cond`
    pub(crate) fn wait_at_safe_point(&self, guard: &mut MutexGuard<'_, SyncState>, seg: usize, cond: Cond) {
        guard.runs[seg] = SegmentRun::SafePoint;
        self.sched.broadcast(Cond::AtSafePoint);
        self.sched.wait(guard, cond);
        guard.runs[seg] = SegmentRun::Running;
    }

    /// Blocks until a segment is free and hands it to `thread`. The segment the
    /// thread used last is preferred, as its pages are most likely still private.
    pub(crate) fn acquire_segment(&self, thread: usize, prefer: Option<usize>) -> usize {
        let started = Instant::now();
        let mut waited = false;
        let mut sync = self.sched.lock();

        let num = loop {
            if sync.pause_requested.is_some() {
                waited = true;
                self.sched.wait(&mut sync, Cond::RequestRemoved);
                continue;
            }

            let free = prefer
                .filter(|&num| sync.runs[num] == SegmentRun::Free)
                .or_else(|| (1..sync.runs.len()).find(|&num| sync.runs[num] == SegmentRun::Free));
            match free {
                Some(num) => break num,
                None => {
                    waited = true;
                    self.sched.wait(&mut sync, Cond::SegmentFree);
                }
            }
        };

        sync.runs[num] = SegmentRun::Running;
        sync.owners[num] = Some(thread);
        drop(sync);

        debug!("THREAD ({}): ACQUIRED SEGMENT ({})", thread, num);
        if waited {
            self.emit(
                num,
                Event::WaitedForSegment {
                    elapsed: started.elapsed(),
                },
            );
        }
        num
    }

    pub(crate) fn release_segment(&self, seg: usize) {
        let mut sync = self.sched.lock();
        sync.runs[seg] = SegmentRun::Free;
        sync.owners[seg] = None;
        self.segments[seg].lower(SIGNAL_PAUSE | SIGNAL_ABORT);
        drop(sync);

        self.sched.broadcast(Cond::SegmentFree);
        self.sched.broadcast(Cond::AtSafePoint);
        debug!("SEGMENT ({}): RELEASED", seg);
    }

    /// Stops every other segment at a safe point. Returns once no other segment runs.
    pub(crate) fn request_pause(&self, seg: usize) {
        let mut sync = self.sched.lock();
        while sync.pause_requested.is_some() {
            self.wait_at_safe_point(&mut sync, seg, Cond::RequestRemoved);
        }

        sync.pause_requested = Some(seg);
        for num in 1..sync.runs.len() {
            if num != seg && sync.runs[num] == SegmentRun::Running {
                self.segments[num].raise(SIGNAL_PAUSE);
            }
        }

        while sync.running_other(seg) {
            self.sched.wait(&mut sync, Cond::AtSafePoint);
        }
        debug!("SEGMENT ({}): WORLD STOPPED", seg);
    }

    pub(crate) fn release_pause(&self, seg: usize) {
        let mut sync = self.sched.lock();
        debug_assert_eq!(sync.pause_requested, Some(seg));
        sync.pause_requested = None;
        for segment in self.segments.iter().skip(1) {
            segment.lower(SIGNAL_PAUSE);
        }
        drop(sync);

        self.sched.broadcast(Cond::RequestRemoved);
        self.sched.broadcast(Cond::SegmentFree);
        debug!("SEGMENT ({}): WORLD RESUMED", seg);
    }

    /// Reacts to signals raised for `seg`: waits out a pending pause, and turns an
    /// abort request into [`AbortReason::Requested`] unless the transaction is
    /// inevitable.
    pub(crate) fn check_signals(&self, seg: usize) -> Result<()> {
        let segment = &self.segments[seg];
        let signal = segment.signal();

        if signal & SIGNAL_PAUSE != 0 {
            let mut sync = self.sched.lock();
            while sync.paused_by_other(seg) {
                self.wait_at_safe_point(&mut sync, seg, Cond::RequestRemoved);
            }
            segment.lower(SIGNAL_PAUSE);
        }

        if signal & SIGNAL_ABORT != 0 && segment.lower(SIGNAL_ABORT) {
            if segment.local.lock().state == TxState::Inevitable {
                info!("SEGMENT ({}): ABORT REQUEST IGNORED, TRANSACTION IS INEVITABLE", seg);
                return Ok(());
            }
            return Err(AbortReason::Requested.into());
        }
        Ok(())
    }

    /// Asks the transaction running in segment `num` to abort at its next safe point.
    /// Inevitable transactions ignore the request.
    pub fn abort_segment(&self, num: usize) {
        if num >= 1 && num < self.segments.len() {
            info!("SEGMENT ({}): ABORT REQUESTED", num);
            self.segments[num].raise(SIGNAL_ABORT);
        }
    }
}

// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The engine context. There is no process global state: every segment, the
//! commit log, the old space and the scheduler belong to one [`Engine`], so that
//! several isolated engines can live in one process.

use crate::{
    commit_log::{CommitEntry, CommitLog},
    hooks::Counters,
    oldspace::OldSpace,
    pages::HeapLayout,
    sched::Scheduler,
    segment::{Segment, TxState},
    spinlock::SpinLock,
    thread::{RootStack, ThreadLocal},
    Config, Event, Hooks, ObjRef, ObjectModel, Resource, Result, SlotModel, Stats, StmError,
};
use log::*;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

pub struct Engine {
    pub(crate) config: Config,
    pub(crate) layout: HeapLayout,
    pub(crate) model: Box<dyn ObjectModel>,
    hooks: Option<Box<dyn Hooks>>,

    /// the sharing segment first, then one segment per parallel transaction
    pub(crate) segments: Vec<Segment>,
    pub(crate) log: CommitLog,
    pub(crate) sched: Scheduler,
    pub(crate) old: SpinLock<OldSpace>,

    /// root stacks of all registered threads
    pub(crate) threads: Mutex<FxHashMap<usize, Arc<Mutex<RootStack>>>>,
    pub(crate) permanent: Mutex<Vec<ObjRef>>,
    pub(crate) major_pending: AtomicBool,

    counters: Counters,
    next_thread: AtomicUsize,
}

impl Engine {
    /// Creates an engine with the default [`SlotModel`] and no hooks
    pub fn setup(config: Config) -> Result<Arc<Self>> {
        Self::setup_with(config, SlotModel, None)
    }

    pub fn setup_with<M>(config: Config, model: M, hooks: Option<Box<dyn Hooks>>) -> Result<Arc<Self>>
    where
        M: ObjectModel + 'static,
    {
        config.validate()?;

        let layout = HeapLayout::new(
            config.page_size,
            config.heap_pages,
            config.nursery_pages,
            config.num_segments,
        );
        let segments = (0..=config.num_segments).map(|num| Segment::new(num, &layout)).collect();
        let old = OldSpace::new(layout.old_range(), config.page_size);

        info!(
            "ENGINE: SETUP {} SEGMENTS, {} PAGES OF {} BYTES, {} OLD PAGES",
            config.num_segments,
            config.heap_pages,
            config.page_size,
            config.old_pages()
        );

        Ok(Arc::new(Self {
            sched: Scheduler::new(config.num_segments),
            config,
            layout,
            model: Box::new(model),
            hooks,
            segments,
            log: CommitLog::new(),
            old: SpinLock::new(old),
            threads: Mutex::new(FxHashMap::default()),
            permanent: Mutex::new(Vec::new()),
            major_pending: AtomicBool::new(false),
            counters: Counters::default(),
            next_thread: AtomicUsize::new(1),
        }))
    }

    /// Shuts the engine down and wipes every page. Fails, if a [`ThreadLocal`] still
    /// holds a reference to the engine.
    pub fn teardown(engine: Arc<Self>) -> Result<()> {
        match Arc::try_unwrap(engine) {
            Ok(engine) => {
                info!(
                    "ENGINE: TEARDOWN AT REVISION ({}), {:?}",
                    engine.log.head(),
                    engine.counters.snapshot()
                );
                Ok(())
            }
            Err(_) => Err(StmError::Protocol("engine is still used by registered threads")),
        }
    }

    pub fn register_thread_local(self: &Arc<Self>) -> ThreadLocal {
        let id = self.next_thread.fetch_add(1, Ordering::Relaxed);
        let roots = Arc::new(Mutex::new(RootStack::new(self.config.root_stack_depth)));
        self.threads.lock().insert(id, roots.clone());

        debug!("THREAD ({}): REGISTERED", id);
        ThreadLocal::new(self.clone(), id, roots)
    }

    pub(crate) fn unregister_thread(&self, id: usize) {
        self.threads.lock().remove(&id);
        debug!("THREAD ({}): UNREGISTERED", id);
    }

    /// Keeps a committed object alive for the lifetime of the engine
    pub fn add_permanent_root(&self, obj: ObjRef) -> Result<()> {
        if !self.layout.is_old(obj.addr()) {
            return Err(StmError::Protocol("permanent roots must be committed old objects"));
        }
        self.permanent.lock().push(obj);
        Ok(())
    }

    /// Revision of the latest commit
    pub fn revision(&self) -> u64 {
        self.log.head()
    }

    /// The revision segment `num` currently reflects
    pub fn segment_revision(&self, num: usize) -> u64 {
        self.segments[num].revision()
    }

    pub fn num_segments(&self) -> usize {
        self.config.num_segments
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    /// Number of retained commit log entries
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Retained commit log entries newer than `revision`, oldest first
    pub fn commits_since(&self, revision: u64) -> Vec<Arc<CommitEntry>> {
        self.log.between(revision, self.log.head())
    }

    pub fn transaction_state(&self, num: usize) -> TxState {
        self.segments[num].local.lock().state
    }

    /// Number of live old space objects, shadows included
    pub fn old_objects(&self) -> usize {
        self.old.lock().count()
    }

    pub(crate) fn emit(&self, seg: usize, event: Event) {
        self.counters.count(&event);
        if let Some(hooks) = &self.hooks {
            hooks.on_event(seg, &event);
        }
    }

    /// Reserves old space for an object of `size` bytes
    pub(crate) fn alloc_old(&self, size: usize) -> Result<ObjRef> {
        let mut old = self.old.lock();
        let addr = old.alloc(size).ok_or(StmError::Exhausted(Resource::Heap))?;
        if old.since_major() > self.config.major_threshold_bytes {
            self.major_pending.store(true, Ordering::Release);
        }
        Ok(ObjRef::from_addr(addr))
    }

    pub(crate) fn free_old(&self, obj: ObjRef) {
        if self.old.lock().free(obj.addr()).is_none() {
            warn!("ENGINE: FREEING UNKNOWN OBJECT {:?}", obj);
        }
    }

    /// Takes a dead committed object out of use. Its address stays reserved until
    /// no segment can replay a commit log entry up to `revision`.
    pub(crate) fn retire_old(&self, obj: ObjRef, revision: u64) {
        if !self.old.lock().retire(obj.addr(), revision) {
            warn!("ENGINE: RETIRING UNKNOWN OBJECT {:?}", obj);
        }
    }

    pub(crate) fn major_pending(&self) -> bool {
        self.major_pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::builtin()
            .with_segments(2)
            .with_heap_pages(64)
            .with_nursery_pages(8)
    }

    #[test]
    fn test_setup_teardown() {
        let engine = Engine::setup(config()).expect("setup failed");
        assert_eq!(engine.revision(), 0);
        assert_eq!(engine.num_segments(), 2);

        let thread = engine.register_thread_local();
        let cloned = engine.clone();
        assert!(Engine::teardown(cloned).is_err());

        drop(thread);
        assert!(engine.threads.lock().is_empty());
        assert!(Engine::teardown(engine).is_ok());
    }

    #[test]
    fn test_setup_rejects_invalid_config() {
        assert!(matches!(
            Engine::setup(config().with_segments(0)),
            Err(StmError::Config(_))
        ));
    }

    #[test]
    fn test_alloc_old_pressure() {
        let engine = Engine::setup(config().with_major_threshold(64)).expect("setup failed");
        let a = engine.alloc_old(48).expect("old space exhausted");
        assert!(engine.layout.is_old(a.addr()));
        assert!(!engine.major_pending());

        engine.alloc_old(48).expect("old space exhausted");
        assert!(engine.major_pending());

        engine.free_old(a);
        assert_eq!(engine.old_objects(), 1);
    }

    #[test]
    fn test_permanent_root_must_be_old() {
        let engine = Engine::setup(config()).expect("setup failed");
        let young = ObjRef::from_addr(engine.layout.nursery_range(1).start);
        assert!(engine.add_permanent_root(young).is_err());
    }
}

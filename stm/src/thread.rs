// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The mutator's handle on an engine.
//!
//! A [`ThreadLocal`] owns the thread's root stack and, while a transaction runs,
//! one segment. Every operation that returns [`StmError::Aborted`] or
//! [`StmError::Exhausted`] has already rolled the transaction back and released the
//! segment; [`ThreadLocal::atomically`] retries aborted transactions.
//!
//! Objects move when the nursery is collected. Any operation that allocates,
//! collects, commits or passes a safe point may do so, so references that must
//! survive such a call belong on the root stack.

use crate::{
    object::{Header, ObjRef, WORD},
    AbortReason, Engine, Resource, Result, StmError,
};
use log::*;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectLevel {
    /// collects the nursery of the calling thread's segment
    Minor,

    /// stops every thread and collects the whole heap
    Major,
}

/// Stack of live references maintained by the mutator. The collectors update the
/// slots when objects move.
pub struct RootStack {
    slots: Vec<ObjRef>,
    limit: usize,

    /// slots at the start of the running transaction
    saved: Vec<ObjRef>,
}

impl RootStack {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            limit,
            saved: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, obj: ObjRef) -> Result<()> {
        if self.slots.len() >= self.limit {
            return Err(StmError::Exhausted(Resource::RootStack));
        }
        self.slots.push(obj);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<ObjRef> {
        self.slots.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn save(&mut self) {
        self.saved.clear();
        self.saved.extend_from_slice(&self.slots);
    }

    /// Rewinds the stack to the slots of the last [`RootStack::save`]
    pub(crate) fn restore(&mut self) {
        self.slots.clear();
        self.slots.extend_from_slice(&self.saved);
        self.saved.clear();
    }

    pub(crate) fn discard_saved(&mut self) {
        self.saved.clear();
    }

    /// Slots a rollback may bring back, which stay alive until then
    pub(crate) fn saved(&self) -> &[ObjRef] {
        &self.saved
    }

    pub(crate) fn slots(&self) -> &[ObjRef] {
        &self.slots
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [ObjRef] {
        &mut self.slots
    }
}

pub struct ThreadLocal {
    engine: Arc<Engine>,
    id: usize,
    roots: Arc<Mutex<RootStack>>,
    segment: Option<usize>,
    last_segment: Option<usize>,
}

impl ThreadLocal {
    pub(crate) fn new(engine: Arc<Engine>, id: usize, roots: Arc<Mutex<RootStack>>) -> Self {
        Self {
            engine,
            id,
            roots,
            segment: None,
            last_segment: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The segment of the running transaction
    pub fn segment(&self) -> Option<usize> {
        self.segment
    }

    pub fn in_transaction(&self) -> bool {
        self.segment.is_some()
    }

    fn seg(&self) -> usize {
        match self.segment {
            Some(seg) => seg,
            None => panic!("thread {} accessed the heap outside of a transaction", self.id),
        }
    }

    /// Aborts the running transaction, if `result` ended it
    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.ends_transaction() {
                self.abort_with(e.clone());
            }
        }
        result
    }

    fn abort_with(&mut self, cause: StmError) {
        if let Some(seg) = self.segment.take() {
            self.engine.abort(seg, cause);
            self.roots.lock().restore();
            self.last_segment = Some(seg);
        }
    }

    /// Aborts a running transaction and removes the thread's roots from the engine
    pub fn unregister(self) {
        drop(self)
    }

    pub fn push_root(&mut self, obj: ObjRef) -> Result<()> {
        let result = self.roots.lock().push(obj);
        self.finish(result)
    }

    pub fn pop_root(&mut self) -> Option<ObjRef> {
        self.roots.lock().pop()
    }

    pub fn peek_root(&self) -> Option<ObjRef> {
        self.roots.lock().slots().last().copied()
    }

    /// Returns the root at `index`, counted from the bottom of the stack
    pub fn root(&self, index: usize) -> Option<ObjRef> {
        self.roots.lock().slots().get(index).copied()
    }

    pub fn roots_len(&self) -> usize {
        self.roots.lock().len()
    }

    pub fn start_transaction(&mut self) -> Result<()> {
        if self.segment.is_some() {
            return Err(StmError::Protocol("transaction already running"));
        }

        let seg = self.engine.acquire_segment(self.id, self.last_segment);
        self.segment = Some(seg);
        self.roots.lock().save();
        let result = self.engine.begin(seg, self.roots.clone()).map(|_| ());
        if result.is_err() {
            self.segment = None;
            self.engine.release_segment(seg);
        }
        result
    }

    /// Commits the running transaction. Returns the revision it committed at, which
    /// is the current head for a transaction that wrote nothing.
    pub fn commit_transaction(&mut self) -> Result<u64> {
        let seg = match self.segment {
            Some(seg) => seg,
            None => return Err(StmError::Protocol("no transaction running")),
        };

        let result = self.engine.commit(seg);
        if result.is_ok() {
            self.roots.lock().discard_saved();
            self.segment = None;
            self.last_segment = Some(seg);
        }
        self.finish(result)
    }

    /// Rolls the running transaction back
    pub fn abort_transaction(&mut self) -> Result<()> {
        if self.segment.is_none() {
            return Err(StmError::Protocol("no transaction running"));
        }
        self.abort_with(StmError::Aborted(AbortReason::Explicit));
        Ok(())
    }

    pub fn become_inevitable(&mut self, reason: &str) -> Result<()> {
        let result = self.engine.become_inevitable(self.seg(), reason);
        self.finish(result)
    }

    /// Commits the running transaction and starts the next one right away
    pub fn force_transaction_break(&mut self) -> Result<()> {
        self.commit_transaction()?;
        self.start_transaction()
    }

    /// Runs `program` in a transaction until it commits. Aborted runs are retried;
    /// every other error is returned after rolling the transaction back.
    pub fn atomically<T, F>(&mut self, mut program: F) -> Result<T>
    where
        F: FnMut(&mut ThreadLocal) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.start_transaction()?;

            let error = match program(self) {
                Ok(value) => match self.commit_transaction() {
                    Ok(_) => return Ok(value),
                    Err(e) => e,
                },
                Err(e) => {
                    self.abort_with(e.clone());
                    e
                }
            };

            if !error.is_retryable() {
                return Err(error);
            }
            debug!("THREAD ({}): RETRY ({}) AFTER {}", self.id, attempt, error);
        }
    }

    pub fn allocate(&mut self, size: usize) -> Result<ObjRef> {
        self.allocate_tagged(size, 0)
    }

    /// Allocates an object of `size` bytes, header included. For the default object
    /// model `tag` is the number of leading reference slots.
    pub fn allocate_tagged(&mut self, size: usize, tag: u16) -> Result<ObjRef> {
        let result = self.engine.allocate(self.seg(), size, tag);
        self.finish(result)
    }

    pub fn read_barrier(&self, obj: ObjRef) {
        self.engine.read_barrier(self.seg(), obj);
    }

    pub fn was_read(&self, obj: ObjRef) -> bool {
        self.engine.was_read(self.seg(), obj)
    }

    pub fn write_barrier(&self, obj: ObjRef) {
        self.engine.write_barrier(self.seg(), obj);
    }

    /// Reads the word at payload `offset`. Applies the read barrier.
    pub fn load_word(&self, obj: ObjRef, offset: usize) -> u64 {
        let seg = self.seg();
        self.engine.read_barrier(seg, obj);
        self.engine.read_word(seg, obj.field_addr(offset))
    }

    /// Writes the word at payload `offset`. Applies the write barrier.
    pub fn store_word(&self, obj: ObjRef, offset: usize, value: u64) {
        let seg = self.seg();
        self.engine.write_barrier(seg, obj);
        self.engine.write_word(seg, obj.field_addr(offset), value);
    }

    pub fn load_ref(&self, obj: ObjRef, slot: usize) -> ObjRef {
        ObjRef::from_addr(self.load_word(obj, slot * WORD))
    }

    pub fn store_ref(&self, obj: ObjRef, slot: usize, value: ObjRef) {
        self.store_word(obj, slot * WORD, value.addr());
    }

    pub fn load_bytes(&self, obj: ObjRef, offset: usize, out: &mut [u8]) {
        let seg = self.seg();
        self.engine.read_barrier(seg, obj);
        self.engine.read_bytes(seg, obj.field_addr(offset), out);
    }

    pub fn store_bytes(&self, obj: ObjRef, offset: usize, bytes: &[u8]) {
        let seg = self.seg();
        self.engine.write_barrier(seg, obj);
        self.engine.write_bytes(seg, obj.field_addr(offset), bytes);
    }

    pub fn header(&self, obj: ObjRef) -> Header {
        self.engine.read_header(self.seg(), obj)
    }

    /// Returns an identifier of `obj` that survives promotion out of the nursery
    pub fn id_of(&mut self, obj: ObjRef) -> Result<u64> {
        let result = self.engine.id_of(self.seg(), obj);
        self.finish(result)
    }

    /// Waits out pending pauses and honours abort requests. Outside of a
    /// transaction this is a no-op.
    pub fn safe_point(&mut self) -> Result<()> {
        let seg = match self.segment {
            Some(seg) => seg,
            None => return Ok(()),
        };

        let mut result = self.engine.check_signals(seg);
        if result.is_ok() && self.engine.major_pending() {
            result = self.engine.major_collection(seg, false);
        }
        self.finish(result)
    }

    /// Runs a collection. Outside of a transaction a short one is started for it.
    pub fn collect(&mut self, level: CollectLevel) -> Result<()> {
        if self.segment.is_none() {
            return self.atomically(|tl| tl.collect(level));
        }

        let seg = self.seg();
        let result = match level {
            CollectLevel::Minor => self.engine.minor_collection(seg),
            CollectLevel::Major => self.engine.major_collection(seg, true),
        };
        self.finish(result)
    }
}

impl Drop for ThreadLocal {
    fn drop(&mut self) {
        self.abort_with(StmError::Aborted(AbortReason::Explicit));
        self.engine.unregister_thread(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_stack_limit() {
        let mut stack = RootStack::new(2);
        assert!(stack.push(ObjRef::NULL).is_ok());
        assert!(stack.push(ObjRef::NULL).is_ok());
        assert_eq!(
            stack.push(ObjRef::NULL),
            Err(StmError::Exhausted(Resource::RootStack))
        );

        assert_eq!(stack.pop(), Some(ObjRef::NULL));
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.pop(), Some(ObjRef::NULL));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_root_stack_restore() {
        let a = ObjRef::from_addr(0x1000);
        let b = ObjRef::from_addr(0x2000);
        let c = ObjRef::from_addr(0x3000);

        let mut stack = RootStack::new(8);
        stack.push(a).expect("push failed");
        stack.push(b).expect("push failed");
        stack.save();

        assert_eq!(stack.pop(), Some(b));
        assert_eq!(stack.pop(), Some(a));
        stack.push(c).expect("push failed");
        assert_eq!(stack.saved(), &[a, b]);

        stack.restore();
        assert_eq!(stack.slots(), &[a, b]);
        assert!(stack.saved().is_empty());

        stack.save();
        stack.push(c).expect("push failed");
        stack.discard_saved();
        assert!(stack.saved().is_empty());
        assert_eq!(stack.slots(), &[a, b, c]);
    }
}

// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Paged Software Transactional Memory
//!
//! A transactional memory engine over a garbage collected heap. Threads run
//! isolated transactions which are validated against a global commit log and
//! retried on conflict.
//!
//! The heap is seen through a fixed number of segments. Every segment holds a full
//! view of the heap, made of pages that are either inaccessible, a read only view of
//! the latest committed content, or a private copy. Pages are privatized lazily on
//! first access; a private copy always reflects the committed state at the
//! segment's revision plus the writes of the transaction running in it.
//!
//! Young objects are bump allocated in a per segment nursery and promoted to old
//! space by a copying minor collection. Old space is collected by a stop-the-world
//! mark and sweep once allocation pressure builds up.
//!
//! ```
//! use paged_stm::{Config, Engine};
//!
//! let engine = Engine::setup(Config::builtin()).unwrap();
//! let mut thread = engine.register_thread_local();
//!
//! let counter = thread
//!     .atomically(|tl| {
//!         let obj = tl.allocate(16)?;
//!         tl.store_word(obj, 0, 41);
//!         tl.push_root(obj)
//!     })
//!     .and_then(|_| thread.atomically(|tl| {
//!         let obj = tl.peek_root().unwrap();
//!         let value = tl.load_word(obj, 0) + 1;
//!         tl.store_word(obj, 0, value);
//!         Ok(value)
//!     }))
//!     .unwrap();
//! assert_eq!(counter, 42);
//!
//! drop(thread);
//! Engine::teardown(engine).unwrap();
//! ```

mod barrier;
mod commit_log;
mod engine;
mod major;
mod nursery;
mod oldspace;
mod pages;
mod sched;
mod segment;
mod spinlock;
mod transaction;

pub mod config;
pub mod errors;
pub mod hooks;
pub mod object;
pub mod thread;

pub use commit_log::CommitEntry;
pub use config::Config;
pub use engine::Engine;
pub use errors::{AbortReason, Resource, Result, StmError};
pub use hooks::{Event, Hooks, Stats};
pub use object::{Header, ObjRef, ObjectModel, ObjectView, SlotModel, HEADER_SIZE, MIN_OBJECT_SIZE, WORD};
pub use pages::{HeapLayout, PageStatus, Region};
pub use segment::{TxState, SHARING};
pub use spinlock::SpinLock;
pub use thread::{CollectLevel, ThreadLocal};

//! kvlease Store - compare-and-swap engine over a pluggable key-value backend
//!
//! - `backend`: the capability contract a concrete store has to satisfy
//! - `memory`: in-process backend used by tests and the CLI
//! - `cas`: `CasStore`, revision bookkeeping and logical expiration
//! - `tree`: bounded-retry deletion of every key under a prefix
//! - `watch`: polling watch with an optional change feed

pub mod backend;
pub mod cas;
pub mod memory;
pub mod tree;
pub mod watch;

pub use backend::{Backend, Conditional};
pub use cas::CasStore;
pub use memory::MemoryBackend;
pub use tree::{DELETE_TREE_RETRIES, DeleteTreeOptions};
pub use watch::{ChangeEvent, ChangeFeed, ChangeKind, WatchOptions};

pub use kvlease_common::{
    Clock, Expectation, KvError, KvItem, ManualClock, ReadOptions, Result, StoreConfig,
    SystemClock, TokioClock, WriteOptions,
};

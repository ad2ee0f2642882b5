//! Symdex Client - host side of the symdex worker
//!
//! Owns the worker process through [`WorkerProxy`] and builds the bulk
//! operations (sweeps, rebuilds, single-file updates, completion) on top of
//! its typed calls.

pub mod completion;
pub mod indexing;
pub mod proxy;

pub use completion::module_completions;
pub use indexing::{
    discover_files, index_database, index_file, remove_store, Discovery, IndexSummary,
};
pub use proxy::{WorkerCommand, WorkerProxy, STDERR_TAIL_LINES};

//! Symdex Core - incremental symbol index for Python source trees
//!
//! This library holds everything that runs inside the worker process: the
//! layered SQLite store, the syntax-tree symbol extractor, the indexer that
//! keeps the two in step, and the line-delimited call protocol the host
//! uses to drive it.

pub mod config;
pub mod error;
pub mod extract;
pub mod indexer;
pub mod paths;
pub mod protocol;
pub mod server;
pub mod store;

pub use config::Config;
pub use error::{ErrorEnvelope, SymdexError};
pub use extract::{extract_symbols, Symbol};
pub use indexer::Indexer;
pub use protocol::{Operation, Request, Response, PROTOCOL_VERSION};
pub use server::{Server, ServerState};
pub use store::{FileRecord, Occurrence, SymbolStore};

/// Result type alias for symdex operations
pub type Result<T> = std::result::Result<T, SymdexError>;

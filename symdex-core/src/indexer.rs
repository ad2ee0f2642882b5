//! Incremental indexer: the worker-side implementation of every operation

use crate::error::SymdexError;
use crate::extract::extract_symbols;
use crate::paths::normalize_path;
use crate::store::{Occurrence, SymbolStore};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Owns the attached store and drives per-file updates.
///
/// Holds no state between calls apart from the store itself and its open
/// sweep, so any sequence of operations is valid once `set_databases` has
/// been called.
#[derive(Default)]
pub struct Indexer {
    store: Option<SymbolStore>,
}

impl Indexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the attached stores. The previous store is closed first;
    /// anything it had not committed is discarded.
    pub fn set_databases(&mut self, paths: &[PathBuf]) -> crate::Result<()> {
        if let Some(previous) = self.store.take() {
            if previous.sweep_active() {
                warn!("dropping store with an unfinished sweep");
            }
            drop(previous);
        }
        self.store = Some(SymbolStore::attach(paths)?);
        Ok(())
    }

    fn store(&self) -> crate::Result<&SymbolStore> {
        self.store.as_ref().ok_or(SymdexError::NotAttached)
    }

    fn store_mut(&mut self) -> crate::Result<&mut SymbolStore> {
        self.store.as_mut().ok_or(SymdexError::NotAttached)
    }

    pub fn begin_file_processing(&mut self, dbi: usize) -> crate::Result<()> {
        self.store_mut()?.begin_sweep(dbi)
    }

    /// Close the sweep on `dbi`; with `prune`, files not processed since
    /// `begin_file_processing` are removed. Returns the number removed.
    pub fn end_file_processing(&mut self, dbi: usize, prune: bool) -> crate::Result<usize> {
        self.store_mut()?.end_sweep(dbi, prune)
    }

    /// Bring `path` up to date in database `dbi`.
    ///
    /// Returns whether symbols were re-extracted. An unchanged file (stored
    /// timestamp not older than its mtime) is skipped unless `force`. When
    /// the file does not parse, its timestamp and symbols are left as they
    /// were, but it still counts as seen by an open sweep.
    pub fn process_file(&mut self, dbi: usize, path: &Path, force: bool) -> crate::Result<bool> {
        let path = normalize_path(path);
        let mtime = file_mtime(&path)?;
        // The sweep mark is in memory and survives the rollback of a failed update.
        self.store_mut()?.atomically(|store| {
            let changed = store.update_file_timestamp(dbi, &path, mtime)?;
            if !changed && !force {
                return Ok(false);
            }

            let source = std::fs::read(&path)?;
            let symbols = extract_symbols(&path, &source)?;
            store.clear_symbols(dbi, &path)?;
            store.add_symbols(dbi, &path, &symbols)?;
            debug!(path = %path.display(), symbols = symbols.len(), "extracted");
            Ok(true)
        })
    }

    pub fn query_occurrences(&self, symbol: &str) -> crate::Result<Vec<Occurrence>> {
        self.store()?.occurrences(symbol)
    }

    pub fn query_members(&self, package: &str, prefix: &str) -> crate::Result<Vec<String>> {
        self.store()?.members(package, prefix)
    }

    pub fn query_packages(&self, prefix: &str) -> crate::Result<Vec<String>> {
        self.store()?.packages(prefix)
    }

    pub fn commit(&mut self) -> crate::Result<()> {
        self.store_mut()?.commit()
    }
}

/// Modification time in fractional seconds since the epoch
pub fn file_mtime(path: &Path) -> crate::Result<f64> {
    let modified = std::fs::metadata(path)?.modified()?;
    let secs = match modified.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_secs_f64(),
        Err(before) => -before.duration().as_secs_f64(),
    };
    Ok(secs)
}

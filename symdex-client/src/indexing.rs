//! Bulk sweeps and single-file updates driven through a worker proxy

use crate::proxy::WorkerProxy;
use ignore::WalkBuilder;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use symdex_core::config::{Config, DatabaseConfig};
use symdex_core::paths::normalize_path;
use symdex_core::store::PRIMARY_DBI;
use symdex_core::{Result, SymdexError};
use tracing::{debug, info, warn};

/// Outcome of one sweep over a database
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexSummary {
    pub database: PathBuf,
    /// Files whose symbols were (re)extracted
    pub indexed: usize,
    pub unchanged: usize,
    /// Files skipped because they could not be read or parsed
    pub failed: usize,
    /// Stale file records pruned at the end of the sweep
    pub removed: usize,
    pub cancelled: bool,
    /// No roots configured; the store is only fed by single-file updates
    pub skipped: bool,
}

/// Source files found under a database's roots
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub files: Vec<PathBuf>,
    /// False when some entry under a root could not be walked. A sweep over
    /// an incomplete listing must not prune.
    pub complete: bool,
}

/// Source files under the database's roots that belong in it, sorted.
/// A root that is missing or unreadable is an error.
pub fn discover_files(config: &Config, database: &DatabaseConfig) -> Result<Discovery> {
    let include = database.pattern_matcher()?;

    // Build glob matcher for ignored names
    let mut ignore_builder = globset::GlobSetBuilder::new();
    for pattern in &config.ignore.patterns {
        let glob_pattern = if pattern.contains('*') || pattern.contains('?') {
            pattern.clone()
        } else {
            format!("**/{}", pattern)
        };
        for glob in [glob_pattern, format!("**/{}/**", pattern)] {
            ignore_builder
                .add(globset::Glob::new(&glob).map_err(|e| SymdexError::GlobPattern(e.to_string()))?);
        }
    }
    let ignore_set = ignore_builder
        .build()
        .map_err(|e| SymdexError::GlobPattern(e.to_string()))?;

    let mut files = Vec::new();
    let mut complete = true;
    for root in database.root_paths() {
        if let Err(e) = std::fs::read_dir(&root) {
            return Err(SymdexError::RootUnavailable {
                path: root,
                message: e.to_string(),
            });
        }

        let mut builder = WalkBuilder::new(&root);
        builder.hidden(false);
        builder.git_ignore(true);
        builder.git_global(false);
        builder.git_exclude(true);
        builder.follow_links(config.indexing.follow_links);

        for entry in builder.build() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("cannot walk under {}: {}", root.display(), e);
                    complete = false;
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_some_and(|t| t.is_file()) || !config.is_source_file(path) {
                continue;
            }

            let relative = path.strip_prefix(&root).unwrap_or(path);
            if ignore_set.is_match(relative) {
                continue;
            }

            let path = normalize_path(path);
            if include.as_ref().map_or(true, |m| m.is_match(&path)) {
                files.push(path);
            }
        }
    }

    files.sort();
    files.dedup();
    Ok(Discovery { files, complete })
}

/// Tear down anything holding the store open, then delete it
pub fn remove_store(proxy: &mut WorkerProxy, store: &Path) -> Result<()> {
    proxy.reset();
    for suffix in ["", "-journal"] {
        let mut file = store.as_os_str().to_owned();
        file.push(suffix);
        match std::fs::remove_file(&file) {
            Ok(()) => debug!(path = ?file, "removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Sweep `database`: process every discovered file, then prune records of
/// files that were not seen.
///
/// Unreadable or unparseable files are counted and skipped. `cancel` is
/// checked between files; a cancelled sweep still closes its bracket and
/// commits, without pruning. Nothing is pruned either when part of a root
/// could not be walked. A database without roots is left untouched. With
/// `rebuild`, the store file is deleted first and every file is
/// re-extracted.
pub fn index_database(
    proxy: &mut WorkerProxy,
    config: &Config,
    database: &DatabaseConfig,
    rebuild: bool,
    cancel: &AtomicBool,
) -> Result<IndexSummary> {
    let store = database.store_path();
    if database.roots.is_empty() {
        info!(store = %store.display(), "no roots configured, sweep skipped");
        return Ok(IndexSummary {
            database: store,
            skipped: true,
            ..Default::default()
        });
    }

    // A bad root fails here, before the store is touched
    let Discovery { files, complete } = discover_files(config, database)?;
    if !complete {
        warn!(store = %store.display(), "incomplete walk, stale records will be kept");
    }

    if rebuild {
        info!(store = %store.display(), "rebuilding");
        remove_store(proxy, &store)?;
    }
    if let Some(parent) = store.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    info!(store = %store.display(), files = files.len(), "sweep started");

    proxy.set_databases(std::slice::from_ref(&store))?;
    proxy.begin_file_processing(PRIMARY_DBI)?;

    let commit_every = config.indexing.commit_every.max(1);
    let mut summary = IndexSummary {
        database: store.clone(),
        ..Default::default()
    };

    for (i, file) in files.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            summary.cancelled = true;
            break;
        }
        match proxy.process_file(PRIMARY_DBI, file, rebuild) {
            Ok(true) => summary.indexed += 1,
            Ok(false) => summary.unchanged += 1,
            Err(err) if err.is_file_local() => {
                warn!("skipping {}: {}", file.display(), err);
                summary.failed += 1;
            }
            Err(err) => return Err(err),
        }
        if (i + 1) % commit_every == 0 {
            proxy.commit()?;
        }
    }

    let prune = complete && !summary.cancelled;
    summary.removed = proxy.end_file_processing(PRIMARY_DBI, prune)?;
    proxy.commit()?;

    info!(
        store = %store.display(),
        indexed = summary.indexed,
        unchanged = summary.unchanged,
        failed = summary.failed,
        removed = summary.removed,
        cancelled = summary.cancelled,
        "sweep finished"
    );
    Ok(summary)
}

/// Update one file in every configured database that covers it.
/// Returns the stores that were written.
pub fn index_file(proxy: &mut WorkerProxy, config: &Config, path: &Path) -> Result<Vec<PathBuf>> {
    let path = normalize_path(path);
    if !config.is_source_file(&path) {
        debug!(path = %path.display(), "not a source file");
        return Ok(Vec::new());
    }

    let mut updated = Vec::new();
    for database in config.ordered_databases() {
        if !database.covers(&path)? {
            continue;
        }
        let store = database.store_path();
        proxy.set_databases(std::slice::from_ref(&store))?;
        proxy.process_file(PRIMARY_DBI, &path, false)?;
        proxy.commit()?;
        updated.push(store);
    }
    Ok(updated)
}

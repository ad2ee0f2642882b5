//! Layered SQLite symbol store
//!
//! One writable primary store plus read-only companions attached to the same
//! connection. Reads go through a union of every attached schema, tagged with
//! the database index (`dbi`) each row came from. Writes only ever touch the
//! primary (`dbi` 0).

mod query;

pub use query::Occurrence;

use crate::error::SymdexError;
use crate::extract::Symbol;
use crate::paths::{package_for_path, path_key};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SCHEMA_VERSION: i32 = 1;

/// Index of the writable primary store
pub const PRIMARY_DBI: usize = 0;

/// Stored state of one indexed file
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub package: String,
    pub timestamp: f64,
}

/// Files seen since `begin_sweep`
struct Sweep {
    dbi: usize,
    seen: HashSet<i64>,
}

/// Symbol store attached over one primary and zero or more companions
pub struct SymbolStore {
    pub(crate) conn: Connection,
    /// Schema name per dbi: "main", "db1", "db2", ...
    schemas: Vec<String>,
    sweep: Option<Sweep>,
}

impl SymbolStore {
    /// Open `paths[0]` writable and attach the rest read-only.
    ///
    /// Every store gets the schema if it lacks it; a path that cannot be
    /// opened fails the whole attach with [`SymdexError::StoreOpen`].
    pub fn attach(paths: &[PathBuf]) -> crate::Result<Self> {
        let Some((primary, companions)) = paths.split_first() else {
            return Err(SymdexError::InvalidArguments {
                operation: "set_databases".to_string(),
                message: "at least one database path is required".to_string(),
            });
        };

        let conn = Connection::open_with_flags(
            primary,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| store_open(primary, e))?;
        conn.execute_batch(
            "
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;
            PRAGMA foreign_keys = ON;
            ",
        )
        .map_err(|e| store_open(primary, e))?;
        Self::init_schema(&conn, primary)?;

        let mut schemas = vec!["main".to_string()];
        for (i, companion) in companions.iter().enumerate() {
            // Create the schema through a short-lived writable handle, then
            // attach read-only so this session can never write to it.
            {
                let setup = Connection::open(companion).map_err(|e| store_open(companion, e))?;
                Self::init_schema(&setup, companion)?;
            }
            let schema = format!("db{}", i + 1);
            conn.execute(
                &format!("ATTACH DATABASE ?1 AS {}", schema),
                params![readonly_uri(companion)],
            )
            .map_err(|e| store_open(companion, e))?;
            schemas.push(schema);
        }

        debug!(primary = %primary.display(), companions = companions.len(), "attached symbol stores");

        Ok(Self {
            conn,
            schemas,
            sweep: None,
        })
    }

    /// Create tables and indexes if missing; reject stores from another schema version
    fn init_schema(conn: &Connection, path: &Path) -> crate::Result<()> {
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(|e| store_open(path, e))?;

        if version != 0 && version != SCHEMA_VERSION {
            return Err(SymdexError::SchemaVersionMismatch {
                path: path.to_path_buf(),
                found: version,
                expected: SCHEMA_VERSION,
            });
        }

        if version == 0 {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS files (
                    id INTEGER PRIMARY KEY,
                    path TEXT NOT NULL UNIQUE,
                    package TEXT NOT NULL,     -- dotted package, e.g. \"os.path\"
                    timestamp REAL NOT NULL    -- last seen modification time
                );
                CREATE INDEX IF NOT EXISTS files_package ON files(package);

                CREATE TABLE IF NOT EXISTS symbols (
                    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                    symbol TEXT NOT NULL,
                    scope TEXT NOT NULL,       -- enclosing definitions, e.g. \"Cls\"
                    row INTEGER NOT NULL,
                    col INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS symbols_symbol ON symbols(symbol);
                CREATE INDEX IF NOT EXISTS symbols_file ON symbols(file_id);

                PRAGMA user_version = 1;
                ",
            )
            .map_err(|e| store_open(path, e))?;
        }

        Ok(())
    }

    pub fn database_count(&self) -> usize {
        self.schemas.len()
    }

    fn check_dbi(&self, dbi: usize) -> crate::Result<()> {
        if dbi >= self.schemas.len() {
            return Err(SymdexError::InvalidDatabaseIndex {
                dbi,
                attached: self.schemas.len(),
            });
        }
        Ok(())
    }

    fn check_writable(&self, dbi: usize) -> crate::Result<()> {
        self.check_dbi(dbi)?;
        if dbi != PRIMARY_DBI {
            return Err(SymdexError::ReadOnlyDatabase { dbi });
        }
        Ok(())
    }

    /// Open the batch transaction on first write; `commit` closes it
    fn begin_write(&self) -> crate::Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    /// Run `f` so that its writes land all together or not at all.
    ///
    /// Nested inside the batch transaction; a failure rolls back only what
    /// `f` wrote.
    pub(crate) fn atomically<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> crate::Result<T>,
    ) -> crate::Result<T> {
        self.begin_write()?;
        self.conn.execute_batch("SAVEPOINT file_update")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("RELEASE file_update")?;
                Ok(value)
            }
            Err(err) => {
                self.conn
                    .execute_batch("ROLLBACK TO file_update; RELEASE file_update")?;
                Err(err)
            }
        }
    }

    /// Stored record for `path` in database `dbi`
    pub fn file_record(&self, dbi: usize, path: &Path) -> crate::Result<Option<FileRecord>> {
        self.check_dbi(dbi)?;
        let sql = format!(
            "SELECT id, path, package, timestamp FROM {}.files WHERE path = ?1",
            self.schemas[dbi]
        );
        let record = self
            .conn
            .query_row(&sql, params![path_key(path)], |row| {
                Ok(FileRecord {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    package: row.get(2)?,
                    timestamp: row.get(3)?,
                })
            })
            .optional()?;
        Ok(record)
    }

    /// Staleness gate: record `mtime` for `path` and report whether the file
    /// needs (re)extraction.
    ///
    /// New files and files whose stored timestamp is strictly older than
    /// `mtime` are written and reported changed (their package recomputed).
    /// Anything else is left untouched. Either way the file counts as seen by
    /// an active sweep.
    pub fn update_file_timestamp(&mut self, dbi: usize, path: &Path, mtime: f64) -> crate::Result<bool> {
        self.check_writable(dbi)?;
        let key = path_key(path);

        let existing: Option<(i64, f64)> = self
            .conn
            .query_row(
                "SELECT id, timestamp FROM files WHERE path = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (id, changed) = match existing {
            Some((id, stored)) if stored < mtime => {
                self.begin_write()?;
                self.conn.execute(
                    "UPDATE files SET timestamp = ?1, package = ?2 WHERE id = ?3",
                    params![mtime, package_for_path(path), id],
                )?;
                (id, true)
            }
            Some((id, _)) => (id, false),
            None => {
                self.begin_write()?;
                self.conn.execute(
                    "INSERT INTO files(path, package, timestamp) VALUES (?1, ?2, ?3)",
                    params![key, package_for_path(path), mtime],
                )?;
                (self.conn.last_insert_rowid(), true)
            }
        };

        self.mark_seen(dbi, id);
        Ok(changed)
    }

    /// Delete every symbol of `path`, ahead of re-extraction. Returns the number removed.
    pub fn clear_symbols(&mut self, dbi: usize, path: &Path) -> crate::Result<usize> {
        self.check_writable(dbi)?;
        self.begin_write()?;
        let removed = self.conn.execute(
            "DELETE FROM symbols WHERE file_id = (SELECT id FROM files WHERE path = ?1)",
            params![path_key(path)],
        )?;
        Ok(removed)
    }

    /// Insert symbols for an already recorded file
    pub fn add_symbols(&mut self, dbi: usize, path: &Path, symbols: &[Symbol]) -> crate::Result<()> {
        self.check_writable(dbi)?;
        let Some(record) = self.file_record(dbi, path)? else {
            return Err(SymdexError::InvalidArguments {
                operation: "add_symbols".to_string(),
                message: format!("{} has no file record", path.display()),
            });
        };

        self.begin_write()?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO symbols(file_id, symbol, scope, row, col) VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for symbol in symbols {
            stmt.execute(params![
                record.id,
                symbol.name,
                symbol.scope,
                symbol.row as i64,
                symbol.col as i64
            ])?;
        }
        Ok(())
    }

    /// Start recording which files of `dbi` are visited
    pub fn begin_sweep(&mut self, dbi: usize) -> crate::Result<()> {
        self.check_writable(dbi)?;
        if let Some(previous) = &self.sweep {
            warn!(dbi = previous.dbi, seen = previous.seen.len(), "restarting unfinished sweep");
        }
        self.sweep = Some(Sweep {
            dbi,
            seen: HashSet::new(),
        });
        Ok(())
    }

    fn mark_seen(&mut self, dbi: usize, file_id: i64) {
        if let Some(sweep) = self.sweep.as_mut() {
            if sweep.dbi == dbi {
                sweep.seen.insert(file_id);
            }
        }
    }

    /// Close the sweep. With `prune`, every file of `dbi` not seen since
    /// `begin_sweep` is deleted along with its symbols. Returns the number
    /// of files removed.
    pub fn end_sweep(&mut self, dbi: usize, prune: bool) -> crate::Result<usize> {
        self.check_writable(dbi)?;
        let sweep = match self.sweep.take() {
            Some(sweep) if sweep.dbi == dbi => sweep,
            other => {
                self.sweep = other;
                return Err(SymdexError::NoActiveSweep { dbi });
            }
        };

        if !prune {
            debug!(dbi, seen = sweep.seen.len(), "sweep closed without pruning");
            return Ok(0);
        }

        let ids: Vec<i64> = {
            let mut stmt = self.conn.prepare("SELECT id FROM files")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        let stale: Vec<i64> = ids.into_iter().filter(|id| !sweep.seen.contains(id)).collect();

        if !stale.is_empty() {
            self.begin_write()?;
            let mut delete_symbols = self
                .conn
                .prepare_cached("DELETE FROM symbols WHERE file_id = ?1")?;
            let mut delete_file = self.conn.prepare_cached("DELETE FROM files WHERE id = ?1")?;
            for id in &stale {
                delete_symbols.execute(params![id])?;
                delete_file.execute(params![id])?;
            }
        }

        info!(dbi, seen = sweep.seen.len(), removed = stale.len(), "sweep finished");
        Ok(stale.len())
    }

    /// Whether a sweep bracket is open
    pub fn sweep_active(&self) -> bool {
        self.sweep.is_some()
    }

    /// Persist pending writes
    pub fn commit(&mut self) -> crate::Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }
}

fn store_open(path: &Path, err: rusqlite::Error) -> SymdexError {
    SymdexError::StoreOpen {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// SQLite URI opening `path` read-only
fn readonly_uri(path: &Path) -> String {
    let mut uri = String::from("file:");
    for ch in path_key(path).chars() {
        match ch {
            '%' => uri.push_str("%25"),
            '?' => uri.push_str("%3f"),
            '#' => uri.push_str("%23"),
            '\\' => uri.push('/'),
            _ => uri.push(ch),
        }
    }
    uri.push_str("?mode=ro");
    uri
}

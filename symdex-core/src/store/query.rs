//! Read queries over the union of attached stores

use super::SymbolStore;
use rusqlite::params;
use serde::{Deserialize, Serialize};

/// One definition site returned by `occurrences`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub symbol: String,
    pub scope: String,
    pub package: String,
    pub row: usize,
    pub col: usize,
    pub file: String,
    /// Database the record came from
    pub dbi: usize,
}

impl Occurrence {
    /// `package.scope.symbol`, skipping empty parts
    pub fn qualified_name(&self) -> String {
        [self.package.as_str(), self.scope.as_str(), self.symbol.as_str()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// `file:line:column`, one-based, as editors expect
    pub fn location(&self) -> String {
        format!("{}:{}:{}", self.file, self.row + 1, self.col + 1)
    }
}

/// Split `ns.symbol` into the symbol and a GLOB over `'.' || package || '.' || scope`.
///
/// Without a namespace only module-level symbols match (the qualified path
/// then ends in the separator). With one, the namespace must be the tail of
/// the package/scope chain.
pub(crate) fn namespace_pattern(query: &str) -> (String, &str) {
    match query.rsplit_once('.') {
        Some((namespace, symbol)) => (format!("*.{}", namespace), symbol),
        None => ("*.".to_string(), query),
    }
}

impl SymbolStore {
    /// One SELECT per attached schema joined into a single compound query
    fn union_sql(&self, compound: &str, select: impl Fn(usize, &str) -> String) -> String {
        self.schemas
            .iter()
            .enumerate()
            .map(|(dbi, schema)| select(dbi, schema))
            .collect::<Vec<_>>()
            .join(compound)
    }

    /// Definitions named by `query` (`symbol` or `namespace.symbol`), ordered
    /// by symbol, file path, row, then database.
    pub fn occurrences(&self, query: &str) -> crate::Result<Vec<Occurrence>> {
        let (pattern, symbol) = namespace_pattern(query);
        let sql = format!(
            "{} ORDER BY symbol, path, row, dbi",
            self.union_sql(" UNION ALL ", |dbi, schema| {
                format!(
                    "SELECT s.symbol, s.scope, f.package, s.row, s.col, f.path, {dbi} AS dbi
                     FROM {schema}.symbols s JOIN {schema}.files f ON s.file_id = f.id
                     WHERE s.symbol = ?1 AND ('.' || f.package || '.' || s.scope) GLOB ?2"
                )
            })
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![symbol, pattern], |row| {
            let line: i64 = row.get(3)?;
            let col: i64 = row.get(4)?;
            let dbi: i64 = row.get(6)?;
            Ok(Occurrence {
                symbol: row.get(0)?,
                scope: row.get(1)?,
                package: row.get(2)?,
                row: line as usize,
                col: col as usize,
                file: row.get(5)?,
                dbi: dbi as usize,
            })
        })?;

        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Distinct module-level symbols of `package` starting with `prefix`
    pub fn members(&self, package: &str, prefix: &str) -> crate::Result<Vec<String>> {
        let sql = format!(
            "{} ORDER BY 1",
            self.union_sql(" UNION ", |_, schema| {
                format!(
                    "SELECT DISTINCT s.symbol
                     FROM {schema}.symbols s JOIN {schema}.files f ON s.file_id = f.id
                     WHERE f.package = ?1 AND s.scope = '' AND s.symbol GLOB ?2"
                )
            })
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![package, format!("{}*", prefix)], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Distinct package names starting with `prefix`
    pub fn packages(&self, prefix: &str) -> crate::Result<Vec<String>> {
        let sql = format!(
            "{} ORDER BY 1",
            self.union_sql(" UNION ", |_, schema| {
                format!(
                    "SELECT DISTINCT package FROM {schema}.files
                     WHERE package <> '' AND package GLOB ?1"
                )
            })
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![format!("{}*", prefix)], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Symbol;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn sym(name: &str, scope: &str, row: usize) -> Symbol {
        Symbol {
            name: name.to_string(),
            scope: scope.to_string(),
            row,
            col: 4,
        }
    }

    /// Record `file` with `symbols`, bypassing the filesystem
    fn put(store: &mut SymbolStore, file: &Path, symbols: &[Symbol]) {
        store.update_file_timestamp(0, file, 1.0).unwrap();
        store.clear_symbols(0, file).unwrap();
        store.add_symbols(0, file, symbols).unwrap();
    }

    fn store_with_fixture(dir: &TempDir) -> (SymbolStore, PathBuf, PathBuf) {
        let mut store = SymbolStore::attach(&[dir.path().join("a.db")]).unwrap();
        let first = dir.path().join("first.py");
        let second = dir.path().join("second.py");
        put(
            &mut store,
            &first,
            &[
                sym("foo", "", 3),
                sym("foo", "Cls", 8),
                sym("foo", "Outer.Cls", 12),
                sym("bar", "", 1),
            ],
        );
        put(&mut store, &second, &[sym("foo", "", 0), sym("foo", "Other", 2)]);
        store.commit().unwrap();
        (store, first, second)
    }

    #[test]
    fn test_bare_name_matches_module_scope_only() {
        let dir = TempDir::new().unwrap();
        let (store, first, second) = store_with_fixture(&dir);

        let results = store.occurrences("foo").unwrap();
        let found: Vec<(&str, &str, usize)> = results
            .iter()
            .map(|o| (o.file.as_str(), o.scope.as_str(), o.row))
            .collect();
        assert_eq!(
            found,
            vec![
                (first.to_str().unwrap(), "", 3),
                (second.to_str().unwrap(), "", 0),
            ]
        );
    }

    #[test]
    fn test_dotted_name_matches_scope_suffix() {
        let dir = TempDir::new().unwrap();
        let (store, _, _) = store_with_fixture(&dir);

        let scopes: Vec<String> = store
            .occurrences("Cls.foo")
            .unwrap()
            .into_iter()
            .map(|o| o.scope)
            .collect();
        assert_eq!(scopes, vec!["Cls", "Outer.Cls"]);

        let scopes: Vec<String> = store
            .occurrences("Outer.Cls.foo")
            .unwrap()
            .into_iter()
            .map(|o| o.scope)
            .collect();
        assert_eq!(scopes, vec!["Outer.Cls"]);

        // Glob wildcards in the namespace are honoured
        assert_eq!(store.occurrences("*.foo").unwrap().len(), 5);
        assert!(store.occurrences("Missing.foo").unwrap().is_empty());
        assert!(store.occurrences("nothing").unwrap().is_empty());
    }

    #[test]
    fn test_namespace_includes_package_chain() {
        let dir = TempDir::new().unwrap();
        let mut store = SymbolStore::attach(&[dir.path().join("a.db")]).unwrap();
        let pkg = dir.path().join("pkg");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("__init__.py"), "").unwrap();
        let module = pkg.join("mod.py");
        put(&mut store, &module, &[sym("run", "Task", 5)]);

        let results = store.occurrences("mod.Task.run").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].package, "pkg.mod");
        assert_eq!(results[0].qualified_name(), "pkg.mod.Task.run");
        assert_eq!(results[0].location(), format!("{}:6:5", module.display()));
    }

    #[test]
    fn test_members_and_packages() {
        let dir = TempDir::new().unwrap();
        let mut store = SymbolStore::attach(&[dir.path().join("a.db")]).unwrap();
        let root = dir.path().join("app");
        std::fs::create_dir_all(root.join("util")).unwrap();
        std::fs::write(root.join("__init__.py"), "").unwrap();
        std::fs::write(root.join("util/__init__.py"), "").unwrap();

        put(
            &mut store,
            &root.join("util/__init__.py"),
            &[sym("parse", "", 0), sym("print_all", "", 1), sym("parse", "K", 2)],
        );
        put(&mut store, &root.join("util/io.py"), &[sym("parse", "", 0)]);
        put(&mut store, &root.join("__init__.py"), &[sym("VERSION", "", 0)]);

        assert_eq!(store.members("app.util", "p").unwrap(), vec!["parse", "print_all"]);
        assert_eq!(store.members("app.util", "pa").unwrap(), vec!["parse"]);
        assert_eq!(store.members("app.util", "").unwrap().len(), 2);
        assert!(store.members("app.nothing", "").unwrap().is_empty());

        assert_eq!(
            store.packages("app").unwrap(),
            vec!["app", "app.util", "app.util.io"]
        );
        assert_eq!(store.packages("app.util.").unwrap(), vec!["app.util.io"]);
    }

    #[test]
    fn test_union_tags_provenance() {
        let dir = TempDir::new().unwrap();
        let shared = dir.path().join("shared.py");
        let lib_db = dir.path().join("lib.db");
        {
            let mut lib = SymbolStore::attach(&[lib_db.clone()]).unwrap();
            put(&mut lib, &shared, &[sym("helper", "", 1), sym("legacy", "", 2)]);
            lib.commit().unwrap();
        }

        let mut store = SymbolStore::attach(&[dir.path().join("main.db"), lib_db]).unwrap();
        put(&mut store, &shared, &[sym("helper", "", 7)]);
        store.commit().unwrap();

        let found: Vec<(usize, usize)> = store
            .occurrences("helper")
            .unwrap()
            .into_iter()
            .map(|o| (o.dbi, o.row))
            .collect();
        assert_eq!(found, vec![(1, 1), (0, 7)]);

        let legacy = store.occurrences("legacy").unwrap();
        assert_eq!(legacy.len(), 1);
        assert_eq!(legacy[0].dbi, 1);
        assert_eq!(store.packages("shar").unwrap(), vec!["shared"]);
    }

    #[test]
    fn test_namespace_pattern() {
        assert_eq!(namespace_pattern("foo"), ("*.".to_string(), "foo"));
        assert_eq!(namespace_pattern("a.B.foo"), ("*.a.B".to_string(), "foo"));
    }
}

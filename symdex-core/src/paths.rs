//! Path normalization and package derivation

use std::path::{Component, Path, PathBuf};

/// Marker file that makes a directory a Python package
pub const PACKAGE_MARKER: &str = "__init__.py";

/// Make `path` absolute and collapse `.`/`..` components lexically.
///
/// Symlinks are not resolved. On Windows the result is lower-cased so the
/// same file always maps to the same `files.path` row.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // Never pop past the root or a drive prefix
                if matches!(
                    normalized.components().next_back(),
                    Some(Component::Normal(_))
                ) {
                    normalized.pop();
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    if cfg!(windows) {
        PathBuf::from(normalized.to_string_lossy().to_lowercase())
    } else {
        normalized
    }
}

/// Dotted package name of a source file.
///
/// The module's own name comes first (nothing for `__init__`), then each
/// enclosing directory is prepended for as long as it holds an `__init__.py`.
pub fn package_for_path(path: &Path) -> String {
    let mut segments: Vec<String> = Vec::new();

    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
        if stem != "__init__" {
            segments.push(stem.to_string());
        }
    }

    let mut dir = path.parent();
    while let Some(current) = dir {
        if !current.join(PACKAGE_MARKER).is_file() {
            break;
        }
        match current.file_name().and_then(|n| n.to_str()) {
            Some(name) => segments.push(name.to_string()),
            None => break,
        }
        dir = current.parent();
    }

    segments.reverse();
    segments.join(".")
}

/// Path as stored in the `files` table
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_collapses_dots() {
        let path = normalize_path(Path::new("/a/b/../c/./d.py"));
        assert_eq!(path, PathBuf::from("/a/c/d.py"));
        let path = normalize_path(Path::new("/../x.py"));
        assert_eq!(path, PathBuf::from("/x.py"));
    }

    #[test]
    fn test_normalize_relative_is_absolute() {
        let path = normalize_path(Path::new("some/file.py"));
        assert!(path.is_absolute());
        assert!(path.ends_with("some/file.py"));
    }

    #[test]
    fn test_package_for_nested_modules() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("top/pkg/sub")).unwrap();
        fs::write(root.join("top/pkg/__init__.py"), "").unwrap();
        fs::write(root.join("top/pkg/sub/__init__.py"), "").unwrap();
        fs::write(root.join("top/pkg/sub/mod.py"), "").unwrap();
        fs::write(root.join("top/script.py"), "").unwrap();

        assert_eq!(package_for_path(&root.join("top/pkg/sub/mod.py")), "pkg.sub.mod");
        assert_eq!(package_for_path(&root.join("top/pkg/sub/__init__.py")), "pkg.sub");
        assert_eq!(package_for_path(&root.join("top/pkg/__init__.py")), "pkg");
        assert_eq!(package_for_path(&root.join("top/script.py")), "script");
    }

    #[test]
    fn test_package_stops_at_missing_marker() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        // a/ is not a package, so b/ is the outermost one
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/__init__.py"), "").unwrap();
        assert_eq!(package_for_path(&root.join("a/b/m.pyw")), "b.m");
    }
}

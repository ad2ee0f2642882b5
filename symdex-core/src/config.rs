//! Configuration for symdex

use crate::paths::normalize_path;
use crate::SymdexError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration as TOML
pub const DEFAULT_CONFIG: &str = r#"# Symdex Configuration

# Each [[databases]] entry is one symbol store. Queries attach all of them,
# ordered by `index`: the first is writable, the rest are read-only companions.
[[databases]]
# Store file ($VAR and ${VAR} are expanded)
path = "$HOME/.cache/symdex/project.db"
# Directories walked by `symdex index`
roots = ["."]
# Optional glob a file path must match to be indexed into this store
# pattern = "**/src/**"
index = 0

[indexing]
# Source file extensions considered for indexing
extensions = ["py", "pyw"]
# Files processed per commit during a sweep
commit_every = 500
# Follow symbolic links while walking roots
follow_links = false

[ignore]
# Directory and file names skipped while walking roots
patterns = [
    ".git",
    ".hg",
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    "node_modules",
    "build",
    "dist",
]

[worker]
# Path to the worker binary (defaults to symdex-worker next to symdex)
# program = "/usr/local/bin/symdex-worker"
"#;

/// Symdex configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub ignore: IgnoreConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    #[serde(default)]
    pub roots: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_commit_every")]
    pub commit_every: usize,
    #[serde(default)]
    pub follow_links: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IgnoreConfig {
    #[serde(default = "default_ignore_patterns")]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub program: Option<String>,
}

// Default value functions
fn default_extensions() -> Vec<String> {
    vec!["py".to_string(), "pyw".to_string()]
}
fn default_commit_every() -> usize {
    500
}
fn default_ignore_patterns() -> Vec<String> {
    vec![
        ".git".to_string(),
        "__pycache__".to_string(),
        ".venv".to_string(),
        "venv".to_string(),
    ]
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            commit_every: default_commit_every(),
            follow_links: false,
        }
    }
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self {
            patterns: default_ignore_patterns(),
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| SymdexError::ConfigParse(e.to_string()))
    }

    /// Write the default config, refusing to overwrite an existing file
    pub fn init(path: &Path) -> crate::Result<()> {
        if path.exists() {
            return Err(SymdexError::ConfigExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, DEFAULT_CONFIG)?;
        Ok(())
    }

    /// Databases sorted by their `index`; entries without one keep file order, last.
    pub fn ordered_databases(&self) -> Vec<&DatabaseConfig> {
        let mut databases: Vec<&DatabaseConfig> = self.databases.iter().collect();
        databases.sort_by_key(|db| db.index.unwrap_or(u32::MAX));
        databases
    }

    /// Store paths in query order, ready for `set_databases`
    pub fn database_paths(&self) -> Vec<PathBuf> {
        self.ordered_databases()
            .into_iter()
            .map(DatabaseConfig::store_path)
            .collect()
    }

    /// Whether `path` has one of the configured source extensions
    pub fn is_source_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.indexing.extensions.iter().any(|x| x == ext))
    }
}

impl DatabaseConfig {
    /// Store file path with environment variables expanded
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(expand_vars(&self.path))
    }

    /// Root directories with environment variables expanded, normalized
    pub fn root_paths(&self) -> Vec<PathBuf> {
        self.roots
            .iter()
            .map(|root| normalize_path(Path::new(&expand_vars(root))))
            .collect()
    }

    /// Compile the optional include pattern
    pub fn pattern_matcher(&self) -> crate::Result<Option<globset::GlobMatcher>> {
        self.pattern
            .as_deref()
            .map(|pattern| {
                globset::Glob::new(pattern)
                    .map(|g| g.compile_matcher())
                    .map_err(|e| SymdexError::GlobPattern(e.to_string()))
            })
            .transpose()
    }

    /// Whether a file belongs in this database: inside one of its roots (or
    /// no roots configured) and matching its pattern (if any).
    pub fn covers(&self, path: &Path) -> crate::Result<bool> {
        let path = normalize_path(path);
        let roots = self.root_paths();
        if !roots.is_empty() && !roots.iter().any(|root| path.starts_with(root)) {
            return Ok(false);
        }
        Ok(match self.pattern_matcher()? {
            Some(matcher) => matcher.is_match(&path),
            None => true,
        })
    }
}

/// Expand `$VAR` and `${VAR}` references; unknown variables are left as written.
pub fn expand_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match std::env::var(name) {
            Ok(value) if !name.is_empty() => out.push_str(&value),
            _ => out.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }

    out.push_str(rest);
    out
}

//! Script source providers for `include` / `require`.
//!
//! Resolution and loading are separate steps: a provider first maps the
//! path written in the script to a canonical name, then loads source text
//! for that name. `include_once` bookkeeping uses the canonical name.

use rustc_hash::FxHashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Source text returned by a provider.
#[derive(Debug, Clone)]
pub struct ScriptSource {
    /// Canonical name, reported as the file in errors and traces.
    pub name: String,
    pub text: String,
}

/// Provider of script sources.
///
/// Implementations must be shareable across threads so one provider can
/// back every engine in a worker pool.
pub trait SourceProvider: Send + Sync {
    /// Map `path` (as written in the script) to a canonical name.
    ///
    /// `referrer` is the canonical name of the including script, if any.
    /// Returns `None` when the path cannot be found.
    fn resolve(&self, path: &str, referrer: Option<&str>) -> Option<String>;

    /// Load the source for a name produced by [`SourceProvider::resolve`].
    fn load(&self, name: &str) -> io::Result<String>;

    /// Resolve then load.
    fn fetch(&self, path: &str, referrer: Option<&str>) -> io::Result<ScriptSource> {
        let name = self.resolve(path, referrer).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "No such file or directory")
        })?;
        let text = self.load(&name)?;
        Ok(ScriptSource { name, text })
    }
}

/// Filesystem provider searching an ordered list of include directories.
///
/// Relative paths are tried against each include directory in order, then
/// against the directory of the including script. Paths starting with `./`
/// or `../` skip the include directories.
#[derive(Debug, Clone, Default)]
pub struct IncludePathLoader {
    include_paths: Vec<PathBuf>,
}

impl IncludePathLoader {
    pub fn new(include_paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            include_paths: include_paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn include_paths(&self) -> &[PathBuf] {
        &self.include_paths
    }

    fn candidates(&self, path: &str, referrer: Option<&str>) -> Vec<PathBuf> {
        let requested = Path::new(path);
        if requested.is_absolute() {
            return vec![requested.to_path_buf()];
        }

        let mut out = Vec::new();
        let explicit_relative = path.starts_with("./") || path.starts_with("../");
        if !explicit_relative {
            out.extend(self.include_paths.iter().map(|dir| dir.join(requested)));
        }
        if let Some(dir) = referrer.and_then(|r| Path::new(r).parent()) {
            out.push(dir.join(requested));
        }
        out
    }
}

impl SourceProvider for IncludePathLoader {
    fn resolve(&self, path: &str, referrer: Option<&str>) -> Option<String> {
        self.candidates(path, referrer)
            .into_iter()
            .find(|candidate| candidate.is_file())
            .map(|found| {
                found
                    .canonicalize()
                    .unwrap_or(found)
                    .to_string_lossy()
                    .into_owned()
            })
    }

    fn load(&self, name: &str) -> io::Result<String> {
        std::fs::read_to_string(name)
    }
}

/// In-memory provider keyed by exact path; useful for embedding bundled
/// scripts.
#[derive(Debug, Clone, Default)]
pub struct MemorySourceProvider {
    files: FxHashMap<String, String>,
}

impl MemorySourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.insert(name, text);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.files.insert(name.into(), text.into());
    }
}

impl SourceProvider for MemorySourceProvider {
    fn resolve(&self, path: &str, _referrer: Option<&str>) -> Option<String> {
        let path = path.strip_prefix("./").unwrap_or(path);
        self.files.contains_key(path).then(|| path.to_string())
    }

    fn load(&self, name: &str) -> io::Result<String> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "No such file or directory"))
    }
}

/// Shared provider handle.
pub type SharedSourceProvider = Arc<dyn SourceProvider>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_include_path_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(second.path().join("lib.php"), "<?php return 2;").unwrap();
        fs::write(first.path().join("lib.php"), "<?php return 1;").unwrap();

        let loader = IncludePathLoader::new([first.path(), second.path()]);
        let source = loader.fetch("lib.php", None).unwrap();
        assert_eq!(source.text, "<?php return 1;");
    }

    #[test]
    fn test_relative_to_referrer() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("helper.php"), "<?php").unwrap();
        let main = dir.path().join("main.php");

        let loader = IncludePathLoader::default();
        let name = loader
            .resolve("./helper.php", Some(main.to_str().unwrap()))
            .unwrap();
        assert!(name.ends_with("helper.php"));
    }

    #[test]
    fn test_missing_file() {
        let loader = IncludePathLoader::default();
        let err = loader.fetch("missing.php", None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_memory_provider() {
        let provider = MemorySourceProvider::new().with_file("a.php", "<?php return 'a';");
        assert_eq!(provider.resolve("./a.php", None).as_deref(), Some("a.php"));
        assert!(provider.resolve("b.php", None).is_none());
    }
}

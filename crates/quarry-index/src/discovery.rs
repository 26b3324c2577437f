//! Source file discovery for a project root.

use std::path::Path;

use crate::error::Result;
use crate::languages::detect_language;

/// Lists the files of a project that should be indexed.
pub trait FileDiscovery: Send + Sync {
    /// Project-relative, `/`-separated paths, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be walked.
    fn discover(&self, root: &Path) -> Result<Vec<String>>;
}

/// Gitignore-aware directory walk.
#[derive(Debug, Clone)]
pub struct WalkDiscovery {
    /// Directory names skipped anywhere in the tree.
    pub ignore_dirs: Vec<String>,
    /// Files larger than this are skipped.
    pub max_file_bytes: u64,
    /// Extensions indexed on top of the known languages; chunked as whole files.
    pub extra_extensions: Vec<String>,
}

impl Default for WalkDiscovery {
    fn default() -> Self {
        Self {
            ignore_dirs: vec![
                "target".into(),
                "node_modules".into(),
                "dist".into(),
                "build".into(),
                "vendor".into(),
            ],
            max_file_bytes: 1024 * 1024,
            extra_extensions: Vec::new(),
        }
    }
}

impl WalkDiscovery {
    fn wanted(&self, path: &Path) -> bool {
        if detect_language(path).is_some() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extra_extensions.iter().any(|x| x == ext))
    }
}

impl FileDiscovery for WalkDiscovery {
    fn discover(&self, root: &Path) -> Result<Vec<String>> {
        if !root.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a directory", root.display()),
            )
            .into());
        }

        let ignore_dirs = self.ignore_dirs.clone();
        let walker = ignore::WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(true)
            .require_git(false)
            .filter_entry(move |entry| {
                let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                !(is_dir
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|n| ignore_dirs.iter().any(|d| d == n)))
            })
            .build();

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("walk error: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) || !self.wanted(entry.path()) {
                continue;
            }
            let size = entry.metadata().map_or(0, |m| m.len());
            if size > self.max_file_bytes {
                tracing::debug!(path = %entry.path().display(), size, "skipping large file");
                continue;
            }
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(rel);
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn finds_known_languages_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("notes.bin"), "x").unwrap();

        let files = WalkDiscovery::default().discover(dir.path()).unwrap();
        assert_eq!(files, vec!["src/main.rs"]);
    }

    #[test]
    fn extra_extensions_are_included() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.src"), "function foo(){}").unwrap();
        let discovery = WalkDiscovery {
            extra_extensions: vec!["src".into()],
            ..WalkDiscovery::default()
        };
        assert_eq!(discovery.discover(dir.path()).unwrap(), vec!["a.src"]);
    }

    #[test]
    fn ignored_dirs_and_large_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("target")).unwrap();
        fs::write(dir.path().join("target/gen.rs"), "fn x() {}").unwrap();
        fs::write(dir.path().join("big.rs"), "x".repeat(64)).unwrap();
        fs::write(dir.path().join("small.rs"), "fn y() {}").unwrap();

        let discovery = WalkDiscovery {
            max_file_bytes: 32,
            ..WalkDiscovery::default()
        };
        assert_eq!(discovery.discover(dir.path()).unwrap(), vec!["small.rs"]);
    }

    #[test]
    fn gitignore_respected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "skip.rs\n").unwrap();
        fs::write(dir.path().join("skip.rs"), "fn a() {}").unwrap();
        fs::write(dir.path().join("keep.rs"), "fn b() {}").unwrap();
        assert_eq!(
            WalkDiscovery::default().discover(dir.path()).unwrap(),
            vec!["keep.rs"]
        );
    }

    #[test]
    fn missing_root_is_error() {
        assert!(
            WalkDiscovery::default()
                .discover(Path::new("/nonexistent/quarry/root"))
                .is_err()
        );
    }
}

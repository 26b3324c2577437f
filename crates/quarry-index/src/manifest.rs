//! Per-project record of indexed files, their hashes and chunk ids.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::chunker::ChunkId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file_path: String,
    /// blake3 hex of the file bytes. Empty once invalidated by recovery.
    pub content_hash: String,
    /// Seconds since the Unix epoch.
    pub mtime: i64,
    pub chunk_ids: Vec<ChunkId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    files: BTreeMap<String, ManifestEntry>,
}

/// A discovered file that could be read and hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub file_path: String,
    pub content_hash: String,
    pub mtime: i64,
}

/// Classification of a scan against the manifest, each list sorted by path.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<ScannedFile>,
    pub modified: Vec<ScannedFile>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Paths whose index entries the batch will touch.
    #[must_use]
    pub fn touched_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .added
            .iter()
            .chain(&self.modified)
            .map(|f| f.file_path.clone())
            .chain(self.deleted.iter().cloned())
            .collect();
        paths.sort();
        paths
    }
}

impl Manifest {
    #[must_use]
    pub fn get(&self, file_path: &str) -> Option<&ManifestEntry> {
        self.files.get(file_path)
    }

    pub fn insert(&mut self, entry: ManifestEntry) {
        self.files.insert(entry.file_path.clone(), entry);
    }

    pub fn remove(&mut self, file_path: &str) -> Option<ManifestEntry> {
        self.files.remove(file_path)
    }

    /// Forget the stored hash so the next scan treats the file as modified.
    pub fn invalidate(&mut self, file_path: &str) -> bool {
        match self.files.get_mut(file_path) {
            Some(entry) => {
                entry.content_hash.clear();
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.files.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Union of every file's chunk ids.
    #[must_use]
    pub fn chunk_ids(&self) -> BTreeSet<&ChunkId> {
        self.files.values().flat_map(|e| &e.chunk_ids).collect()
    }

    /// Classify `scanned` files. Paths in `unreadable` keep their entries and
    /// are never reported as deleted.
    #[must_use]
    pub fn classify(&self, scanned: Vec<ScannedFile>, unreadable: &BTreeSet<String>) -> ChangeSet {
        let mut changes = ChangeSet::default();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        for file in scanned {
            seen.insert(file.file_path.clone());
            match self.files.get(&file.file_path) {
                None => changes.added.push(file),
                Some(entry) if entry.content_hash != file.content_hash => {
                    changes.modified.push(file);
                }
                Some(_) => changes.unchanged.push(file.file_path),
            }
        }
        changes.deleted = self
            .files
            .keys()
            .filter(|p| !seen.contains(*p) && !unreadable.contains(*p))
            .cloned()
            .collect();

        changes.added.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        changes.modified.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        changes.unchanged.sort();
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanned(path: &str, hash: &str) -> ScannedFile {
        ScannedFile {
            file_path: path.into(),
            content_hash: hash.into(),
            mtime: 0,
        }
    }

    fn entry(path: &str, hash: &str) -> ManifestEntry {
        ManifestEntry {
            file_path: path.into(),
            content_hash: hash.into(),
            mtime: 0,
            chunk_ids: vec![ChunkId::derive(path, 1, 1, hash)],
        }
    }

    #[test]
    fn classify_all_kinds() {
        let mut m = Manifest::default();
        m.insert(entry("same.rs", "h1"));
        m.insert(entry("changed.rs", "h2"));
        m.insert(entry("gone.rs", "h3"));

        let changes = m.classify(
            vec![
                scanned("same.rs", "h1"),
                scanned("changed.rs", "h2b"),
                scanned("new.rs", "h4"),
            ],
            &BTreeSet::new(),
        );
        assert_eq!(changes.added, vec![scanned("new.rs", "h4")]);
        assert_eq!(changes.modified, vec![scanned("changed.rs", "h2b")]);
        assert_eq!(changes.unchanged, vec!["same.rs".to_string()]);
        assert_eq!(changes.deleted, vec!["gone.rs".to_string()]);
        assert_eq!(
            changes.touched_paths(),
            vec!["changed.rs", "gone.rs", "new.rs"]
        );
    }

    #[test]
    fn unreadable_files_are_not_deleted() {
        let mut m = Manifest::default();
        m.insert(entry("locked.rs", "h"));
        let unreadable = BTreeSet::from(["locked.rs".to_string()]);
        let changes = m.classify(Vec::new(), &unreadable);
        assert!(changes.is_empty());
    }

    #[test]
    fn invalidated_entry_reads_as_modified() {
        let mut m = Manifest::default();
        m.insert(entry("a.rs", "h"));
        assert!(m.invalidate("a.rs"));
        assert!(!m.invalidate("missing.rs"));
        let changes = m.classify(vec![scanned("a.rs", "h")], &BTreeSet::new());
        assert_eq!(changes.modified.len(), 1);
    }

    #[test]
    fn chunk_ids_union() {
        let mut m = Manifest::default();
        m.insert(entry("a.rs", "h"));
        m.insert(entry("b.rs", "h"));
        assert_eq!(m.chunk_ids().len(), 2);
        m.remove("a.rs");
        assert_eq!(m.chunk_ids().len(), 1);
    }
}

//! Declared-name lookup used by entity tracking.

use std::collections::{BTreeMap, BTreeSet};

use crate::chunker::ChunkId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityIndex {
    by_name: BTreeMap<String, BTreeSet<ChunkId>>,
}

impl EntityIndex {
    pub fn add(&mut self, name: &str, id: &ChunkId) {
        self.by_name
            .entry(name.to_string())
            .or_default()
            .insert(id.clone());
    }

    pub fn remove(&mut self, name: &str, id: &ChunkId) {
        if let Some(ids) = self.by_name.get_mut(name) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_name.remove(name);
            }
        }
    }

    /// Chunks declared with exactly `name`, in id order.
    pub fn lookup(&self, name: &str) -> impl Iterator<Item = &ChunkId> {
        self.by_name.get(name).into_iter().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.values().map(BTreeSet::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Identifiers in a query, case preserved, deduplicated in first-seen order.
#[must_use]
pub fn query_identifiers(query: &str) -> Vec<&str> {
    let mut seen = BTreeSet::new();
    query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(*t))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_exact() {
        let mut idx = EntityIndex::default();
        let a = ChunkId::derive("a.rs", 1, 1, "x");
        idx.add("parse_config", &a);
        assert_eq!(idx.lookup("parse_config").count(), 1);
        assert_eq!(idx.lookup("parse").count(), 0);
        assert_eq!(idx.lookup("Parse_Config").count(), 0);
    }

    #[test]
    fn remove_cleans_empty_names() {
        let mut idx = EntityIndex::default();
        let a = ChunkId::derive("a.rs", 1, 1, "x");
        let b = ChunkId::derive("b.rs", 1, 1, "x");
        idx.add("run", &a);
        idx.add("run", &b);
        assert_eq!(idx.len(), 2);
        idx.remove("run", &a);
        assert_eq!(idx.lookup("run").collect::<Vec<_>>(), vec![&b]);
        idx.remove("run", &b);
        assert!(idx.is_empty());
    }

    #[test]
    fn identifiers_from_query() {
        assert_eq!(
            query_identifiers("where is parse_config() called, parse_config?"),
            vec!["where", "is", "parse_config", "called"]
        );
    }
}

use super::{check_dim, top_k, IndexBackend, IndexError, VectorIndex};
use crate::types::{Candidate, Embedding, IndexEntry};
use std::collections::{BTreeMap, HashMap};

/// Index with native deletion.
///
/// Entries live in a `BTreeMap` under monotonically increasing ids, so map
/// order is insertion order. Removing an identity with `k` entries costs
/// O(k log n) and never rewrites the rest of the index.
pub struct KeyedIndex {
    dim: usize,
    next_id: u64,
    entries: BTreeMap<u64, IndexEntry>,
    by_identity: HashMap<String, Vec<u64>>,
}

impl KeyedIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            next_id: 0,
            entries: BTreeMap::new(),
            by_identity: HashMap::new(),
        }
    }
}

impl VectorIndex for KeyedIndex {
    fn backend(&self) -> IndexBackend {
        IndexBackend::Keyed
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, identity_id: &str) -> bool {
        self.by_identity.contains_key(identity_id)
    }

    fn insert(&mut self, entry: IndexEntry) -> Result<(), IndexError> {
        check_dim(self.dim, &entry.embedding)?;
        let id = self.next_id;
        self.next_id += 1;
        self.by_identity
            .entry(entry.identity_id.clone())
            .or_default()
            .push(id);
        self.entries.insert(id, entry);
        Ok(())
    }

    fn search(&self, query: &Embedding, k: usize) -> Result<Vec<Candidate>, IndexError> {
        check_dim(self.dim, query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let scored = self
            .entries
            .values()
            .map(|entry| Candidate {
                identity_id: entry.identity_id.clone(),
                identity_seq: entry.identity_seq,
                similarity: query.similarity(&entry.embedding),
            })
            .collect();

        Ok(top_k(scored, k))
    }

    fn remove(&mut self, identity_id: &str) -> usize {
        let Some(ids) = self.by_identity.remove(identity_id) else {
            return 0;
        };
        for id in &ids {
            self.entries.remove(id);
        }
        ids.len()
    }

    fn rebuild_from(&mut self, entries: Vec<IndexEntry>) -> Result<(), IndexError> {
        let mut fresh = KeyedIndex::new(self.dim);
        for entry in entries {
            fresh.insert(entry)?;
        }
        *self = fresh;
        Ok(())
    }

    fn entries(&self) -> Vec<IndexEntry> {
        self.entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::{basis, entry};

    #[test]
    fn test_remove_leaves_other_entry_ids_untouched() {
        let mut index = KeyedIndex::new(4);
        index.insert(entry("a", 1, basis(4, 0))).unwrap();
        index.insert(entry("b", 2, basis(4, 1))).unwrap();
        index.insert(entry("a", 1, basis(4, 2))).unwrap();

        assert_eq!(index.remove("a"), 2);
        assert_eq!(index.entries.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert!(!index.by_identity.contains_key("a"));
        assert_eq!(index.remove("a"), 0);
    }

    #[test]
    fn test_ids_keep_growing_after_removal() {
        let mut index = KeyedIndex::new(4);
        index.insert(entry("a", 1, basis(4, 0))).unwrap();
        index.remove("a");
        index.insert(entry("b", 2, basis(4, 1))).unwrap();
        assert_eq!(index.entries.keys().copied().collect::<Vec<_>>(), vec![1]);
    }
}

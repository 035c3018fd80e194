use super::{check_dim, top_k, IndexBackend, IndexError, VectorIndex};
use crate::types::{dot, Candidate, Embedding, IndexEntry};
use std::collections::HashSet;

#[derive(Debug, Clone)]
struct Owner {
    identity_id: String,
    identity_seq: i64,
}

/// Exhaustive-scan index over one contiguous `dim`-strided buffer.
///
/// The buffer only supports append. Removal tombstones the identity so
/// searches skip it at once, then [`compact`](Self::compact) rewrites the
/// buffer without it in O(total entries).
pub struct FlatIndex {
    dim: usize,
    data: Vec<f32>,
    owners: Vec<Owner>,
    tombstones: HashSet<String>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
            owners: Vec::new(),
            tombstones: HashSet::new(),
        }
    }

    /// Exclude `identity_id` from search without touching the buffer.
    pub fn mark_removed(&mut self, identity_id: &str) -> usize {
        if self.tombstones.contains(identity_id) {
            return 0;
        }
        let count = self
            .owners
            .iter()
            .filter(|o| o.identity_id == identity_id)
            .count();
        if count > 0 {
            self.tombstones.insert(identity_id.to_string());
        }
        count
    }

    /// Physically drop tombstoned entries.
    pub fn compact(&mut self) {
        if self.tombstones.is_empty() {
            return;
        }

        let mut data = Vec::with_capacity(self.data.len());
        let mut owners = Vec::with_capacity(self.owners.len());
        for (owner, row) in self.owners.drain(..).zip(self.data.chunks_exact(self.dim)) {
            if !self.tombstones.contains(&owner.identity_id) {
                data.extend_from_slice(row);
                owners.push(owner);
            }
        }

        tracing::debug!(
            dropped = self.data.len() / self.dim - owners.len(),
            kept = owners.len(),
            "flat index compacted"
        );
        self.data = data;
        self.owners = owners;
        self.tombstones.clear();
    }

    fn is_live(&self, owner: &Owner) -> bool {
        !self.tombstones.contains(&owner.identity_id)
    }
}

impl VectorIndex for FlatIndex {
    fn backend(&self) -> IndexBackend {
        IndexBackend::Flat
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        if self.tombstones.is_empty() {
            self.owners.len()
        } else {
            self.owners.iter().filter(|o| self.is_live(o)).count()
        }
    }

    fn contains(&self, identity_id: &str) -> bool {
        !self.tombstones.contains(identity_id)
            && self.owners.iter().any(|o| o.identity_id == identity_id)
    }

    fn insert(&mut self, entry: IndexEntry) -> Result<(), IndexError> {
        check_dim(self.dim, &entry.embedding)?;
        // Re-enrolling a tombstoned identity must not resurrect its old rows.
        if self.tombstones.contains(&entry.identity_id) {
            self.compact();
        }
        self.data.extend_from_slice(entry.embedding.values());
        self.owners.push(Owner {
            identity_id: entry.identity_id,
            identity_seq: entry.identity_seq,
        });
        Ok(())
    }

    fn search(&self, query: &Embedding, k: usize) -> Result<Vec<Candidate>, IndexError> {
        check_dim(self.dim, query)?;
        if k == 0 || self.owners.is_empty() {
            return Ok(Vec::new());
        }

        let scored = self
            .owners
            .iter()
            .zip(self.data.chunks_exact(self.dim))
            .filter(|(owner, _)| self.is_live(owner))
            .map(|(owner, row)| Candidate {
                identity_id: owner.identity_id.clone(),
                identity_seq: owner.identity_seq,
                similarity: dot(query.values(), row),
            })
            .collect();

        Ok(top_k(scored, k))
    }

    fn remove(&mut self, identity_id: &str) -> usize {
        let removed = self.mark_removed(identity_id);
        self.compact();
        removed
    }

    fn rebuild_from(&mut self, entries: Vec<IndexEntry>) -> Result<(), IndexError> {
        let mut fresh = FlatIndex::new(self.dim);
        fresh.data.reserve(entries.len() * self.dim);
        for entry in entries {
            fresh.insert(entry)?;
        }
        *self = fresh;
        Ok(())
    }

    fn entries(&self) -> Vec<IndexEntry> {
        self.owners
            .iter()
            .zip(self.data.chunks_exact(self.dim))
            .filter(|(owner, _)| self.is_live(owner))
            .map(|(owner, row)| IndexEntry {
                identity_id: owner.identity_id.clone(),
                identity_seq: owner.identity_seq,
                // Rows were normalized on the way in.
                embedding: Embedding::from_unit(row.to_vec()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::{basis, entry};

    #[test]
    fn test_marked_identity_hidden_before_compaction() {
        let mut index = FlatIndex::new(4);
        index.insert(entry("a", 1, basis(4, 0))).unwrap();
        index.insert(entry("b", 2, basis(4, 1))).unwrap();

        assert_eq!(index.mark_removed("a"), 1);
        // Buffer still holds both rows.
        assert_eq!(index.owners.len(), 2);
        assert_eq!(index.len(), 1);

        let hits = index.search(&basis(4, 0), 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].identity_id, "b");

        index.compact();
        assert_eq!(index.owners.len(), 1);
        assert_eq!(index.data.len(), 4);
    }

    #[test]
    fn test_mark_unknown_identity_is_noop() {
        let mut index = FlatIndex::new(4);
        index.insert(entry("a", 1, basis(4, 0))).unwrap();
        assert_eq!(index.mark_removed("nobody"), 0);
        assert!(index.tombstones.is_empty());
    }

    #[test]
    fn test_reinsert_after_mark_does_not_resurrect_old_rows() {
        let mut index = FlatIndex::new(4);
        index.insert(entry("a", 1, basis(4, 0))).unwrap();
        index.mark_removed("a");
        index.insert(entry("a", 1, basis(4, 2))).unwrap();

        assert_eq!(index.len(), 1);
        let hits = index.search(&basis(4, 0), 5).unwrap();
        assert!(hits[0].similarity.abs() < 1e-6);
    }

    #[test]
    fn test_compaction_keeps_rows_aligned_with_owners() {
        let mut index = FlatIndex::new(4);
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            index.insert(entry(id, i as i64, basis(4, i))).unwrap();
        }
        index.remove("b");

        for (axis, id) in [(0, "a"), (2, "c"), (3, "d")] {
            let hit = index.search(&basis(4, axis), 1).unwrap().remove(0);
            assert_eq!(hit.identity_id, id);
            assert!((hit.similarity - 1.0).abs() < 1e-6);
        }
    }
}

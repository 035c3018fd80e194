//! Vector similarity index over the enrolled gallery.
//!
//! The index is derived state: the embedding store is authoritative and every
//! backend can be rebuilt from a full enumeration of it. Two backends sit
//! behind [`VectorIndex`]:
//!
//! - [`FlatIndex`]: contiguous exhaustive-scan storage. Append-only by nature,
//!   so deletes tombstone the identity and then compact the whole buffer.
//! - [`KeyedIndex`]: ordered map keyed by entry id with an owner lookup, so
//!   deletes touch only the removed identity's entries.

mod flat;
mod keyed;

pub use flat::FlatIndex;
pub use keyed::KeyedIndex;

use crate::types::{Candidate, Embedding, IndexEntry};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("dimension mismatch: index holds {expected}-dim vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("unknown index backend: {0} (expected \"flat\" or \"keyed\")")]
    UnknownBackend(String),
}

/// Which [`VectorIndex`] implementation is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexBackend {
    Flat,
    Keyed,
}

impl IndexBackend {
    pub fn build(self, dim: usize) -> Box<dyn VectorIndex> {
        match self {
            Self::Flat => Box::new(FlatIndex::new(dim)),
            Self::Keyed => Box::new(KeyedIndex::new(dim)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Keyed => "keyed",
        }
    }
}

impl FromStr for IndexBackend {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" => Ok(Self::Flat),
            "keyed" => Ok(Self::Keyed),
            other => Err(IndexError::UnknownBackend(other.to_string())),
        }
    }
}

/// Nearest-neighbour structure over (vector, identity) entries.
///
/// Contract shared by all backends:
/// - `search` returns at most `k` hits, best first. Exact ties are ordered by
///   earliest enrollment, then by insertion order.
/// - after `remove` returns, no `search` yields the removed identity.
/// - `rebuild_from` either replaces the whole entry set or leaves it untouched.
pub trait VectorIndex: Send + Sync {
    fn backend(&self) -> IndexBackend;

    fn dim(&self) -> usize;

    /// Number of live (searchable) entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, identity_id: &str) -> bool;

    fn insert(&mut self, entry: IndexEntry) -> Result<(), IndexError>;

    fn search(&self, query: &Embedding, k: usize) -> Result<Vec<Candidate>, IndexError>;

    /// Drop every entry owned by `identity_id`; returns how many were removed.
    fn remove(&mut self, identity_id: &str) -> usize;

    /// Replace all entries of `identity_id` with `entries`.
    fn update(&mut self, identity_id: &str, entries: Vec<IndexEntry>) -> Result<(), IndexError> {
        for entry in &entries {
            check_dim(self.dim(), &entry.embedding)?;
        }
        self.remove(identity_id);
        for entry in entries {
            self.insert(entry)?;
        }
        Ok(())
    }

    fn rebuild_from(&mut self, entries: Vec<IndexEntry>) -> Result<(), IndexError>;

    /// Enumerate live entries in insertion order.
    fn entries(&self) -> Vec<IndexEntry>;
}

pub(crate) fn check_dim(expected: usize, embedding: &Embedding) -> Result<(), IndexError> {
    if embedding.dim() != expected {
        return Err(IndexError::DimensionMismatch {
            expected,
            actual: embedding.dim(),
        });
    }
    Ok(())
}

/// Order scored entries best first and keep `k`.
///
/// `scored` must arrive in insertion order; the stable sort keeps that order
/// among exact ties of both similarity and enrollment.
pub(crate) fn top_k(mut scored: Vec<Candidate>, k: usize) -> Vec<Candidate> {
    scored.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then(a.identity_seq.cmp(&b.identity_seq))
    });
    scored.truncate(k);
    scored
}

/// Thread-safe handle to the active backend.
///
/// Mutations take the write lock, so they are serialized and a concurrent
/// `search` observes either the whole mutation or none of it.
pub struct SharedIndex {
    inner: RwLock<Box<dyn VectorIndex>>,
}

impl SharedIndex {
    pub fn new(index: Box<dyn VectorIndex>) -> Self {
        Self {
            inner: RwLock::new(index),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Box<dyn VectorIndex>> {
        // Mutations validate before touching state, so a poisoned guard
        // still holds a consistent index.
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Box<dyn VectorIndex>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn backend(&self) -> IndexBackend {
        self.read().backend()
    }

    pub fn dim(&self) -> usize {
        self.read().dim()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn contains(&self, identity_id: &str) -> bool {
        self.read().contains(identity_id)
    }

    pub fn search(&self, query: &Embedding, k: usize) -> Result<Vec<Candidate>, IndexError> {
        self.read().search(query, k)
    }

    /// Insert a batch (one enrollment) under a single write lock.
    pub fn insert_all(&self, entries: Vec<IndexEntry>) -> Result<(), IndexError> {
        let mut index = self.write();
        for entry in &entries {
            check_dim(index.dim(), &entry.embedding)?;
        }
        for entry in entries {
            index.insert(entry)?;
        }
        Ok(())
    }

    pub fn remove(&self, identity_id: &str) -> usize {
        let removed = self.write().remove(identity_id);
        tracing::debug!(identity = identity_id, removed, "index entries removed");
        removed
    }

    pub fn update(&self, identity_id: &str, entries: Vec<IndexEntry>) -> Result<(), IndexError> {
        self.write().update(identity_id, entries)
    }

    pub fn rebuild_from(&self, entries: Vec<IndexEntry>) -> Result<(), IndexError> {
        let count = entries.len();
        self.write().rebuild_from(entries)?;
        tracing::info!(entries = count, "index rebuilt");
        Ok(())
    }

    pub fn entries(&self) -> Vec<IndexEntry> {
        self.read().entries()
    }
}

//! The enrolled gallery: record store plus the index derived from it.
//!
//! Every gallery mutation (enroll, re-enroll, delete, rebuild) runs under one
//! writer mutex, store first and index second. Searches never take that
//! mutex; they only see the index's own read/write lock, so they observe
//! each index mutation whole. Between the store commit and the index update
//! the index may lag the store. Recognition detects that and answers from
//! the store instead.

use crate::index::{IndexBackend, IndexError, SharedIndex};
use crate::snapshot::{self, SnapshotWriter};
use crate::store::{Store, StoreError};
use crate::types::{Embedding, Identity, IndexEntry, NewIdentity, Provenance};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("failed to start snapshot writer: {0}")]
    SnapshotThread(#[from] std::io::Error),
}

/// Where the index came from at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSource {
    Snapshot,
    Rebuilt,
}

pub struct Gallery {
    store: Arc<Store>,
    index: Arc<SharedIndex>,
    writer: Mutex<()>,
    snapshots: Mutex<Option<SnapshotWriter>>,
}

impl Gallery {
    /// Build the index for `store`, preferring a snapshot at `snapshot_path`
    /// when it agrees with the store, and start the snapshot writer.
    pub fn load(
        store: Arc<Store>,
        backend: IndexBackend,
        dim: usize,
        snapshot_path: Option<PathBuf>,
    ) -> Result<(Self, IndexSource), GalleryError> {
        let index = Arc::new(SharedIndex::new(backend.build(dim)));

        let from_snapshot = match &snapshot_path {
            Some(path) => load_snapshot(&store, &index, path, dim)?,
            None => false,
        };
        let source = if from_snapshot {
            IndexSource::Snapshot
        } else {
            index.rebuild_from(store.all_entries()?)?;
            IndexSource::Rebuilt
        };

        let snapshots = match snapshot_path {
            Some(path) => Some(SnapshotWriter::spawn(Arc::clone(&index), path)?),
            None => None,
        };

        tracing::info!(
            backend = backend.as_str(),
            entries = index.len(),
            source = ?source,
            "gallery loaded"
        );

        let gallery = Self {
            store,
            index,
            writer: Mutex::new(()),
            snapshots: Mutex::new(snapshots),
        };
        if source == IndexSource::Rebuilt {
            gallery.request_snapshot();
        }
        Ok((gallery, source))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn index(&self) -> &Arc<SharedIndex> {
        &self.index
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_snapshot(&self) {
        let snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(writer) = snapshots.as_ref() {
            writer.request();
        }
    }

    /// Enroll a new identity with its embeddings.
    pub fn enroll(
        &self,
        identity: &NewIdentity,
        embeddings: Vec<(Embedding, Provenance)>,
        now: DateTime<Utc>,
    ) -> Result<Identity, GalleryError> {
        let _writer = self.lock_writer();
        let stored = self.store.insert_identity(identity, &embeddings, now)?;
        self.index_new(&stored, embeddings)?;
        Ok(stored)
    }

    /// Add embeddings to an already enrolled identity.
    pub fn add_embeddings(
        &self,
        identity_id: &str,
        embeddings: Vec<(Embedding, Provenance)>,
        now: DateTime<Utc>,
    ) -> Result<Identity, GalleryError> {
        let _writer = self.lock_writer();
        let stored = self.store.add_embeddings(identity_id, &embeddings, now)?;
        self.index_new(&stored, embeddings)?;
        Ok(stored)
    }

    fn index_new(
        &self,
        identity: &Identity,
        embeddings: Vec<(Embedding, Provenance)>,
    ) -> Result<(), GalleryError> {
        let entries = embeddings
            .into_iter()
            .map(|(embedding, _)| IndexEntry {
                identity_id: identity.id.clone(),
                identity_seq: identity.seq,
                embedding,
            })
            .collect();

        if let Err(err) = self.index.insert_all(entries) {
            // The store already committed; bring the index back in line with it.
            tracing::error!(identity = %identity.id, error = %err, "index insert failed; rebuilding");
            self.rebuild_locked()?;
        }
        self.request_snapshot();
        Ok(())
    }

    /// Delete an identity and compact it out of the index before returning.
    pub fn delete(&self, identity_id: &str) -> Result<bool, GalleryError> {
        let _writer = self.lock_writer();
        let existed = self.store.delete_identity(identity_id)?;
        let removed = self.index.remove(identity_id);
        if existed || removed > 0 {
            self.request_snapshot();
        }
        Ok(existed)
    }

    /// Discard the index and rebuild it from the store.
    pub fn rebuild(&self) -> Result<usize, GalleryError> {
        let _writer = self.lock_writer();
        self.rebuild_locked()
    }

    fn rebuild_locked(&self) -> Result<usize, GalleryError> {
        let entries = self.store.all_entries()?;
        let count = entries.len();
        self.index.rebuild_from(entries)?;
        self.request_snapshot();
        Ok(count)
    }

    /// Recheck index against store once in-flight mutations finish, and
    /// rebuild if they still disagree. Returns whether a rebuild happened.
    ///
    /// Compares the owner of every entry, so a delete followed by a
    /// re-enrollment under the same id is caught even when counts match.
    pub fn reconcile(&self) -> Result<bool, GalleryError> {
        let _writer = self.lock_writer();
        let mut stored = self.store.entry_owner_seqs()?;
        let mut indexed: Vec<i64> = self.index.entries().iter().map(|e| e.identity_seq).collect();
        stored.sort_unstable();
        indexed.sort_unstable();
        if stored == indexed {
            return Ok(false);
        }
        tracing::warn!(
            stored = stored.len(),
            indexed = indexed.len(),
            "index disagrees with store; forcing rebuild"
        );
        self.rebuild_locked()?;
        Ok(true)
    }

    /// Entry counts agree right now. Advisory: may race with a mutation.
    pub fn is_consistent(&self) -> Result<bool, GalleryError> {
        Ok(self.store.embedding_count()? == self.index.len())
    }

    /// Stop the snapshot writer and persist the final index state.
    pub fn flush(&self) {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut writer) = snapshots.take() {
            if let Err(err) = writer.flush() {
                tracing::warn!(error = %err, path = %writer.path().display(), "final index snapshot failed");
            }
        }
    }
}

/// Load the snapshot into `index` if it matches the store entry for entry.
fn load_snapshot(
    store: &Store,
    index: &SharedIndex,
    path: &std::path::Path,
    dim: usize,
) -> Result<bool, GalleryError> {
    let entries = match snapshot::read_snapshot(path, dim) {
        Ok(Some(entries)) => entries,
        Ok(None) => return Ok(false),
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "ignoring unreadable index snapshot");
            return Ok(false);
        }
    };

    let owners = store.entry_owner_seqs()?;
    let matches = owners.len() == entries.len()
        && owners
            .iter()
            .zip(entries.iter())
            .all(|(seq, entry)| *seq == entry.identity_seq);
    if !matches {
        tracing::warn!(
            snapshot = entries.len(),
            stored = owners.len(),
            "index snapshot is stale; rebuilding from store"
        );
        return Ok(false);
    }

    index.rebuild_from(entries)?;
    Ok(true)
}

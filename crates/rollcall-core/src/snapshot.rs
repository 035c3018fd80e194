//! Durable snapshots of the vector index.
//!
//! A snapshot is a JSON file holding the entries in insertion order plus a
//! SHA-256 over their contents. Writes go to a sibling temp file and are
//! renamed into place, so readers never observe a torn snapshot.
//!
//! Persistence is best effort. A failed write is logged and the in-memory
//! index stays as it is; anything lost is recoverable by rebuilding from the
//! record store.

use crate::index::SharedIndex;
use crate::types::IndexEntry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported snapshot version {0}")]
    Version(u32),
    #[error("snapshot holds {actual}-dim vectors, index expects {expected}")]
    Dimension { expected: usize, actual: usize },
    #[error("snapshot checksum mismatch")]
    Checksum,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    dimension: usize,
    checksum: String,
    entries: Vec<IndexEntry>,
}

fn checksum(entries: &[IndexEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update((entry.identity_id.len() as u64).to_le_bytes());
        hasher.update(entry.identity_id.as_bytes());
        hasher.update(entry.identity_seq.to_le_bytes());
        for value in entry.embedding.values() {
            hasher.update(value.to_le_bytes());
        }
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Atomically write `entries` to `path`.
pub fn write_snapshot(path: &Path, dimension: usize, entries: Vec<IndexEntry>) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = SnapshotFile {
        version: SNAPSHOT_VERSION,
        dimension,
        checksum: checksum(&entries),
        entries,
    };

    let tmp = path.with_extension("tmp");
    let mut out = File::create(&tmp)?;
    out.write_all(&serde_json::to_vec(&file)?)?;
    out.sync_all()?;
    drop(out);
    std::fs::rename(&tmp, path)?;

    // Persist the rename itself.
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// Read a snapshot written by [`write_snapshot`]. `Ok(None)` if there is none.
pub fn read_snapshot(path: &Path, dimension: usize) -> Result<Option<Vec<IndexEntry>>, SnapshotError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let file: SnapshotFile = serde_json::from_slice(&bytes)?;
    if file.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::Version(file.version));
    }
    if file.dimension != dimension {
        return Err(SnapshotError::Dimension {
            expected: dimension,
            actual: file.dimension,
        });
    }
    if let Some(bad) = file.entries.iter().find(|e| e.embedding.dim() != dimension) {
        return Err(SnapshotError::Dimension {
            expected: dimension,
            actual: bad.embedding.dim(),
        });
    }
    if checksum(&file.entries) != file.checksum {
        return Err(SnapshotError::Checksum);
    }

    Ok(Some(file.entries))
}

fn persist(index: &SharedIndex, path: &Path) -> Result<usize, SnapshotError> {
    // Copy out under the read lock, serialize without it.
    let entries = index.entries();
    let count = entries.len();
    write_snapshot(path, index.dim(), entries)?;
    Ok(count)
}

/// Background snapshot writer.
///
/// [`request`](Self::request) never blocks: it drops a signal into a channel
/// of capacity one. When a signal is already pending the request coalesces
/// with it, which is enough because the writer serializes whatever the index
/// holds at write time.
pub struct SnapshotWriter {
    index: Arc<SharedIndex>,
    path: PathBuf,
    tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SnapshotWriter {
    pub fn spawn(index: Arc<SharedIndex>, path: PathBuf) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<()>(1);

        let handle = {
            let index = Arc::clone(&index);
            let path = path.clone();
            std::thread::Builder::new()
                .name("rollcall-snapshot".into())
                .spawn(move || {
                    tracing::debug!(path = %path.display(), "snapshot writer started");
                    while rx.blocking_recv().is_some() {
                        match persist(&index, &path) {
                            Ok(entries) => {
                                tracing::debug!(entries, path = %path.display(), "index snapshot written")
                            }
                            Err(err) => tracing::warn!(
                                error = %err,
                                path = %path.display(),
                                "index snapshot failed; in-memory index unaffected"
                            ),
                        }
                    }
                    tracing::debug!("snapshot writer exiting");
                })?
        };

        Ok(Self {
            index,
            path,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ask for a snapshot of the current index state.
    pub fn request(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
            Err(mpsc::error::TrySendError::Closed(())) => {
                tracing::warn!("snapshot writer is gone; snapshot skipped");
            }
        }
    }

    /// Stop the writer thread and write one final snapshot synchronously.
    pub fn flush(&mut self) -> Result<(), SnapshotError> {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("snapshot writer thread panicked");
            }
        }
        let entries = persist(&self.index, &self.path)?;
        tracing::info!(entries, path = %self.path.display(), "index snapshot flushed");
        Ok(())
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        if self.tx.is_some() {
            if let Err(err) = self.flush() {
                tracing::warn!(error = %err, "final index snapshot failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexBackend;
    use crate::types::tests::{basis, entry};

    fn sample() -> Vec<IndexEntry> {
        vec![entry("a", 1, basis(4, 0)), entry("b", 2, basis(4, 3))]
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_snapshot(&dir.path().join("index.json"), 4).unwrap().is_none());
    }

    #[test]
    fn test_written_snapshot_reads_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("index.json");
        write_snapshot(&path, 4, sample()).unwrap();

        let entries = read_snapshot(&path, 4).unwrap().unwrap();
        assert_eq!(entries, sample());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_overwrite_replaces_snapshot_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        write_snapshot(&path, 4, sample()).unwrap();
        write_snapshot(&path, 4, sample()[..1].to_vec()).unwrap();

        assert_eq!(read_snapshot(&path, 4).unwrap().unwrap().len(), 1);
        assert!(!path.with_extension("tmp").exists());
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("index.json")]);
    }

    #[test]
    fn test_tampered_snapshot_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        write_snapshot(&path, 4, sample()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("\"b\"", "\"c\"")).unwrap();
        assert!(matches!(read_snapshot(&path, 4), Err(SnapshotError::Checksum)));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        write_snapshot(&path, 4, sample()).unwrap();
        assert!(matches!(
            read_snapshot(&path, 512),
            Err(SnapshotError::Dimension { expected: 512, actual: 4 })
        ));
    }

    #[test]
    fn test_writer_persists_latest_state_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let index = Arc::new(SharedIndex::new(IndexBackend::Keyed.build(4)));
        let mut writer = SnapshotWriter::spawn(Arc::clone(&index), path.clone()).unwrap();

        index.insert_all(sample()).unwrap();
        for _ in 0..10 {
            writer.request();
        }
        index.remove("a");
        writer.request();
        writer.flush().unwrap();

        let entries = read_snapshot(&path, 4).unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].identity_id, "b");

        // Requests after flush are ignored.
        writer.request();
    }

    #[test]
    fn test_write_failure_does_not_touch_index() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("index.json");
        std::fs::create_dir_all(&path).unwrap();

        let index = Arc::new(SharedIndex::new(IndexBackend::Flat.build(4)));
        index.insert_all(sample()).unwrap();
        let mut writer = SnapshotWriter::spawn(Arc::clone(&index), path).unwrap();
        writer.request();
        assert!(writer.flush().is_err());
        assert_eq!(index.len(), 2);
    }
}

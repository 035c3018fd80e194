//! SQLite record store: identities, their embeddings and attendance segments.
//!
//! This is the source of truth. The vector index is rebuilt from
//! [`Store::all_entries`] whenever it cannot be trusted.
//!
//! Deleting an identity cascades to its embeddings and its whole attendance
//! history; nothing is archived.

use crate::attendance::{DailyCount, HistoryFilter, Segment, Transition};
use crate::types::{Embedding, EmbeddingRecord, Identity, IndexEntry, NewIdentity, Provenance};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity already exists: {0}")]
    AlreadyExists(String),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("invalid database value: {0}")]
    InvalidDbValue(String),
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS identities (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    department TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_seq INTEGER NOT NULL REFERENCES identities(seq) ON DELETE CASCADE,
    provenance TEXT NOT NULL CHECK(provenance IN ('original', 'synthetic')),
    dimension INTEGER NOT NULL,
    vector BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_identity ON embeddings(identity_seq);

CREATE TABLE IF NOT EXISTS attendance_segments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_seq INTEGER NOT NULL REFERENCES identities(seq) ON DELETE CASCADE,
    log_date TEXT NOT NULL,
    in_time INTEGER NOT NULL,
    out_time INTEGER,
    duration_hours REAL,
    clamped INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_segments_key ON attendance_segments(identity_seq, log_date);
CREATE INDEX IF NOT EXISTS idx_segments_date ON attendance_segments(log_date);
";

const DATE_FORMAT: &str = "%Y-%m-%d";

const SEGMENT_COLUMNS: &str = "s.id, s.identity_seq, i.id, i.name, i.department,
     s.log_date, s.in_time, s.out_time, s.duration_hours, s.clamped";

/// SQLite-backed store. One connection, guarded by a mutex.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::init(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "record store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Every write runs inside a transaction, so a poisoned guard still
        // wraps a consistent database.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an identity together with all of its embeddings, atomically.
    pub fn insert_identity(
        &self,
        identity: &NewIdentity,
        embeddings: &[(Embedding, Provenance)],
        now: DateTime<Utc>,
    ) -> Result<Identity> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM identities WHERE id = ?1)",
            params![identity.id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::AlreadyExists(identity.id.clone()));
        }

        tx.execute(
            "INSERT INTO identities (id, name, department, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![identity.id, identity.name, identity.department, now.timestamp_millis()],
        )?;
        let seq = tx.last_insert_rowid();
        insert_embeddings(&tx, seq, embeddings, now)?;
        tx.commit()?;

        Ok(Identity {
            seq,
            id: identity.id.clone(),
            name: identity.name.clone(),
            department: identity.department.clone(),
            created_at: millis_to_datetime(now.timestamp_millis())?,
        })
    }

    /// Append embeddings to an existing identity (re-enrollment), atomically.
    pub fn add_embeddings(
        &self,
        identity_id: &str,
        embeddings: &[(Embedding, Provenance)],
        now: DateTime<Utc>,
    ) -> Result<Identity> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let identity = tx
            .query_row(
                "SELECT seq, id, name, department, created_at FROM identities WHERE id = ?1",
                params![identity_id],
                identity_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(identity_id.to_string()))?;
        let identity = decode_identity(identity)?;

        insert_embeddings(&tx, identity.seq, embeddings, now)?;
        tx.commit()?;
        Ok(identity)
    }

    pub fn identity(&self, identity_id: &str) -> Result<Option<Identity>> {
        self.conn()
            .query_row(
                "SELECT seq, id, name, department, created_at FROM identities WHERE id = ?1",
                params![identity_id],
                identity_row,
            )
            .optional()?
            .map(decode_identity)
            .transpose()
    }

    /// All identities, earliest enrollment first.
    pub fn identities(&self) -> Result<Vec<Identity>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT seq, id, name, department, created_at FROM identities ORDER BY seq",
        )?;
        let rows = stmt.query_map([], identity_row)?;
        rows.map(|row| decode_identity(row?)).collect()
    }

    /// Identities with the number of embeddings each owns.
    pub fn identity_summaries(&self) -> Result<Vec<(Identity, usize)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT i.seq, i.id, i.name, i.department, i.created_at, COUNT(e.id)
             FROM identities i LEFT JOIN embeddings e ON e.identity_seq = i.seq
             GROUP BY i.seq ORDER BY i.seq",
        )?;
        let rows = stmt.query_map([], |row| Ok((identity_row(row)?, row.get::<_, i64>(5)?)))?;
        rows.map(|row| {
            let (identity, count) = row?;
            Ok((decode_identity(identity)?, count as usize))
        })
        .collect()
    }

    /// Delete an identity, its embeddings and its attendance history.
    /// Returns `false` if it did not exist.
    pub fn delete_identity(&self, identity_id: &str) -> Result<bool> {
        let deleted = self
            .conn()
            .execute("DELETE FROM identities WHERE id = ?1", params![identity_id])?;
        Ok(deleted > 0)
    }

    pub fn identity_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn embedding_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Every stored embedding, in insertion order.
    pub fn all_entries(&self) -> Result<Vec<IndexEntry>> {
        Ok(self
            .records("", params![])?
            .into_iter()
            .map(IndexEntry::from)
            .collect())
    }

    /// Owner seq of every stored embedding, in insertion order. Lets a
    /// snapshot be checked against the store without decoding vectors.
    pub fn entry_owner_seqs(&self) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT identity_seq FROM embeddings ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }

    pub fn embeddings_of(&self, identity_id: &str) -> Result<Vec<EmbeddingRecord>> {
        self.records("WHERE i.id = ?1", params![identity_id])
    }

    fn records(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<EmbeddingRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT e.id, e.identity_seq, i.id, e.provenance, e.dimension, e.vector, e.created_at
             FROM embeddings e JOIN identities i ON i.seq = e.identity_seq
             {filter} ORDER BY e.id"
        ))?;
        let rows = stmt.query_map(args, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Vec<u8>>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        rows.map(|row| {
            let (id, identity_seq, identity_id, provenance, dimension, blob, created_at) = row?;
            let provenance = Provenance::parse(&provenance)
                .ok_or_else(|| StoreError::InvalidDbValue(format!("provenance {provenance:?}")))?;
            let values = decode_vector_blob(&blob, dimension as usize)?;
            let embedding = Embedding::normalized(values, dimension as usize)
                .map_err(|e| StoreError::InvalidDbValue(format!("embedding {id}: {e}")))?;
            Ok(EmbeddingRecord {
                id,
                identity_seq,
                identity_id,
                embedding,
                provenance,
                created_at: millis_to_datetime(created_at)?,
            })
        })
        .collect()
    }

    /// Read the latest segment of (identity, date), let `decide` pick the
    /// transition and apply it, all in one transaction.
    pub(crate) fn apply_transition(
        &self,
        identity_seq: i64,
        date: NaiveDate,
        decide: impl FnOnce(Option<&Segment>) -> Transition,
    ) -> Result<(Transition, Segment)> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let date_text = date.format(DATE_FORMAT).to_string();

        let latest = latest_segment(&tx, identity_seq, &date_text)?;
        let transition = decide(latest.as_ref());

        let segment_id = match transition {
            Transition::Open { at } => {
                tx.execute(
                    "INSERT INTO attendance_segments (identity_seq, log_date, in_time)
                     VALUES (?1, ?2, ?3)",
                    params![identity_seq, date_text, at.timestamp_millis()],
                )?;
                tx.last_insert_rowid()
            }
            Transition::Close {
                segment_id,
                at,
                duration_hours,
                clamped,
            } => {
                tx.execute(
                    "UPDATE attendance_segments
                     SET out_time = ?2, duration_hours = ?3, clamped = ?4
                     WHERE id = ?1 AND out_time IS NULL",
                    params![segment_id, at.timestamp_millis(), duration_hours, clamped],
                )?;
                segment_id
            }
            Transition::Duplicate => match &latest {
                Some(segment) => segment.id,
                None => {
                    return Err(StoreError::InvalidDbValue(
                        "duplicate transition without a prior segment".into(),
                    ))
                }
            },
        };

        let segment = tx.query_row(
            &format!(
                "SELECT {SEGMENT_COLUMNS} FROM attendance_segments s
                 JOIN identities i ON i.seq = s.identity_seq WHERE s.id = ?1"
            ),
            params![segment_id],
            segment_row,
        )?;
        tx.commit()?;

        Ok((transition, decode_segment(segment)?))
    }

    /// All segments dated `date`, oldest first.
    pub fn segments_on(&self, date: NaiveDate) -> Result<Vec<Segment>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM attendance_segments s
             JOIN identities i ON i.seq = s.identity_seq
             WHERE s.log_date = ?1 ORDER BY s.id"
        ))?;
        let rows = stmt.query_map(params![date.format(DATE_FORMAT).to_string()], segment_row)?;
        rows.map(|row| decode_segment(row?)).collect()
    }

    /// Filtered segments, newest date first and latest arrival first within a
    /// date, plus the total number of matches ignoring pagination.
    pub fn history(
        &self,
        filter: &HistoryFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Segment>, usize)> {
        let conn = self.conn();
        let from = filter.from.map(|d| d.format(DATE_FORMAT).to_string());
        let to = filter.to.map(|d| d.format(DATE_FORMAT).to_string());
        let predicate = "(?1 IS NULL OR i.id = ?1)
             AND (?2 IS NULL OR s.log_date >= ?2)
             AND (?3 IS NULL OR s.log_date <= ?3)";

        let total: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM attendance_segments s
                 JOIN identities i ON i.seq = s.identity_seq WHERE {predicate}"
            ),
            params![filter.identity_id, from, to],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM attendance_segments s
             JOIN identities i ON i.seq = s.identity_seq
             WHERE {predicate}
             ORDER BY s.log_date DESC, s.in_time DESC, s.id DESC
             LIMIT ?4 OFFSET ?5"
        ))?;
        let rows = stmt.query_map(
            params![filter.identity_id, from, to, limit as i64, offset as i64],
            segment_row,
        )?;
        let segments = rows
            .map(|row| decode_segment(row?))
            .collect::<Result<Vec<_>>>()?;

        Ok((segments, total as usize))
    }

    /// Per-date segment counts, newest date first.
    pub fn daily_aggregate(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<DailyCount>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT log_date,
                    COUNT(*),
                    COUNT(DISTINCT identity_seq),
                    SUM(CASE WHEN out_time IS NULL THEN 1 ELSE 0 END),
                    SUM(CASE WHEN out_time IS NULL THEN 0 ELSE 1 END),
                    COALESCE(SUM(duration_hours), 0.0)
             FROM attendance_segments
             WHERE (?1 IS NULL OR log_date >= ?1) AND (?2 IS NULL OR log_date <= ?2)
             GROUP BY log_date ORDER BY log_date DESC",
        )?;
        let rows = stmt.query_map(
            params![
                from.map(|d| d.format(DATE_FORMAT).to_string()),
                to.map(|d| d.format(DATE_FORMAT).to_string())
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, f64>(5)?,
                ))
            },
        )?;

        rows.map(|row| {
            let (date, segments, identities, open, closed, total_hours) = row?;
            Ok(DailyCount {
                date: parse_date(&date)?,
                segments: segments as usize,
                identities: identities as usize,
                open: open as usize,
                closed: closed as usize,
                total_hours,
            })
        })
        .collect()
    }
}

fn insert_embeddings(
    tx: &rusqlite::Transaction<'_>,
    identity_seq: i64,
    embeddings: &[(Embedding, Provenance)],
    now: DateTime<Utc>,
) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO embeddings (identity_seq, provenance, dimension, vector, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (embedding, provenance) in embeddings {
        stmt.execute(params![
            identity_seq,
            provenance.as_str(),
            embedding.dim() as i64,
            encode_vector_blob(embedding.values()),
            now.timestamp_millis()
        ])?;
    }
    Ok(())
}

fn latest_segment(
    tx: &rusqlite::Transaction<'_>,
    identity_seq: i64,
    date_text: &str,
) -> Result<Option<Segment>> {
    tx.query_row(
        &format!(
            "SELECT {SEGMENT_COLUMNS} FROM attendance_segments s
             JOIN identities i ON i.seq = s.identity_seq
             WHERE s.identity_seq = ?1 AND s.log_date = ?2
             ORDER BY s.id DESC LIMIT 1"
        ),
        params![identity_seq, date_text],
        segment_row,
    )
    .optional()?
    .map(decode_segment)
    .transpose()
}

type IdentityRow = (i64, String, String, String, i64);

fn identity_row(row: &Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_identity((seq, id, name, department, created_at): IdentityRow) -> Result<Identity> {
    Ok(Identity {
        seq,
        id,
        name,
        department,
        created_at: millis_to_datetime(created_at)?,
    })
}

struct SegmentRow {
    id: i64,
    identity_seq: i64,
    identity_id: String,
    name: String,
    department: String,
    date: String,
    in_time: i64,
    out_time: Option<i64>,
    duration_hours: Option<f64>,
    clamped: bool,
}

fn segment_row(row: &Row<'_>) -> rusqlite::Result<SegmentRow> {
    Ok(SegmentRow {
        id: row.get(0)?,
        identity_seq: row.get(1)?,
        identity_id: row.get(2)?,
        name: row.get(3)?,
        department: row.get(4)?,
        date: row.get(5)?,
        in_time: row.get(6)?,
        out_time: row.get(7)?,
        duration_hours: row.get(8)?,
        clamped: row.get(9)?,
    })
}

fn decode_segment(row: SegmentRow) -> Result<Segment> {
    Ok(Segment {
        id: row.id,
        identity_seq: row.identity_seq,
        identity_id: row.identity_id,
        name: row.name,
        department: row.department,
        date: parse_date(&row.date)?,
        in_time: millis_to_datetime(row.in_time)?,
        out_time: row.out_time.map(millis_to_datetime).transpose()?,
        duration_hours: row.duration_hours,
        clamped: row.clamped,
    })
}

fn parse_date(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .map_err(|e| StoreError::InvalidDbValue(format!("date {text:?}: {e}")))
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::InvalidDbValue(format!("timestamp {ms} out of range")))
}

fn encode_vector_blob(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vector_blob(blob: &[u8], dimension: usize) -> Result<Vec<f32>> {
    if blob.len() != dimension * std::mem::size_of::<f32>() {
        return Err(StoreError::InvalidDbValue(format!(
            "vector blob is {} bytes, expected {}",
            blob.len(),
            dimension * std::mem::size_of::<f32>()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::basis;
    use chrono::TimeZone;

    fn person(id: &str) -> NewIdentity {
        NewIdentity {
            id: id.into(),
            name: format!("Name {id}"),
            department: "Ops".into(),
        }
    }

    fn originals(axes: &[usize]) -> Vec<(Embedding, Provenance)> {
        axes.iter()
            .map(|&a| (basis(8, a), Provenance::Original))
            .collect()
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn test_insert_and_enumerate() {
        let store = Store::open_in_memory().unwrap();
        let a = store.insert_identity(&person("a"), &originals(&[0, 1]), at(8)).unwrap();
        let b = store.insert_identity(&person("b"), &originals(&[2]), at(9)).unwrap();
        assert!(a.seq < b.seq);

        assert_eq!(store.identity_count().unwrap(), 2);
        assert_eq!(store.embedding_count().unwrap(), 3);

        let entries = store.all_entries().unwrap();
        let owners: Vec<_> = entries.iter().map(|e| e.identity_id.as_str()).collect();
        assert_eq!(owners, vec!["a", "a", "b"]);
        assert!((entries[2].embedding.similarity(&basis(8, 2)) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_duplicate_identity_rejected_without_partial_write() {
        let store = Store::open_in_memory().unwrap();
        store.insert_identity(&person("a"), &originals(&[0]), at(8)).unwrap();
        let err = store
            .insert_identity(&person("a"), &originals(&[1, 2]), at(9))
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == "a"));
        assert_eq!(store.embedding_count().unwrap(), 1);
    }

    #[test]
    fn test_add_embeddings_keeps_provenance() {
        let store = Store::open_in_memory().unwrap();
        store.insert_identity(&person("a"), &originals(&[0]), at(8)).unwrap();
        store
            .add_embeddings("a", &[(basis(8, 4), Provenance::Synthetic)], at(10))
            .unwrap();

        let records = store.embeddings_of("a").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].provenance, Provenance::Synthetic);

        let err = store.add_embeddings("zz", &originals(&[0]), at(10)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_delete_cascades_to_embeddings_and_segments() {
        let store = Store::open_in_memory().unwrap();
        let a = store.insert_identity(&person("a"), &originals(&[0, 1]), at(8)).unwrap();
        store.insert_identity(&person("b"), &originals(&[2]), at(8)).unwrap();
        let date = at(9).date_naive();
        store
            .apply_transition(a.seq, date, |_| Transition::Open { at: at(9) })
            .unwrap();

        assert!(store.delete_identity("a").unwrap());
        assert!(!store.delete_identity("a").unwrap());
        assert_eq!(store.embedding_count().unwrap(), 1);
        assert!(store.segments_on(date).unwrap().is_empty());
        assert!(store.identity("a").unwrap().is_none());
    }

    #[test]
    fn test_seq_not_reused_after_delete() {
        let store = Store::open_in_memory().unwrap();
        let first = store.insert_identity(&person("a"), &originals(&[0]), at(8)).unwrap();
        store.delete_identity("a").unwrap();
        let second = store.insert_identity(&person("b"), &originals(&[0]), at(8)).unwrap();
        assert!(second.seq > first.seq);
    }

    #[test]
    fn test_identity_summaries_count_embeddings() {
        let store = Store::open_in_memory().unwrap();
        store.insert_identity(&person("a"), &originals(&[0, 1, 2]), at(8)).unwrap();
        store.insert_identity(&person("b"), &originals(&[3]), at(8)).unwrap();
        let summaries = store.identity_summaries().unwrap();
        let counts: Vec<_> = summaries.iter().map(|(i, n)| (i.id.as_str(), *n)).collect();
        assert_eq!(counts, vec![("a", 3), ("b", 1)]);
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rollcall.db");
        {
            let store = Store::open(&path).unwrap();
            store.insert_identity(&person("a"), &originals(&[0]), at(8)).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.embedding_count().unwrap(), 1);
    }

    #[test]
    fn test_vector_blob_length_checked() {
        assert!(decode_vector_blob(&[0u8; 7], 2).is_err());
        let round = decode_vector_blob(&encode_vector_blob(&[0.5, -2.0]), 2).unwrap();
        assert_eq!(round, vec![0.5, -2.0]);
    }
}

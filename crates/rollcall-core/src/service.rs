//! The `Rollcall` facade: enrollment, recognition and attendance behind one
//! handle. The store, gallery, engine and ledger are built here and shared
//! through `Arc`; nothing lives in globals.

use crate::attendance::{
    AttendanceLedger, AttendanceStats, HistoryFilter, HistoryPage, LedgerError, Page,
    PresenceStatus, TodaySnapshot,
};
use crate::gallery::{Gallery, GalleryError};
use crate::index::IndexBackend;
use crate::recognition::{
    MatchPath, Recognition, RecognitionEngine, RecognitionError, UnrecognizedReason,
    DEFAULT_THRESHOLD,
};
use crate::store::{Store, StoreError};
use crate::types::{Embedding, NewIdentity, Provenance, EMBEDDING_DIM};
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Upper bound on images accepted by one enrollment request.
pub const DEFAULT_MAX_IMAGES: usize = 50;

#[derive(Debug, Clone)]
pub struct RollcallConfig {
    pub dimension: usize,
    /// Cosine similarity a match must strictly exceed.
    pub threshold: f32,
    pub max_images: usize,
    pub backend: IndexBackend,
    /// Offset used to assign events to calendar dates.
    pub utc_offset: FixedOffset,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for RollcallConfig {
    fn default() -> Self {
        Self {
            dimension: EMBEDDING_DIM,
            threshold: DEFAULT_THRESHOLD,
            max_images: DEFAULT_MAX_IMAGES,
            backend: IndexBackend::Flat,
            utc_offset: Utc.fix(),
            snapshot_path: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("embedding extraction failed: {0}")]
    Failed(String),
}

/// Turns one image into a raw (not yet normalized) face embedding.
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> Result<Vec<f32>, ExtractError>;
}

/// Produces synthetic variants (flips, lighting, small rotations) of
/// enrollment images. Returns only the additions, never the inputs.
pub trait Augmenter: Send + Sync {
    fn expand(&self, images: &[Vec<u8>]) -> Vec<Vec<u8>>;
}

/// Errors reported to callers of [`Rollcall`].
#[derive(Error, Debug)]
pub enum RollcallError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("identity already exists: {0}")]
    AlreadyExists(String),
    #[error("no face detected in any image")]
    NoFaceDetected,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for RollcallError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(id) => Self::AlreadyExists(id),
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<GalleryError> for RollcallError {
    fn from(err: GalleryError) -> Self {
        match err {
            GalleryError::Store(err) => err.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<RecognitionError> for RollcallError {
    fn from(err: RecognitionError) -> Self {
        match err {
            RecognitionError::InvalidQuery(err) => Self::Validation(err.to_string()),
            RecognitionError::Gallery(err) => err.into(),
        }
    }
}

impl From<LedgerError> for RollcallError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Store(err) => err.into(),
        }
    }
}

/// What one enrollment call stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Enrollment {
    pub identity_id: String,
    pub original: usize,
    pub synthetic: usize,
    /// Input images with no detectable face.
    pub skipped: usize,
}

impl Enrollment {
    pub fn total(&self) -> usize {
        self.original + self.synthetic
    }
}

/// Recognition outcome plus the attendance transition it caused.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecognitionResult {
    Recognized {
        identity_id: String,
        name: String,
        department: String,
        similarity: f32,
        path: MatchPath,
        status: PresenceStatus,
        at: DateTime<Utc>,
        date: NaiveDate,
        /// Set when this event closed a segment.
        duration_hours: Option<f64>,
        clamped: bool,
        duplicate: bool,
    },
    Unrecognized {
        reason: UnrecognizedReason,
        best_similarity: Option<f32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub identity_id: String,
    pub name: String,
    pub department: String,
    pub created_at: DateTime<Utc>,
    pub embeddings: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub identities: usize,
    pub embeddings: usize,
    pub index_entries: usize,
    pub backend: &'static str,
    pub consistent: bool,
    pub threshold: f32,
    pub dimension: usize,
}

pub struct Rollcall<E> {
    config: RollcallConfig,
    gallery: Arc<Gallery>,
    engine: RecognitionEngine,
    ledger: AttendanceLedger,
    extractor: E,
    augmenter: Option<Box<dyn Augmenter>>,
}

impl<E: EmbeddingExtractor> Rollcall<E> {
    /// Load the gallery (from snapshot when it matches the store, otherwise
    /// rebuilt) and wire up the engine and ledger.
    pub fn open(store: Arc<Store>, config: RollcallConfig, extractor: E) -> Result<Self, RollcallError> {
        if !(config.threshold.is_finite() && (-1.0..=1.0).contains(&config.threshold)) {
            return Err(RollcallError::Validation(format!(
                "threshold {} is outside [-1, 1]",
                config.threshold
            )));
        }
        if config.dimension == 0 {
            return Err(RollcallError::Validation("embedding dimension must be positive".into()));
        }

        let (gallery, _) = Gallery::load(
            Arc::clone(&store),
            config.backend,
            config.dimension,
            config.snapshot_path.clone(),
        )?;
        let gallery = Arc::new(gallery);

        Ok(Self {
            engine: RecognitionEngine::new(Arc::clone(&gallery), config.threshold),
            ledger: AttendanceLedger::new(store, config.utc_offset),
            gallery,
            extractor,
            augmenter: None,
            config,
        })
    }

    pub fn with_augmenter(mut self, augmenter: impl Augmenter + 'static) -> Self {
        self.augmenter = Some(Box::new(augmenter));
        self
    }

    pub fn config(&self) -> &RollcallConfig {
        &self.config
    }

    /// Enroll a new identity from one or more face images.
    pub fn enroll(
        &self,
        identity: NewIdentity,
        images: &[Vec<u8>],
        now: DateTime<Utc>,
    ) -> Result<Enrollment, RollcallError> {
        let identity = validate_identity(identity)?;
        self.check_image_count(images)?;

        // Extraction is the expensive part; fail fast on an obvious duplicate.
        // The store transaction still catches a concurrent one.
        if self.gallery.store().identity(&identity.id)?.is_some() {
            return Err(RollcallError::AlreadyExists(identity.id));
        }

        let (embeddings, mut enrollment) = self.embed_images(&identity.id, images)?;
        self.gallery.enroll(&identity, embeddings, now)?;

        tracing::info!(
            identity = %identity.id,
            original = enrollment.original,
            synthetic = enrollment.synthetic,
            skipped = enrollment.skipped,
            "identity enrolled"
        );
        enrollment.identity_id = identity.id;
        Ok(enrollment)
    }

    /// Add face images to an enrolled identity.
    pub fn add_images(
        &self,
        identity_id: &str,
        images: &[Vec<u8>],
        now: DateTime<Utc>,
    ) -> Result<Enrollment, RollcallError> {
        self.check_image_count(images)?;
        if self.gallery.store().identity(identity_id)?.is_none() {
            return Err(RollcallError::NotFound(identity_id.to_string()));
        }

        let (embeddings, enrollment) = self.embed_images(identity_id, images)?;
        self.gallery.add_embeddings(identity_id, embeddings, now)?;

        tracing::info!(
            identity = %identity_id,
            original = enrollment.original,
            synthetic = enrollment.synthetic,
            "embeddings added"
        );
        Ok(enrollment)
    }

    fn check_image_count(&self, images: &[Vec<u8>]) -> Result<(), RollcallError> {
        if images.is_empty() {
            return Err(RollcallError::Validation("at least one image is required".into()));
        }
        if images.len() > self.config.max_images {
            return Err(RollcallError::Validation(format!(
                "{} images exceeds the limit of {}",
                images.len(),
                self.config.max_images
            )));
        }
        Ok(())
    }

    fn embed_images(
        &self,
        identity_id: &str,
        images: &[Vec<u8>],
    ) -> Result<(Vec<(Embedding, Provenance)>, Enrollment), RollcallError> {
        let mut embeddings = Vec::with_capacity(images.len());
        let mut with_face = Vec::with_capacity(images.len());
        let mut skipped = 0;

        for (i, image) in images.iter().enumerate() {
            match self.extract(image) {
                Ok(embedding) => {
                    embeddings.push((embedding, Provenance::Original));
                    with_face.push(image.clone());
                }
                Err(ExtractError::NoFaceDetected) => {
                    tracing::info!(identity = %identity_id, image = i, "no face detected; image skipped");
                    skipped += 1;
                }
                Err(ExtractError::InvalidImage(msg)) => {
                    return Err(RollcallError::Validation(format!("image {i}: {msg}")));
                }
                Err(ExtractError::Failed(msg)) => {
                    return Err(RollcallError::Internal(format!("image {i}: {msg}")));
                }
            }
        }

        if embeddings.is_empty() {
            return Err(RollcallError::NoFaceDetected);
        }
        let original = embeddings.len();

        if let Some(augmenter) = &self.augmenter {
            for image in augmenter.expand(&with_face) {
                match self.extract(&image) {
                    Ok(embedding) => embeddings.push((embedding, Provenance::Synthetic)),
                    Err(err) => {
                        tracing::debug!(identity = %identity_id, error = %err, "synthetic image dropped");
                    }
                }
            }
        }

        let enrollment = Enrollment {
            identity_id: identity_id.to_string(),
            original,
            synthetic: embeddings.len() - original,
            skipped,
        };
        Ok((embeddings, enrollment))
    }

    /// Extract and normalize. A model producing vectors of the wrong shape
    /// is a deployment fault, not a bad request.
    fn extract(&self, image: &[u8]) -> Result<Embedding, ExtractError> {
        let raw = self.extractor.extract(image)?;
        Embedding::normalized(raw, self.config.dimension)
            .map_err(|err| ExtractError::Failed(format!("extractor output rejected: {err}")))
    }

    /// Recognize the face in `image` and record attendance at `at`.
    pub fn recognize(&self, image: &[u8], at: DateTime<Utc>) -> Result<RecognitionResult, RollcallError> {
        let probe = match self.extract(image) {
            Ok(probe) => probe,
            Err(ExtractError::NoFaceDetected) => return self.finish(Recognition::no_face(), at),
            Err(ExtractError::InvalidImage(msg)) => return Err(RollcallError::Validation(msg)),
            Err(ExtractError::Failed(msg)) => return Err(RollcallError::Internal(msg)),
        };
        let recognition = self.engine.recognize_embedding(&probe)?;
        self.finish(recognition, at)
    }

    /// Recognize a precomputed embedding and record attendance at `at`.
    pub fn recognize_embedding(
        &self,
        values: Vec<f32>,
        at: DateTime<Utc>,
    ) -> Result<RecognitionResult, RollcallError> {
        let recognition = self.engine.recognize(values)?;
        self.finish(recognition, at)
    }

    fn finish(&self, recognition: Recognition, at: DateTime<Utc>) -> Result<RecognitionResult, RollcallError> {
        match recognition {
            Recognition::Recognized {
                identity,
                similarity,
                path,
            } => {
                let event = self.ledger.record(&identity, at)?;
                let closed = event.status == PresenceStatus::Out;
                Ok(RecognitionResult::Recognized {
                    identity_id: identity.id,
                    name: identity.name,
                    department: identity.department,
                    similarity,
                    path,
                    status: event.status,
                    at: event.at,
                    date: event.segment.date,
                    duration_hours: if closed { event.segment.duration_hours } else { None },
                    clamped: closed && event.segment.clamped,
                    duplicate: event.duplicate,
                })
            }
            Recognition::Unrecognized {
                reason,
                best_similarity,
            } => {
                tracing::info!(reason = ?reason, best = ?best_similarity, "face not recognized");
                Ok(RecognitionResult::Unrecognized {
                    reason,
                    best_similarity,
                })
            }
        }
    }

    pub fn today(&self, now: DateTime<Utc>) -> Result<TodaySnapshot, RollcallError> {
        Ok(self.ledger.today_snapshot(now)?)
    }

    pub fn history(&self, filter: &HistoryFilter, page: Page) -> Result<HistoryPage, RollcallError> {
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(RollcallError::Validation(format!("range start {from} is after end {to}")));
            }
        }
        Ok(self.ledger.history(filter, page)?)
    }

    pub fn daily_aggregate(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<AttendanceStats, RollcallError> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(RollcallError::Validation(format!("range start {from} is after end {to}")));
            }
        }
        Ok(self.ledger.stats(from, to)?)
    }

    /// Remove an identity with its embeddings and attendance history.
    pub fn delete_identity(&self, identity_id: &str) -> Result<(), RollcallError> {
        if !self.gallery.delete(identity_id)? {
            return Err(RollcallError::NotFound(identity_id.to_string()));
        }
        tracing::info!(identity = %identity_id, "identity deleted");
        Ok(())
    }

    /// One enrolled identity with its embedding count.
    pub fn identity(&self, identity_id: &str) -> Result<IdentitySummary, RollcallError> {
        let store = self.gallery.store();
        let identity = store
            .identity(identity_id)?
            .ok_or_else(|| RollcallError::NotFound(identity_id.to_string()))?;
        let embeddings = store.embeddings_of(identity_id)?.len();
        Ok(IdentitySummary {
            identity_id: identity.id,
            name: identity.name,
            department: identity.department,
            created_at: identity.created_at,
            embeddings,
        })
    }

    pub fn list_identities(&self) -> Result<Vec<IdentitySummary>, RollcallError> {
        Ok(self
            .gallery
            .store()
            .identity_summaries()?
            .into_iter()
            .map(|(identity, embeddings)| IdentitySummary {
                identity_id: identity.id,
                name: identity.name,
                department: identity.department,
                created_at: identity.created_at,
                embeddings,
            })
            .collect())
    }

    pub fn status(&self) -> Result<StatusReport, RollcallError> {
        let store = self.gallery.store();
        let index = self.gallery.index();
        let embeddings = store.embedding_count()?;
        let index_entries = index.len();
        Ok(StatusReport {
            identities: store.identity_count()?,
            embeddings,
            index_entries,
            backend: index.backend().as_str(),
            consistent: embeddings == index_entries,
            threshold: self.engine.threshold(),
            dimension: index.dim(),
        })
    }

    /// Discard the index and rebuild it from the store. Returns the entry count.
    pub fn rebuild_index(&self) -> Result<usize, RollcallError> {
        let count = self.gallery.rebuild()?;
        tracing::info!(entries = count, "index rebuilt on request");
        Ok(count)
    }

    /// Stop background persistence and write the final index snapshot.
    pub fn shutdown(&self) {
        self.gallery.flush();
    }
}

fn validate_identity(identity: NewIdentity) -> Result<NewIdentity, RollcallError> {
    let id = identity.id.trim();
    let name = identity.name.trim();
    if id.is_empty() {
        return Err(RollcallError::Validation("identity id must not be empty".into()));
    }
    if name.is_empty() {
        return Err(RollcallError::Validation("name must not be empty".into()));
    }
    Ok(NewIdentity {
        id: id.to_string(),
        name: name.to_string(),
        department: identity.department.trim().to_string(),
    })
}

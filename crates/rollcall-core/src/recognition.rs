//! Query resolution against the enrolled gallery.

use crate::gallery::{Gallery, GalleryError};
use crate::index::IndexError;
use crate::store::StoreError;
use crate::types::{Candidate, CosineMatcher, Embedding, Identity, Matcher, VectorError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Default acceptance threshold on cosine similarity.
pub const DEFAULT_THRESHOLD: f32 = 0.40;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] VectorError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
}

impl From<StoreError> for RecognitionError {
    fn from(err: StoreError) -> Self {
        Self::Gallery(GalleryError::Store(err))
    }
}

/// Which path produced the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPath {
    Index,
    Exhaustive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnrecognizedReason {
    BelowThreshold,
    NoFaceDetected,
    EmptyGallery,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recognition {
    Recognized {
        identity: Identity,
        similarity: f32,
        path: MatchPath,
    },
    Unrecognized {
        reason: UnrecognizedReason,
        best_similarity: Option<f32>,
    },
}

impl Recognition {
    pub fn no_face() -> Self {
        Self::Unrecognized {
            reason: UnrecognizedReason::NoFaceDetected,
            best_similarity: None,
        }
    }
}

/// Why the index could not answer a query.
#[derive(Debug)]
enum Fallback {
    /// Nothing indexed yet: not an error, just nothing to search.
    Unpopulated,
    /// Index and store disagree.
    Inconsistent(String),
    Failed(IndexError),
}

pub struct RecognitionEngine {
    gallery: Arc<Gallery>,
    threshold: f32,
}

impl RecognitionEngine {
    pub fn new(gallery: Arc<Gallery>, threshold: f32) -> Self {
        Self { gallery, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Normalize a raw query vector and resolve it.
    pub fn recognize(&self, query: Vec<f32>) -> Result<Recognition, RecognitionError> {
        let probe = Embedding::normalized(query, self.gallery.index().dim())?;
        self.recognize_embedding(&probe)
    }

    pub fn recognize_embedding(&self, probe: &Embedding) -> Result<Recognition, RecognitionError> {
        let store = self.gallery.store();
        if store.identity_count()? == 0 {
            return Ok(Recognition::Unrecognized {
                reason: UnrecognizedReason::EmptyGallery,
                best_similarity: None,
            });
        }

        let best = match self.search_index(probe)? {
            Ok((candidate, identity)) => Some((candidate, identity, MatchPath::Index)),
            Err(fallback) => {
                match &fallback {
                    Fallback::Unpopulated => {
                        tracing::debug!("index empty; scanning store");
                    }
                    Fallback::Inconsistent(detail) => {
                        tracing::warn!(detail = %detail, "index inconsistent with store");
                        self.gallery.reconcile()?;
                    }
                    Fallback::Failed(err) => {
                        tracing::warn!(error = %err, "index search failed; scanning store");
                    }
                }
                self.exhaustive(probe)?
                    .map(|(candidate, identity)| (candidate, identity, MatchPath::Exhaustive))
            }
        };

        let Some((candidate, identity, path)) = best else {
            return Ok(Recognition::Unrecognized {
                reason: UnrecognizedReason::EmptyGallery,
                best_similarity: None,
            });
        };

        if candidate.similarity > self.threshold {
            tracing::debug!(
                identity = %identity.id,
                similarity = candidate.similarity,
                path = ?path,
                "recognized"
            );
            Ok(Recognition::Recognized {
                identity,
                similarity: candidate.similarity,
                path,
            })
        } else {
            tracing::debug!(
                best = candidate.similarity,
                threshold = self.threshold,
                "best match below threshold"
            );
            Ok(Recognition::Unrecognized {
                reason: UnrecognizedReason::BelowThreshold,
                best_similarity: Some(candidate.similarity),
            })
        }
    }

    /// Fast path. The outer `Result` carries store failures, the inner one
    /// says why the index cannot be trusted for this query.
    fn search_index(
        &self,
        probe: &Embedding,
    ) -> Result<Result<(Candidate, Identity), Fallback>, RecognitionError> {
        let store = self.gallery.store();
        let index = self.gallery.index();

        let indexed = index.len();
        if indexed == 0 {
            return Ok(Err(Fallback::Unpopulated));
        }
        let stored = store.embedding_count()?;
        if indexed != stored {
            return Ok(Err(Fallback::Inconsistent(format!(
                "index holds {indexed} entries, store holds {stored}"
            ))));
        }

        let hit = match index.search(probe, 1) {
            Ok(mut hits) => match hits.pop() {
                Some(hit) => hit,
                None => return Ok(Err(Fallback::Inconsistent("search returned no hit".into()))),
            },
            Err(err) => return Ok(Err(Fallback::Failed(err))),
        };

        match store.identity(&hit.identity_id)? {
            Some(identity) if identity.seq == hit.identity_seq => Ok(Ok((hit, identity))),
            Some(identity) => Ok(Err(Fallback::Inconsistent(format!(
                "index hit for {} belongs to enrollment {}, store holds {}",
                hit.identity_id, hit.identity_seq, identity.seq
            )))),
            None => Ok(Err(Fallback::Inconsistent(format!(
                "index hit for unknown identity {}",
                hit.identity_id
            )))),
        }
    }

    /// Slow path: best-of cosine over every stored embedding.
    fn exhaustive(&self, probe: &Embedding) -> Result<Option<(Candidate, Identity)>, RecognitionError> {
        let store = self.gallery.store();
        let gallery = store.all_entries()?;
        let Some(candidate) = CosineMatcher.best_candidate(probe, &gallery) else {
            return Ok(None);
        };
        let identity = store
            .identity(&candidate.identity_id)?
            .filter(|identity| identity.seq == candidate.identity_seq);
        Ok(identity.map(|identity| (candidate, identity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexBackend;
    use crate::store::Store;
    use crate::types::tests::basis;
    use crate::types::{NewIdentity, Provenance};
    use chrono::{TimeZone, Utc};

    const DIM: usize = 8;

    fn setup(backend: IndexBackend) -> (Arc<Store>, Arc<Gallery>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (gallery, _) = Gallery::load(Arc::clone(&store), backend, DIM, None).unwrap();
        (store, Arc::new(gallery))
    }

    fn person(id: &str) -> NewIdentity {
        NewIdentity {
            id: id.into(),
            name: format!("Person {id}"),
            department: "Ops".into(),
        }
    }

    fn enroll(gallery: &Gallery, id: &str, vectors: Vec<Embedding>) {
        let embeddings = vectors.into_iter().map(|e| (e, Provenance::Original)).collect();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        gallery.enroll(&person(id), embeddings, now).unwrap();
    }

    fn recognized_id(result: &Recognition) -> Option<&str> {
        match result {
            Recognition::Recognized { identity, .. } => Some(identity.id.as_str()),
            Recognition::Unrecognized { .. } => None,
        }
    }

    #[test]
    fn test_empty_gallery() {
        let (_, gallery) = setup(IndexBackend::Flat);
        let engine = RecognitionEngine::new(gallery, DEFAULT_THRESHOLD);
        let result = engine.recognize(basis(DIM, 0).values().to_vec()).unwrap();
        assert_eq!(
            result,
            Recognition::Unrecognized {
                reason: UnrecognizedReason::EmptyGallery,
                best_similarity: None,
            }
        );
    }

    #[test]
    fn test_rejects_bad_query() {
        let (_, gallery) = setup(IndexBackend::Flat);
        let engine = RecognitionEngine::new(gallery, DEFAULT_THRESHOLD);
        assert!(matches!(
            engine.recognize(vec![1.0; DIM - 1]),
            Err(RecognitionError::InvalidQuery(VectorError::DimensionMismatch { .. }))
        ));
        assert!(matches!(
            engine.recognize(vec![0.0; DIM]),
            Err(RecognitionError::InvalidQuery(VectorError::Degenerate(_)))
        ));
    }

    #[test]
    fn test_best_of_multiple_embeddings_via_index() {
        for backend in [IndexBackend::Flat, IndexBackend::Keyed] {
            let (_, gallery) = setup(backend);
            enroll(&gallery, "alice", vec![basis(DIM, 0), basis(DIM, 1), basis(DIM, 2)]);
            enroll(&gallery, "bob", vec![basis(DIM, 5)]);
            let engine = RecognitionEngine::new(gallery, DEFAULT_THRESHOLD);

            // Only alice's third embedding is close.
            let mut query = vec![0.0; DIM];
            query[2] = 1.0;
            query[5] = 0.3;
            match engine.recognize(query).unwrap() {
                Recognition::Recognized { identity, similarity, path } => {
                    assert_eq!(identity.id, "alice");
                    assert!(similarity > 0.9);
                    assert_eq!(path, MatchPath::Index);
                }
                other => panic!("expected a match, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        let (_, gallery) = setup(IndexBackend::Keyed);
        enroll(&gallery, "alice", vec![basis(DIM, 0)]);

        let query = vec![1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let score = Embedding::normalized(query.clone(), DIM)
            .unwrap()
            .similarity(&basis(DIM, 0));

        // A score equal to the threshold is not accepted.
        let engine = RecognitionEngine::new(Arc::clone(&gallery), score);
        match engine.recognize(query.clone()).unwrap() {
            Recognition::Unrecognized { reason, best_similarity } => {
                assert_eq!(reason, UnrecognizedReason::BelowThreshold);
                assert_eq!(best_similarity, Some(score));
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        let engine = RecognitionEngine::new(gallery, score - 1e-4);
        assert_eq!(recognized_id(&engine.recognize(query).unwrap()), Some("alice"));
    }

    #[test]
    fn test_orthogonal_query_is_below_threshold() {
        let (_, gallery) = setup(IndexBackend::Flat);
        enroll(&gallery, "alice", vec![basis(DIM, 0)]);
        let engine = RecognitionEngine::new(gallery, DEFAULT_THRESHOLD);
        let result = engine.recognize(basis(DIM, 4).values().to_vec()).unwrap();
        assert!(matches!(
            result,
            Recognition::Unrecognized {
                reason: UnrecognizedReason::BelowThreshold,
                ..
            }
        ));
    }

    #[test]
    fn test_tie_goes_to_earliest_enrollment() {
        for backend in [IndexBackend::Flat, IndexBackend::Keyed] {
            let (_, gallery) = setup(backend);
            enroll(&gallery, "first", vec![basis(DIM, 3)]);
            enroll(&gallery, "second", vec![basis(DIM, 3)]);
            let engine = RecognitionEngine::new(gallery, DEFAULT_THRESHOLD);
            let result = engine.recognize(basis(DIM, 3).values().to_vec()).unwrap();
            assert_eq!(recognized_id(&result), Some("first"));
        }
    }

    #[test]
    fn test_stale_index_falls_back_and_rebuilds() {
        let (store, gallery) = setup(IndexBackend::Flat);
        enroll(&gallery, "alice", vec![basis(DIM, 0)]);

        // Commit to the store without going through the gallery.
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        store
            .insert_identity(&person("carol"), &[(basis(DIM, 6), Provenance::Original)], now)
            .unwrap();
        assert!(!gallery.is_consistent().unwrap());

        let engine = RecognitionEngine::new(Arc::clone(&gallery), DEFAULT_THRESHOLD);
        match engine.recognize(basis(DIM, 6).values().to_vec()).unwrap() {
            Recognition::Recognized { identity, path, .. } => {
                assert_eq!(identity.id, "carol");
                assert_eq!(path, MatchPath::Exhaustive);
            }
            other => panic!("expected a match, got {other:?}"),
        }

        assert!(gallery.is_consistent().unwrap());
        let again = engine.recognize(basis(DIM, 6).values().to_vec()).unwrap();
        assert!(matches!(again, Recognition::Recognized { path: MatchPath::Index, .. }));
    }

    #[test]
    fn test_reenrolled_identity_ignores_old_vectors() {
        for backend in [IndexBackend::Flat, IndexBackend::Keyed] {
            let (store, gallery) = setup(backend);
            enroll(&gallery, "alice", vec![basis(DIM, 0)]);

            // Same id, new enrollment, committed behind the index's back.
            // Entry counts still agree.
            store.delete_identity("alice").unwrap();
            let now = Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap();
            store
                .insert_identity(&person("alice"), &[(basis(DIM, 7), Provenance::Original)], now)
                .unwrap();
            assert!(gallery.is_consistent().unwrap());

            let engine = RecognitionEngine::new(Arc::clone(&gallery), DEFAULT_THRESHOLD);
            let stale = engine.recognize(basis(DIM, 0).values().to_vec()).unwrap();
            assert!(matches!(
                stale,
                Recognition::Unrecognized {
                    reason: UnrecognizedReason::BelowThreshold,
                    ..
                }
            ));

            // The mismatch forced a rebuild; the new vector now answers from the index.
            match engine.recognize(basis(DIM, 7).values().to_vec()).unwrap() {
                Recognition::Recognized { identity, path, .. } => {
                    assert_eq!(identity.id, "alice");
                    assert_eq!(path, MatchPath::Index);
                }
                other => panic!("expected a match, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_deleted_identity_never_recognized() {
        let (_, gallery) = setup(IndexBackend::Keyed);
        enroll(&gallery, "alice", vec![basis(DIM, 0)]);
        enroll(&gallery, "bob", vec![basis(DIM, 1)]);
        gallery.delete("alice").unwrap();

        let engine = RecognitionEngine::new(gallery, DEFAULT_THRESHOLD);
        let result = engine.recognize(basis(DIM, 0).values().to_vec()).unwrap();
        assert_eq!(recognized_id(&result), None);
    }
}

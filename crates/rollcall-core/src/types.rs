use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimension of ArcFace-style face embeddings.
pub const EMBEDDING_DIM: usize = 512;

/// Vectors whose L2 norm falls at or below this are rejected as degenerate.
pub const MIN_NORM: f32 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("vector contains NaN or infinite components")]
    NonFinite,
    #[error("vector norm {0} is too small to normalize")]
    Degenerate(f32),
}

/// Unit-length face embedding.
///
/// Only constructed through [`Embedding::normalized`] (or deserialized from
/// data that was), so `similarity` can be a plain dot product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Validate `values` against `dim` and scale them to unit length.
    pub fn normalized(values: Vec<f32>, dim: usize) -> Result<Self, VectorError> {
        if values.len() != dim {
            return Err(VectorError::DimensionMismatch {
                expected: dim,
                actual: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(VectorError::NonFinite);
        }

        let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if !norm.is_finite() || norm <= MIN_NORM {
            return Err(VectorError::Degenerate(norm));
        }

        Ok(Self {
            values: values.into_iter().map(|x| x / norm).collect(),
        })
    }

    /// Wrap values already known to be unit length (rows read back out of an index).
    pub(crate) fn from_unit(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Both sides are unit vectors.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        dot(&self.values, &other.values)
    }
}

/// Dot product over the common prefix of two slices.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Enrollment ordinal; lower means enrolled earlier.
    pub seq: i64,
    pub id: String,
    pub name: String,
    pub department: String,
    pub created_at: DateTime<Utc>,
}

/// Identity metadata supplied at enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIdentity {
    pub id: String,
    pub name: String,
    pub department: String,
}

/// Where an embedding came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Original,
    Synthetic,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Synthetic => "synthetic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "original" => Some(Self::Original),
            "synthetic" => Some(Self::Synthetic),
            _ => None,
        }
    }
}

/// A stored embedding with its owner and provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub identity_seq: i64,
    pub identity_id: String,
    pub embedding: Embedding,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
}

/// One (vector, owner) pair of the gallery, as held by a vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub identity_id: String,
    pub identity_seq: i64,
    pub embedding: Embedding,
}

impl From<EmbeddingRecord> for IndexEntry {
    fn from(record: EmbeddingRecord) -> Self {
        Self {
            identity_id: record.identity_id,
            identity_seq: record.identity_seq,
            embedding: record.embedding,
        }
    }
}

/// Best-scoring identity for a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub identity_id: String,
    pub identity_seq: i64,
    /// Cosine similarity of the best embedding of this identity [-1, 1].
    pub similarity: f32,
}

impl Candidate {
    /// Higher similarity wins; an exact tie goes to the earlier enrollment.
    pub fn outranks(&self, other: &Candidate) -> bool {
        self.similarity > other.similarity
            || (self.similarity == other.similarity && self.identity_seq < other.identity_seq)
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn best_candidate(&self, probe: &Embedding, gallery: &[IndexEntry]) -> Option<Candidate>;
}

/// Exhaustive cosine matcher.
///
/// Scores an identity by the best of all its embeddings, so an identity is a
/// candidate if any stored pose or lighting condition is close to the probe.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_candidate(&self, probe: &Embedding, gallery: &[IndexEntry]) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;

        for entry in gallery {
            let candidate = Candidate {
                identity_id: entry.identity_id.clone(),
                identity_seq: entry.identity_seq,
                similarity: probe.similarity(&entry.embedding),
            };
            let is_better = match &best {
                None => true,
                Some(prev) => candidate.outranks(prev),
            };
            if is_better {
                best = Some(candidate);
            }
        }

        best
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Unit vector along axis `i` in `dim` dimensions.
    pub(crate) fn basis(dim: usize, i: usize) -> Embedding {
        let mut values = vec![0.0; dim];
        values[i] = 1.0;
        Embedding::normalized(values, dim).unwrap()
    }

    pub(crate) fn entry(id: &str, seq: i64, embedding: Embedding) -> IndexEntry {
        IndexEntry {
            identity_id: id.into(),
            identity_seq: seq,
            embedding,
        }
    }

    #[test]
    fn test_normalized_has_unit_norm() {
        let e = Embedding::normalized(vec![3.0, 4.0], 2).unwrap();
        let norm = e.values().iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((e.values()[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_self_similarity_is_one() {
        let values: Vec<f32> = (0..EMBEDDING_DIM).map(|i| (i as f32 * 0.37).sin()).collect();
        let e = Embedding::normalized(values, EMBEDDING_DIM).unwrap();
        assert!((e.similarity(&e) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_similarity_orthogonal_and_opposite() {
        let a = basis(2, 0);
        let b = basis(2, 1);
        let c = Embedding::normalized(vec![-1.0, 0.0], 2).unwrap();
        assert!(a.similarity(&b).abs() < 1e-6);
        assert!((a.similarity(&c) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_wrong_dimension() {
        let err = Embedding::normalized(vec![1.0, 0.0], 3).unwrap_err();
        assert_eq!(err, VectorError::DimensionMismatch { expected: 3, actual: 2 });
    }

    #[test]
    fn test_rejects_non_finite_and_zero() {
        assert_eq!(
            Embedding::normalized(vec![f32::NAN, 1.0], 2).unwrap_err(),
            VectorError::NonFinite
        );
        assert_eq!(
            Embedding::normalized(vec![f32::INFINITY, 1.0], 2).unwrap_err(),
            VectorError::NonFinite
        );
        assert!(matches!(
            Embedding::normalized(vec![0.0, 0.0], 2).unwrap_err(),
            VectorError::Degenerate(_)
        ));
    }

    #[test]
    fn test_cosine_matcher_best_of_identity() {
        // The matching embedding is the last of three owned by "b".
        let probe = basis(3, 2);
        let gallery = vec![
            entry("a", 1, basis(3, 0)),
            entry("b", 2, basis(3, 1)),
            entry("b", 2, Embedding::normalized(vec![0.0, 1.0, 1.0], 3).unwrap()),
            entry("b", 2, basis(3, 2)),
        ];

        let best = CosineMatcher.best_candidate(&probe, &gallery).unwrap();
        assert_eq!(best.identity_id, "b");
        assert!((best.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_matcher_tie_goes_to_earliest_enrollment() {
        let probe = basis(2, 0);
        let gallery = vec![entry("late", 7, basis(2, 0)), entry("early", 3, basis(2, 0))];

        let best = CosineMatcher.best_candidate(&probe, &gallery).unwrap();
        assert_eq!(best.identity_id, "early");
    }

    #[test]
    fn test_cosine_matcher_empty_gallery() {
        assert!(CosineMatcher.best_candidate(&basis(2, 0), &[]).is_none());
    }

    #[test]
    fn test_provenance_round_trip_names() {
        assert_eq!(Provenance::parse("synthetic"), Some(Provenance::Synthetic));
        assert_eq!(Provenance::Original.as_str(), "original");
        assert_eq!(Provenance::parse("augmented"), None);
    }
}

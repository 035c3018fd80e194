//! rollcall-core: face recognition attendance engine.
//!
//! An enrolled gallery of face embeddings lives in SQLite and is mirrored by
//! an in-memory vector index. Recognized faces toggle a per-day IN/OUT
//! attendance ledger. Embedding extraction itself is pluggable through
//! [`service::EmbeddingExtractor`].

pub mod attendance;
pub mod gallery;
pub mod index;
pub mod recognition;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod types;

pub use attendance::{
    AttendanceEvent, AttendanceLedger, AttendanceStats, DailyCount, DayState, HistoryFilter,
    HistoryPage, Page, PresenceStatus, Segment, TodaySnapshot,
};
pub use index::{IndexBackend, SharedIndex, VectorIndex};
pub use recognition::{MatchPath, Recognition, RecognitionEngine, UnrecognizedReason};
pub use service::{
    Augmenter, EmbeddingExtractor, Enrollment, ExtractError, IdentitySummary, RecognitionResult,
    Rollcall, RollcallConfig, RollcallError, StatusReport,
};
pub use store::Store;
pub use types::{Embedding, Identity, NewIdentity, EMBEDDING_DIM};

use crate::engine::{EngineError, EngineHandle};
use crate::extractor::CommandExtractor;
use chrono::NaiveDate;
use rollcall_core::{HistoryFilter, NewIdentity, Page, RollcallError};
use serde::Serialize;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
///
/// Structured replies are JSON strings. Dates are `YYYY-MM-DD`; an empty
/// string means "unset".
pub struct RollcallService {
    pub engine: EngineHandle<CommandExtractor>,
}

fn to_fdo(err: EngineError) -> fdo::Error {
    match err {
        EngineError::Rollcall(RollcallError::Validation(msg)) => fdo::Error::InvalidArgs(msg),
        EngineError::Rollcall(RollcallError::NoFaceDetected) => {
            fdo::Error::InvalidArgs("no face detected in any image".into())
        }
        EngineError::Rollcall(RollcallError::NotFound(id)) => {
            fdo::Error::UnknownObject(format!("identity not found: {id}"))
        }
        EngineError::Rollcall(RollcallError::AlreadyExists(id)) => {
            fdo::Error::FileExists(format!("identity already exists: {id}"))
        }
        other => {
            tracing::error!(error = %other, "request failed");
            fdo::Error::Failed(other.to_string())
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization failed: {e}")))
}

fn parse_date(field: &str, value: &str) -> fdo::Result<Option<NaiveDate>> {
    if value.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(Some)
        .map_err(|e| fdo::Error::InvalidArgs(format!("{field}: expected YYYY-MM-DD, got {value:?} ({e})")))
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Enroll a new identity from one or more encoded face images.
    async fn enroll(
        &self,
        identity_id: &str,
        name: &str,
        department: &str,
        images: Vec<Vec<u8>>,
    ) -> fdo::Result<String> {
        tracing::info!(identity = identity_id, images = images.len(), "enroll requested");
        let identity = NewIdentity {
            id: identity_id.to_string(),
            name: name.to_string(),
            department: department.to_string(),
        };
        let enrollment = self.engine.enroll(identity, images).await.map_err(to_fdo)?;
        to_json(&enrollment)
    }

    /// Add face images to an enrolled identity.
    async fn add_images(&self, identity_id: &str, images: Vec<Vec<u8>>) -> fdo::Result<String> {
        tracing::info!(identity = identity_id, images = images.len(), "add_images requested");
        let enrollment = self
            .engine
            .add_images(identity_id.to_string(), images)
            .await
            .map_err(to_fdo)?;
        to_json(&enrollment)
    }

    /// Recognize the face in an image and record attendance.
    async fn recognize(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::debug!(bytes = image.len(), "recognize requested");
        let result = self.engine.recognize(image).await.map_err(to_fdo)?;
        to_json(&result)
    }

    /// Recognize a precomputed embedding and record attendance.
    async fn recognize_embedding(&self, embedding: Vec<f64>) -> fdo::Result<String> {
        let values = embedding.into_iter().map(|v| v as f32).collect();
        let result = self.engine.recognize_embedding(values).await.map_err(to_fdo)?;
        to_json(&result)
    }

    /// Presence of every enrolled identity today.
    async fn today(&self) -> fdo::Result<String> {
        let snapshot = self.engine.today().await.map_err(to_fdo)?;
        to_json(&snapshot)
    }

    /// Attendance segments, newest first. `limit` 0 means the default page size.
    async fn history(
        &self,
        identity_id: &str,
        from: &str,
        to: &str,
        limit: u32,
        offset: u32,
    ) -> fdo::Result<String> {
        let filter = HistoryFilter {
            identity_id: (!identity_id.is_empty()).then(|| identity_id.to_string()),
            from: parse_date("from", from)?,
            to: parse_date("to", to)?,
        };
        let mut page = Page {
            offset: offset as usize,
            ..Page::default()
        };
        if limit > 0 {
            page.limit = limit as usize;
        }
        let history = self.engine.history(filter, page).await.map_err(to_fdo)?;
        to_json(&history)
    }

    /// Per-day segment counts and hours, with the enrolled total and
    /// average daily presence.
    async fn daily_aggregate(&self, from: &str, to: &str) -> fdo::Result<String> {
        let from = parse_date("from", from)?;
        let to = parse_date("to", to)?;
        let stats = self.engine.daily_aggregate(from, to).await.map_err(to_fdo)?;
        to_json(&stats)
    }

    /// Delete an identity with its embeddings and attendance history.
    async fn delete_identity(&self, identity_id: &str) -> fdo::Result<()> {
        tracing::info!(identity = identity_id, "delete requested");
        self.engine
            .delete_identity(identity_id.to_string())
            .await
            .map_err(to_fdo)
    }

    /// One enrolled identity with its embedding count.
    async fn get_identity(&self, identity_id: &str) -> fdo::Result<String> {
        let summary = self
            .engine
            .identity(identity_id.to_string())
            .await
            .map_err(to_fdo)?;
        to_json(&summary)
    }

    /// Enrolled identities with their embedding counts.
    async fn list_identities(&self) -> fdo::Result<String> {
        let identities = self.engine.list_identities().await.map_err(to_fdo)?;
        to_json(&identities)
    }

    /// Rebuild the vector index from the record store.
    async fn rebuild_index(&self) -> fdo::Result<u32> {
        let entries = self.engine.rebuild_index().await.map_err(to_fdo)?;
        Ok(u32::try_from(entries).unwrap_or(u32::MAX))
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let report = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": report.identities,
            "embeddings": report.embeddings,
            "index_entries": report.index_entries,
            "index_backend": report.backend,
            "index_consistent": report.consistent,
            "similarity_threshold": report.threshold,
            "dimension": report.dimension,
        })
        .to_string())
    }
}

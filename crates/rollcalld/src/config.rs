use chrono::FixedOffset;
use rollcall_core::{IndexBackend, RollcallConfig, EMBEDDING_DIM};
use std::path::PathBuf;

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Path of the index snapshot file.
    pub snapshot_path: PathBuf,
    /// Cosine similarity a match must strictly exceed.
    pub similarity_threshold: f32,
    /// Images accepted per enrollment request.
    pub max_images_per_identity: usize,
    pub index_backend: IndexBackend,
    /// Offset, in minutes east of UTC, that decides the attendance date.
    pub utc_offset_minutes: i32,
    /// Requests run concurrently on the blocking pool.
    pub workers: usize,
    /// External model command: reads an image on stdin, writes JSON on stdout.
    pub extractor_command: Vec<String>,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("rollcall.db"));
        let snapshot_path = std::env::var("ROLLCALL_SNAPSHOT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("index.json"));

        let index_backend = match std::env::var("ROLLCALL_INDEX_BACKEND") {
            Ok(value) => value.parse().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "falling back to flat index");
                IndexBackend::Flat
            }),
            Err(_) => IndexBackend::Flat,
        };

        let bus = match std::env::var("ROLLCALL_BUS").as_deref() {
            Ok("system") => BusKind::System,
            _ => BusKind::Session,
        };

        let extractor_command = std::env::var("ROLLCALL_EXTRACTOR_COMMAND")
            .map(|cmd| cmd.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Self {
            db_path,
            snapshot_path,
            similarity_threshold: env_f32("ROLLCALL_SIMILARITY_THRESHOLD", 0.40),
            max_images_per_identity: env_usize("ROLLCALL_MAX_IMAGES", 50),
            index_backend,
            utc_offset_minutes: env_i32("ROLLCALL_UTC_OFFSET_MINUTES", 0),
            workers: env_usize("ROLLCALL_WORKERS", 4).max(1),
            extractor_command,
            bus,
        }
    }

    pub fn utc_offset(&self) -> anyhow::Result<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                anyhow::anyhow!("ROLLCALL_UTC_OFFSET_MINUTES={} is out of range", self.utc_offset_minutes)
            })
    }

    /// Settings handed to the core library.
    pub fn rollcall_config(&self) -> anyhow::Result<RollcallConfig> {
        Ok(RollcallConfig {
            dimension: EMBEDDING_DIM,
            threshold: self.similarity_threshold,
            max_images: self.max_images_per_identity,
            backend: self.index_backend,
            utc_offset: self.utc_offset()?,
            snapshot_path: Some(self.snapshot_path.clone()),
        })
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i32(key: &str, default: i32) -> i32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_offset(minutes: i32) -> Config {
        Config {
            utc_offset_minutes: minutes,
            ..Config::from_env()
        }
    }

    #[test]
    fn test_utc_offset() {
        assert_eq!(
            with_offset(330).utc_offset().unwrap(),
            FixedOffset::east_opt(330 * 60).unwrap()
        );
        assert_eq!(
            with_offset(-300).utc_offset().unwrap(),
            FixedOffset::west_opt(300 * 60).unwrap()
        );
    }

    #[test]
    fn test_out_of_range_offset_is_an_error() {
        assert!(with_offset(24 * 60).utc_offset().is_err());
        assert!(with_offset(i32::MAX).utc_offset().is_err());
        assert!(with_offset(i32::MIN).utc_offset().is_err());
    }
}

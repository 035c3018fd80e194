use chrono::{NaiveDate, Utc};
use rollcall_core::{
    AttendanceStats, EmbeddingExtractor, Enrollment, HistoryFilter, HistoryPage, IdentitySummary,
    NewIdentity, Page, RecognitionResult, Rollcall, RollcallError, StatusReport, TodaySnapshot,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Rollcall(#[from] RollcallError),
    #[error("engine is shutting down")]
    Closed,
    #[error("engine task failed: {0}")]
    Task(String),
}

/// Clone-safe handle to the recognition service.
///
/// Every call runs on tokio's blocking pool (SQLite, model subprocess and
/// index scans all block), with at most `workers` calls in flight.
pub struct EngineHandle<E> {
    rollcall: Arc<Rollcall<E>>,
    permits: Arc<Semaphore>,
    workers: u32,
}

impl<E> Clone for EngineHandle<E> {
    fn clone(&self) -> Self {
        Self {
            rollcall: Arc::clone(&self.rollcall),
            permits: Arc::clone(&self.permits),
            workers: self.workers,
        }
    }
}

impl<E: EmbeddingExtractor + 'static> EngineHandle<E> {
    pub fn new(rollcall: Rollcall<E>, workers: usize) -> Self {
        let workers = workers.clamp(1, 1024);
        Self {
            rollcall: Arc::new(rollcall),
            permits: Arc::new(Semaphore::new(workers)),
            workers: workers as u32,
        }
    }

    async fn run<T, F>(&self, job: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Rollcall<E>) -> Result<T, RollcallError> + Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::Closed)?;
        let rollcall = Arc::clone(&self.rollcall);
        let result = tokio::task::spawn_blocking(move || job(&rollcall))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?;
        Ok(result?)
    }

    pub async fn enroll(&self, identity: NewIdentity, images: Vec<Vec<u8>>) -> Result<Enrollment, EngineError> {
        self.run(move |r| r.enroll(identity, &images, Utc::now())).await
    }

    pub async fn add_images(&self, identity_id: String, images: Vec<Vec<u8>>) -> Result<Enrollment, EngineError> {
        self.run(move |r| r.add_images(&identity_id, &images, Utc::now()))
            .await
    }

    pub async fn recognize(&self, image: Vec<u8>) -> Result<RecognitionResult, EngineError> {
        // Timestamp on arrival, not when a worker frees up.
        let at = Utc::now();
        self.run(move |r| r.recognize(&image, at)).await
    }

    pub async fn recognize_embedding(&self, values: Vec<f32>) -> Result<RecognitionResult, EngineError> {
        let at = Utc::now();
        self.run(move |r| r.recognize_embedding(values, at)).await
    }

    pub async fn today(&self) -> Result<TodaySnapshot, EngineError> {
        self.run(|r| r.today(Utc::now())).await
    }

    pub async fn history(&self, filter: HistoryFilter, page: Page) -> Result<HistoryPage, EngineError> {
        self.run(move |r| r.history(&filter, page)).await
    }

    pub async fn daily_aggregate(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<AttendanceStats, EngineError> {
        self.run(move |r| r.daily_aggregate(from, to)).await
    }

    pub async fn delete_identity(&self, identity_id: String) -> Result<(), EngineError> {
        self.run(move |r| r.delete_identity(&identity_id)).await
    }

    pub async fn identity(&self, identity_id: String) -> Result<IdentitySummary, EngineError> {
        self.run(move |r| r.identity(&identity_id)).await
    }

    pub async fn list_identities(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        self.run(|r| r.list_identities()).await
    }

    pub async fn status(&self) -> Result<StatusReport, EngineError> {
        self.run(|r| r.status()).await
    }

    pub async fn rebuild_index(&self) -> Result<usize, EngineError> {
        self.run(|r| r.rebuild_index()).await
    }

    /// Refuse new work, wait for in-flight calls, then flush the index snapshot.
    pub async fn shutdown(&self) {
        // Already closed: another shutdown got here first.
        let Ok(drained) = self.permits.acquire_many(self.workers).await else {
            return;
        };
        self.permits.close();
        drop(drained);

        let rollcall = Arc::clone(&self.rollcall);
        if let Err(e) = tokio::task::spawn_blocking(move || rollcall.shutdown()).await {
            tracing::warn!(error = %e, "shutdown flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{ExtractError, RollcallConfig, Store, UnrecognizedReason};

    struct FirstByte;

    impl EmbeddingExtractor for FirstByte {
        fn extract(&self, image: &[u8]) -> Result<Vec<f32>, ExtractError> {
            let mut values = vec![0.0; 4];
            match image.first() {
                Some(&b) if (b as usize) < 4 => {
                    values[b as usize] = 1.0;
                    Ok(values)
                }
                _ => Err(ExtractError::NoFaceDetected),
            }
        }
    }

    fn handle() -> EngineHandle<FirstByte> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = RollcallConfig {
            dimension: 4,
            ..RollcallConfig::default()
        };
        EngineHandle::new(Rollcall::open(store, config, FirstByte).unwrap(), 2)
    }

    fn person(id: &str) -> NewIdentity {
        NewIdentity {
            id: id.into(),
            name: id.into(),
            department: String::new(),
        }
    }

    #[tokio::test]
    async fn test_parallel_recognitions_toggle_independently() {
        let engine = handle();
        engine.enroll(person("a"), vec![vec![0]]).await.unwrap();
        engine.enroll(person("b"), vec![vec![1]]).await.unwrap();

        let tasks: Vec<_> = [0u8, 1u8]
            .into_iter()
            .map(|axis| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.recognize(vec![axis]).await })
            })
            .collect();
        for task in tasks {
            assert!(matches!(
                task.await.unwrap().unwrap(),
                RecognitionResult::Recognized { .. }
            ));
        }

        let today = engine.today().await.unwrap();
        assert_eq!(today.in_count, 2);
    }

    #[tokio::test]
    async fn test_no_face_is_a_result_not_an_error() {
        let engine = handle();
        engine.enroll(person("a"), vec![vec![0]]).await.unwrap();
        match engine.recognize(vec![9]).await.unwrap() {
            RecognitionResult::Unrecognized { reason, .. } => {
                assert_eq!(reason, UnrecognizedReason::NoFaceDetected)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_identity_lookup() {
        let engine = handle();
        engine.enroll(person("a"), vec![vec![0], vec![2]]).await.unwrap();
        assert_eq!(engine.identity("a".into()).await.unwrap().embeddings, 2);
        assert!(matches!(
            engine.identity("zed".into()).await,
            Err(EngineError::Rollcall(RollcallError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let engine = handle();
        engine.shutdown().await;
        assert!(matches!(engine.status().await, Err(EngineError::Closed)));
    }
}

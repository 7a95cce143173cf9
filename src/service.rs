use crate::model::{EvaluationReport, FinalReport, ModulePreview, SaveGradeEntry};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("module {0} not found")]
    ModuleNotFound(i64),
    #[error("{0}")]
    Rejected(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Boundary to the grade-management backend. Each call is atomic from
/// the engine's perspective: it succeeds or fails as a whole, with no
/// partial-item results. Transport, auth and serialization live behind
/// the implementation.
#[async_trait]
pub trait ModuleService: Send + Sync {
    async fn fetch_module_preview(&self, module_id: i64) -> Result<ModulePreview, ServiceError>;

    async fn fetch_evaluation_report(
        &self,
        module_id: i64,
        evaluation_period: i64,
    ) -> Result<EvaluationReport, ServiceError>;

    async fn fetch_final_report(&self, module_id: i64) -> Result<FinalReport, ServiceError>;

    /// Persists a batch of grade entries. Returns the number of stored
    /// grade records.
    async fn save_grades(
        &self,
        module_id: i64,
        entries: Vec<SaveGradeEntry>,
    ) -> Result<usize, ServiceError>;
}

#[async_trait]
impl<S: ModuleService + ?Sized> ModuleService for Arc<S> {
    async fn fetch_module_preview(&self, module_id: i64) -> Result<ModulePreview, ServiceError> {
        (**self).fetch_module_preview(module_id).await
    }

    async fn fetch_evaluation_report(
        &self,
        module_id: i64,
        evaluation_period: i64,
    ) -> Result<EvaluationReport, ServiceError> {
        (**self)
            .fetch_evaluation_report(module_id, evaluation_period)
            .await
    }

    async fn fetch_final_report(&self, module_id: i64) -> Result<FinalReport, ServiceError> {
        (**self).fetch_final_report(module_id).await
    }

    async fn save_grades(
        &self,
        module_id: i64,
        entries: Vec<SaveGradeEntry>,
    ) -> Result<usize, ServiceError> {
        (**self).save_grades(module_id, entries).await
    }
}

use crate::calc;
use crate::diff::{self, SaveRequestError};
use crate::index::EntityIndex;
use crate::model::{EvaluationReport, FinalReport, ModulePreview};
use crate::overlay::{EditOverlay, ExerciseKey};
use crate::service::{ModuleService, ServiceError};
use crate::tables::{self, PreviewTables};
use futures::future::try_join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not load module preview: {0}")]
    BaseLoad(#[source] ServiceError),
    #[error("module preview loaded but reports are unavailable: {0}")]
    ReportLoad(#[source] ServiceError),
    #[error(transparent)]
    Validation(#[from] SaveRequestError),
    #[error("could not save grades: {0}")]
    Save(#[source] ServiceError),
    #[error("no module preview loaded")]
    NoPreview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    BaseLoaded,
    ReportsLoaded,
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub generation: u64,
    /// Set when stage 2 failed: the base snapshot stays visible but
    /// both report collections were cleared.
    pub reports_error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SaveOutcome {
    /// Nothing differed from the persisted record; no network call was
    /// made. Advisory, not a failure.
    NoChanges,
    Saved {
        stored: usize,
        cleared_indexes: Vec<i64>,
        reports_error: Option<String>,
    },
}

/// One module preview session: owns the canonical snapshot, its derived
/// index, the report collections and the edit overlay.
///
/// Reloads are serialized by the `&mut` receiver; the generation
/// counter stamps each completed load so callers can tell which load
/// produced the state they are looking at.
pub struct PreviewSession<S> {
    service: S,
    state: LoadState,
    generation: u64,
    snapshot: Option<ModulePreview>,
    index: EntityIndex,
    evaluation_reports: Vec<EvaluationReport>,
    final_report: Option<FinalReport>,
    overlay: EditOverlay,
}

impl<S: ModuleService> PreviewSession<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            state: LoadState::Idle,
            generation: 0,
            snapshot: None,
            index: EntityIndex::default(),
            evaluation_reports: Vec::new(),
            final_report: None,
            overlay: EditOverlay::default(),
        }
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self) -> Option<&ModulePreview> {
        self.snapshot.as_ref()
    }

    pub fn index(&self) -> &EntityIndex {
        &self.index
    }

    pub fn overlay(&self) -> &EditOverlay {
        &self.overlay
    }

    /// Two-stage load: base entity snapshot, then one evaluation report
    /// per distinct period concurrently alongside the final report.
    ///
    /// Base failure clears all previous state and returns the error;
    /// report failure keeps the fresh base and degrades: both report
    /// collections stay empty and `reports_error` carries a message
    /// distinct from a base-load failure.
    pub async fn load(&mut self, module_id: i64) -> Result<LoadOutcome, SessionError> {
        self.generation += 1;
        debug!(module_id, generation = self.generation, "loading module preview");

        let preview = match self.service.fetch_module_preview(module_id).await {
            Ok(preview) => preview,
            Err(e) => {
                warn!(module_id, error = %e, "base preview load failed");
                self.reset();
                return Err(SessionError::BaseLoad(e));
            }
        };

        let mut periods: Vec<i64> = preview.uts.iter().map(|ut| ut.evaluation_period).collect();
        periods.sort_unstable();
        periods.dedup();

        self.index = EntityIndex::build(&preview);
        self.snapshot = Some(preview);
        // Replacing the snapshot invalidates every unsaved edit and all
        // previously fetched reports.
        self.overlay.clear();
        self.evaluation_reports.clear();
        self.final_report = None;
        self.state = LoadState::BaseLoaded;

        let fetched = {
            let service = &self.service;
            let evaluations = try_join_all(
                periods
                    .iter()
                    .map(|&period| service.fetch_evaluation_report(module_id, period)),
            );
            let final_report = service.fetch_final_report(module_id);
            tokio::try_join!(evaluations, final_report)
        };

        match fetched {
            Ok((evaluations, final_report)) => {
                self.evaluation_reports = evaluations;
                self.final_report = Some(final_report);
                self.state = LoadState::ReportsLoaded;
                info!(
                    module_id,
                    generation = self.generation,
                    periods = periods.len(),
                    "module preview loaded"
                );
                Ok(LoadOutcome {
                    generation: self.generation,
                    reports_error: None,
                })
            }
            Err(e) => {
                warn!(module_id, error = %e, "report fetch failed, keeping base snapshot");
                Ok(LoadOutcome {
                    generation: self.generation,
                    reports_error: Some(SessionError::ReportLoad(e).to_string()),
                })
            }
        }
    }

    /// Diffs the overlay against the persisted record for one pair and,
    /// when something changed, saves and reloads. The overlay survives
    /// a failed save so typed input is never lost; a successful save
    /// clears it through the reload.
    pub async fn save_exercises(
        &mut self,
        student_id: i64,
        instrument_id: i64,
    ) -> Result<SaveOutcome, SessionError> {
        let module_id = self
            .snapshot
            .as_ref()
            .map(|p| p.module_id)
            .ok_or(SessionError::NoPreview)?;

        let request = diff::build_save_request(&self.index, &self.overlay, student_id, instrument_id)?;
        if !request.changed {
            debug!(student_id, instrument_id, "no exercise changes to save");
            return Ok(SaveOutcome::NoChanges);
        }

        let cleared_indexes = request.cleared_indexes.clone();
        let stored = match self.service.save_grades(module_id, vec![request.entry]).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(student_id, instrument_id, error = %e, "grade save failed");
                return Err(SessionError::Save(e));
            }
        };
        info!(student_id, instrument_id, stored, "grades saved");

        let outcome = self.load(module_id).await?;
        Ok(SaveOutcome::Saved {
            stored,
            cleared_indexes,
            reports_error: outcome.reports_error,
        })
    }

    pub fn set_exercise_text(&mut self, key: ExerciseKey, text: impl Into<String>) {
        self.overlay.set(key, text);
    }

    /// Text shown in an editing cell (overlay, else persisted, else
    /// empty).
    pub fn exercise_display(&self, key: ExerciseKey) -> String {
        self.overlay.display_value(&self.index, key)
    }

    pub fn provisional_average(&self, student_id: i64, instrument_id: i64) -> Option<f64> {
        calc::provisional_average(&self.index, &self.overlay, student_id, instrument_id)
    }

    pub fn persisted_grade(&self, student_id: i64, instrument_id: i64) -> Option<f64> {
        self.index.persisted_grade(student_id, instrument_id)
    }

    pub fn tables(&self) -> Option<PreviewTables> {
        self.snapshot
            .as_ref()
            .map(|preview| tables::build_tables(preview, &self.index, &self.overlay))
    }

    pub fn evaluation_reports(&self) -> Vec<EvaluationReport> {
        tables::sorted_evaluation_reports(&self.evaluation_reports)
    }

    pub fn final_report(&self) -> Option<FinalReport> {
        self.final_report.as_ref().map(tables::sorted_final_report)
    }

    fn reset(&mut self) {
        self.snapshot = None;
        self.index = EntityIndex::default();
        self.evaluation_reports.clear();
        self.final_report = None;
        self.overlay.clear();
        self.state = LoadState::Idle;
    }
}

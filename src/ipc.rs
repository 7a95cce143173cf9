use crate::calc::{self, EXERCISE_INDEXES};
use crate::model::ModulePreview;
use crate::overlay::ExerciseKey;
use crate::service::ServiceError;
use crate::session::{LoadState, PreviewSession, SaveOutcome, SessionError};
use crate::store::SqliteStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct OkResp {
    id: String,
    ok: bool,
    result: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ErrObj {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ErrResp {
    id: String,
    ok: bool,
    error: ErrObj,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub store: Option<Arc<SqliteStore>>,
    pub session: Option<PreviewSession<Arc<SqliteStore>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            store: None,
            session: None,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

fn ok(id: String, result: serde_json::Value) -> serde_json::Value {
    json!(OkResp {
        id,
        ok: true,
        result
    })
}

fn err(id: String, code: &str, message: impl Into<String>) -> serde_json::Value {
    err_with(id, code, message, None)
}

fn err_with(
    id: String,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    json!(ErrResp {
        id,
        ok: false,
        error: ErrObj {
            code: code.into(),
            message: message.into(),
            details
        }
    })
}

fn param_i64(params: &serde_json::Value, name: &str) -> Option<i64> {
    params.get(name).and_then(|v| v.as_i64())
}

fn state_label(state: LoadState) -> &'static str {
    match state {
        LoadState::Idle => "idle",
        LoadState::BaseLoaded => "baseLoaded",
        LoadState::ReportsLoaded => "reportsLoaded",
    }
}

pub async fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    match req.method.as_str() {
        "health" => ok(
            req.id,
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
            }),
        ),
        "workspace.select" => {
            let path = req
                .params
                .get("path")
                .and_then(|v| v.as_str())
                .map(PathBuf::from);
            let Some(path) = path else {
                return err(req.id, "bad_params", "missing params.path");
            };

            match SqliteStore::open(&path) {
                Ok(store) => {
                    state.workspace = Some(path.clone());
                    state.store = Some(Arc::new(store));
                    // Any loaded preview belonged to the old workspace.
                    state.session = None;
                    ok(
                        req.id,
                        json!({ "workspacePath": path.to_string_lossy() }),
                    )
                }
                Err(e) => err(req.id, "db_open_failed", format!("{e:?}")),
            }
        }
        "module.import" => {
            let Some(store) = state.store.as_ref() else {
                return err(req.id, "no_workspace", "select a workspace first");
            };
            let Some(module_value) = req.params.get("module") else {
                return err(req.id, "bad_params", "missing params.module");
            };
            let preview: ModulePreview = match serde_json::from_value(module_value.clone()) {
                Ok(v) => v,
                Err(e) => return err(req.id, "bad_params", format!("invalid module: {e}")),
            };
            match store.import_module(&preview) {
                Ok(summary) => ok(req.id, json!(summary)),
                Err(e) => err(req.id, "import_failed", e.to_string()),
            }
        }
        "preview.load" => {
            let Some(store) = state.store.clone() else {
                return err(req.id, "no_workspace", "select a workspace first");
            };
            let Some(module_id) = param_i64(&req.params, "moduleId") else {
                return err(req.id, "bad_params", "missing moduleId");
            };

            let session = state
                .session
                .get_or_insert_with(|| PreviewSession::new(store));

            match session.load(module_id).await {
                Ok(outcome) => ok(
                    req.id,
                    json!({
                        "moduleId": module_id,
                        "generation": outcome.generation,
                        "state": state_label(session.state()),
                        "reportsError": outcome.reports_error
                    }),
                ),
                Err(SessionError::BaseLoad(ServiceError::ModuleNotFound(id))) => {
                    err(req.id, "not_found", format!("module {id} not found"))
                }
                Err(e) => {
                    warn!(module_id, error = %e, "preview load failed");
                    err(req.id, "base_load_failed", e.to_string())
                }
            }
        }
        "preview.tables" => {
            let Some(session) = state.session.as_ref() else {
                return err(req.id, "no_preview", "load a module preview first");
            };
            let Some(tables) = session.tables() else {
                return err(req.id, "no_preview", "load a module preview first");
            };
            ok(
                req.id,
                json!({
                    "generation": session.generation(),
                    "state": state_label(session.state()),
                    "tables": tables,
                    "evaluationReports": session.evaluation_reports(),
                    "finalReport": session.final_report()
                }),
            )
        }
        "exercises.get" => {
            let Some(session) = state.session.as_ref() else {
                return err(req.id, "no_preview", "load a module preview first");
            };
            let (Some(student_id), Some(instrument_id)) = (
                param_i64(&req.params, "studentId"),
                param_i64(&req.params, "instrumentId"),
            ) else {
                return err(req.id, "bad_params", "missing studentId/instrumentId");
            };

            let cells: Vec<serde_json::Value> = EXERCISE_INDEXES
                .map(|exercise_index| {
                    let key = ExerciseKey::new(student_id, instrument_id, exercise_index);
                    json!({
                        "exerciseIndex": exercise_index,
                        "text": session.exercise_display(key),
                        "edited": session.overlay().entry(key).is_some()
                    })
                })
                .collect();

            ok(
                req.id,
                json!({
                    "studentId": student_id,
                    "instrumentId": instrument_id,
                    "cells": cells,
                    "provisionalAverage": session.provisional_average(student_id, instrument_id),
                    "persistedGrade": session.persisted_grade(student_id, instrument_id)
                }),
            )
        }
        "exercises.set" => {
            let Some(session) = state.session.as_mut() else {
                return err(req.id, "no_preview", "load a module preview first");
            };
            let (Some(student_id), Some(instrument_id), Some(exercise_index)) = (
                param_i64(&req.params, "studentId"),
                param_i64(&req.params, "instrumentId"),
                param_i64(&req.params, "exerciseIndex"),
            ) else {
                return err(
                    req.id,
                    "bad_params",
                    "missing studentId/instrumentId/exerciseIndex",
                );
            };
            if !calc::EXERCISE_INDEXES.contains(&exercise_index) {
                return err(
                    req.id,
                    "bad_params",
                    format!("exerciseIndex must be between 1 and 10, got {exercise_index}"),
                );
            }
            let Some(text) = req.params.get("text").and_then(|v| v.as_str()) else {
                return err(req.id, "bad_params", "missing text");
            };

            let key = ExerciseKey::new(student_id, instrument_id, exercise_index);
            session.set_exercise_text(key, text);
            ok(
                req.id,
                json!({
                    "text": session.exercise_display(key),
                    "provisionalAverage": session.provisional_average(student_id, instrument_id)
                }),
            )
        }
        "exercises.save" => {
            let Some(session) = state.session.as_mut() else {
                return err(req.id, "no_preview", "load a module preview first");
            };
            let (Some(student_id), Some(instrument_id)) = (
                param_i64(&req.params, "studentId"),
                param_i64(&req.params, "instrumentId"),
            ) else {
                return err(req.id, "bad_params", "missing studentId/instrumentId");
            };

            match session.save_exercises(student_id, instrument_id).await {
                Ok(SaveOutcome::NoChanges) => ok(
                    req.id,
                    json!({ "saved": false, "noChanges": true }),
                ),
                Ok(SaveOutcome::Saved {
                    stored,
                    cleared_indexes,
                    reports_error,
                }) => ok(
                    req.id,
                    json!({
                        "saved": true,
                        "stored": stored,
                        "clearedIndexes": cleared_indexes,
                        "generation": session.generation(),
                        "reportsError": reports_error
                    }),
                ),
                Err(SessionError::Validation(e)) => {
                    let details = match &e {
                        crate::diff::SaveRequestError::InvalidExercise {
                            exercise_index, ..
                        } => Some(json!({ "exerciseIndex": exercise_index })),
                    };
                    err_with(req.id, "validation_failed", e.to_string(), details)
                }
                Err(SessionError::NoPreview) => {
                    err(req.id, "no_preview", "load a module preview first")
                }
                Err(e @ SessionError::Save(_)) => err(req.id, "save_failed", e.to_string()),
                Err(e) => err(req.id, "base_load_failed", e.to_string()),
            }
        }
        other => err(
            req.id,
            "bad_params",
            format!("unknown method: {other}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, params: serde_json::Value) -> Request {
        Request {
            id: "t1".into(),
            method: method.into(),
            params,
        }
    }

    #[tokio::test]
    async fn health_reports_version_without_a_workspace() {
        let mut state = AppState::new();
        let resp = handle_request(&mut state, request("health", json!({}))).await;
        assert_eq!(resp["ok"], json!(true));
        assert!(resp["result"]["version"].is_string());
        assert_eq!(resp["result"]["workspacePath"], json!(null));
    }

    #[tokio::test]
    async fn methods_requiring_a_workspace_fail_without_one() {
        let mut state = AppState::new();
        let resp =
            handle_request(&mut state, request("preview.load", json!({ "moduleId": 1 }))).await;
        assert_eq!(resp["ok"], json!(false));
        assert_eq!(resp["error"]["code"], json!("no_workspace"));
    }

    #[tokio::test]
    async fn methods_requiring_a_preview_fail_without_one() {
        let mut state = AppState::new();
        let resp = handle_request(&mut state, request("preview.tables", json!({}))).await;
        assert_eq!(resp["error"]["code"], json!("no_preview"));

        let resp = handle_request(
            &mut state,
            request("exercises.get", json!({ "studentId": 1, "instrumentId": 2 })),
        )
        .await;
        assert_eq!(resp["error"]["code"], json!("no_preview"));
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let mut state = AppState::new();
        let resp = handle_request(&mut state, request("grades.frobnicate", json!({}))).await;
        assert_eq!(resp["ok"], json!(false));
        assert_eq!(resp["error"]["code"], json!("bad_params"));
    }
}

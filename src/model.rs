use serde::{Deserialize, Serialize};

/// Learning outcome (RA). Weights are percentages that should sum to 100
/// across a module, but the sum is reported as-is so discrepancies stay
/// visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningOutcome {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub weight_percent: f64,
}

/// Teaching unit (UT), grouped into terms by evaluation period.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeachingUnit {
    pub id: i64,
    pub name: String,
    pub evaluation_period: i64,
}

/// Share of a learning outcome resolved within a teaching unit.
/// At most one link per (utId, raId) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtRaLink {
    pub ut_id: i64,
    pub ra_id: i64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: i64,
    pub name: String,
    pub ut_id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseWeight {
    pub exercise_index: i64,
    pub weight_percent: f64,
}

/// Gradable artifact belonging to an activity and teaching unit,
/// optionally decomposed into up to 10 weighted exercises.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub id: i64,
    pub name: String,
    pub ut_id: i64,
    pub activity_id: i64,
    pub weight_percent: f64,
    #[serde(default)]
    pub ra_ids: Vec<i64>,
    #[serde(default)]
    pub exercise_weights: Vec<ExerciseWeight>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: i64,
    pub student_code: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseGrade {
    pub exercise_index: i64,
    pub grade_value: f64,
}

/// Persisted grade record, the unit of persistence: at most one per
/// (student, instrument) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub student_id: i64,
    pub instrument_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade_value: Option<f64>,
    #[serde(default)]
    pub exercise_grades: Vec<ExerciseGrade>,
}

/// Base entity snapshot for one module, as served by the preview fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModulePreview {
    pub module_id: i64,
    pub module_name: String,
    pub academic_year: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher_name: Option<String>,
    #[serde(default)]
    pub ras: Vec<LearningOutcome>,
    #[serde(default)]
    pub uts: Vec<TeachingUnit>,
    #[serde(default)]
    pub ut_ra_links: Vec<UtRaLink>,
    #[serde(default)]
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub instruments: Vec<Instrument>,
    #[serde(default)]
    pub students: Vec<Student>,
    #[serde(default)]
    pub grades: Vec<Grade>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationReportRow {
    pub student_id: i64,
    pub student_code: String,
    pub student_name: String,
    pub numeric_grade: f64,
    pub suggested_bulletin_grade: i64,
    #[serde(rename = "allRAsPassed")]
    pub all_ras_passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationReport {
    pub module_id: i64,
    pub evaluation_period: i64,
    pub students: Vec<EvaluationReportRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalReportRow {
    pub student_id: i64,
    pub student_code: String,
    pub student_name: String,
    pub final_grade: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalReport {
    pub module_id: i64,
    pub students: Vec<FinalReportRow>,
}

/// One item of a grade save batch. `grade_value` carries the persisted
/// overall grade when the exercises alone cannot determine it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveGradeEntry {
    pub student_id: i64,
    pub instrument_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade_value: Option<f64>,
    #[serde(default)]
    pub exercise_grades: Vec<ExerciseGrade>,
}

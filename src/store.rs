use crate::model::{
    Activity, EvaluationReport, EvaluationReportRow, ExerciseGrade, ExerciseWeight, FinalReport,
    FinalReportRow, Grade, Instrument, LearningOutcome, ModulePreview, SaveGradeEntry, Student,
    TeachingUnit, UtRaLink,
};
use crate::service::{ModuleService, ServiceError};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        ServiceError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub module_id: i64,
    pub students: usize,
    pub instruments: usize,
    pub grades: usize,
}

/// SQLite-backed module store. One database file per workspace.
///
/// The connection lives behind a mutex: rusqlite connections are not
/// `Sync`, and every service call is a short critical section on a
/// single-threaded runtime, so contention is not a concern.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(workspace)?;
        let db_path = workspace.join("sara.sqlite3");
        let conn = Connection::open(db_path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS modules(
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                academic_year TEXT NOT NULL,
                teacher_name TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS ras(
                id INTEGER PRIMARY KEY,
                module_id INTEGER NOT NULL,
                code TEXT NOT NULL,
                name TEXT NOT NULL,
                weight_percent REAL NOT NULL,
                FOREIGN KEY(module_id) REFERENCES modules(id)
            )",
            [],
        )?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_ras_module ON ras(module_id)", [])?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS uts(
                id INTEGER PRIMARY KEY,
                module_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                evaluation_period INTEGER NOT NULL,
                FOREIGN KEY(module_id) REFERENCES modules(id)
            )",
            [],
        )?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_uts_module ON uts(module_id)", [])?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS ut_ra_links(
                ut_id INTEGER NOT NULL,
                ra_id INTEGER NOT NULL,
                percent REAL NOT NULL,
                PRIMARY KEY(ut_id, ra_id),
                FOREIGN KEY(ut_id) REFERENCES uts(id),
                FOREIGN KEY(ra_id) REFERENCES ras(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS activities(
                id INTEGER PRIMARY KEY,
                module_id INTEGER NOT NULL,
                ut_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                FOREIGN KEY(module_id) REFERENCES modules(id),
                FOREIGN KEY(ut_id) REFERENCES uts(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_activities_module ON activities(module_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS instruments(
                id INTEGER PRIMARY KEY,
                module_id INTEGER NOT NULL,
                ut_id INTEGER NOT NULL,
                activity_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                weight_percent REAL NOT NULL,
                FOREIGN KEY(module_id) REFERENCES modules(id),
                FOREIGN KEY(ut_id) REFERENCES uts(id),
                FOREIGN KEY(activity_id) REFERENCES activities(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_instruments_module ON instruments(module_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_instruments_activity ON instruments(activity_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS instrument_ras(
                instrument_id INTEGER NOT NULL,
                ra_id INTEGER NOT NULL,
                PRIMARY KEY(instrument_id, ra_id),
                FOREIGN KEY(instrument_id) REFERENCES instruments(id),
                FOREIGN KEY(ra_id) REFERENCES ras(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS instrument_exercise_weights(
                instrument_id INTEGER NOT NULL,
                exercise_index INTEGER NOT NULL,
                weight_percent REAL NOT NULL,
                PRIMARY KEY(instrument_id, exercise_index),
                FOREIGN KEY(instrument_id) REFERENCES instruments(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS students(
                id INTEGER PRIMARY KEY,
                module_id INTEGER NOT NULL,
                student_code TEXT NOT NULL,
                full_name TEXT NOT NULL,
                FOREIGN KEY(module_id) REFERENCES modules(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_students_module ON students(module_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS grades(
                student_id INTEGER NOT NULL,
                instrument_id INTEGER NOT NULL,
                grade_value REAL,
                updated_at TEXT,
                PRIMARY KEY(student_id, instrument_id),
                FOREIGN KEY(student_id) REFERENCES students(id),
                FOREIGN KEY(instrument_id) REFERENCES instruments(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS exercise_grades(
                student_id INTEGER NOT NULL,
                instrument_id INTEGER NOT NULL,
                exercise_index INTEGER NOT NULL,
                grade_value REAL NOT NULL,
                updated_at TEXT,
                PRIMARY KEY(student_id, instrument_id, exercise_index),
                FOREIGN KEY(student_id) REFERENCES students(id),
                FOREIGN KEY(instrument_id) REFERENCES instruments(id)
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another thread panicked mid-call;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the stored snapshot of a module wholesale. Every entity
    /// row for the module is rewritten inside one transaction.
    pub fn import_module(&self, preview: &ModulePreview) -> anyhow::Result<ImportSummary> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let module_id = preview.module_id;

        tx.execute(
            "DELETE FROM exercise_grades WHERE student_id IN
                (SELECT id FROM students WHERE module_id = ?1)",
            params![module_id],
        )?;
        tx.execute(
            "DELETE FROM grades WHERE student_id IN
                (SELECT id FROM students WHERE module_id = ?1)",
            params![module_id],
        )?;
        tx.execute(
            "DELETE FROM instrument_exercise_weights WHERE instrument_id IN
                (SELECT id FROM instruments WHERE module_id = ?1)",
            params![module_id],
        )?;
        tx.execute(
            "DELETE FROM instrument_ras WHERE instrument_id IN
                (SELECT id FROM instruments WHERE module_id = ?1)",
            params![module_id],
        )?;
        tx.execute(
            "DELETE FROM ut_ra_links WHERE ut_id IN
                (SELECT id FROM uts WHERE module_id = ?1)",
            params![module_id],
        )?;
        tx.execute("DELETE FROM students WHERE module_id = ?1", params![module_id])?;
        tx.execute("DELETE FROM instruments WHERE module_id = ?1", params![module_id])?;
        tx.execute("DELETE FROM activities WHERE module_id = ?1", params![module_id])?;
        tx.execute("DELETE FROM uts WHERE module_id = ?1", params![module_id])?;
        tx.execute("DELETE FROM ras WHERE module_id = ?1", params![module_id])?;
        tx.execute("DELETE FROM modules WHERE id = ?1", params![module_id])?;

        tx.execute(
            "INSERT INTO modules(id, name, academic_year, teacher_name) VALUES (?1, ?2, ?3, ?4)",
            params![
                module_id,
                preview.module_name,
                preview.academic_year,
                preview.teacher_name
            ],
        )?;
        for ra in &preview.ras {
            tx.execute(
                "INSERT INTO ras(id, module_id, code, name, weight_percent)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ra.id, module_id, ra.code, ra.name, ra.weight_percent],
            )?;
        }
        for ut in &preview.uts {
            tx.execute(
                "INSERT INTO uts(id, module_id, name, evaluation_period) VALUES (?1, ?2, ?3, ?4)",
                params![ut.id, module_id, ut.name, ut.evaluation_period],
            )?;
        }
        for link in &preview.ut_ra_links {
            tx.execute(
                "INSERT OR REPLACE INTO ut_ra_links(ut_id, ra_id, percent) VALUES (?1, ?2, ?3)",
                params![link.ut_id, link.ra_id, link.percent],
            )?;
        }
        for activity in &preview.activities {
            tx.execute(
                "INSERT INTO activities(id, module_id, ut_id, name) VALUES (?1, ?2, ?3, ?4)",
                params![activity.id, module_id, activity.ut_id, activity.name],
            )?;
        }
        for instrument in &preview.instruments {
            tx.execute(
                "INSERT INTO instruments(id, module_id, ut_id, activity_id, name, weight_percent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    instrument.id,
                    module_id,
                    instrument.ut_id,
                    instrument.activity_id,
                    instrument.name,
                    instrument.weight_percent
                ],
            )?;
            for ra_id in &instrument.ra_ids {
                tx.execute(
                    "INSERT OR REPLACE INTO instrument_ras(instrument_id, ra_id) VALUES (?1, ?2)",
                    params![instrument.id, ra_id],
                )?;
            }
            for weight in &instrument.exercise_weights {
                tx.execute(
                    "INSERT OR REPLACE INTO instrument_exercise_weights(
                        instrument_id, exercise_index, weight_percent)
                     VALUES (?1, ?2, ?3)",
                    params![instrument.id, weight.exercise_index, weight.weight_percent],
                )?;
            }
        }
        for student in &preview.students {
            tx.execute(
                "INSERT INTO students(id, module_id, student_code, full_name)
                 VALUES (?1, ?2, ?3, ?4)",
                params![student.id, module_id, student.student_code, student.full_name],
            )?;
        }
        let now = Utc::now().to_rfc3339();
        for grade in &preview.grades {
            tx.execute(
                "INSERT OR REPLACE INTO grades(student_id, instrument_id, grade_value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![grade.student_id, grade.instrument_id, grade.grade_value, now],
            )?;
            for exercise in &grade.exercise_grades {
                tx.execute(
                    "INSERT OR REPLACE INTO exercise_grades(
                        student_id, instrument_id, exercise_index, grade_value, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        grade.student_id,
                        grade.instrument_id,
                        exercise.exercise_index,
                        exercise.grade_value,
                        now
                    ],
                )?;
            }
        }

        tx.commit()?;
        info!(
            module_id,
            students = preview.students.len(),
            instruments = preview.instruments.len(),
            "module imported"
        );
        Ok(ImportSummary {
            module_id,
            students: preview.students.len(),
            instruments: preview.instruments.len(),
            grades: preview.grades.len(),
        })
    }

    fn load_preview(&self, module_id: i64) -> Result<ModulePreview, ServiceError> {
        let conn = self.lock();

        let header = conn
            .query_row(
                "SELECT name, academic_year, teacher_name FROM modules WHERE id = ?1",
                params![module_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        let (module_name, academic_year, teacher_name) = match header {
            Some(h) => h,
            None => return Err(ServiceError::ModuleNotFound(module_id)),
        };

        let mut stmt = conn.prepare(
            "SELECT id, code, name, weight_percent FROM ras WHERE module_id = ?1 ORDER BY id",
        )?;
        let ras = stmt
            .query_map(params![module_id], |row| {
                Ok(LearningOutcome {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    name: row.get(2)?,
                    weight_percent: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, name, evaluation_period FROM uts WHERE module_id = ?1 ORDER BY id",
        )?;
        let uts = stmt
            .query_map(params![module_id], |row| {
                Ok(TeachingUnit {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    evaluation_period: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT l.ut_id, l.ra_id, l.percent FROM ut_ra_links l
             JOIN uts u ON u.id = l.ut_id
             WHERE u.module_id = ?1 ORDER BY l.ut_id, l.ra_id",
        )?;
        let ut_ra_links = stmt
            .query_map(params![module_id], |row| {
                Ok(UtRaLink {
                    ut_id: row.get(0)?,
                    ra_id: row.get(1)?,
                    percent: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, name, ut_id FROM activities WHERE module_id = ?1 ORDER BY id",
        )?;
        let activities = stmt
            .query_map(params![module_id], |row| {
                Ok(Activity {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    ut_id: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, name, ut_id, activity_id, weight_percent
             FROM instruments WHERE module_id = ?1 ORDER BY id",
        )?;
        let mut instruments = stmt
            .query_map(params![module_id], |row| {
                Ok(Instrument {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    ut_id: row.get(2)?,
                    activity_id: row.get(3)?,
                    weight_percent: row.get(4)?,
                    ra_ids: Vec::new(),
                    exercise_weights: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT r.instrument_id, r.ra_id FROM instrument_ras r
             JOIN instruments i ON i.id = r.instrument_id
             WHERE i.module_id = ?1 ORDER BY r.instrument_id, r.ra_id",
        )?;
        let mut ra_links: HashMap<i64, Vec<i64>> = HashMap::new();
        let rows = stmt.query_map(params![module_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (instrument_id, ra_id) = row?;
            ra_links.entry(instrument_id).or_default().push(ra_id);
        }

        let mut stmt = conn.prepare(
            "SELECT w.instrument_id, w.exercise_index, w.weight_percent
             FROM instrument_exercise_weights w
             JOIN instruments i ON i.id = w.instrument_id
             WHERE i.module_id = ?1 ORDER BY w.instrument_id, w.exercise_index",
        )?;
        let mut weight_rows: HashMap<i64, Vec<ExerciseWeight>> = HashMap::new();
        let rows = stmt.query_map(params![module_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                ExerciseWeight {
                    exercise_index: row.get(1)?,
                    weight_percent: row.get(2)?,
                },
            ))
        })?;
        for row in rows {
            let (instrument_id, weight) = row?;
            weight_rows.entry(instrument_id).or_default().push(weight);
        }

        for instrument in &mut instruments {
            if let Some(ids) = ra_links.remove(&instrument.id) {
                instrument.ra_ids = ids;
            }
            if let Some(weights) = weight_rows.remove(&instrument.id) {
                instrument.exercise_weights = weights;
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, student_code, full_name FROM students WHERE module_id = ?1 ORDER BY id",
        )?;
        let students = stmt
            .query_map(params![module_id], |row| {
                Ok(Student {
                    id: row.get(0)?,
                    student_code: row.get(1)?,
                    full_name: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT g.student_id, g.instrument_id, g.grade_value FROM grades g
             JOIN students s ON s.id = g.student_id
             WHERE s.module_id = ?1 ORDER BY g.student_id, g.instrument_id",
        )?;
        let mut grades = stmt
            .query_map(params![module_id], |row| {
                Ok(Grade {
                    student_id: row.get(0)?,
                    instrument_id: row.get(1)?,
                    grade_value: row.get(2)?,
                    exercise_grades: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT e.student_id, e.instrument_id, e.exercise_index, e.grade_value
             FROM exercise_grades e
             JOIN students s ON s.id = e.student_id
             WHERE s.module_id = ?1 ORDER BY e.student_id, e.instrument_id, e.exercise_index",
        )?;
        let mut exercise_rows: HashMap<(i64, i64), Vec<ExerciseGrade>> = HashMap::new();
        let rows = stmt.query_map(params![module_id], |row| {
            Ok((
                (row.get::<_, i64>(0)?, row.get::<_, i64>(1)?),
                ExerciseGrade {
                    exercise_index: row.get(2)?,
                    grade_value: row.get(3)?,
                },
            ))
        })?;
        for row in rows {
            let (pair, exercise) = row?;
            exercise_rows.entry(pair).or_default().push(exercise);
        }
        for grade in &mut grades {
            if let Some(exercises) = exercise_rows.remove(&(grade.student_id, grade.instrument_id))
            {
                grade.exercise_grades = exercises;
            }
        }

        Ok(ModulePreview {
            module_id,
            module_name,
            academic_year,
            teacher_name,
            ras,
            uts,
            ut_ra_links,
            activities,
            instruments,
            students,
            grades,
        })
    }
}

#[async_trait]
impl ModuleService for SqliteStore {
    async fn fetch_module_preview(&self, module_id: i64) -> Result<ModulePreview, ServiceError> {
        self.load_preview(module_id)
    }

    async fn fetch_evaluation_report(
        &self,
        module_id: i64,
        evaluation_period: i64,
    ) -> Result<EvaluationReport, ServiceError> {
        let preview = self.load_preview(module_id)?;
        compute_evaluation_report(&preview, evaluation_period)
    }

    async fn fetch_final_report(&self, module_id: i64) -> Result<FinalReport, ServiceError> {
        let preview = self.load_preview(module_id)?;
        Ok(compute_final_report(&preview))
    }

    async fn save_grades(
        &self,
        module_id: i64,
        entries: Vec<SaveGradeEntry>,
    ) -> Result<usize, ServiceError> {
        let preview = self.load_preview(module_id)?;
        let student_ids: HashSet<i64> = preview.students.iter().map(|s| s.id).collect();
        let instrument_by_id: HashMap<i64, &Instrument> =
            preview.instruments.iter().map(|i| (i.id, i)).collect();

        let entries = coalesce_entries(entries);
        let mut stored = 0usize;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        for entry in entries {
            if !student_ids.contains(&entry.student_id) {
                return Err(ServiceError::Rejected(format!(
                    "student {} not found in module {}",
                    entry.student_id, module_id
                )));
            }
            let instrument = instrument_by_id.get(&entry.instrument_id).ok_or_else(|| {
                ServiceError::Rejected(format!(
                    "instrument {} not found in module {}",
                    entry.instrument_id, module_id
                ))
            })?;
            if instrument.ra_ids.is_empty() {
                return Err(ServiceError::Rejected(format!(
                    "instrument {} has no RA associations; link instrument-RA before adding grades",
                    instrument.id
                )));
            }
            validate_exercise_entries(&entry.exercise_grades)?;

            let grade_value = resolve_grade_value(instrument, &entry)?;
            tx.execute(
                "INSERT INTO grades(student_id, instrument_id, grade_value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(student_id, instrument_id)
                 DO UPDATE SET grade_value = ?3, updated_at = ?4",
                params![entry.student_id, entry.instrument_id, grade_value, now],
            )?;

            if !entry.exercise_grades.is_empty() {
                tx.execute(
                    "DELETE FROM exercise_grades WHERE student_id = ?1 AND instrument_id = ?2",
                    params![entry.student_id, entry.instrument_id],
                )?;
                for exercise in &entry.exercise_grades {
                    tx.execute(
                        "INSERT INTO exercise_grades(
                            student_id, instrument_id, exercise_index, grade_value, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            entry.student_id,
                            entry.instrument_id,
                            exercise.exercise_index,
                            round_half_up(exercise.grade_value, 2),
                            now
                        ],
                    )?;
                }
            }
            stored += 1;
        }

        tx.commit()?;
        debug!(module_id, stored, "grade batch persisted");
        Ok(stored)
    }
}

/// Half-up decimal rounding over non-negative grade values.
pub fn round_half_up(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor + 0.5).floor() / factor
}

/// Bulletin scale: below 1 clamps to 1, failing grades truncate, a
/// numeric pass with an unpassed RA caps at 4, and a clean pass rounds
/// half-up.
pub fn suggested_bulletin_grade(numeric_grade: f64, all_ras_passed: bool) -> i64 {
    if numeric_grade < 1.0 {
        return 1;
    }
    if numeric_grade < 5.0 {
        return numeric_grade.trunc() as i64;
    }
    if !all_ras_passed {
        return 4;
    }
    round_half_up(numeric_grade, 0) as i64
}

/// Later entries for the same (student, instrument) pair override
/// earlier ones field by field, preserving first-seen order.
fn coalesce_entries(entries: Vec<SaveGradeEntry>) -> Vec<SaveGradeEntry> {
    let mut order: Vec<(i64, i64)> = Vec::new();
    let mut by_pair: HashMap<(i64, i64), SaveGradeEntry> = HashMap::new();

    for entry in entries {
        let pair = (entry.student_id, entry.instrument_id);
        match by_pair.get_mut(&pair) {
            None => {
                order.push(pair);
                by_pair.insert(pair, entry);
            }
            Some(current) => {
                if entry.grade_value.is_some() {
                    current.grade_value = entry.grade_value;
                }
                if !entry.exercise_grades.is_empty() {
                    current.exercise_grades = entry.exercise_grades;
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|pair| by_pair.remove(&pair))
        .collect()
}

fn validate_exercise_entries(exercises: &[ExerciseGrade]) -> Result<(), ServiceError> {
    let mut seen = HashSet::new();
    for exercise in exercises {
        if !seen.insert(exercise.exercise_index) {
            return Err(ServiceError::Rejected(format!(
                "duplicated exerciseIndex in exerciseGrades: {}",
                exercise.exercise_index
            )));
        }
    }
    Ok(())
}

/// Overall grade for a save entry: recomputed from the instrument's
/// positive exercise weights when exercises are present (absent ones
/// count as zero), otherwise the explicit grade value. Both paths round
/// half-up to 2 decimals.
fn resolve_grade_value(
    instrument: &Instrument,
    entry: &SaveGradeEntry,
) -> Result<f64, ServiceError> {
    if !entry.exercise_grades.is_empty() {
        let by_index: HashMap<i64, f64> = entry
            .exercise_grades
            .iter()
            .map(|e| (e.exercise_index, e.grade_value))
            .collect();

        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for weight in &instrument.exercise_weights {
            if weight.weight_percent <= 0.0 {
                continue;
            }
            let grade = by_index.get(&weight.exercise_index).copied().unwrap_or(0.0);
            weighted += grade * weight.weight_percent;
            total_weight += weight.weight_percent;
        }

        if total_weight > 0.0 {
            return Ok(round_half_up(weighted / total_weight, 2));
        }
        if let Some(fallback) = entry.grade_value {
            return Ok(round_half_up(fallback, 2));
        }
        return Err(ServiceError::Rejected(format!(
            "cannot compute grade from exercises for instrument {}: no exercise weights configured",
            instrument.id
        )));
    }

    match entry.grade_value {
        Some(value) => Ok(round_half_up(value, 2)),
        None => Err(ServiceError::Rejected(
            "gradeValue is required when exerciseGrades is empty".into(),
        )),
    }
}

struct ReportContext<'a> {
    preview: &'a ModulePreview,
    activity_by_ut: HashMap<i64, i64>,
    instruments_by_activity: HashMap<i64, Vec<&'a Instrument>>,
    ut_period: HashMap<i64, i64>,
    evaluation_periods: BTreeSet<i64>,
}

impl<'a> ReportContext<'a> {
    fn build(preview: &'a ModulePreview) -> Self {
        let mut activity_by_ut = HashMap::new();
        for activity in &preview.activities {
            activity_by_ut.insert(activity.ut_id, activity.id);
        }
        let mut instruments_by_activity: HashMap<i64, Vec<&Instrument>> = HashMap::new();
        for instrument in &preview.instruments {
            instruments_by_activity
                .entry(instrument.activity_id)
                .or_default()
                .push(instrument);
        }
        let ut_period: HashMap<i64, i64> = preview
            .uts
            .iter()
            .map(|ut| (ut.id, ut.evaluation_period))
            .collect();
        let evaluation_periods: BTreeSet<i64> =
            preview.uts.iter().map(|ut| ut.evaluation_period).collect();
        Self {
            preview,
            activity_by_ut,
            instruments_by_activity,
            ut_period,
            evaluation_periods,
        }
    }

    fn grades_for(&self, student_id: i64) -> HashMap<i64, f64> {
        self.preview
            .grades
            .iter()
            .filter(|g| g.student_id == student_id)
            .filter_map(|g| g.grade_value.map(|v| (g.instrument_id, v)))
            .collect()
    }

    /// (utId, raId) -> weighted instrument mean for one UT-RA link.
    /// A missing instrument grade counts as zero in the numerator but
    /// its weight still counts in the denominator.
    fn ut_ra_grades(&self, grades: &HashMap<i64, f64>) -> HashMap<(i64, i64), f64> {
        let mut result = HashMap::new();
        for link in &self.preview.ut_ra_links {
            let value = match self.activity_by_ut.get(&link.ut_id) {
                None => 0.0,
                Some(activity_id) => {
                    let mut numerator = 0.0;
                    let mut denominator = 0.0;
                    for instrument in self
                        .instruments_by_activity
                        .get(activity_id)
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                    {
                        if !instrument.ra_ids.contains(&link.ra_id) {
                            continue;
                        }
                        let grade = grades.get(&instrument.id).copied().unwrap_or(0.0);
                        numerator += grade * instrument.weight_percent;
                        denominator += instrument.weight_percent;
                    }
                    if denominator == 0.0 {
                        0.0
                    } else {
                        round_half_up(numerator / denominator, 4)
                    }
                }
            };
            result.insert((link.ut_id, link.ra_id), value);
        }
        result
    }

    fn final_grade(&self, grades: &HashMap<i64, f64>) -> f64 {
        let ut_ra = self.ut_ra_grades(grades);
        let mut final_grade = 0.0;
        for ra in &self.preview.ras {
            let mut ra_global = 0.0;
            for link in self
                .preview
                .ut_ra_links
                .iter()
                .filter(|l| l.ra_id == ra.id)
            {
                let grade = ut_ra.get(&(link.ut_id, link.ra_id)).copied().unwrap_or(0.0);
                ra_global += grade * link.percent / 100.0;
            }
            final_grade += round_half_up(ra_global, 4) * ra.weight_percent / 100.0;
        }
        round_half_up(final_grade, 4)
    }

    /// Evaluation-period grade: per-RA grade over the links whose UT
    /// falls in the period, normalized by those links' percents, then
    /// aggregated by global RA weight over the RAs present in the
    /// period. An RA below 5 in the period clears the passed flag.
    fn evaluation_result(
        &self,
        grades: &HashMap<i64, f64>,
        evaluation_period: i64,
    ) -> (f64, bool) {
        let ut_ra = self.ut_ra_grades(grades);

        let mut weighted_sum = 0.0;
        let mut total_ra_weight = 0.0;
        let mut all_passed = true;

        for ra in &self.preview.ras {
            let links_in_period: Vec<&UtRaLink> = self
                .preview
                .ut_ra_links
                .iter()
                .filter(|l| l.ra_id == ra.id)
                .filter(|l| self.ut_period.get(&l.ut_id) == Some(&evaluation_period))
                .collect();
            if links_in_period.is_empty() {
                continue;
            }

            let percent_sum: f64 = links_in_period.iter().map(|l| l.percent).sum();
            let ra_eval_grade = if percent_sum > 0.0 {
                let numerator: f64 = links_in_period
                    .iter()
                    .map(|l| {
                        ut_ra.get(&(l.ut_id, l.ra_id)).copied().unwrap_or(0.0) * l.percent
                    })
                    .sum();
                numerator / percent_sum
            } else {
                0.0
            };

            if ra_eval_grade < 5.0 {
                all_passed = false;
            }
            weighted_sum += ra_eval_grade * ra.weight_percent;
            total_ra_weight += ra.weight_percent;
        }

        let numeric = if total_ra_weight > 0.0 {
            round_half_up(weighted_sum / total_ra_weight, 4)
        } else {
            0.0
        };
        (numeric, all_passed)
    }

    fn sorted_students(&self) -> Vec<&Student> {
        let mut students: Vec<&Student> = self.preview.students.iter().collect();
        students.sort_by(|a, b| a.student_code.cmp(&b.student_code));
        students
    }
}

pub fn compute_evaluation_report(
    preview: &ModulePreview,
    evaluation_period: i64,
) -> Result<EvaluationReport, ServiceError> {
    let context = ReportContext::build(preview);
    if !context.evaluation_periods.contains(&evaluation_period) {
        return Err(ServiceError::Rejected(format!(
            "evaluation period not configured in module: {evaluation_period}"
        )));
    }

    let mut rows = Vec::new();
    for student in context.sorted_students() {
        let grades = context.grades_for(student.id);
        let (numeric_grade, all_ras_passed) = context.evaluation_result(&grades, evaluation_period);
        rows.push(EvaluationReportRow {
            student_id: student.id,
            student_code: student.student_code.clone(),
            student_name: student.full_name.clone(),
            numeric_grade,
            suggested_bulletin_grade: suggested_bulletin_grade(numeric_grade, all_ras_passed),
            all_ras_passed,
        });
    }

    Ok(EvaluationReport {
        module_id: preview.module_id,
        evaluation_period,
        students: rows,
    })
}

pub fn compute_final_report(preview: &ModulePreview) -> FinalReport {
    let context = ReportContext::build(preview);
    let mut rows = Vec::new();
    for student in context.sorted_students() {
        let grades = context.grades_for(student.id);
        rows.push(FinalReportRow {
            student_id: student.id,
            student_code: student.student_code.clone(),
            student_name: student.full_name.clone(),
            final_grade: context.final_grade(&grades),
        });
    }
    FinalReport {
        module_id: preview.module_id,
        students: rows,
    }
}

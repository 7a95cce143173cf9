use crate::calc::{self, EXERCISE_INDEXES};
use crate::index::EntityIndex;
use crate::model::{ExerciseGrade, SaveGradeEntry};
use crate::overlay::{EditOverlay, ExerciseKey};
use thiserror::Error;

/// Absolute difference below which an edited value is treated as equal
/// to the persisted one, so floating round-trip noise never triggers a
/// save.
pub const CHANGE_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error, PartialEq)]
pub enum SaveRequestError {
    #[error("invalid value {text:?} for exercise {exercise_index}: must be a number between 0 and 10")]
    InvalidExercise { exercise_index: i64, text: String },
}

/// Minimal reconciliation result for one (student, instrument) pair.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    /// Whether anything differs from the persisted record. When false
    /// the caller must not issue the save call.
    pub changed: bool,
    /// Indices whose persisted value was cleared in the editor. They
    /// count as changes but are absent from the payload: the save path
    /// has no way to express deletion of a single exercise grade.
    pub cleared_indexes: Vec<i64>,
    pub entry: SaveGradeEntry,
}

/// Compares the overlay against the persisted snapshot for one pair and
/// builds the outgoing save entry. Validation failures abort the whole
/// request; no partial submission.
pub fn build_save_request(
    index: &EntityIndex,
    overlay: &EditOverlay,
    student_id: i64,
    instrument_id: i64,
) -> Result<SaveRequest, SaveRequestError> {
    let mut changed = false;
    let mut cleared_indexes = Vec::new();
    let mut exercise_grades = Vec::new();

    for exercise_index in EXERCISE_INDEXES {
        let key = ExerciseKey::new(student_id, instrument_id, exercise_index);
        let raw = overlay.display_value(index, key);
        let text = raw.trim();
        let persisted = index.persisted_exercise(student_id, instrument_id, exercise_index);

        if text.is_empty() {
            if persisted.is_some() {
                changed = true;
                cleared_indexes.push(exercise_index);
            }
            continue;
        }

        let parsed = match calc::parse_grade_text(text) {
            Some(v) if (0.0..=10.0).contains(&v) => v,
            _ => {
                return Err(SaveRequestError::InvalidExercise {
                    exercise_index,
                    text: text.to_string(),
                })
            }
        };

        match persisted {
            None => changed = true,
            Some(prev) if (prev - parsed).abs() >= CHANGE_TOLERANCE => changed = true,
            Some(_) => {}
        }

        exercise_grades.push(ExerciseGrade {
            exercise_index,
            grade_value: parsed,
        });
    }

    Ok(SaveRequest {
        changed,
        cleared_indexes,
        entry: SaveGradeEntry {
            student_id,
            instrument_id,
            grade_value: index.persisted_grade(student_id, instrument_id),
            exercise_grades,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExerciseWeight, Grade, Instrument, ModulePreview};

    fn index_for(exercises: Vec<(i64, f64)>, grade_value: Option<f64>) -> EntityIndex {
        EntityIndex::build(&ModulePreview {
            module_id: 1,
            module_name: "Test".into(),
            academic_year: "2025-2026".into(),
            teacher_name: None,
            ras: vec![],
            uts: vec![],
            ut_ra_links: vec![],
            activities: vec![],
            instruments: vec![Instrument {
                id: 2,
                name: "Examen".into(),
                ut_id: 1,
                activity_id: 1,
                weight_percent: 100.0,
                ra_ids: vec![1],
                exercise_weights: vec![
                    ExerciseWeight {
                        exercise_index: 1,
                        weight_percent: 50.0,
                    },
                    ExerciseWeight {
                        exercise_index: 2,
                        weight_percent: 50.0,
                    },
                ],
            }],
            students: vec![],
            grades: vec![Grade {
                student_id: 1,
                instrument_id: 2,
                grade_value,
                exercise_grades: exercises
                    .into_iter()
                    .map(|(exercise_index, grade_value)| crate::model::ExerciseGrade {
                        exercise_index,
                        grade_value,
                    })
                    .collect(),
            }],
        })
    }

    #[test]
    fn untouched_pair_reports_no_change() {
        let index = index_for(vec![(1, 6.0), (2, 8.0)], Some(7.0));
        let overlay = EditOverlay::default();
        let request = build_save_request(&index, &overlay, 1, 2).expect("request");
        assert!(!request.changed);
        assert_eq!(request.entry.exercise_grades.len(), 2);
        assert_eq!(request.entry.grade_value, Some(7.0));
    }

    #[test]
    fn tolerance_absorbs_round_trip_noise() {
        let index = index_for(vec![(1, 7.0)], Some(7.0));

        let mut overlay = EditOverlay::default();
        overlay.set(ExerciseKey::new(1, 2, 1), "7.0000001");
        let request = build_save_request(&index, &overlay, 1, 2).expect("request");
        assert!(!request.changed);

        let mut overlay = EditOverlay::default();
        overlay.set(ExerciseKey::new(1, 2, 1), "7.01");
        let request = build_save_request(&index, &overlay, 1, 2).expect("request");
        assert!(request.changed);
    }

    #[test]
    fn out_of_range_value_aborts_naming_the_index() {
        let index = index_for(vec![], None);
        let mut overlay = EditOverlay::default();
        overlay.set(ExerciseKey::new(1, 2, 3), "11");

        let err = build_save_request(&index, &overlay, 1, 2).expect_err("must reject");
        assert_eq!(
            err,
            SaveRequestError::InvalidExercise {
                exercise_index: 3,
                text: "11".into()
            }
        );
    }

    #[test]
    fn unparsable_text_aborts_the_whole_request() {
        let index = index_for(vec![(1, 6.0)], None);
        let mut overlay = EditOverlay::default();
        overlay.set(ExerciseKey::new(1, 2, 2), "seven");

        let err = build_save_request(&index, &overlay, 1, 2).expect_err("must reject");
        assert!(matches!(
            err,
            SaveRequestError::InvalidExercise {
                exercise_index: 2,
                ..
            }
        ));
    }

    #[test]
    fn cleared_value_counts_as_change_but_leaves_payload() {
        let index = index_for(vec![(1, 6.0), (2, 8.0)], Some(7.0));
        let mut overlay = EditOverlay::default();
        overlay.set(ExerciseKey::new(1, 2, 1), "  ");

        let request = build_save_request(&index, &overlay, 1, 2).expect("request");
        assert!(request.changed);
        assert_eq!(request.cleared_indexes, vec![1]);
        let indexes: Vec<i64> = request
            .entry
            .exercise_grades
            .iter()
            .map(|e| e.exercise_index)
            .collect();
        assert_eq!(indexes, vec![2]);
    }

    #[test]
    fn new_value_on_blank_cell_is_a_change() {
        let index = index_for(vec![(1, 6.0)], None);
        let mut overlay = EditOverlay::default();
        overlay.set(ExerciseKey::new(1, 2, 2), "9,75");

        let request = build_save_request(&index, &overlay, 1, 2).expect("request");
        assert!(request.changed);
        assert_eq!(request.entry.exercise_grades.len(), 2);
        assert_eq!(request.entry.exercise_grades[1].grade_value, 9.75);
    }

    #[test]
    fn comma_decimals_validate_in_range() {
        let index = index_for(vec![], None);
        let mut overlay = EditOverlay::default();
        overlay.set(ExerciseKey::new(1, 2, 1), "9,99");
        let request = build_save_request(&index, &overlay, 1, 2).expect("request");
        assert!(request.changed);

        let mut overlay = EditOverlay::default();
        overlay.set(ExerciseKey::new(1, 2, 1), "10,01");
        assert!(build_save_request(&index, &overlay, 1, 2).is_err());
    }
}

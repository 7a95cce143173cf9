use crate::calc;
use crate::model::{Activity, Instrument, LearningOutcome, ModulePreview, Student, TeachingUnit};
use std::collections::{BTreeMap, HashMap};

/// O(1) lookup structures over a module snapshot.
///
/// Pure derivation: rebuilt whenever the snapshot is replaced, never
/// mutated in place. Duplicate ids keep the last-seen entity; foreign
/// keys are not checked here, so a lookup for an unresolved reference
/// simply returns `None` and the caller renders the cell as absent.
#[derive(Debug, Default, Clone)]
pub struct EntityIndex {
    pub ra_by_id: HashMap<i64, LearningOutcome>,
    pub ut_by_id: HashMap<i64, TeachingUnit>,
    pub activity_by_id: HashMap<i64, Activity>,
    pub instrument_by_id: HashMap<i64, Instrument>,
    pub student_by_id: HashMap<i64, Student>,
    /// (utId, raId) -> percent share of the RA resolved in that UT.
    pub ut_ra_percent: HashMap<(i64, i64), f64>,
    /// (studentId, instrumentId) -> persisted overall grade.
    pub grade_by_pair: HashMap<(i64, i64), f64>,
    /// (studentId, instrumentId) -> persisted per-exercise grades,
    /// keyed by exercise index within 1..=10.
    pub exercises_by_pair: HashMap<(i64, i64), BTreeMap<i64, f64>>,
    /// instrumentId -> positive exercise weights within 1..=10.
    pub weights_by_instrument: HashMap<i64, BTreeMap<i64, f64>>,
}

impl EntityIndex {
    pub fn build(preview: &ModulePreview) -> Self {
        let mut index = EntityIndex::default();

        for ra in &preview.ras {
            index.ra_by_id.insert(ra.id, ra.clone());
        }
        for ut in &preview.uts {
            index.ut_by_id.insert(ut.id, ut.clone());
        }
        for activity in &preview.activities {
            index.activity_by_id.insert(activity.id, activity.clone());
        }
        for instrument in &preview.instruments {
            index
                .weights_by_instrument
                .insert(instrument.id, calc::exercise_weight_table(instrument));
            index
                .instrument_by_id
                .insert(instrument.id, instrument.clone());
        }
        for student in &preview.students {
            index.student_by_id.insert(student.id, student.clone());
        }
        for link in &preview.ut_ra_links {
            index
                .ut_ra_percent
                .insert((link.ut_id, link.ra_id), link.percent);
        }
        for grade in &preview.grades {
            let pair = (grade.student_id, grade.instrument_id);
            if let Some(value) = grade.grade_value {
                index.grade_by_pair.insert(pair, value);
            }
            let by_index: BTreeMap<i64, f64> = grade
                .exercise_grades
                .iter()
                .filter(|e| calc::EXERCISE_INDEXES.contains(&e.exercise_index))
                .filter(|e| e.grade_value.is_finite())
                .map(|e| (e.exercise_index, e.grade_value))
                .collect();
            index.exercises_by_pair.insert(pair, by_index);
        }

        index
    }

    pub fn persisted_grade(&self, student_id: i64, instrument_id: i64) -> Option<f64> {
        self.grade_by_pair
            .get(&(student_id, instrument_id))
            .copied()
    }

    pub fn persisted_exercise(
        &self,
        student_id: i64,
        instrument_id: i64,
        exercise_index: i64,
    ) -> Option<f64> {
        self.exercises_by_pair
            .get(&(student_id, instrument_id))
            .and_then(|m| m.get(&exercise_index))
            .copied()
    }

    pub fn exercise_weights(&self, instrument_id: i64) -> Option<&BTreeMap<i64, f64>> {
        self.weights_by_instrument.get(&instrument_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExerciseGrade, ExerciseWeight, Grade};

    fn preview_with(grades: Vec<Grade>, instruments: Vec<Instrument>) -> ModulePreview {
        ModulePreview {
            module_id: 1,
            module_name: "Test".into(),
            academic_year: "2025-2026".into(),
            teacher_name: None,
            ras: vec![],
            uts: vec![],
            ut_ra_links: vec![],
            activities: vec![],
            instruments,
            students: vec![],
            grades,
        }
    }

    #[test]
    fn duplicate_grade_records_keep_last_seen() {
        let preview = preview_with(
            vec![
                Grade {
                    student_id: 1,
                    instrument_id: 2,
                    grade_value: Some(4.0),
                    exercise_grades: vec![],
                },
                Grade {
                    student_id: 1,
                    instrument_id: 2,
                    grade_value: Some(6.5),
                    exercise_grades: vec![],
                },
            ],
            vec![],
        );
        let index = EntityIndex::build(&preview);
        assert_eq!(index.persisted_grade(1, 2), Some(6.5));
    }

    #[test]
    fn absent_grade_value_is_not_indexed() {
        let preview = preview_with(
            vec![Grade {
                student_id: 1,
                instrument_id: 2,
                grade_value: None,
                exercise_grades: vec![ExerciseGrade {
                    exercise_index: 1,
                    grade_value: 7.0,
                }],
            }],
            vec![],
        );
        let index = EntityIndex::build(&preview);
        assert_eq!(index.persisted_grade(1, 2), None);
        assert_eq!(index.persisted_exercise(1, 2, 1), Some(7.0));
    }

    #[test]
    fn out_of_range_exercise_indices_are_dropped() {
        let preview = preview_with(
            vec![Grade {
                student_id: 1,
                instrument_id: 2,
                grade_value: None,
                exercise_grades: vec![
                    ExerciseGrade {
                        exercise_index: 0,
                        grade_value: 5.0,
                    },
                    ExerciseGrade {
                        exercise_index: 11,
                        grade_value: 5.0,
                    },
                    ExerciseGrade {
                        exercise_index: 10,
                        grade_value: 5.0,
                    },
                ],
            }],
            vec![],
        );
        let index = EntityIndex::build(&preview);
        assert_eq!(index.persisted_exercise(1, 2, 0), None);
        assert_eq!(index.persisted_exercise(1, 2, 11), None);
        assert_eq!(index.persisted_exercise(1, 2, 10), Some(5.0));
    }

    #[test]
    fn weight_tables_are_precomputed_per_instrument() {
        let preview = preview_with(
            vec![],
            vec![Instrument {
                id: 9,
                name: "Examen".into(),
                ut_id: 1,
                activity_id: 1,
                weight_percent: 100.0,
                ra_ids: vec![1],
                exercise_weights: vec![
                    ExerciseWeight {
                        exercise_index: 1,
                        weight_percent: 60.0,
                    },
                    ExerciseWeight {
                        exercise_index: 2,
                        weight_percent: 40.0,
                    },
                ],
            }],
        );
        let index = EntityIndex::build(&preview);
        let weights = index.exercise_weights(9).expect("weight table");
        assert_eq!(weights.get(&1), Some(&60.0));
        assert_eq!(weights.get(&2), Some(&40.0));
    }

    #[test]
    fn unresolved_references_return_none() {
        let preview = preview_with(vec![], vec![]);
        let index = EntityIndex::build(&preview);
        assert!(index.ut_by_id.get(&42).is_none());
        assert_eq!(index.persisted_grade(7, 7), None);
        assert!(index.exercise_weights(7).is_none());
    }
}

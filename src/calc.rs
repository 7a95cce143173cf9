use crate::index::EntityIndex;
use crate::model::Instrument;
use crate::overlay::{EditOverlay, ExerciseKey};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Valid exercise positions within an instrument.
pub const EXERCISE_INDEXES: RangeInclusive<i64> = 1..=10;

/// Business rule inherited from the backend averages: an exercise with
/// a positive weight but no value anywhere counts as zero in the
/// weighted mean. Kept as a named constant so the policy is visible
/// instead of emerging from fallback chains.
pub const UNGRADED_EXERCISE_VALUE: f64 = 0.0;

/// Parses user-entered grade text. Accepts comma or period as the
/// decimal separator; blank or non-numeric text is `None`.
pub fn parse_grade_text(raw: &str) -> Option<f64> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    text.replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Per-instrument exercise weight table: only indices in 1..=10 with a
/// strictly positive weight survive; duplicate indices keep the
/// last-seen weight. An empty table means the instrument has no
/// exercise-level breakdown and only the persisted overall grade is
/// meaningful.
pub fn exercise_weight_table(instrument: &Instrument) -> BTreeMap<i64, f64> {
    let mut table = BTreeMap::new();
    for item in &instrument.exercise_weights {
        if !EXERCISE_INDEXES.contains(&item.exercise_index) {
            continue;
        }
        if !item.weight_percent.is_finite() || item.weight_percent <= 0.0 {
            continue;
        }
        table.insert(item.exercise_index, item.weight_percent);
    }
    table
}

/// Value precedence for one exercise cell: a parseable overlay entry
/// wins, otherwise the persisted exercise value, otherwise nothing.
pub fn resolve_exercise_value(
    index: &EntityIndex,
    overlay: &EditOverlay,
    key: ExerciseKey,
) -> Option<f64> {
    if let Some(text) = overlay.entry(key) {
        if let Some(value) = parse_grade_text(text) {
            return Some(value);
        }
    }
    index.persisted_exercise(key.student_id, key.instrument_id, key.exercise_index)
}

/// Provisional instrument grade for a student, blending overlay and
/// persisted exercise values through the instrument's weight table.
///
/// `None` when the instrument has no positive-weight exercises; the
/// caller falls back to the persisted overall grade.
pub fn provisional_average(
    index: &EntityIndex,
    overlay: &EditOverlay,
    student_id: i64,
    instrument_id: i64,
) -> Option<f64> {
    let weights = index.exercise_weights(instrument_id)?;

    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for (&exercise_index, &weight) in weights {
        let key = ExerciseKey::new(student_id, instrument_id, exercise_index);
        let value =
            resolve_exercise_value(index, overlay, key).unwrap_or(UNGRADED_EXERCISE_VALUE);
        weighted_sum += value * weight;
        total_weight += weight;
    }

    if total_weight <= 0.0 {
        return None;
    }
    Some(weighted_sum / total_weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExerciseGrade, ExerciseWeight, Grade, ModulePreview};

    fn instrument(id: i64, weights: Vec<(i64, f64)>) -> Instrument {
        Instrument {
            id,
            name: format!("Instrumento {id}"),
            ut_id: 1,
            activity_id: 1,
            weight_percent: 100.0,
            ra_ids: vec![1],
            exercise_weights: weights
                .into_iter()
                .map(|(exercise_index, weight_percent)| ExerciseWeight {
                    exercise_index,
                    weight_percent,
                })
                .collect(),
        }
    }

    fn index_for(instruments: Vec<Instrument>, grades: Vec<Grade>) -> EntityIndex {
        EntityIndex::build(&ModulePreview {
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
        })
    }

    fn grade(student_id: i64, instrument_id: i64, exercises: Vec<(i64, f64)>) -> Grade {
        Grade {
            student_id,
            instrument_id,
            grade_value: None,
            exercise_grades: exercises
                .into_iter()
                .map(|(exercise_index, grade_value)| ExerciseGrade {
                    exercise_index,
                    grade_value,
                })
                .collect(),
        }
    }

    #[test]
    fn parse_accepts_comma_and_period() {
        assert_eq!(parse_grade_text("7.5"), Some(7.5));
        assert_eq!(parse_grade_text("7,5"), Some(7.5));
        assert_eq!(parse_grade_text("  10 "), Some(10.0));
        assert_eq!(parse_grade_text(""), None);
        assert_eq!(parse_grade_text("  "), None);
        assert_eq!(parse_grade_text("x7"), None);
    }

    #[test]
    fn weight_table_filters_range_and_sign() {
        let table = exercise_weight_table(&instrument(
            1,
            vec![(0, 50.0), (11, 50.0), (3, -5.0), (4, 0.0), (5, 25.0)],
        ));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&5), Some(&25.0));
    }

    #[test]
    fn duplicate_weight_indices_keep_last_seen() {
        let table = exercise_weight_table(&instrument(1, vec![(2, 30.0), (2, 70.0)]));
        assert_eq!(table.get(&2), Some(&70.0));
    }

    #[test]
    fn average_is_none_without_positive_weights() {
        let index = index_for(vec![instrument(1, vec![])], vec![grade(7, 1, vec![(1, 9.0)])]);
        let overlay = EditOverlay::default();
        assert_eq!(provisional_average(&index, &overlay, 7, 1), None);
    }

    #[test]
    fn persisted_values_drive_the_weighted_mean() {
        let index = index_for(
            vec![instrument(1, vec![(1, 50.0), (2, 50.0)])],
            vec![grade(7, 1, vec![(1, 6.0), (2, 8.0)])],
        );
        let overlay = EditOverlay::default();
        let avg = provisional_average(&index, &overlay, 7, 1).expect("average");
        assert!((avg - 7.0).abs() < 1e-9);
    }

    #[test]
    fn overlay_changes_only_its_own_index() {
        let index = index_for(
            vec![instrument(1, vec![(1, 50.0), (2, 50.0)])],
            vec![grade(7, 1, vec![(1, 6.0), (2, 8.0)])],
        );
        let mut overlay = EditOverlay::default();
        overlay.set(ExerciseKey::new(7, 1, 1), "10");

        let avg = provisional_average(&index, &overlay, 7, 1).expect("average");
        assert!((avg - 9.0).abs() < 1e-9);
    }

    #[test]
    fn unparsable_overlay_falls_back_to_persisted() {
        let index = index_for(
            vec![instrument(1, vec![(1, 50.0), (2, 50.0)])],
            vec![grade(7, 1, vec![(1, 6.0), (2, 8.0)])],
        );
        let mut overlay = EditOverlay::default();
        overlay.set(ExerciseKey::new(7, 1, 1), "not a number");

        let avg = provisional_average(&index, &overlay, 7, 1).expect("average");
        assert!((avg - 7.0).abs() < 1e-9);
    }

    #[test]
    fn missing_values_count_as_zero() {
        let index = index_for(
            vec![instrument(1, vec![(1, 50.0), (2, 50.0)])],
            vec![grade(7, 1, vec![(2, 8.0)])],
        );
        let overlay = EditOverlay::default();
        let avg = provisional_average(&index, &overlay, 7, 1).expect("average");
        assert!((avg - 4.0).abs() < 1e-9);
    }

    #[test]
    fn average_stays_bounded_for_bounded_inputs() {
        let index = index_for(
            vec![instrument(1, vec![(1, 20.0), (2, 30.0), (3, 50.0)])],
            vec![grade(7, 1, vec![(1, 10.0), (2, 0.0), (3, 10.0)])],
        );
        let overlay = EditOverlay::default();
        let avg = provisional_average(&index, &overlay, 7, 1).expect("average");
        assert!((0.0..=10.0).contains(&avg));
    }

    #[test]
    fn comma_decimal_in_overlay_is_honored() {
        let index = index_for(
            vec![instrument(1, vec![(1, 100.0)])],
            vec![grade(7, 1, vec![])],
        );
        let mut overlay = EditOverlay::default();
        overlay.set(ExerciseKey::new(7, 1, 1), "7,5");
        let avg = provisional_average(&index, &overlay, 7, 1).expect("average");
        assert!((avg - 7.5).abs() < 1e-9);
    }
}

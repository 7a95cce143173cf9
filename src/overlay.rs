use crate::index::EntityIndex;
use std::collections::{HashMap, HashSet};

/// Composite key for one edited exercise cell. A structural key rather
/// than a concatenated id string, so ids can never collide through a
/// separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExerciseKey {
    pub student_id: i64,
    pub instrument_id: i64,
    pub exercise_index: i64,
}

impl ExerciseKey {
    pub fn new(student_id: i64, instrument_id: i64, exercise_index: i64) -> Self {
        Self {
            student_id,
            instrument_id,
            exercise_index,
        }
    }
}

/// Unsaved free-form exercise edits, layered over the persisted
/// snapshot and never mutating it. Single editor, last write wins.
///
/// The owning session resets the overlay whenever the snapshot is
/// replaced, so edits never survive an unrelated reload.
#[derive(Debug, Default, Clone)]
pub struct EditOverlay {
    entries: HashMap<ExerciseKey, String>,
}

impl EditOverlay {
    pub fn set(&mut self, key: ExerciseKey, text: impl Into<String>) {
        self.entries.insert(key, text.into());
    }

    /// Raw overlay text for a key, if the cell has been touched.
    pub fn entry(&self, key: ExerciseKey) -> Option<&str> {
        self.entries.get(&key).map(String::as_str)
    }

    /// Text shown in the editing cell: overlay text if present, else
    /// the stringified persisted exercise value, else empty.
    pub fn display_value(&self, index: &EntityIndex, key: ExerciseKey) -> String {
        if let Some(text) = self.entry(key) {
            return text.to_string();
        }
        index
            .persisted_exercise(key.student_id, key.instrument_id, key.exercise_index)
            .map(format_value)
            .unwrap_or_default()
    }

    /// (studentId, instrumentId) pairs with at least one touched cell.
    pub fn edited_pairs(&self) -> HashSet<(i64, i64)> {
        self.entries
            .keys()
            .map(|k| (k.student_id, k.instrument_id))
            .collect()
    }

    pub fn clear_pair(&mut self, student_id: i64, instrument_id: i64) {
        self.entries
            .retain(|k, _| !(k.student_id == student_id && k.instrument_id == instrument_id));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

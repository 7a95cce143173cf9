use crate::calc;
use crate::index::EntityIndex;
use crate::model::{EvaluationReport, FinalReport, ModulePreview};
use crate::order;
use crate::overlay::EditOverlay;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaRow {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub weight_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaTable {
    pub rows: Vec<RaRow>,
    /// Actual sum of the RA weights. Should be 100 but is reported
    /// as-is so configuration discrepancies stay visible.
    pub weight_sum: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UtRaRow {
    pub ut_id: i64,
    pub ut_name: String,
    pub evaluation_period: i64,
    /// One cell per RA column; `None` when no link exists for the pair.
    pub percents: Vec<Option<f64>>,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UtRaMatrix {
    pub ra_codes: Vec<String>,
    pub rows: Vec<UtRaRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentRow {
    pub id: i64,
    pub name: String,
    /// Absent when the teaching-unit reference does not resolve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ut_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_period: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_name: Option<String>,
    pub weight_percent: f64,
    pub ra_codes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub id: i64,
    pub student_code: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeCell {
    pub instrument_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted: Option<f64>,
    /// Provisional average from exercise values (overlay included);
    /// absent when the instrument has no exercise breakdown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<f64>,
    pub edited: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRow {
    pub student_id: i64,
    pub student_code: String,
    pub full_name: String,
    pub cells: Vec<GradeCell>,
}

/// Cross-referenced display tables for one module snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewTables {
    pub module_id: i64,
    pub module_name: String,
    pub academic_year: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher_name: Option<String>,
    pub ras: RaTable,
    pub ut_ra: UtRaMatrix,
    pub instruments: Vec<InstrumentRow>,
    pub students: Vec<StudentRow>,
    pub grades: Vec<GradeRow>,
}

pub fn build_tables(
    preview: &ModulePreview,
    index: &EntityIndex,
    overlay: &EditOverlay,
) -> PreviewTables {
    let mut ras = preview.ras.clone();
    ras.sort_by(|a, b| order::compare_natural(&a.code, &b.code));
    let weight_sum = ras.iter().map(|ra| ra.weight_percent).sum();
    let ra_table = RaTable {
        rows: ras
            .iter()
            .map(|ra| RaRow {
                id: ra.id,
                code: ra.code.clone(),
                name: ra.name.clone(),
                weight_percent: ra.weight_percent,
            })
            .collect(),
        weight_sum,
    };

    let mut uts = preview.uts.clone();
    uts.sort_by(|a, b| {
        a.evaluation_period
            .cmp(&b.evaluation_period)
            .then_with(|| order::compare_natural(&a.name, &b.name))
    });
    let ut_ra_rows = uts
        .iter()
        .map(|ut| {
            let percents: Vec<Option<f64>> = ras
                .iter()
                .map(|ra| index.ut_ra_percent.get(&(ut.id, ra.id)).copied())
                .collect();
            let total = percents.iter().flatten().sum();
            UtRaRow {
                ut_id: ut.id,
                ut_name: ut.name.clone(),
                evaluation_period: ut.evaluation_period,
                percents,
                total,
            }
        })
        .collect();
    let ut_ra = UtRaMatrix {
        ra_codes: ras.iter().map(|ra| ra.code.clone()).collect(),
        rows: ut_ra_rows,
    };

    let mut instruments = preview.instruments.clone();
    instruments.sort_by(|a, b| order::compare_instruments(index, a, b));
    let instrument_rows: Vec<InstrumentRow> = instruments
        .iter()
        .map(|instrument| {
            let ut = index.ut_by_id.get(&instrument.ut_id);
            let mut ra_codes: Vec<String> = instrument
                .ra_ids
                .iter()
                .filter_map(|ra_id| index.ra_by_id.get(ra_id))
                .map(|ra| ra.code.clone())
                .collect();
            ra_codes.sort_by(|a, b| order::compare_natural(a, b));
            InstrumentRow {
                id: instrument.id,
                name: instrument.name.clone(),
                ut_name: ut.map(|u| u.name.clone()),
                evaluation_period: ut.map(|u| u.evaluation_period),
                activity_name: index
                    .activity_by_id
                    .get(&instrument.activity_id)
                    .map(|a| a.name.clone()),
                weight_percent: instrument.weight_percent,
                ra_codes,
            }
        })
        .collect();

    let mut students = preview.students.clone();
    students.sort_by(|a, b| order::compare_natural(&a.student_code, &b.student_code));
    let student_rows: Vec<StudentRow> = students
        .iter()
        .map(|s| StudentRow {
            id: s.id,
            student_code: s.student_code.clone(),
            full_name: s.full_name.clone(),
        })
        .collect();

    let edited_pairs = overlay.edited_pairs();
    let grades = students
        .iter()
        .map(|student| {
            let cells = instruments
                .iter()
                .map(|instrument| GradeCell {
                    instrument_id: instrument.id,
                    persisted: index.persisted_grade(student.id, instrument.id),
                    preview: calc::provisional_average(index, overlay, student.id, instrument.id),
                    edited: edited_pairs.contains(&(student.id, instrument.id)),
                })
                .collect();
            GradeRow {
                student_id: student.id,
                student_code: student.student_code.clone(),
                full_name: student.full_name.clone(),
                cells,
            }
        })
        .collect();

    PreviewTables {
        module_id: preview.module_id,
        module_name: preview.module_name.clone(),
        academic_year: preview.academic_year.clone(),
        teacher_name: preview.teacher_name.clone(),
        ras: ra_table,
        ut_ra,
        instruments: instrument_rows,
        students: student_rows,
        grades,
    }
}

/// Evaluation reports ordered by period with naturally sorted rows.
pub fn sorted_evaluation_reports(reports: &[EvaluationReport]) -> Vec<EvaluationReport> {
    let mut out: Vec<EvaluationReport> = reports.to_vec();
    for report in &mut out {
        report
            .students
            .sort_by(|a, b| order::compare_natural(&a.student_code, &b.student_code));
    }
    out.sort_by_key(|r| r.evaluation_period);
    out
}

/// Final report with naturally sorted rows.
pub fn sorted_final_report(report: &FinalReport) -> FinalReport {
    let mut out = report.clone();
    out.students
        .sort_by(|a, b| order::compare_natural(&a.student_code, &b.student_code));
    out
}

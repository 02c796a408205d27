use serde_json::Value;
use time::PrimitiveDateTime;

use crate::db::types::GradingModeKind;

pub(crate) const COLUMNS: &str = "\
    id, assignment_id, student_id, document_locator, submitted_at, grade, feedback, \
    is_auto_graded, grading_mode, grading_breakdown, graded_at, graded_by, grading_failures, \
    last_grading_failure_at";

/// Every grading field written by one automated grading run, plus the state the
/// grade was computed from.
#[derive(Debug, Clone)]
pub(crate) struct AutoGradeUpdate {
    pub(crate) grade: f64,
    pub(crate) feedback: String,
    pub(crate) grading_mode: GradingModeKind,
    pub(crate) breakdown: Value,
    pub(crate) graded_at: PrimitiveDateTime,
    pub(crate) document_locator: String,
    pub(crate) submitted_at: PrimitiveDateTime,
}

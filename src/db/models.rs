use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;
use validator::Validate;

use crate::db::types::GradingModeKind;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, Validate)]
pub struct AssignmentSpec {
    pub id: String,
    #[validate(length(min = 1, message = "title must not be empty"))]
    pub title: String,
    pub description: String,
    pub due_at: PrimitiveDateTime,
    #[validate(range(min = 1, message = "max_marks must be positive"))]
    pub max_marks: i32,
    pub reference_locator: Option<String>,
    pub created_by: String,
    pub created_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Submission {
    pub id: String,
    pub assignment_id: String,
    pub student_id: String,
    pub document_locator: String,
    pub submitted_at: PrimitiveDateTime,
    pub grade: Option<f64>,
    pub feedback: Option<String>,
    pub is_auto_graded: bool,
    pub grading_mode: Option<GradingModeKind>,
    pub grading_breakdown: Option<Json<serde_json::Value>>,
    pub graded_at: Option<PrimitiveDateTime>,
    pub graded_by: Option<String>,
    pub grading_failures: i32,
    pub last_grading_failure_at: Option<PrimitiveDateTime>,
}

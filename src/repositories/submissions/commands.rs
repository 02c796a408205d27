use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use super::types::AutoGradeUpdate;

/// Applies an automated grade in a single statement. Returns `false` when the
/// submission no longer exists, was graded by a person, or was resubmitted since
/// the grade was computed.
pub(crate) async fn record_auto_grade(
    pool: &PgPool,
    submission_id: &str,
    params: AutoGradeUpdate,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE submissions
         SET grade = $1,
             feedback = $2,
             is_auto_graded = TRUE,
             grading_mode = $3,
             grading_breakdown = $4,
             graded_at = $5,
             graded_by = NULL,
             last_grading_failure_at = NULL
         WHERE id = $6
           AND graded_by IS NULL
           AND document_locator = $7
           AND submitted_at = $8",
    )
    .bind(params.grade)
    .bind(params.feedback)
    .bind(params.grading_mode)
    .bind(Json(params.breakdown))
    .bind(params.graded_at)
    .bind(submission_id)
    .bind(params.document_locator)
    .bind(params.submitted_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub(crate) async fn record_grading_failure(
    pool: &PgPool,
    submission_id: &str,
    failed_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE submissions
         SET grading_failures = grading_failures + 1,
             last_grading_failure_at = $1
         WHERE id = $2 AND grade IS NULL",
    )
    .bind(failed_at)
    .bind(submission_id)
    .execute(pool)
    .await?;

    Ok(())
}

use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::Submission;

use super::types::COLUMNS;

pub(crate) async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<Submission>, sqlx::Error> {
    sqlx::query_as::<_, Submission>(&format!("SELECT {COLUMNS} FROM submissions WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn list_ungraded_ids(
    pool: &PgPool,
    assignment_id: &str,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT id
         FROM submissions
         WHERE assignment_id = $1
           AND grade IS NULL
         ORDER BY submitted_at, id",
    )
    .bind(assignment_id)
    .fetch_all(pool)
    .await
}

/// Assignments that have an answer key and at least one ungraded submission not
/// in failure backoff, oldest pending work first.
pub(crate) async fn list_ungraded_assignment_ids(
    pool: &PgPool,
    limit: i64,
    retry_failed_before: PrimitiveDateTime,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT s.assignment_id
         FROM submissions s
         JOIN answer_keys k ON k.assignment_id = s.assignment_id
         WHERE s.grade IS NULL
           AND (s.last_grading_failure_at IS NULL OR s.last_grading_failure_at < $2)
         GROUP BY s.assignment_id
         ORDER BY MIN(s.submitted_at)
         LIMIT $1",
    )
    .bind(limit)
    .bind(retry_failed_before)
    .fetch_all(pool)
    .await
}

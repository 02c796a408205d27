use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AnswerKeyRow {
    pub(crate) assignment_id: String,
    pub(crate) total_marks: i32,
    pub(crate) requires_manual_review: bool,
    pub(crate) body: Json<Value>,
    pub(crate) created_at: PrimitiveDateTime,
}

pub(crate) struct CreateAnswerKey<'a> {
    pub(crate) assignment_id: &'a str,
    pub(crate) total_marks: i32,
    pub(crate) requires_manual_review: bool,
    pub(crate) body: Value,
    pub(crate) created_at: PrimitiveDateTime,
}

pub(crate) async fn find_by_assignment(
    pool: &PgPool,
    assignment_id: &str,
) -> Result<Option<AnswerKeyRow>, sqlx::Error> {
    sqlx::query_as::<_, AnswerKeyRow>(
        "SELECT assignment_id, total_marks, requires_manual_review, body, created_at
         FROM answer_keys
         WHERE assignment_id = $1",
    )
    .bind(assignment_id)
    .fetch_optional(pool)
    .await
}

/// Insert-only: an existing key is kept and `false` is returned.
pub(crate) async fn create_if_absent(
    pool: &PgPool,
    params: CreateAnswerKey<'_>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO answer_keys (assignment_id, total_marks, requires_manual_review, body, created_at)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (assignment_id) DO NOTHING",
    )
    .bind(params.assignment_id)
    .bind(params.total_marks)
    .bind(params.requires_manual_review)
    .bind(Json(params.body))
    .bind(params.created_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

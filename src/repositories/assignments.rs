use sqlx::PgPool;

use crate::db::models::AssignmentSpec;

pub(crate) const COLUMNS: &str = "\
    id, title, description, due_at, max_marks, reference_locator, created_by, created_at";

pub(crate) async fn find_by_id(
    pool: &PgPool,
    id: &str,
) -> Result<Option<AssignmentSpec>, sqlx::Error> {
    sqlx::query_as::<_, AssignmentSpec>(&format!("SELECT {COLUMNS} FROM assignments WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn list_without_answer_key(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<AssignmentSpec>, sqlx::Error> {
    sqlx::query_as::<_, AssignmentSpec>(
        "SELECT a.id, a.title, a.description, a.due_at, a.max_marks, a.reference_locator,
                a.created_by, a.created_at
         FROM assignments a
         LEFT JOIN answer_keys k ON k.assignment_id = a.id
         WHERE k.assignment_id IS NULL
         ORDER BY a.created_at
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

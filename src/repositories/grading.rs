use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::{AssignmentSpec, Submission};
use crate::schemas::grading::{AnswerKey, GradingResult};

use super::{answer_keys, assignments, submissions};

/// Persistence operations the grading pipeline depends on.
#[async_trait]
pub trait GradingRepository: Send + Sync {
    async fn find_assignment(&self, id: &str) -> Result<Option<AssignmentSpec>>;

    async fn find_answer_key(&self, assignment_id: &str) -> Result<Option<AnswerKey>>;

    /// Insert-only. Returns the key that ends up stored, which is the existing
    /// one if another writer got there first.
    async fn save_answer_key(&self, assignment_id: &str, key: &AnswerKey) -> Result<AnswerKey>;

    async fn find_submission(&self, id: &str) -> Result<Option<Submission>>;

    async fn list_ungraded_submission_ids(&self, assignment_id: &str) -> Result<Vec<String>>;

    async fn list_assignments_needing_answer_keys(&self, limit: i64)
        -> Result<Vec<AssignmentSpec>>;

    /// Only assignments with a stored answer key are listed. Submissions whose last
    /// failure is not older than `retry_failed_before` do not count as pending.
    async fn list_assignments_with_ungraded_submissions(
        &self,
        limit: i64,
        retry_failed_before: PrimitiveDateTime,
    ) -> Result<Vec<String>>;

    /// Writes grade, feedback, mode, breakdown and grading timestamp atomically,
    /// provided `graded` still describes the stored submission. Returns `false`
    /// if the submission disappeared, was graded by a person, or was resubmitted.
    async fn record_auto_grade(
        &self,
        graded: &Submission,
        result: &GradingResult,
        graded_at: PrimitiveDateTime,
    ) -> Result<bool>;

    async fn record_grading_failure(
        &self,
        submission_id: &str,
        failed_at: PrimitiveDateTime,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct PgGradingRepository {
    pool: PgPool,
}

impl PgGradingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GradingRepository for PgGradingRepository {
    async fn find_assignment(&self, id: &str) -> Result<Option<AssignmentSpec>> {
        assignments::find_by_id(&self.pool, id).await.context("Failed to load assignment")
    }

    async fn find_answer_key(&self, assignment_id: &str) -> Result<Option<AnswerKey>> {
        let Some(row) = answer_keys::find_by_assignment(&self.pool, assignment_id)
            .await
            .context("Failed to load answer key")?
        else {
            return Ok(None);
        };

        let key: AnswerKey =
            serde_json::from_value(row.body.0).context("Stored answer key is invalid")?;
        Ok(Some(key))
    }

    async fn save_answer_key(&self, assignment_id: &str, key: &AnswerKey) -> Result<AnswerKey> {
        let inserted = answer_keys::create_if_absent(
            &self.pool,
            answer_keys::CreateAnswerKey {
                assignment_id,
                total_marks: i32::try_from(key.total_marks())
                    .context("Answer key total marks out of range")?,
                requires_manual_review: key.requires_manual_review(),
                body: serde_json::to_value(key).context("Failed to serialize answer key")?,
                created_at: crate::core::time::primitive_now_utc(),
            },
        )
        .await
        .context("Failed to save answer key")?;

        if inserted {
            return Ok(key.clone());
        }

        tracing::info!(assignment_id, "Answer key already exists; keeping stored key");
        self.find_answer_key(assignment_id).await?.context("Answer key vanished after conflict")
    }

    async fn find_submission(&self, id: &str) -> Result<Option<Submission>> {
        submissions::find_by_id(&self.pool, id).await.context("Failed to load submission")
    }

    async fn list_ungraded_submission_ids(&self, assignment_id: &str) -> Result<Vec<String>> {
        submissions::list_ungraded_ids(&self.pool, assignment_id)
            .await
            .context("Failed to list ungraded submissions")
    }

    async fn list_assignments_needing_answer_keys(
        &self,
        limit: i64,
    ) -> Result<Vec<AssignmentSpec>> {
        assignments::list_without_answer_key(&self.pool, limit)
            .await
            .context("Failed to list assignments without answer keys")
    }

    async fn list_assignments_with_ungraded_submissions(
        &self,
        limit: i64,
        retry_failed_before: PrimitiveDateTime,
    ) -> Result<Vec<String>> {
        submissions::list_ungraded_assignment_ids(&self.pool, limit, retry_failed_before)
            .await
            .context("Failed to list assignments with ungraded submissions")
    }

    async fn record_auto_grade(
        &self,
        graded: &Submission,
        result: &GradingResult,
        graded_at: PrimitiveDateTime,
    ) -> Result<bool> {
        submissions::record_auto_grade(
            &self.pool,
            &graded.id,
            submissions::AutoGradeUpdate {
                grade: result.total_grade,
                feedback: result.overall_feedback.clone(),
                grading_mode: result.mode.kind(),
                breakdown: grading_breakdown(result),
                graded_at,
                document_locator: graded.document_locator.clone(),
                submitted_at: graded.submitted_at,
            },
        )
        .await
        .context("Failed to record automated grade")
    }

    async fn record_grading_failure(
        &self,
        submission_id: &str,
        failed_at: PrimitiveDateTime,
    ) -> Result<()> {
        submissions::record_grading_failure(&self.pool, submission_id, failed_at)
            .await
            .context("Failed to record grading failure")
    }
}

pub(crate) fn grading_breakdown(result: &GradingResult) -> serde_json::Value {
    json!({
        "mode": result.mode,
        "max_marks": result.max_marks,
        "questions": result.questions,
    })
}

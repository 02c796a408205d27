use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use assignment_grader::{
    AnswerKey, AnswerKeySynthesizer, AssignmentSpec, CompletionOptions, DocumentExtractor,
    DocumentStore, GradingEngine, GradingFailed, GradingMode, GradingPipeline, GradingRepository,
    GradingResult, QuestionKey, ReasoningClient, ReasoningUnavailable, StorageError, Submission,
};
use async_trait::async_trait;
use time::macros::datetime;
use time::PrimitiveDateTime;

const OPTIONS: CompletionOptions = CompletionOptions { max_tokens: 300, temperature: 0.0 };

struct OneDocument;

#[async_trait]
impl DocumentStore for OneDocument {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        match locator {
            "uploads/s1.txt" => Ok(b"Q1: the mitochondria".to_vec()),
            other => Err(StorageError::NotFound(other.to_string())),
        }
    }

    async fn delete(&self, _locator: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

struct FixedGrade;

#[async_trait]
impl ReasoningClient for FixedGrade {
    async fn complete(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _options: CompletionOptions,
    ) -> Result<String, ReasoningUnavailable> {
        Ok(r#"{"total_grade": 8, "overall_feedback": "Correct organelle."}"#.to_string())
    }
}

#[derive(Default)]
struct Tables {
    keys: HashMap<String, AnswerKey>,
    submissions: HashMap<String, Submission>,
}

#[derive(Default)]
struct HostRepository {
    tables: Mutex<Tables>,
}

fn assignment() -> AssignmentSpec {
    AssignmentSpec {
        id: "a1".to_string(),
        title: "Cell biology".to_string(),
        description: "One question.".to_string(),
        due_at: datetime!(2025-03-01 12:00),
        max_marks: 10,
        reference_locator: None,
        created_by: "faculty-1".to_string(),
        created_at: datetime!(2025-02-01 09:00),
    }
}

fn submission() -> Submission {
    Submission {
        id: "s1".to_string(),
        assignment_id: "a1".to_string(),
        student_id: "student-1".to_string(),
        document_locator: "uploads/s1.txt".to_string(),
        submitted_at: datetime!(2025-02-20 18:30),
        grade: None,
        feedback: None,
        is_auto_graded: false,
        grading_mode: None,
        grading_breakdown: None,
        graded_at: None,
        graded_by: None,
        grading_failures: 0,
        last_grading_failure_at: None,
    }
}

#[async_trait]
impl GradingRepository for HostRepository {
    async fn find_assignment(&self, id: &str) -> Result<Option<AssignmentSpec>> {
        Ok((id == "a1").then(assignment))
    }

    async fn find_answer_key(&self, assignment_id: &str) -> Result<Option<AnswerKey>> {
        Ok(self.tables.lock().expect("tables").keys.get(assignment_id).cloned())
    }

    async fn save_answer_key(&self, assignment_id: &str, key: &AnswerKey) -> Result<AnswerKey> {
        let mut tables = self.tables.lock().expect("tables");
        Ok(tables.keys.entry(assignment_id.to_string()).or_insert_with(|| key.clone()).clone())
    }

    async fn find_submission(&self, id: &str) -> Result<Option<Submission>> {
        Ok(self.tables.lock().expect("tables").submissions.get(id).cloned())
    }

    async fn list_ungraded_submission_ids(&self, assignment_id: &str) -> Result<Vec<String>> {
        let tables = self.tables.lock().expect("tables");
        Ok(tables
            .submissions
            .values()
            .filter(|row| row.assignment_id == assignment_id && row.grade.is_none())
            .map(|row| row.id.clone())
            .collect())
    }

    async fn list_assignments_needing_answer_keys(
        &self,
        _limit: i64,
    ) -> Result<Vec<AssignmentSpec>> {
        Ok(Vec::new())
    }

    async fn list_assignments_with_ungraded_submissions(
        &self,
        _limit: i64,
        _retry_failed_before: PrimitiveDateTime,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn record_auto_grade(
        &self,
        graded: &Submission,
        result: &GradingResult,
        graded_at: PrimitiveDateTime,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().expect("tables");
        let Some(row) = tables.submissions.get_mut(&graded.id) else {
            return Ok(false);
        };
        row.grade = Some(result.total_grade);
        row.feedback = Some(result.overall_feedback.clone());
        row.is_auto_graded = true;
        row.graded_at = Some(graded_at);
        Ok(true)
    }

    async fn record_grading_failure(
        &self,
        _submission_id: &str,
        _failed_at: PrimitiveDateTime,
    ) -> Result<()> {
        Ok(())
    }
}

fn pipeline(repository: Arc<HostRepository>, staging: &tempfile::TempDir) -> GradingPipeline {
    let reasoning: Arc<dyn ReasoningClient> = Arc::new(FixedGrade);
    GradingPipeline::new(
        repository,
        DocumentExtractor::new(Arc::new(OneDocument), staging.path().to_path_buf()),
        AnswerKeySynthesizer::new(reasoning.clone(), Duration::from_secs(1), 4000, OPTIONS),
        GradingEngine::new(reasoning, Duration::from_secs(1), 0.6, OPTIONS),
    )
}

#[tokio::test]
async fn host_application_grades_against_its_answer_key() {
    let staging = tempfile::tempdir().expect("tempdir");
    let repository = Arc::new(HostRepository::default());
    let key = AnswerKey::new(
        vec![QuestionKey {
            number: 1,
            ideal_answer: "The mitochondria".to_string(),
            key_points: BTreeSet::from(["names the organelle".to_string()]),
            max_marks: 10.0,
            marking_criteria: BTreeSet::new(),
        }],
        10,
    )
    .expect("answer key");
    {
        let mut tables = repository.tables.lock().expect("tables");
        tables.keys.insert("a1".to_string(), key);
        tables.submissions.insert("s1".to_string(), submission());
    }

    let result = pipeline(repository.clone(), &staging).grade_one("s1").await.expect("graded");

    assert_eq!(result.mode, GradingMode::Detailed);
    assert_eq!(result.total_grade, 8.0);
    let stored = repository.tables.lock().expect("tables").submissions["s1"].clone();
    assert_eq!(stored.grade, Some(8.0));
    assert!(stored.is_auto_graded);
}

#[tokio::test]
async fn host_application_creates_keys_and_sees_failures() {
    let staging = tempfile::tempdir().expect("tempdir");
    let repository = Arc::new(HostRepository::default());
    let pipeline = pipeline(repository.clone(), &staging);

    let key = pipeline.create_answer_key(&assignment()).await.expect("answer key");
    assert!(key.requires_manual_review());
    assert_eq!(key.total_marks(), 10);

    assert!(matches!(
        pipeline.grade_one("missing").await,
        Err(GradingFailed::SubmissionNotFound(id)) if id == "missing"
    ));
}

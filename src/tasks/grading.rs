use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use validator::Validate;

use crate::core::config::Settings;
use crate::core::time::primitive_now_utc;
use crate::db::models::{AssignmentSpec, Submission};
use crate::repositories::GradingRepository;
use crate::schemas::grading::{AnswerKey, GradingResult};
use crate::services::answer_key::AnswerKeySynthesizer;
use crate::services::extraction::{DocumentExtractor, ExtractionError};
use crate::services::grading_engine::GradingEngine;
use crate::services::reasoning::ReasoningClient;
use crate::services::single_flight::SingleFlight;
use crate::services::storage::DocumentStore;


/// Terminal failure of one grading attempt. Prior grade state is left as it was.
#[derive(Debug, Clone, Error)]
pub enum GradingFailed {
    #[error("submission {0} not found")]
    SubmissionNotFound(String),
    #[error("submission {0} was regraded by hand or resubmitted while being graded")]
    Superseded(String),
    #[error("assignment {0} not found")]
    AssignmentNotFound(String),
    #[error("submission document could not be extracted: {0}")]
    Extraction(#[source] Arc<ExtractionError>),
    #[error("grading state could not be persisted: {0}")]
    Persistence(String),
}

impl GradingFailed {
    fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }

    fn label(&self) -> &'static str {
        match self {
            Self::SubmissionNotFound(_) => "submission_not_found",
            Self::Superseded(_) => "superseded",
            Self::AssignmentNotFound(_) => "assignment_not_found",
            Self::Extraction(_) => "extraction_failed",
            Self::Persistence(_) => "persistence_failed",
        }
    }
}

pub type GradingOutcome = Result<GradingResult, GradingFailed>;

/// Coordinates extraction, answer keys, grading and persistence.
#[derive(Clone)]
pub struct GradingPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    repository: Arc<dyn GradingRepository>,
    extractor: DocumentExtractor,
    synthesizer: AnswerKeySynthesizer,
    engine: GradingEngine,
    flights: SingleFlight<(String, String), GradingOutcome>,
}

impl GradingPipeline {
    pub fn new(
        repository: Arc<dyn GradingRepository>,
        extractor: DocumentExtractor,
        synthesizer: AnswerKeySynthesizer,
        engine: GradingEngine,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                repository,
                extractor,
                synthesizer,
                engine,
                flights: SingleFlight::default(),
            }),
        }
    }

    pub(crate) fn from_settings(
        settings: &Settings,
        repository: Arc<dyn GradingRepository>,
        documents: Arc<dyn DocumentStore>,
        reasoning: Arc<dyn ReasoningClient>,
    ) -> Self {
        Self::new(
            repository,
            DocumentExtractor::from_settings(settings, documents),
            AnswerKeySynthesizer::from_settings(settings, reasoning.clone()),
            GradingEngine::from_settings(settings, reasoning),
        )
    }

    /// Builds and stores the answer key for a new assignment. Reference documents
    /// that cannot be read produce the manual-review key rather than an error.
    pub async fn create_answer_key(
        &self,
        assignment: &AssignmentSpec,
    ) -> anyhow::Result<AnswerKey> {
        assignment.validate().context("Invalid assignment metadata")?;
        let max_marks =
            u32::try_from(assignment.max_marks).context("Assignment max marks out of range")?;

        let reference_text = match assignment.reference_locator.as_deref() {
            Some(locator) => match self.inner.extractor.extract(locator).await {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(
                        assignment_id = %assignment.id,
                        error = %err,
                        "Reference document unavailable; answer key needs manual review"
                    );
                    String::new()
                }
            },
            None => String::new(),
        };

        let key = self
            .inner
            .synthesizer
            .synthesize(&assignment.title, &assignment.description, &reference_text, max_marks)
            .await;

        self.inner.repository.save_answer_key(&assignment.id, &key).await
    }

    /// Grades one submission. Concurrent calls for the same submission share a
    /// single run.
    pub async fn grade_submission(
        &self,
        submission: &Submission,
        assignment: &AssignmentSpec,
    ) -> GradingOutcome {
        let key = (assignment.id.clone(), submission.id.clone());
        let inner = Arc::clone(&self.inner);
        let submission = submission.clone();
        let assignment = assignment.clone();

        self.inner
            .flights
            .run(key, async move { inner.grade_fresh(&submission, &assignment).await })
            .await
    }

    pub async fn grade_one(&self, submission_id: &str) -> GradingOutcome {
        let submission = self
            .inner
            .repository
            .find_submission(submission_id)
            .await
            .map_err(GradingFailed::persistence)?
            .ok_or_else(|| GradingFailed::SubmissionNotFound(submission_id.to_string()))?;

        let assignment = self
            .inner
            .repository
            .find_assignment(&submission.assignment_id)
            .await
            .map_err(GradingFailed::persistence)?
            .ok_or_else(|| GradingFailed::AssignmentNotFound(submission.assignment_id.clone()))?;

        self.grade_submission(&submission, &assignment).await
    }

    /// Lists the assignment's ungraded submissions once and grades them one at a
    /// time as the stream is polled. Calling again resumes with whatever is
    /// still ungraded.
    pub async fn grade_batch(
        &self,
        assignment_id: &str,
    ) -> Result<BoxStream<'static, (String, GradingOutcome)>, GradingFailed> {
        self.inner
            .repository
            .find_assignment(assignment_id)
            .await
            .map_err(GradingFailed::persistence)?
            .ok_or_else(|| GradingFailed::AssignmentNotFound(assignment_id.to_string()))?;

        let ids = self
            .inner
            .repository
            .list_ungraded_submission_ids(assignment_id)
            .await
            .map_err(GradingFailed::persistence)?;
        tracing::info!(assignment_id, pending = ids.len(), "Starting batch grading");

        let pipeline = self.clone();
        Ok(stream::iter(ids)
            .then(move |submission_id| {
                let pipeline = pipeline.clone();
                async move {
                    let outcome = pipeline.grade_one(&submission_id).await;
                    (submission_id, outcome)
                }
            })
            .boxed())
    }
}

impl PipelineInner {
    async fn grade_fresh(
        &self,
        submission: &Submission,
        assignment: &AssignmentSpec,
    ) -> GradingOutcome {
        let timer = Instant::now();
        let outcome = self.run_stages(submission, assignment).await;
        let elapsed = timer.elapsed().as_secs_f64();

        match &outcome {
            Ok(result) => {
                metrics::counter!("grading_jobs_total", "status" => result.mode.label())
                    .increment(1);
                tracing::info!(
                    submission_id = %submission.id,
                    assignment_id = %assignment.id,
                    grade = result.total_grade,
                    max_marks = result.max_marks,
                    mode = result.mode.label(),
                    duration_seconds = elapsed,
                    "Submission graded"
                );
            }
            Err(err) => {
                metrics::counter!("grading_jobs_total", "status" => err.label()).increment(1);
                tracing::error!(
                    submission_id = %submission.id,
                    assignment_id = %assignment.id,
                    error = %err,
                    "Grading failed"
                );
                if matches!(err, GradingFailed::Extraction(_)) {
                    self.note_failure(&submission.id).await;
                }
            }
        }
        metrics::histogram!("grading_duration_seconds").record(elapsed);

        outcome
    }

    async fn run_stages(
        &self,
        submission: &Submission,
        assignment: &AssignmentSpec,
    ) -> GradingOutcome {
        let text = self
            .extractor
            .extract(&submission.document_locator)
            .await
            .map_err(|err| GradingFailed::Extraction(Arc::new(err)))?;

        let key = match self
            .repository
            .find_answer_key(&assignment.id)
            .await
            .map_err(GradingFailed::persistence)?
        {
            Some(key) => key,
            None => {
                tracing::warn!(
                    assignment_id = %assignment.id,
                    "No answer key stored; grading against manual-review key"
                );
                AnswerKey::degenerate(u32::try_from(assignment.max_marks).unwrap_or(1))
            }
        };

        let result = self.engine.grade(&text, &key).await;

        let recorded = self
            .repository
            .record_auto_grade(submission, &result, primitive_now_utc())
            .await
            .map_err(GradingFailed::persistence)?;
        if recorded {
            return Ok(result);
        }

        let current = self
            .repository
            .find_submission(&submission.id)
            .await
            .map_err(GradingFailed::persistence)?;
        Err(match current {
            Some(_) => GradingFailed::Superseded(submission.id.clone()),
            None => GradingFailed::SubmissionNotFound(submission.id.clone()),
        })
    }

    async fn note_failure(&self, submission_id: &str) {
        if let Err(err) =
            self.repository.record_grading_failure(submission_id, primitive_now_utc()).await
        {
            tracing::error!(submission_id, error = %err, "Failed to record grading failure");
        }
    }
}

pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

pub use crate::db::models::{AssignmentSpec, Submission};
pub use crate::db::types::GradingModeKind;
pub use crate::repositories::{GradingRepository, PgGradingRepository};
pub use crate::schemas::grading::{
    AnswerKey, AnswerKeyError, BasicGradingReason, GradingMode, GradingResult, QuestionGrade,
    QuestionKey,
};
pub use crate::services::answer_key::AnswerKeySynthesizer;
pub use crate::services::extraction::{DocumentExtractor, ExtractionError};
pub use crate::services::grading_engine::GradingEngine;
pub use crate::services::reasoning::{CompletionOptions, ReasoningClient, ReasoningUnavailable};
pub use crate::services::storage::{DocumentStore, StorageError};
pub use crate::tasks::grading::{GradingFailed, GradingOutcome, GradingPipeline};

use std::sync::Arc;

use crate::core::{config::Settings, state::AppState, telemetry};
use crate::services::reasoning::OpenAiReasoningClient;
use crate::services::storage::document_store_from_settings;

pub async fn run_worker() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let documents = document_store_from_settings(&settings).await?;
    let reasoning = Arc::new(OpenAiReasoningClient::from_settings(&settings)?);
    let repository = Arc::new(PgGradingRepository::new(db_pool.clone()));
    let pipeline =
        GradingPipeline::from_settings(&settings, repository.clone(), documents, reasoning);

    tracing::info!(
        environment = %settings.runtime().environment.as_str(),
        model = %settings.ai().ai_model,
        "Assignment grader starting"
    );

    let state = AppState::new(settings, repository, pipeline);
    let result = tasks::scheduler::run(state).await;

    db_pool.close().await;
    tracing::info!("Database pool closed");

    result
}

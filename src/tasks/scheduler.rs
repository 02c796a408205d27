use anyhow::Result;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::repositories::GradingRepository;
use crate::tasks::grading::GradingPipeline;

const ANSWER_KEY_SWEEP_LIMIT: i64 = 20;
const ASSIGNMENT_SWEEP_LIMIT: i64 = 20;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepSummary {
    pub(crate) graded: usize,
    pub(crate) failed: usize,
}

pub(crate) async fn run(state: AppState) -> Result<()> {
    let poll = Duration::from_secs(state.settings().grading().poll_interval_seconds.max(1));
    let retry_backoff = Duration::from_secs(state.settings().grading().retry_backoff_seconds);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handles = vec![
        tokio::spawn(answer_key_loop(state.clone(), poll, shutdown_rx.clone())),
        tokio::spawn(grading_loop(state.clone(), poll, retry_backoff, shutdown_rx.clone())),
    ];
    tracing::info!(poll_interval_seconds = poll.as_secs(), "Grading worker started");

    crate::core::shutdown::shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("Failed to broadcast shutdown signal to background tasks");
    }

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }

    Ok(())
}

async fn answer_key_loop(state: AppState, poll: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(poll);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) =
                    synthesize_missing_answer_keys(state.repository(), state.pipeline()).await
                {
                    tracing::error!(error = %err, "synthesize_missing_answer_keys failed");
                }
            }
        }
    }
}

async fn grading_loop(
    state: AppState,
    poll: Duration,
    retry_backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(poll);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                let sweep = grade_pending_submissions(
                    state.repository(),
                    state.pipeline(),
                    retry_backoff,
                    &shutdown,
                );
                match sweep.await {
                    Ok(summary) if summary.graded + summary.failed > 0 => {
                        tracing::info!(
                            graded = summary.graded,
                            failed = summary.failed,
                            "Grading sweep finished"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "grade_pending_submissions failed"),
                }
            }
        }
    }
}

/// Creates answer keys for assignments that do not have one yet.
pub(crate) async fn synthesize_missing_answer_keys(
    repository: &dyn GradingRepository,
    pipeline: &GradingPipeline,
) -> Result<usize> {
    let assignments = repository.list_assignments_needing_answer_keys(ANSWER_KEY_SWEEP_LIMIT).await?;

    let mut created = 0;
    for assignment in assignments {
        match pipeline.create_answer_key(&assignment).await {
            Ok(key) => {
                created += 1;
                tracing::info!(
                    assignment_id = %assignment.id,
                    manual_review = key.requires_manual_review(),
                    "Answer key stored"
                );
            }
            Err(err) => {
                tracing::error!(assignment_id = %assignment.id, error = %err, "Failed to create answer key");
            }
        }
    }

    Ok(created)
}

/// Batch-grades assignments that have an answer key and ungraded submissions, one
/// submission at a time. Submissions that failed within `retry_backoff` do not
/// make an assignment eligible. Stops between submissions once shutdown is
/// signalled.
pub(crate) async fn grade_pending_submissions(
    repository: &dyn GradingRepository,
    pipeline: &GradingPipeline,
    retry_backoff: Duration,
    shutdown: &watch::Receiver<bool>,
) -> Result<SweepSummary> {
    let retry_failed_before = primitive_now_utc() - retry_backoff;
    let assignment_ids = repository
        .list_assignments_with_ungraded_submissions(ASSIGNMENT_SWEEP_LIMIT, retry_failed_before)
        .await?;

    let mut summary = SweepSummary::default();
    for assignment_id in assignment_ids {
        let mut batch = match pipeline.grade_batch(&assignment_id).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!(assignment_id, error = %err, "Failed to start batch grading");
                continue;
            }
        };

        while let Some((submission_id, outcome)) = batch.next().await {
            match outcome {
                Ok(_) => summary.graded += 1,
                Err(err) => {
                    summary.failed += 1;
                    tracing::warn!(assignment_id, submission_id, error = %err, "Submission left ungraded");
                }
            }
            if *shutdown.borrow() {
                return Ok(summary);
            }
        }
    }

    Ok(summary)
}

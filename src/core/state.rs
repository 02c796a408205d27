use std::sync::Arc;

use crate::core::config::Settings;
use crate::repositories::GradingRepository;
use crate::tasks::grading::GradingPipeline;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    repository: Arc<dyn GradingRepository>,
    pipeline: GradingPipeline,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        repository: Arc<dyn GradingRepository>,
        pipeline: GradingPipeline,
    ) -> Self {
        Self { inner: Arc::new(InnerState { settings, repository, pipeline }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn repository(&self) -> &dyn GradingRepository {
        self.inner.repository.as_ref()
    }

    pub(crate) fn pipeline(&self) -> &GradingPipeline {
        &self.inner.pipeline
    }
}

use std::sync::Arc;

use crate::core::{config::Settings, redis::RedisHandle, time::Clock};
use crate::repositories::Stores;
use crate::services::ai_grading::AiCollaborator;
use crate::services::answer_cache::AnswerCache;
use crate::services::attempts::AttemptService;
use crate::services::grading::GradingOrchestrator;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    stores: Stores,
    redis: RedisHandle,
    grading: GradingOrchestrator,
    attempts: AttemptService,
    clock: Arc<dyn Clock>,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        stores: Stores,
        redis: RedisHandle,
        answers: Arc<dyn AnswerCache>,
        ai: Arc<dyn AiCollaborator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let grading = GradingOrchestrator::new(ai, settings.grading());
        let attempts = AttemptService::new(
            stores.clone(),
            answers,
            grading.clone(),
            clock.clone(),
            settings.exam().proctoring_write_retries,
            settings.exam().finish_lease(),
        );
        Self { inner: Arc::new(InnerState { settings, stores, redis, grading, attempts, clock }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    pub(crate) fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub(crate) fn grading(&self) -> &GradingOrchestrator {
        &self.inner.grading
    }

    pub(crate) fn attempts(&self) -> &AttemptService {
        &self.inner.attempts
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.inner.clock.as_ref()
    }
}

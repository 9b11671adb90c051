pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use crate::core::{
    config::Settings, redis::RedisHandle, state::AppState, telemetry, time::SystemClock,
};
use crate::repositories::Stores;
use crate::services::ai_grading::OpenAiCollaborator;
use crate::services::answer_cache::{AnswerCache, MemoryAnswerCache, RedisAnswerCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Process {
    Api,
    Worker,
}

impl Process {
    fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Worker => "worker",
        }
    }
}

/// In-progress answers live in Redis. Only the API process, which receives
/// them, may fall back to an in-process cache.
async fn answer_cache(
    redis: &RedisHandle,
    ttl: Duration,
    process: Process,
) -> anyhow::Result<Arc<dyn AnswerCache>> {
    match redis.connect().await {
        Ok(()) => {
            tracing::info!(process = process.as_str(), "Redis connected successfully");
            Ok(Arc::new(RedisAnswerCache::new(redis.clone(), ttl)))
        }
        Err(err) if process == Process::Api => {
            tracing::error!(
                error = %err,
                "Failed to connect to Redis; keeping in-progress answers in memory"
            );
            Ok(Arc::new(MemoryAnswerCache::default()))
        }
        Err(err) => {
            tracing::error!(
                process = process.as_str(),
                error = %err,
                "Failed to connect to Redis; refusing to sweep without the answer cache"
            );
            Err(anyhow::Error::new(err).context("Redis is required to finish expired attempts"))
        }
    }
}

async fn build_state(
    settings: Settings,
    process: Process,
) -> anyhow::Result<(AppState, RedisHandle)> {
    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let redis = RedisHandle::new(settings.redis().redis_url());
    let ttl = Duration::from_secs(settings.exam().answer_cache_ttl_seconds);
    let answers = answer_cache(&redis, ttl, process).await?;

    let ai = Arc::new(OpenAiCollaborator::from_settings(&settings)?);
    let state = AppState::new(
        settings,
        Stores::postgres(db_pool),
        redis.clone(),
        answers,
        ai,
        Arc::new(SystemClock),
    );
    Ok((state, redis))
}

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let (state, redis) = build_state(settings, Process::Api).await?;

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        "Essay exams API listening"
    );

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(core::shutdown::shutdown_signal("api"))
        .await;

    redis.disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}

pub async fn run_worker() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let (state, redis) = build_state(settings, Process::Worker).await?;

    let result = tasks::scheduler::run(state).await;

    redis.disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::redis::RedisHandle;
use crate::db::models::Answer;

#[derive(Debug, Error)]
pub(crate) enum CacheError {
    #[error("answer cache backend error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("answer cache entry is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Work-in-progress answers, keyed by attempt and problem.
///
/// Best-effort durability for resuming an attempt; the attempt record and
/// its submissions stay authoritative.
#[async_trait]
pub(crate) trait AnswerCache: Send + Sync {
    async fn put(&self, attempt_id: &str, problem_id: &str, answer: &Answer)
        -> Result<(), CacheError>;
    async fn load(&self, attempt_id: &str) -> Result<BTreeMap<String, Answer>, CacheError>;
    async fn clear(&self, attempt_id: &str) -> Result<(), CacheError>;
}

fn cache_key(attempt_id: &str) -> String {
    format!("attempt:{attempt_id}:answers")
}

/// One Redis hash per attempt; every write refreshes the TTL.
#[derive(Clone)]
pub(crate) struct RedisAnswerCache {
    redis: RedisHandle,
    ttl: Duration,
}

impl RedisAnswerCache {
    pub(crate) fn new(redis: RedisHandle, ttl: Duration) -> Self {
        Self { redis, ttl }
    }
}

#[async_trait]
impl AnswerCache for RedisAnswerCache {
    async fn put(
        &self,
        attempt_id: &str,
        problem_id: &str,
        answer: &Answer,
    ) -> Result<(), CacheError> {
        let encoded = serde_json::to_string(answer)?;
        self.redis
            .hset_with_ttl(&cache_key(attempt_id), problem_id, &encoded, self.ttl.as_secs())
            .await?;
        Ok(())
    }

    async fn load(&self, attempt_id: &str) -> Result<BTreeMap<String, Answer>, CacheError> {
        let raw = self.redis.hgetall(&cache_key(attempt_id)).await?;
        let mut answers = BTreeMap::new();
        for (problem_id, encoded) in raw {
            match serde_json::from_str::<Answer>(&encoded) {
                Ok(answer) => {
                    answers.insert(problem_id, answer);
                }
                Err(err) => tracing::warn!(
                    attempt_id,
                    problem_id = %problem_id,
                    error = %err,
                    "Skipping unreadable cached answer"
                ),
            }
        }
        Ok(answers)
    }

    async fn clear(&self, attempt_id: &str) -> Result<(), CacheError> {
        self.redis.delete(&cache_key(attempt_id)).await?;
        Ok(())
    }
}

/// Process-local cache used when Redis is unavailable.
#[derive(Default)]
pub(crate) struct MemoryAnswerCache {
    entries: RwLock<HashMap<String, BTreeMap<String, Answer>>>,
}

#[async_trait]
impl AnswerCache for MemoryAnswerCache {
    async fn put(
        &self,
        attempt_id: &str,
        problem_id: &str,
        answer: &Answer,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        entries
            .entry(attempt_id.to_string())
            .or_default()
            .insert(problem_id.to_string(), answer.clone());
        Ok(())
    }

    async fn load(&self, attempt_id: &str) -> Result<BTreeMap<String, Answer>, CacheError> {
        Ok(self.entries.read().await.get(attempt_id).cloned().unwrap_or_default())
    }

    async fn clear(&self, attempt_id: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(attempt_id);
        Ok(())
    }
}

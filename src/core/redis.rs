use std::collections::HashMap;
use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{cmd, Client, ErrorKind, RedisError};
use tokio::sync::RwLock;

#[derive(Clone)]
pub(crate) struct RedisHandle {
    url: String,
    manager: Arc<RwLock<Option<ConnectionManager>>>,
}

#[derive(Debug, Clone)]
pub(crate) enum RedisHealth {
    Healthy,
    Disconnected,
    Unhealthy(String),
}

impl RedisHandle {
    pub(crate) fn new(url: String) -> Self {
        Self { url, manager: Arc::new(RwLock::new(None)) }
    }

    pub(crate) async fn connect(&self) -> Result<(), RedisError> {
        let client = Client::open(self.url.clone())?;
        let manager = ConnectionManager::new(client).await?;
        let mut guard = self.manager.write().await;
        *guard = Some(manager);
        Ok(())
    }

    pub(crate) async fn disconnect(&self) {
        let mut guard = self.manager.write().await;
        *guard = None;
    }

    pub(crate) async fn is_connected(&self) -> bool {
        self.manager.read().await.is_some()
    }

    pub(crate) async fn health(&self) -> RedisHealth {
        let manager = { self.manager.read().await.clone() };
        let Some(mut manager) = manager else {
            return RedisHealth::Disconnected;
        };

        match cmd("PING").query_async::<_, String>(&mut manager).await {
            Ok(_) => RedisHealth::Healthy,
            Err(err) => RedisHealth::Unhealthy(err.to_string()),
        }
    }

    /// Sets one hash field and refreshes the key's TTL in a single round trip.
    pub(crate) async fn hset_with_ttl(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), RedisError> {
        let mut manager = self.connection().await?;
        redis::pipe()
            .atomic()
            .hset(key, field, value)
            .ignore()
            .expire(key, ttl_seconds.min(i64::MAX as u64) as i64)
            .ignore()
            .query_async::<_, ()>(&mut manager)
            .await
    }

    pub(crate) async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, RedisError> {
        let mut manager = self.connection().await?;
        cmd("HGETALL").arg(key).query_async::<_, HashMap<String, String>>(&mut manager).await
    }

    pub(crate) async fn delete(&self, key: &str) -> Result<(), RedisError> {
        let mut manager = self.connection().await?;
        cmd("DEL").arg(key).query_async::<_, i64>(&mut manager).await?;
        Ok(())
    }

    async fn connection(&self) -> Result<ConnectionManager, RedisError> {
        let manager = { self.manager.read().await.clone() };
        manager.ok_or_else(|| RedisError::from((ErrorKind::IoError, "redis is not connected")))
    }
}

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::PrimitiveDateTime;
use tokio::task::JoinHandle;

/// Time left until `end_time`, derived from the wall clock only.
pub(crate) fn remaining(end_time: PrimitiveDateTime, now: PrimitiveDateTime) -> Duration {
    Duration::try_from(end_time - now).unwrap_or(Duration::ZERO)
}

pub(crate) fn is_expired(end_time: PrimitiveDateTime, now: PrimitiveDateTime) -> bool {
    now >= end_time
}

/// One auto-finish timer per open attempt.
///
/// Arming an attempt that already has a timer is a no-op, so resuming an
/// attempt never schedules a second finish.
#[derive(Clone, Default)]
pub(crate) struct AutoFinishScheduler {
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl AutoFinishScheduler {
    /// Returns `false` when a timer for this attempt is already armed.
    pub(crate) fn arm<F, Fut>(&self, attempt_id: &str, delay: Duration, on_expiry: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut timers = match self.timers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if timers.contains_key(attempt_id) {
            return false;
        }

        let registry = self.timers.clone();
        let id = attempt_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Leave the registry before finishing so the finish path can
            // disarm without aborting this task.
            match registry.lock() {
                Ok(mut guard) => guard.remove(&id),
                Err(poisoned) => poisoned.into_inner().remove(&id),
            };
            tracing::info!(attempt_id = %id, "Attempt timer expired");
            on_expiry().await;
        });
        timers.insert(attempt_id.to_string(), handle);
        true
    }

    pub(crate) fn disarm(&self, attempt_id: &str) {
        let handle = match self.timers.lock() {
            Ok(mut guard) => guard.remove(attempt_id),
            Err(poisoned) => poisoned.into_inner().remove(attempt_id),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub(crate) fn is_armed(&self, attempt_id: &str) -> bool {
        match self.timers.lock() {
            Ok(guard) => guard.contains_key(attempt_id),
            Err(poisoned) => poisoned.into_inner().contains_key(attempt_id),
        }
    }
}

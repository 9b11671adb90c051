use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::core::state::AppState;
use crate::tasks::expiry;

pub(crate) async fn run(state: AppState) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(expiry_loop(state.clone(), shutdown_rx));

    crate::core::shutdown::shutdown_signal("worker").await;
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("Failed to broadcast shutdown signal to background tasks");
    }

    if let Err(err) = handle.await {
        tracing::error!(error = %err, "Background task join failed");
    }

    Ok(())
}

pub(crate) async fn expiry_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(state.settings().exam().expiry_sweep_interval_seconds.max(1));
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) =
                    expiry::finish_expired_attempts(state.stores(), state.attempts(), state.clock()).await
                {
                    tracing::error!(error = %err, "finish_expired_attempts failed");
                }
            }
        }
    }
    tracing::debug!("Expiry sweep stopped");
}

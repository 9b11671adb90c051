use anyhow::{Context, Result};

use crate::core::time::Clock;
use crate::repositories::Stores;
use crate::services::attempts::{AttemptService, FinishOutcome};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepReport {
    pub(crate) finished: usize,
    pub(crate) skipped: usize,
    pub(crate) failed: usize,
}

/// Finishes every open attempt whose exam window has closed.
///
/// Covers attempts whose in-process timer was lost, e.g. after a restart.
pub(crate) async fn finish_expired_attempts(
    stores: &Stores,
    attempts: &AttemptService,
    clock: &dyn Clock,
) -> Result<SweepReport> {
    let now = clock.now();
    let expired = stores
        .attempts
        .list_open_ended_before(now)
        .await
        .context("Failed to fetch expired attempts")?;

    let mut report = SweepReport::default();
    for attempt in expired {
        match attempts.finish_expired(&attempt.id).await {
            Ok(FinishOutcome::Closed(finished)) => {
                report.finished += 1;
                if !finished.failed_problem_ids.is_empty() {
                    tracing::warn!(
                        attempt_id = %attempt.id,
                        failed = finished.failed_problem_ids.len(),
                        "Expired attempt closed with ungraded answers"
                    );
                }
            }
            Ok(FinishOutcome::AlreadyClosed(_)) | Ok(FinishOutcome::InProgress) => {
                report.skipped += 1;
            }
            Err(err) => {
                report.failed += 1;
                tracing::error!(attempt_id = %attempt.id, error = %err, "Failed to finish expired attempt");
            }
        }
    }

    if report.finished > 0 {
        tracing::info!(
            finished = report.finished,
            skipped = report.skipped,
            failed = report.failed,
            "Finished expired attempts"
        );
    }
    metrics::counter!("expired_attempts_finished_total").increment(report.finished as u64);

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{finish_expired_attempts, SweepReport};
    use crate::db::models::Answer;
    use crate::db::types::FinishMode;
    use crate::repositories::AttemptStore;
    use crate::test_support::Harness;

    #[tokio::test]
    async fn sweep_closes_attempts_after_the_exam_ends() {
        let harness = Harness::new();
        let (exam, problems) = harness.exam_ending_in(Duration::from_secs(600)).await;
        let student = harness.student("s-1").await;
        let started = harness.attempts.start(&student, &exam.id, None).await.expect("start");
        harness
            .attempts
            .answer(&student, &started.attempt.id, &problems[0].id, Answer::Essay("Draft".into()))
            .await
            .expect("answer");

        // A fresh service has no timers armed, like a restarted worker.
        let service = harness.fresh_attempt_service();
        let early = finish_expired_attempts(&harness.stores, &service, harness.clock.as_ref())
            .await
            .expect("sweep");
        assert_eq!(early, SweepReport::default());

        harness.clock.advance(Duration::from_secs(601));
        let report = finish_expired_attempts(&harness.stores, &service, harness.clock.as_ref())
            .await
            .expect("sweep");

        assert_eq!(report.finished, 1);
        let closed = harness.attempt_store.get_sync(&started.attempt.id).expect("attempt");
        assert_eq!(closed.finish_mode, Some(FinishMode::TimerExpired));
        assert_eq!(closed.submission_ids.len(), 1);
    }

    #[tokio::test]
    async fn sweep_leaves_attempts_claimed_by_another_process() {
        let harness = Harness::new();
        let (exam, _) = harness.exam_ending_in(Duration::from_secs(60)).await;
        let student = harness.student("s-1").await;
        let started = harness.attempts.start(&student, &exam.id, None).await.expect("start");
        let now = harness.clock_now();
        harness
            .attempt_store
            .claim_finish(&started.attempt.id, now, now + Duration::from_secs(600))
            .await
            .expect("claim")
            .expect("claimed");

        let service = harness.fresh_attempt_service();
        harness.clock.advance(Duration::from_secs(120));
        let report = finish_expired_attempts(&harness.stores, &service, harness.clock.as_ref())
            .await
            .expect("sweep");
        assert_eq!(report, SweepReport::default());

        harness.clock.advance(Duration::from_secs(600));
        let report = finish_expired_attempts(&harness.stores, &service, harness.clock.as_ref())
            .await
            .expect("sweep");
        assert_eq!(report.finished, 1);
    }

    #[tokio::test]
    async fn sweep_ignores_attempts_already_closed() {
        let harness = Harness::new();
        let (exam, _) = harness.exam_ending_in(Duration::from_secs(60)).await;
        let student = harness.student("s-1").await;
        let started = harness.attempts.start(&student, &exam.id, None).await.expect("start");
        harness
            .attempts
            .finish(&student, &started.attempt.id, Default::default())
            .await
            .expect("finish");

        harness.clock.advance(Duration::from_secs(120));
        let report =
            finish_expired_attempts(&harness.stores, &harness.attempts, harness.clock.as_ref())
                .await
                .expect("sweep");

        assert_eq!(report, SweepReport::default());
    }
}

use time::PrimitiveDateTime;

use crate::db::models::{Exam, ExamAttempt};
use crate::db::types::{AttemptState, ExamStatus};
use crate::repositories::{StoreResult, Stores};

/// Status of an exam window at `now`. The window is `[start_time, end_time)`.
pub(crate) fn status(exam: &Exam, now: PrimitiveDateTime) -> ExamStatus {
    if now < exam.start_time {
        ExamStatus::Upcoming
    } else if now < exam.end_time {
        ExamStatus::Ongoing
    } else {
        ExamStatus::Ended
    }
}

pub(crate) async fn problem_count(stores: &Stores, exam: &Exam) -> StoreResult<usize> {
    Ok(stores.problems.list_by_exam(&exam.id).await?.len())
}

pub(crate) async fn attempts_for(stores: &Stores, exam: &Exam) -> StoreResult<Vec<ExamAttempt>> {
    stores.attempts.list_by_exam(&exam.id).await
}

#[derive(Debug, Clone)]
pub(crate) struct AttemptMonitorRow {
    pub(crate) attempt_id: String,
    pub(crate) student_id: String,
    pub(crate) state: AttemptState,
    pub(crate) started_at: PrimitiveDateTime,
    pub(crate) submitted_at: Option<PrimitiveDateTime>,
    pub(crate) fullscreen_exit_count: usize,
    pub(crate) hidden_count: usize,
    pub(crate) submission_count: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct ExamMonitor {
    pub(crate) exam_id: String,
    pub(crate) status: ExamStatus,
    pub(crate) problem_count: usize,
    pub(crate) attempts: Vec<AttemptMonitorRow>,
}

/// Per-attempt integrity overview for an exam. `state_of` reports whether an
/// open attempt is currently being submitted.
pub(crate) async fn monitor(
    stores: &Stores,
    exam: &Exam,
    now: PrimitiveDateTime,
    state_of: impl Fn(&ExamAttempt) -> AttemptState,
) -> StoreResult<ExamMonitor> {
    let problem_count = problem_count(stores, exam).await?;
    let attempts = attempts_for(stores, exam)
        .await?
        .iter()
        .map(|attempt| AttemptMonitorRow {
            attempt_id: attempt.id.clone(),
            student_id: attempt.student_id.clone(),
            state: state_of(attempt),
            started_at: attempt.started_at,
            submitted_at: attempt.submitted_at,
            fullscreen_exit_count: attempt.fullscreen_exits.len(),
            hidden_count: attempt.hidden_count(),
            submission_count: attempt.submission_ids.len(),
        })
        .collect();

    Ok(ExamMonitor {
        exam_id: exam.id.clone(),
        status: status(exam, now),
        problem_count,
        attempts,
    })
}

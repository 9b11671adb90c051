//! Exam attempt lifecycle: `Open -> Submitting -> Closed`.
//!
//! Answer edits and the start of a finish are serialized per attempt by a
//! short-lived lock; grading never runs under it. Across processes a finish
//! is claimed in the store with a lease, so the API timer and the worker
//! sweep never grade the same attempt twice. Proctoring appends go straight
//! to the store as field-level merges so they cannot clobber a concurrent
//! close.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use time::PrimitiveDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::time::Clock;
use crate::db::models::{
    Answer, Exam, ExamAttempt, Problem, Submission, VisibilityChange,
};
use crate::db::types::{AttemptState, ExamStatus, FinishMode, ProblemKind, VisibilityState};
use crate::repositories::{AttemptUpdate, NewAttempt, StoreError, Stores};
use crate::services::access::ActingUser;
use crate::services::answer_cache::{AnswerCache, CacheError};
use crate::services::attempt_timer::{self, AutoFinishScheduler};
use crate::services::exam_status;
use crate::services::grading::GradingOrchestrator;
use crate::services::practice::essay_fingerprint;
use crate::services::rubric;

const PROCTORING_RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub(crate) enum AttemptError {
    #[error("exam not found")]
    ExamNotFound,
    #[error("exam is not open for attempts")]
    ExamNotOpen { status: ExamStatus },
    #[error("incorrect exam password")]
    PasswordMismatch,
    #[error("session not found")]
    AttemptNotFound,
    #[error("not allowed to act on this attempt")]
    Forbidden,
    #[error("attempt is already submitted")]
    AttemptClosed,
    #[error("attempt is being submitted")]
    AttemptFrozen,
    #[error("exam time is over")]
    AttemptExpired,
    #[error("problem {0} is not part of this exam")]
    UnknownProblem(String),
    #[error("answer does not fit problem {0}")]
    InvalidAnswer(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone)]
pub(crate) struct StartedAttempt {
    pub(crate) attempt: ExamAttempt,
    pub(crate) resumed: bool,
    pub(crate) remaining: Duration,
}

#[derive(Debug, Clone)]
pub(crate) enum ProctoringOutcome {
    Recorded(ExamAttempt),
    /// Visible transitions are not stored.
    Ignored,
    /// Every write attempt failed; the event is lost.
    Dropped,
}

#[derive(Debug, Clone)]
pub(crate) struct FinishReport {
    pub(crate) attempt: ExamAttempt,
    pub(crate) submissions: Vec<Submission>,
    /// Answered problems that produced no submission.
    pub(crate) failed_problem_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) enum FinishOutcome {
    Closed(FinishReport),
    /// The attempt was closed before this call; nothing was graded.
    AlreadyClosed(ExamAttempt),
    /// Another finish for this attempt is running.
    InProgress,
}

#[derive(Debug, Clone)]
pub(crate) struct AttemptView {
    pub(crate) attempt: ExamAttempt,
    pub(crate) exam: Exam,
    pub(crate) state: AttemptState,
    pub(crate) remaining: Duration,
    pub(crate) problems: Vec<Problem>,
    pub(crate) answers: BTreeMap<String, Answer>,
}

#[derive(Clone)]
pub(crate) struct AttemptService {
    inner: Arc<Inner>,
}

struct Inner {
    stores: Stores,
    answers: Arc<dyn AnswerCache>,
    grading: GradingOrchestrator,
    clock: Arc<dyn Clock>,
    timers: AutoFinishScheduler,
    proctoring_write_retries: u32,
    finish_lease: Duration,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    submitting: StdMutex<HashSet<String>>,
    open_index: RwLock<HashMap<(String, String), String>>,
}

/// Removes the attempt from the submitting set however the finish ends.
struct SubmittingGuard<'a> {
    inner: &'a Inner,
    attempt_id: String,
}

impl Drop for SubmittingGuard<'_> {
    fn drop(&mut self) {
        lock_std(&self.inner.submitting).remove(&self.attempt_id);
    }
}

fn lock_std<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl AttemptService {
    pub(crate) fn new(
        stores: Stores,
        answers: Arc<dyn AnswerCache>,
        grading: GradingOrchestrator,
        clock: Arc<dyn Clock>,
        proctoring_write_retries: u32,
        finish_lease: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                stores,
                answers,
                grading,
                clock,
                timers: AutoFinishScheduler::default(),
                proctoring_write_retries,
                finish_lease,
                locks: StdMutex::new(HashMap::new()),
                submitting: StdMutex::new(HashSet::new()),
                open_index: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn timers(&self) -> &AutoFinishScheduler {
        &self.inner.timers
    }

    /// Opens an attempt, or resumes the open one for this exam and student.
    pub(crate) async fn start(
        &self,
        acting: &ActingUser,
        exam_id: &str,
        password: Option<&str>,
    ) -> Result<StartedAttempt, AttemptError> {
        let exam = self
            .inner
            .stores
            .exams
            .find_by_id(exam_id)
            .await?
            .ok_or(AttemptError::ExamNotFound)?;

        let now = self.inner.clock.now();
        let status = exam_status::status(&exam, now);
        if status != ExamStatus::Ongoing {
            return Err(AttemptError::ExamNotOpen { status });
        }

        if let Some(expected) = exam.password.as_deref().filter(|value| !value.is_empty()) {
            if password != Some(expected) {
                tracing::info!(exam_id, user_id = %acting.id(), "Exam password mismatch");
                return Err(AttemptError::PasswordMismatch);
            }
        }

        let (attempt, resumed) = match self.find_open(exam_id, acting.id()).await? {
            Some(existing) => (existing, true),
            None => {
                let id = Uuid::new_v4().to_string();
                let created = self
                    .inner
                    .stores
                    .attempts
                    .create(NewAttempt {
                        id: id.clone(),
                        exam_id: exam.id.clone(),
                        student_id: acting.id().to_string(),
                        started_at: now,
                    })
                    .await?;
                let resumed = created.id != id;
                (created, resumed)
            }
        };

        self.remember_open(&attempt);
        let remaining = attempt_timer::remaining(exam.end_time, now);
        self.arm_timer(&attempt.id, remaining);

        if resumed {
            metrics::counter!("attempts_resumed_total").increment(1);
            tracing::info!(attempt_id = %attempt.id, exam_id, "Resumed open attempt");
        } else {
            metrics::counter!("attempts_started_total").increment(1);
            tracing::info!(
                attempt_id = %attempt.id,
                exam_id,
                student_id = %attempt.student_id,
                impersonator_id = acting.impersonator_id(),
                "Started attempt"
            );
        }

        Ok(StartedAttempt { attempt, resumed, remaining })
    }

    /// Stores a work-in-progress answer in the attempt's cache.
    pub(crate) async fn answer(
        &self,
        acting: &ActingUser,
        attempt_id: &str,
        problem_id: &str,
        answer: Answer,
    ) -> Result<(), AttemptError> {
        let lock = self.attempt_lock(attempt_id);
        let _held = lock.lock().await;

        let attempt = self.load_owned(acting, attempt_id).await?;
        self.ensure_editable(&attempt)?;

        let exam = self.load_exam(&attempt.exam_id).await?;
        if attempt_timer::is_expired(exam.end_time, self.inner.clock.now()) {
            return Err(AttemptError::AttemptExpired);
        }

        let problem = self
            .inner
            .stores
            .problems
            .find_by_id(problem_id)
            .await?
            .filter(|problem| problem.exam_id.as_deref() == Some(attempt.exam_id.as_str()))
            .ok_or_else(|| AttemptError::UnknownProblem(problem_id.to_string()))?;
        if !answer_fits(&problem, &answer) {
            return Err(AttemptError::InvalidAnswer(problem_id.to_string()));
        }

        self.inner.answers.put(attempt_id, problem_id, &answer).await?;
        Ok(())
    }

    pub(crate) async fn record_fullscreen_exit(
        &self,
        acting: &ActingUser,
        attempt_id: &str,
    ) -> Result<ProctoringOutcome, AttemptError> {
        let attempt = self.load_owned(acting, attempt_id).await?;
        if !attempt.is_open() {
            return Err(AttemptError::AttemptClosed);
        }

        let at = self.inner.clock.now();
        self.append_proctoring(attempt_id, "fullscreen_exit", AttemptUpdate::AppendFullscreenExit(at))
            .await
    }

    pub(crate) async fn record_visibility(
        &self,
        acting: &ActingUser,
        attempt_id: &str,
        state: VisibilityState,
    ) -> Result<ProctoringOutcome, AttemptError> {
        let attempt = self.load_owned(acting, attempt_id).await?;
        if !attempt.is_open() {
            return Err(AttemptError::AttemptClosed);
        }

        if state == VisibilityState::Visible {
            tracing::debug!(attempt_id, "Ignoring visible transition");
            return Ok(ProctoringOutcome::Ignored);
        }

        let change = VisibilityChange { timestamp: self.inner.clock.now(), state };
        self.append_proctoring(attempt_id, "visibility_hidden", AttemptUpdate::AppendVisibilityChange(change))
            .await
    }

    /// Student-initiated finish. `client_answers` override cached answers per
    /// problem while the exam window is still open, and must fit their
    /// problems the same way saved answers do.
    pub(crate) async fn finish(
        &self,
        acting: &ActingUser,
        attempt_id: &str,
        client_answers: BTreeMap<String, Answer>,
    ) -> Result<FinishOutcome, AttemptError> {
        let attempt = self.load_owned(acting, attempt_id).await?;
        if attempt.is_open() && !client_answers.is_empty() {
            let problems = self.inner.stores.problems.list_by_exam(&attempt.exam_id).await?;
            for (problem_id, answer) in &client_answers {
                let problem = problems
                    .iter()
                    .find(|problem| &problem.id == problem_id)
                    .ok_or_else(|| AttemptError::UnknownProblem(problem_id.clone()))?;
                if !answer_fits(problem, answer) {
                    return Err(AttemptError::InvalidAnswer(problem_id.clone()));
                }
            }
        }
        self.finish_with(attempt_id, FinishMode::Manual, client_answers).await
    }

    /// Finish triggered by the exam timer or the expiry sweep.
    pub(crate) async fn finish_expired(
        &self,
        attempt_id: &str,
    ) -> Result<FinishOutcome, AttemptError> {
        self.finish_with(attempt_id, FinishMode::TimerExpired, BTreeMap::new()).await
    }

    pub(crate) async fn view(
        &self,
        acting: &ActingUser,
        attempt_id: &str,
    ) -> Result<AttemptView, AttemptError> {
        let attempt = self.load_attempt(attempt_id).await?;
        let exam = self.load_exam(&attempt.exam_id).await?;
        let is_owner = attempt.student_id == acting.id();
        if !is_owner && !acting.can_manage(&exam.created_by) {
            return Err(AttemptError::Forbidden);
        }

        let state = self.state_of(&attempt);
        let remaining = match state {
            AttemptState::Closed => Duration::ZERO,
            _ => attempt_timer::remaining(exam.end_time, self.inner.clock.now()),
        };
        let problems = self.inner.stores.problems.list_by_exam(&exam.id).await?;
        let answers = if is_owner && state == AttemptState::Open {
            self.inner.answers.load(attempt_id).await?
        } else {
            BTreeMap::new()
        };

        Ok(AttemptView { attempt, exam, state, remaining, problems, answers })
    }

    pub(crate) fn state_of(&self, attempt: &ExamAttempt) -> AttemptState {
        if !attempt.is_open() {
            AttemptState::Closed
        } else if lock_std(&self.inner.submitting).contains(&attempt.id)
            || attempt.is_finish_claimed(self.inner.clock.now())
        {
            AttemptState::Submitting
        } else {
            AttemptState::Open
        }
    }

    async fn finish_with(
        &self,
        attempt_id: &str,
        mode: FinishMode,
        client_answers: BTreeMap<String, Answer>,
    ) -> Result<FinishOutcome, AttemptError> {
        let (attempt, _submitting) = {
            let lock = self.attempt_lock(attempt_id);
            let _held = lock.lock().await;

            let attempt = self.load_attempt(attempt_id).await?;
            if !attempt.is_open() {
                tracing::debug!(attempt_id, mode = mode.as_str(), "Finish on closed attempt ignored");
                return Ok(FinishOutcome::AlreadyClosed(attempt));
            }
            if !lock_std(&self.inner.submitting).insert(attempt_id.to_string()) {
                return Ok(FinishOutcome::InProgress);
            }
            let guard = SubmittingGuard { inner: &self.inner, attempt_id: attempt_id.to_string() };

            let now = self.inner.clock.now();
            let claimed = self
                .inner
                .stores
                .attempts
                .claim_finish(attempt_id, now, now + self.inner.finish_lease)
                .await?;
            let Some(attempt) = claimed else {
                let current = self.load_attempt(attempt_id).await?;
                if !current.is_open() {
                    return Ok(FinishOutcome::AlreadyClosed(current));
                }
                tracing::debug!(attempt_id, mode = mode.as_str(), "Finish already claimed by another process");
                return Ok(FinishOutcome::InProgress);
            };
            (attempt, guard)
        };

        let result = self.grade_and_close(&attempt, mode, client_answers).await;
        if result.is_err() {
            if let Err(err) = self.inner.stores.attempts.release_finish(attempt_id).await {
                tracing::warn!(attempt_id, error = %err, "Failed to release finish claim");
            }
        }
        result
    }

    /// Runs under a live finish claim.
    async fn grade_and_close(
        &self,
        attempt: &ExamAttempt,
        mode: FinishMode,
        client_answers: BTreeMap<String, Answer>,
    ) -> Result<FinishOutcome, AttemptError> {
        let attempt_id = attempt.id.as_str();
        let exam = self.load_exam(&attempt.exam_id).await?;
        let mut answers = self.inner.answers.load(attempt_id).await?;
        if !client_answers.is_empty() {
            if attempt_timer::is_expired(exam.end_time, self.inner.clock.now()) {
                tracing::warn!(attempt_id, "Ignoring client answers sent after the exam ended");
            } else {
                answers.extend(client_answers);
            }
        }

        let problems = self.inner.stores.problems.list_by_exam(&exam.id).await?;
        let mut produced: HashMap<String, Submission> = self
            .inner
            .stores
            .submissions
            .list_by_attempt(attempt_id)
            .await?
            .into_iter()
            .map(|submission| (submission.problem_id.clone(), submission))
            .collect();

        let mut work: Vec<(Problem, Answer)> = Vec::new();
        for problem in &problems {
            if produced.contains_key(&problem.id) {
                continue;
            }
            let Some(answer) = answers.get(&problem.id).filter(|answer| !answer.is_blank()) else {
                continue;
            };
            let problem = rubric::pin_criteria(
                self.inner.stores.problems.as_ref(),
                self.inner.grading.collaborator(),
                self.inner.clock.as_ref(),
                problem.clone(),
                self.inner.grading.timeout(),
            )
            .await?;
            work.push((problem, answer.clone()));
        }

        let mut failed_problem_ids = Vec::new();
        for outcome in self.inner.grading.grade_batch(work).await {
            let graded = match outcome.result {
                Ok(graded) => graded,
                Err(_) => {
                    failed_problem_ids.push(outcome.problem_id);
                    continue;
                }
            };
            let Some(answer) = answers.get(&outcome.problem_id) else {
                continue;
            };

            let submission = exam_submission(
                attempt,
                &outcome.problem_id,
                answer,
                graded.feedback,
                self.inner.clock.now(),
            );
            match self.inner.stores.submissions.create(submission).await {
                Ok(created) => {
                    produced.insert(created.problem_id.clone(), created);
                }
                Err(err) => {
                    tracing::error!(
                        attempt_id,
                        problem_id = %outcome.problem_id,
                        error = %err,
                        "Failed to persist graded submission"
                    );
                    failed_problem_ids.push(outcome.problem_id);
                }
            }
        }

        let submissions: Vec<Submission> =
            problems.iter().filter_map(|problem| produced.remove(&problem.id)).collect();
        let submission_ids = submissions.iter().map(|submission| submission.id.clone()).collect();

        let closed = self
            .inner
            .stores
            .attempts
            .update(
                attempt_id,
                AttemptUpdate::Close { submitted_at: self.inner.clock.now(), submission_ids, mode },
            )
            .await?;
        let Some(closed) = closed else {
            let current = self.load_attempt(attempt_id).await?;
            return Ok(FinishOutcome::AlreadyClosed(current));
        };

        if let Err(err) = self.inner.answers.clear(attempt_id).await {
            tracing::warn!(attempt_id, error = %err, "Failed to clear answer cache after finish");
        }
        self.inner.timers.disarm(attempt_id);
        self.forget_open(&closed);
        lock_std(&self.inner.locks).remove(attempt_id);

        metrics::counter!("attempts_finished_total", "mode" => mode.as_str()).increment(1);
        tracing::info!(
            attempt_id,
            exam_id = %closed.exam_id,
            mode = mode.as_str(),
            graded = submissions.len(),
            failed = failed_problem_ids.len(),
            "Attempt closed"
        );

        Ok(FinishOutcome::Closed(FinishReport { attempt: closed, submissions, failed_problem_ids }))
    }

    async fn append_proctoring(
        &self,
        attempt_id: &str,
        kind: &'static str,
        update: AttemptUpdate,
    ) -> Result<ProctoringOutcome, AttemptError> {
        let mut tries = 0u32;
        loop {
            match self.inner.stores.attempts.update(attempt_id, update.clone()).await {
                Ok(Some(attempt)) => {
                    metrics::counter!("proctoring_events_total", "kind" => kind).increment(1);
                    return Ok(ProctoringOutcome::Recorded(attempt));
                }
                Ok(None) => return Err(AttemptError::AttemptClosed),
                Err(err) if tries < self.inner.proctoring_write_retries => {
                    tries += 1;
                    tracing::debug!(attempt_id, kind, tries, error = %err, "Retrying proctoring write");
                    tokio::time::sleep(PROCTORING_RETRY_BACKOFF * tries).await;
                }
                Err(err) => {
                    metrics::counter!("proctoring_events_dropped_total").increment(1);
                    tracing::warn!(attempt_id, kind, error = %err, "Dropped proctoring event");
                    return Ok(ProctoringOutcome::Dropped);
                }
            }
        }
    }

    /// Open attempt for this pair. A miss in the in-process index falls
    /// through to the store.
    async fn find_open(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> Result<Option<ExamAttempt>, StoreError> {
        let key = (exam_id.to_string(), student_id.to_string());
        let cached = self.read_index().get(&key).cloned();
        if let Some(attempt_id) = cached {
            match self.inner.stores.attempts.find_by_id(&attempt_id).await? {
                Some(attempt) if attempt.is_open() => return Ok(Some(attempt)),
                _ => {
                    self.write_index().remove(&key);
                }
            }
        }

        self.inner.stores.attempts.find_open(exam_id, student_id).await
    }

    fn remember_open(&self, attempt: &ExamAttempt) {
        self.write_index()
            .insert((attempt.exam_id.clone(), attempt.student_id.clone()), attempt.id.clone());
    }

    fn forget_open(&self, attempt: &ExamAttempt) {
        self.write_index().remove(&(attempt.exam_id.clone(), attempt.student_id.clone()));
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, HashMap<(String, String), String>> {
        match self.inner.open_index.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_index(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<(String, String), String>> {
        match self.inner.open_index.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn arm_timer(&self, attempt_id: &str, delay: Duration) {
        let service = self.clone();
        let id = attempt_id.to_string();
        self.inner.timers.arm(attempt_id, delay, move || async move {
            match service.finish_expired(&id).await {
                Ok(FinishOutcome::Closed(_)) => {
                    tracing::info!(attempt_id = %id, "Attempt finished by timer");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(attempt_id = %id, error = %err, "Timer finish failed");
                }
            }
        });
    }

    fn attempt_lock(&self, attempt_id: &str) -> Arc<Mutex<()>> {
        lock_std(&self.inner.locks).entry(attempt_id.to_string()).or_default().clone()
    }

    fn ensure_editable(&self, attempt: &ExamAttempt) -> Result<(), AttemptError> {
        match self.state_of(attempt) {
            AttemptState::Open => Ok(()),
            AttemptState::Submitting => Err(AttemptError::AttemptFrozen),
            AttemptState::Closed => Err(AttemptError::AttemptClosed),
        }
    }

    async fn load_attempt(&self, attempt_id: &str) -> Result<ExamAttempt, AttemptError> {
        self.inner
            .stores
            .attempts
            .find_by_id(attempt_id)
            .await?
            .ok_or(AttemptError::AttemptNotFound)
    }

    async fn load_owned(
        &self,
        acting: &ActingUser,
        attempt_id: &str,
    ) -> Result<ExamAttempt, AttemptError> {
        let attempt = self.load_attempt(attempt_id).await?;
        if attempt.student_id != acting.id() {
            return Err(AttemptError::Forbidden);
        }
        Ok(attempt)
    }

    async fn load_exam(&self, exam_id: &str) -> Result<Exam, AttemptError> {
        self.inner.stores.exams.find_by_id(exam_id).await?.ok_or(AttemptError::ExamNotFound)
    }
}

fn answer_fits(problem: &Problem, answer: &Answer) -> bool {
    match (problem.kind, answer) {
        (ProblemKind::Essay, Answer::Essay(_)) => true,
        (ProblemKind::ReadingComprehension, Answer::Choices(choices)) => {
            let questions = &problem.questions.0;
            choices.len() <= questions.len()
                && choices.iter().zip(questions).all(|(choice, question)| {
                    choice.map_or(true, |index| (index as usize) < question.options.len())
                })
        }
        _ => false,
    }
}

fn exam_submission(
    attempt: &ExamAttempt,
    problem_id: &str,
    answer: &Answer,
    feedback: crate::db::models::Feedback,
    submitted_at: PrimitiveDateTime,
) -> Submission {
    let (essay, answers, essay_hash) = match answer {
        Answer::Essay(text) => (Some(text.clone()), None, Some(essay_fingerprint(text))),
        Answer::Choices(choices) => (None, Some(sqlx::types::Json(choices.clone())), None),
    };

    Submission {
        id: Uuid::new_v4().to_string(),
        problem_id: problem_id.to_string(),
        submitter_id: attempt.student_id.clone(),
        exam_id: Some(attempt.exam_id.clone()),
        attempt_id: Some(attempt.id.clone()),
        essay,
        answers,
        essay_hash,
        feedback: sqlx::types::Json(feedback),
        similarity_check: None,
        submitted_at,
    }
}

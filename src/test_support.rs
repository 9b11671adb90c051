use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    Router,
};
use serde_json::{json, Value};
use sqlx::types::Json;
use time::macros::datetime;
use time::PrimitiveDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::api;
use crate::core::config::{GradingSettings, Settings};
use crate::core::{redis::RedisHandle, security, state::AppState, time::Clock};
use crate::db::models::{
    Exam, ExamAttempt, Feedback, Problem, ReadingQuestion, RubricItem, Submission, User,
};
use crate::db::types::{ProblemKind, UserRole};
use crate::repositories::{
    AttemptStore, AttemptUpdate, ExamStore, NewAttempt, ProblemStore, StoreError, StoreResult,
    Stores, SubmissionStore, UserStore,
};
use crate::services::access::ActingUser;
use crate::services::ai_grading::{AiCollaborator, CollaboratorError, GradeRequest};
use crate::services::answer_cache::MemoryAnswerCache;
use crate::services::attempts::AttemptService;
use crate::services::grading::GradingOrchestrator;

const TEST_SECRET_KEY: &str = "test-secret";
const PROCTORING_RETRIES: u32 = 2;
const FINISH_LEASE: Duration = Duration::from_secs(900);

/// Fixed wall-clock reading every fixture starts from.
pub(crate) const NOW: PrimitiveDateTime = datetime!(2025-05-01 09:00:00);

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    std::env::set_var("APP_ENV", "test");
    std::env::remove_var("APP_STRICT_CONFIG");
    std::env::set_var("SECRET_KEY", TEST_SECRET_KEY);
    std::env::remove_var("DATABASE_URL");
    std::env::remove_var("GRADING_CONCURRENCY");
    std::env::remove_var("FINISH_LEASE_SECONDS");
    std::env::remove_var("OPENAI_API_KEY");
    std::env::remove_var("OPENAI_BASE_URL");
    std::env::set_var("PROMETHEUS_ENABLED", "0");
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("test store mutex")
}

// Fixtures

pub(crate) fn user(id: &str, role: UserRole) -> User {
    User {
        id: id.to_string(),
        username: id.to_string(),
        full_name: format!("User {id}"),
        role,
        is_active: true,
        created_at: NOW,
        updated_at: NOW,
    }
}

pub(crate) fn exam(
    id: &str,
    owner: &str,
    start_time: PrimitiveDateTime,
    end_time: PrimitiveDateTime,
) -> Exam {
    Exam {
        id: id.to_string(),
        title: format!("Exam {id}"),
        description: None,
        start_time,
        end_time,
        password: None,
        created_by: owner.to_string(),
        created_at: NOW,
        updated_at: NOW,
    }
}

pub(crate) fn essay_problem(id: &str, exam_id: Option<&str>) -> Problem {
    Problem {
        id: id.to_string(),
        title: format!("Problem {id}"),
        kind: ProblemKind::Essay,
        prompt: "Describe a place that matters to you.".to_string(),
        passage: None,
        questions: Json(Vec::new()),
        rubric_items: Json(Vec::new()),
        raw_rubric: None,
        custom_max_score: 10.0,
        is_rubric_hidden: false,
        exam_id: exam_id.map(str::to_string),
        created_by: "t-1".to_string(),
        created_at: NOW,
        updated_at: NOW,
    }
}

pub(crate) fn reading_problem(id: &str, exam_id: Option<&str>, correct: &[u32]) -> Problem {
    let questions = correct
        .iter()
        .enumerate()
        .map(|(index, &correct_option)| ReadingQuestion {
            id: format!("q-{}", index + 1),
            question: format!("Question {}", index + 1),
            options: vec!["A".into(), "B".into(), "C".into(), "D".into()],
            correct_option,
        })
        .collect();

    Problem {
        kind: ProblemKind::ReadingComprehension,
        prompt: "Read the passage and answer the questions.".to_string(),
        passage: Some("A short passage about rivers.".to_string()),
        questions: Json(questions),
        ..essay_problem(id, exam_id)
    }
}

pub(crate) fn rubric_item(id: &str, criterion: &str, max_score: f64) -> RubricItem {
    RubricItem { id: id.to_string(), criterion: criterion.to_string(), max_score }
}

pub(crate) fn scored_submission(
    id: &str,
    problem_id: &str,
    submitter_id: &str,
    score: f64,
) -> Submission {
    Submission {
        id: id.to_string(),
        problem_id: problem_id.to_string(),
        submitter_id: submitter_id.to_string(),
        exam_id: None,
        attempt_id: None,
        essay: Some(format!("Essay {id}")),
        answers: None,
        essay_hash: None,
        feedback: Json(Feedback {
            detailed_feedback: Vec::new(),
            total_score: score,
            max_score: 10.0,
            general_suggestions: Vec::new(),
        }),
        similarity_check: None,
        submitted_at: NOW,
    }
}

pub(crate) fn grading_settings() -> GradingSettings {
    GradingSettings { timeout_seconds: 5, concurrency: 3, default_max_score: 10.0 }
}

// Clock

#[derive(Debug)]
pub(crate) struct FixedClock {
    now: StdMutex<PrimitiveDateTime>,
}

impl FixedClock {
    pub(crate) fn new(now: PrimitiveDateTime) -> Self {
        Self { now: StdMutex::new(now) }
    }

    pub(crate) fn set(&self, now: PrimitiveDateTime) {
        *lock(&self.now) = now;
    }

    pub(crate) fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> PrimitiveDateTime {
        *lock(&self.now)
    }
}

// AI collaborator double

#[derive(Debug, Clone, Default)]
struct Script {
    grade_response: Option<Value>,
    rubric_response: Option<Value>,
    similarity_response: Option<Value>,
    failing_marker: Option<String>,
    reported_max: Option<f64>,
    delay: Option<Duration>,
}

/// Scripted stand-in for the remote AI service. Clones share call counters.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedCollaborator {
    script: Arc<Script>,
    grade_calls: Arc<AtomicUsize>,
    rubric_calls: Arc<AtomicUsize>,
    similarity_calls: Arc<AtomicUsize>,
    grade_requests: Arc<StdMutex<Vec<GradeRequest>>>,
}

impl ScriptedCollaborator {
    fn with_script(self, edit: impl FnOnce(&mut Script)) -> Self {
        let mut script = Script::clone(&self.script);
        edit(&mut script);
        Self { script: Arc::new(script), ..self }
    }

    pub(crate) fn with_grade_response(self, value: Value) -> Self {
        self.with_script(|script| script.grade_response = Some(value))
    }

    pub(crate) fn with_rubric(self, value: Value) -> Self {
        self.with_script(|script| script.rubric_response = Some(value))
    }

    pub(crate) fn with_similarity(self, value: Value) -> Self {
        self.with_script(|script| script.similarity_response = Some(value))
    }

    /// Grading fails for essays containing `marker`.
    pub(crate) fn failing_on(self, marker: &str) -> Self {
        let marker = marker.to_string();
        self.with_script(|script| script.failing_marker = Some(marker))
    }

    /// Reports this max score regardless of the requested scale.
    pub(crate) fn reporting_max(self, max_score: f64) -> Self {
        self.with_script(|script| script.reported_max = Some(max_score))
    }

    pub(crate) fn with_delay(self, delay: Duration) -> Self {
        self.with_script(|script| script.delay = Some(delay))
    }

    pub(crate) fn grade_calls(&self) -> usize {
        self.grade_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn rubric_calls(&self) -> usize {
        self.rubric_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn similarity_calls(&self) -> usize {
        self.similarity_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn grade_requests(&self) -> Vec<GradeRequest> {
        lock(&self.grade_requests).clone()
    }

    fn default_grade(&self, request: &GradeRequest) -> Value {
        let max_score = self.script.reported_max.unwrap_or(request.target_max_score);
        let total = max_score * 0.8;
        let rubric_total: f64 = request.rubric_items.iter().map(|item| item.max_score).sum();

        let detailed: Vec<Value> = if request.rubric_items.is_empty() || rubric_total <= 0.0 {
            vec![json!({"criterion": "Overall", "score": total, "feedback": "Solid work."})]
        } else {
            request
                .rubric_items
                .iter()
                .map(|item| {
                    json!({
                        "criterionId": item.id,
                        "criterion": item.criterion,
                        "score": total * item.max_score / rubric_total,
                        "feedback": "Meets most expectations."
                    })
                })
                .collect()
        };

        json!({
            "detailedFeedback": detailed,
            "totalScore": total,
            "maxScore": max_score,
            "generalSuggestions": ["Add a concrete example."]
        })
    }
}

#[async_trait]
impl AiCollaborator for ScriptedCollaborator {
    async fn grade(&self, request: &GradeRequest) -> Result<Value, CollaboratorError> {
        self.grade_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.grade_requests).push(request.clone());
        if let Some(delay) = self.script.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(marker) = self.script.failing_marker.as_deref() {
            if request.essay.contains(marker) {
                return Err(CollaboratorError::Status {
                    status: 500,
                    body: "scripted failure".to_string(),
                });
            }
        }
        Ok(self.script.grade_response.clone().unwrap_or_else(|| self.default_grade(request)))
    }

    async fn parse_rubric(&self, _raw_text: &str) -> Result<Value, CollaboratorError> {
        self.rubric_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.rubric_response.clone().unwrap_or_else(|| json!({"criteria": []})))
    }

    async fn check_similarity(
        &self,
        _essay: &str,
        _prior_essays: &[String],
    ) -> Result<Value, CollaboratorError> {
        self.similarity_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.similarity_response.clone().unwrap_or_else(|| {
            json!({"similarityPercentage": 12.5, "explanation": "Some overlap in structure."})
        }))
    }
}

// In-memory stores

#[derive(Debug, Default)]
pub(crate) struct MemoryExamStore {
    exams: StdMutex<Vec<Exam>>,
}

impl MemoryExamStore {
    pub(crate) fn get_sync(&self, id: &str) -> Option<Exam> {
        lock(&self.exams).iter().find(|exam| exam.id == id).cloned()
    }
}

#[async_trait]
impl ExamStore for MemoryExamStore {
    async fn create(&self, exam: Exam) -> StoreResult<Exam> {
        lock(&self.exams).push(exam.clone());
        Ok(exam)
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Exam>> {
        Ok(self.get_sync(id))
    }

    async fn list(&self) -> StoreResult<Vec<Exam>> {
        let mut exams = lock(&self.exams).clone();
        exams.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(exams)
    }
}

#[derive(Debug)]
pub(crate) struct MemoryAttemptStore {
    attempts: StdMutex<Vec<ExamAttempt>>,
    exams: Arc<MemoryExamStore>,
    failing_updates: AtomicU32,
}

impl MemoryAttemptStore {
    pub(crate) fn new(exams: Arc<MemoryExamStore>) -> Self {
        Self { attempts: StdMutex::new(Vec::new()), exams, failing_updates: AtomicU32::new(0) }
    }

    /// The next `count` updates fail with `StoreError::Unavailable`.
    pub(crate) fn fail_next_updates(&self, count: u32) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    pub(crate) fn get_sync(&self, id: &str) -> Option<ExamAttempt> {
        lock(&self.attempts).iter().find(|attempt| attempt.id == id).cloned()
    }

    pub(crate) fn list_by_exam_sync(&self, exam_id: &str) -> Vec<ExamAttempt> {
        lock(&self.attempts).iter().filter(|attempt| attempt.exam_id == exam_id).cloned().collect()
    }

    fn take_failure(&self) -> bool {
        self.failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn create(&self, attempt: NewAttempt) -> StoreResult<ExamAttempt> {
        let mut attempts = lock(&self.attempts);
        if let Some(open) = attempts.iter().find(|existing| {
            existing.is_open()
                && existing.exam_id == attempt.exam_id
                && existing.student_id == attempt.student_id
        }) {
            return Ok(open.clone());
        }

        let created = ExamAttempt {
            id: attempt.id,
            exam_id: attempt.exam_id,
            student_id: attempt.student_id,
            started_at: attempt.started_at,
            submitted_at: None,
            fullscreen_exits: Vec::new(),
            visibility_state_changes: Json(Vec::new()),
            submission_ids: Vec::new(),
            finish_mode: None,
            finishing_until: None,
        };
        attempts.push(created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<ExamAttempt>> {
        Ok(self.get_sync(id))
    }

    async fn find_open(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> StoreResult<Option<ExamAttempt>> {
        Ok(lock(&self.attempts)
            .iter()
            .find(|attempt| {
                attempt.is_open() && attempt.exam_id == exam_id && attempt.student_id == student_id
            })
            .cloned())
    }

    async fn update(&self, id: &str, update: AttemptUpdate) -> StoreResult<Option<ExamAttempt>> {
        if self.take_failure() {
            return Err(StoreError::Unavailable("scripted store failure".to_string()));
        }

        let mut attempts = lock(&self.attempts);
        let Some(attempt) = attempts.iter_mut().find(|attempt| attempt.id == id && attempt.is_open())
        else {
            return Ok(None);
        };

        match update {
            AttemptUpdate::AppendFullscreenExit(at) => {
                let at = attempt.fullscreen_exits.last().map_or(at, |last| at.max(*last));
                attempt.fullscreen_exits.push(at);
            }
            AttemptUpdate::AppendVisibilityChange(change) => {
                attempt.visibility_state_changes.0.push(change);
            }
            AttemptUpdate::Close { submitted_at, submission_ids, mode } => {
                attempt.submitted_at = Some(submitted_at);
                attempt.submission_ids = submission_ids;
                attempt.finish_mode = Some(mode);
                attempt.finishing_until = None;
            }
        }
        Ok(Some(attempt.clone()))
    }

    async fn claim_finish(
        &self,
        id: &str,
        now: PrimitiveDateTime,
        lease_until: PrimitiveDateTime,
    ) -> StoreResult<Option<ExamAttempt>> {
        let mut attempts = lock(&self.attempts);
        let Some(attempt) = attempts
            .iter_mut()
            .find(|attempt| attempt.id == id && attempt.is_open() && !attempt.is_finish_claimed(now))
        else {
            return Ok(None);
        };
        attempt.finishing_until = Some(lease_until);
        Ok(Some(attempt.clone()))
    }

    async fn release_finish(&self, id: &str) -> StoreResult<()> {
        if let Some(attempt) =
            lock(&self.attempts).iter_mut().find(|attempt| attempt.id == id && attempt.is_open())
        {
            attempt.finishing_until = None;
        }
        Ok(())
    }

    async fn list_by_exam(&self, exam_id: &str) -> StoreResult<Vec<ExamAttempt>> {
        Ok(self.list_by_exam_sync(exam_id))
    }

    async fn list_open_ended_before(
        &self,
        now: PrimitiveDateTime,
    ) -> StoreResult<Vec<ExamAttempt>> {
        let attempts = lock(&self.attempts).clone();
        Ok(attempts
            .into_iter()
            .filter(|attempt| attempt.is_open() && !attempt.is_finish_claimed(now))
            .filter(|attempt| {
                self.exams.get_sync(&attempt.exam_id).is_some_and(|exam| exam.end_time <= now)
            })
            .collect())
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemorySubmissionStore {
    submissions: StdMutex<Vec<Submission>>,
}

impl MemorySubmissionStore {
    /// Insertion order.
    pub(crate) fn all_sync(&self) -> Vec<Submission> {
        lock(&self.submissions).clone()
    }
}

#[async_trait]
impl SubmissionStore for MemorySubmissionStore {
    async fn create(&self, submission: Submission) -> StoreResult<Submission> {
        let mut submissions = lock(&self.submissions);
        if submission.attempt_id.is_some() {
            if let Some(existing) = submissions.iter().find(|stored| {
                stored.attempt_id == submission.attempt_id && stored.problem_id == submission.problem_id
            }) {
                return Ok(existing.clone());
            }
        }
        submissions.push(submission.clone());
        Ok(submission)
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Submission>> {
        Ok(lock(&self.submissions).iter().find(|submission| submission.id == id).cloned())
    }

    async fn list_by_problem(&self, problem_id: &str) -> StoreResult<Vec<Submission>> {
        Ok(lock(&self.submissions)
            .iter()
            .filter(|submission| submission.problem_id == problem_id)
            .cloned()
            .collect())
    }

    async fn list_by_attempt(&self, attempt_id: &str) -> StoreResult<Vec<Submission>> {
        Ok(lock(&self.submissions)
            .iter()
            .filter(|submission| submission.attempt_id.as_deref() == Some(attempt_id))
            .cloned()
            .collect())
    }

    async fn list_for_student_problem(
        &self,
        student_id: &str,
        problem_id: &str,
    ) -> StoreResult<Vec<Submission>> {
        let mut matching: Vec<(usize, Submission)> = lock(&self.submissions)
            .iter()
            .enumerate()
            .filter(|(_, submission)| {
                submission.submitter_id == student_id && submission.problem_id == problem_id
            })
            .map(|(seq, submission)| (seq, submission.clone()))
            .collect();
        matching.sort_by(|(seq_a, a), (seq_b, b)| {
            b.submitted_at.cmp(&a.submitted_at).then(seq_b.cmp(seq_a))
        });
        Ok(matching.into_iter().map(|(_, submission)| submission).collect())
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemoryProblemStore {
    problems: StdMutex<Vec<Problem>>,
}

#[async_trait]
impl ProblemStore for MemoryProblemStore {
    async fn create(&self, problem: Problem) -> StoreResult<Problem> {
        lock(&self.problems).push(problem.clone());
        Ok(problem)
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Problem>> {
        Ok(lock(&self.problems).iter().find(|problem| problem.id == id).cloned())
    }

    async fn list_by_exam(&self, exam_id: &str) -> StoreResult<Vec<Problem>> {
        Ok(lock(&self.problems)
            .iter()
            .filter(|problem| problem.exam_id.as_deref() == Some(exam_id))
            .cloned()
            .collect())
    }

    async fn list_standalone(&self) -> StoreResult<Vec<Problem>> {
        Ok(lock(&self.problems).iter().filter(|problem| problem.exam_id.is_none()).cloned().collect())
    }

    async fn pin_rubric_items(
        &self,
        id: &str,
        items: Vec<RubricItem>,
        updated_at: PrimitiveDateTime,
    ) -> StoreResult<Option<Problem>> {
        let mut problems = lock(&self.problems);
        let Some(problem) = problems.iter_mut().find(|problem| problem.id == id) else {
            return Ok(None);
        };
        if problem.rubric_items.0.is_empty() {
            problem.rubric_items = Json(items);
            problem.updated_at = updated_at;
        }
        Ok(Some(problem.clone()))
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemoryUserStore {
    users: StdMutex<HashMap<String, User>>,
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create(&self, user: User) -> StoreResult<User> {
        lock(&self.users).insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<User>> {
        Ok(lock(&self.users).get(id).cloned())
    }

    async fn update_role(
        &self,
        id: &str,
        role: UserRole,
        updated_at: PrimitiveDateTime,
    ) -> StoreResult<Option<User>> {
        let mut users = lock(&self.users);
        let Some(user) = users.get_mut(id) else {
            return Ok(None);
        };
        user.role = role;
        user.updated_at = updated_at;
        Ok(Some(user.clone()))
    }
}

/// Memory stores plus typed handles for test-side inspection.
pub(crate) struct MemoryBackends {
    pub(crate) stores: Stores,
    pub(crate) attempt_store: Arc<MemoryAttemptStore>,
    pub(crate) submission_store: Arc<MemorySubmissionStore>,
    pub(crate) exam_store: Arc<MemoryExamStore>,
}

impl MemoryBackends {
    pub(crate) fn new() -> Self {
        let exam_store = Arc::new(MemoryExamStore::default());
        let attempt_store = Arc::new(MemoryAttemptStore::new(exam_store.clone()));
        let submission_store = Arc::new(MemorySubmissionStore::default());
        let stores = Stores::from_parts(
            attempt_store.clone(),
            submission_store.clone(),
            exam_store.clone(),
            Arc::new(MemoryProblemStore::default()),
            Arc::new(MemoryUserStore::default()),
        );
        Self { stores, attempt_store, submission_store, exam_store }
    }
}

// Service harness

pub(crate) struct Harness {
    pub(crate) stores: Stores,
    pub(crate) attempt_store: Arc<MemoryAttemptStore>,
    pub(crate) submission_store: Arc<MemorySubmissionStore>,
    pub(crate) answers: Arc<MemoryAnswerCache>,
    pub(crate) ai: ScriptedCollaborator,
    pub(crate) clock: Arc<FixedClock>,
    pub(crate) grading: GradingOrchestrator,
    pub(crate) attempts: AttemptService,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_ai(ScriptedCollaborator::default())
    }

    pub(crate) fn with_ai(ai: ScriptedCollaborator) -> Self {
        let backends = MemoryBackends::new();
        let answers = Arc::new(MemoryAnswerCache::default());
        let clock = Arc::new(FixedClock::new(NOW));
        let grading = GradingOrchestrator::new(Arc::new(ai.clone()), &grading_settings());
        let attempts = AttemptService::new(
            backends.stores.clone(),
            answers.clone(),
            grading.clone(),
            clock.clone(),
            PROCTORING_RETRIES,
            FINISH_LEASE,
        );

        Self {
            stores: backends.stores,
            attempt_store: backends.attempt_store,
            submission_store: backends.submission_store,
            answers,
            ai,
            clock,
            grading,
            attempts,
        }
    }

    /// A second service over the same stores with its own in-process state.
    pub(crate) fn fresh_attempt_service(&self) -> AttemptService {
        AttemptService::new(
            self.stores.clone(),
            self.answers.clone(),
            self.grading.clone(),
            self.clock.clone(),
            PROCTORING_RETRIES,
            FINISH_LEASE,
        )
    }

    pub(crate) fn clock_now(&self) -> PrimitiveDateTime {
        self.clock.now()
    }

    pub(crate) async fn student(&self, id: &str) -> ActingUser {
        let user = self.stores.users.create(user(id, UserRole::Student)).await.expect("user");
        ActingUser::new(user)
    }

    async fn insert_exam(
        &self,
        start_time: PrimitiveDateTime,
        end_time: PrimitiveDateTime,
        password: Option<&str>,
    ) -> Exam {
        let mut exam = exam(&Uuid::new_v4().to_string(), "t-1", start_time, end_time);
        exam.password = password.map(str::to_string);
        self.stores.exams.create(exam).await.expect("exam")
    }

    async fn insert_essay_problems(&self, exam: &Exam, count: usize) -> Vec<Problem> {
        let mut problems = Vec::with_capacity(count);
        for _ in 0..count {
            let problem = essay_problem(&Uuid::new_v4().to_string(), Some(&exam.id));
            problems.push(self.stores.problems.create(problem).await.expect("problem"));
        }
        problems
    }

    pub(crate) async fn ongoing_exam(&self, problems: usize) -> (Exam, Vec<Problem>) {
        let now = self.clock_now();
        let exam = self
            .insert_exam(now - time::Duration::hours(1), now + time::Duration::hours(1), None)
            .await;
        let problems = self.insert_essay_problems(&exam, problems).await;
        (exam, problems)
    }

    pub(crate) async fn ongoing_exam_with_password(&self, password: &str) -> Exam {
        let now = self.clock_now();
        let exam = self
            .insert_exam(
                now - time::Duration::hours(1),
                now + time::Duration::hours(1),
                Some(password),
            )
            .await;
        self.insert_essay_problems(&exam, 1).await;
        exam
    }

    pub(crate) async fn upcoming_exam(&self) -> Exam {
        let now = self.clock_now();
        self.insert_exam(now + time::Duration::hours(1), now + time::Duration::hours(3), None)
            .await
    }

    pub(crate) async fn ongoing_reading_exam(&self, correct: &[u32]) -> (Exam, Problem) {
        let now = self.clock_now();
        let exam = self
            .insert_exam(now - time::Duration::hours(1), now + time::Duration::hours(1), None)
            .await;
        let problem = reading_problem(&Uuid::new_v4().to_string(), Some(&exam.id), correct);
        let problem = self.stores.problems.create(problem).await.expect("problem");
        (exam, problem)
    }

    pub(crate) async fn exam_ending_in(&self, remaining: Duration) -> (Exam, Vec<Problem>) {
        let now = self.clock_now();
        let exam = self.insert_exam(now - time::Duration::hours(1), now + remaining, None).await;
        let problems = self.insert_essay_problems(&exam, 1).await;
        (exam, problems)
    }

    pub(crate) async fn standalone_problem(&self) -> Problem {
        let problem = essay_problem(&Uuid::new_v4().to_string(), None);
        self.stores.problems.create(problem).await.expect("problem")
    }
}

// HTTP harness

pub(crate) struct TestContext {
    pub(crate) state: AppState,
    pub(crate) app: Router,
    pub(crate) ai: ScriptedCollaborator,
    pub(crate) clock: Arc<FixedClock>,
    pub(crate) backends: MemoryBackends,
    _guard: OwnedMutexGuard<()>,
}

pub(crate) async fn setup_test_context() -> TestContext {
    setup_test_context_with_ai(ScriptedCollaborator::default()).await
}

pub(crate) async fn setup_test_context_with_ai(ai: ScriptedCollaborator) -> TestContext {
    let guard = env_lock().await;
    set_test_env();

    let settings = Settings::load().expect("settings");
    let backends = MemoryBackends::new();
    let clock = Arc::new(FixedClock::new(NOW));
    // Never connected; health reports it as down.
    let redis = RedisHandle::new(settings.redis().redis_url());

    let state = AppState::new(
        settings,
        backends.stores.clone(),
        redis,
        Arc::new(MemoryAnswerCache::default()),
        Arc::new(ai.clone()),
        clock.clone(),
    );
    let app = api::router::router(state.clone());

    TestContext { state, app, ai, clock, backends, _guard: guard }
}

impl TestContext {
    pub(crate) async fn insert_user(&self, id: &str, role: UserRole) -> (User, String) {
        let user = self.state.stores().users.create(user(id, role)).await.expect("user");
        let token = bearer_token(&user.id, self.state.settings());
        (user, token)
    }

    pub(crate) async fn insert_exam(&self, owner: &str, password: Option<&str>) -> Exam {
        let now = self.clock.now();
        let mut exam = exam(
            &Uuid::new_v4().to_string(),
            owner,
            now - time::Duration::hours(1),
            now + time::Duration::hours(1),
        );
        exam.password = password.map(str::to_string);
        self.state.stores().exams.create(exam).await.expect("exam")
    }

    pub(crate) async fn insert_problem(&self, problem: Problem) -> Problem {
        self.state.stores().problems.create(problem).await.expect("problem")
    }
}

pub(crate) fn bearer_token(user_id: &str, settings: &Settings) -> String {
    security::create_access_token(user_id, settings, None).expect("token")
}

pub(crate) fn json_request(
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    if let Some(body) = body {
        let bytes = serde_json::to_vec(&body).expect("serialize body");
        builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .expect("request body")
    } else {
        builder.body(Body::empty()).expect("request body")
    }
}

pub(crate) async fn read_json(response: axum::response::Response<Body>) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body");
    serde_json::from_slice(&body).unwrap_or_else(|err| {
        let body_text = String::from_utf8_lossy(&body);
        panic!("json parse: {err}; body: {body_text}");
    })
}

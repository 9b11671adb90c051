//! Persistence boundary for the core services.
//!
//! Every store is a trait so the attempt state machine and the grading
//! pipeline never depend on a concrete database. The Postgres implementations
//! live next to the traits; in-memory doubles live in `test_support`.

pub(crate) mod attempts;
pub(crate) mod exams;
pub(crate) mod health;
pub(crate) mod problems;
pub(crate) mod submissions;
pub(crate) mod users;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::db::models::{
    Exam, ExamAttempt, Problem, RubricItem, Submission, User, VisibilityChange,
};
use crate::db::types::{FinishMode, UserRole};

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub(crate) type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub(crate) struct NewAttempt {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) student_id: String,
    pub(crate) started_at: PrimitiveDateTime,
}

/// Field-level changes to an open attempt.
///
/// Each variant touches only its own columns, so a proctoring append racing a
/// close never overwrites the other write. Stores apply an update only while
/// `submitted_at` is unset.
#[derive(Debug, Clone)]
pub(crate) enum AttemptUpdate {
    /// Appended timestamps never go backwards: the stored value is clamped to
    /// the last recorded exit.
    AppendFullscreenExit(PrimitiveDateTime),
    AppendVisibilityChange(VisibilityChange),
    Close { submitted_at: PrimitiveDateTime, submission_ids: Vec<String>, mode: FinishMode },
}

#[async_trait]
pub(crate) trait AttemptStore: Send + Sync {
    /// Inserts the attempt unless an open one already exists for the same
    /// exam and student, in which case the existing open attempt is returned.
    async fn create(&self, attempt: NewAttempt) -> StoreResult<ExamAttempt>;
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<ExamAttempt>>;
    async fn find_open(&self, exam_id: &str, student_id: &str)
        -> StoreResult<Option<ExamAttempt>>;
    /// Returns `None` when no open attempt with this id exists.
    async fn update(&self, id: &str, update: AttemptUpdate) -> StoreResult<Option<ExamAttempt>>;
    /// Takes the finish of an open attempt until `lease_until`. Returns `None`
    /// when the attempt is closed or another claim is still live at `now`.
    async fn claim_finish(
        &self,
        id: &str,
        now: PrimitiveDateTime,
        lease_until: PrimitiveDateTime,
    ) -> StoreResult<Option<ExamAttempt>>;
    async fn release_finish(&self, id: &str) -> StoreResult<()>;
    async fn list_by_exam(&self, exam_id: &str) -> StoreResult<Vec<ExamAttempt>>;
    /// Open, unclaimed attempts whose exam window closed at or before `now`.
    async fn list_open_ended_before(&self, now: PrimitiveDateTime)
        -> StoreResult<Vec<ExamAttempt>>;
}

#[async_trait]
pub(crate) trait SubmissionStore: Send + Sync {
    /// An attempt holds at most one submission per problem: when one already
    /// exists it is returned and `submission` is discarded.
    async fn create(&self, submission: Submission) -> StoreResult<Submission>;
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Submission>>;
    /// Oldest first.
    async fn list_by_problem(&self, problem_id: &str) -> StoreResult<Vec<Submission>>;
    async fn list_by_attempt(&self, attempt_id: &str) -> StoreResult<Vec<Submission>>;
    /// Most recent first.
    async fn list_for_student_problem(
        &self,
        student_id: &str,
        problem_id: &str,
    ) -> StoreResult<Vec<Submission>>;
}

#[async_trait]
pub(crate) trait ExamStore: Send + Sync {
    async fn create(&self, exam: Exam) -> StoreResult<Exam>;
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Exam>>;
    async fn list(&self) -> StoreResult<Vec<Exam>>;
}

#[async_trait]
pub(crate) trait ProblemStore: Send + Sync {
    async fn create(&self, problem: Problem) -> StoreResult<Problem>;
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Problem>>;
    async fn list_by_exam(&self, exam_id: &str) -> StoreResult<Vec<Problem>>;
    async fn list_standalone(&self) -> StoreResult<Vec<Problem>>;
    /// Stores `items` only while the problem has no criteria, and returns the
    /// problem as stored either way.
    async fn pin_rubric_items(
        &self,
        id: &str,
        items: Vec<RubricItem>,
        updated_at: PrimitiveDateTime,
    ) -> StoreResult<Option<Problem>>;
}

#[async_trait]
pub(crate) trait UserStore: Send + Sync {
    async fn create(&self, user: User) -> StoreResult<User>;
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<User>>;
    async fn update_role(
        &self,
        id: &str,
        role: UserRole,
        updated_at: PrimitiveDateTime,
    ) -> StoreResult<Option<User>>;
}

#[derive(Clone)]
pub(crate) struct Stores {
    pub(crate) attempts: Arc<dyn AttemptStore>,
    pub(crate) submissions: Arc<dyn SubmissionStore>,
    pub(crate) exams: Arc<dyn ExamStore>,
    pub(crate) problems: Arc<dyn ProblemStore>,
    pub(crate) users: Arc<dyn UserStore>,
    pool: Option<PgPool>,
}

impl Stores {
    pub(crate) fn postgres(pool: PgPool) -> Self {
        Self {
            attempts: Arc::new(attempts::PgAttemptStore::new(pool.clone())),
            submissions: Arc::new(submissions::PgSubmissionStore::new(pool.clone())),
            exams: Arc::new(exams::PgExamStore::new(pool.clone())),
            problems: Arc::new(problems::PgProblemStore::new(pool.clone())),
            users: Arc::new(users::PgUserStore::new(pool.clone())),
            pool: Some(pool),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        attempts: Arc<dyn AttemptStore>,
        submissions: Arc<dyn SubmissionStore>,
        exams: Arc<dyn ExamStore>,
        problems: Arc<dyn ProblemStore>,
        users: Arc<dyn UserStore>,
    ) -> Self {
        Self { attempts, submissions, exams, problems, users, pool: None }
    }

    pub(crate) fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }
}

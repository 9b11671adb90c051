use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::models::Submission;
use crate::repositories::{StoreError, StoreResult, SubmissionStore};

pub(crate) const COLUMNS: &str = "\
    id, problem_id, submitter_id, exam_id, attempt_id, essay, answers, essay_hash, \
    feedback, similarity_check, submitted_at";

#[derive(Clone)]
pub(crate) struct PgSubmissionStore {
    pool: PgPool,
}

impl PgSubmissionStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubmissionStore for PgSubmissionStore {
    async fn create(&self, submission: Submission) -> StoreResult<Submission> {
        let inserted = sqlx::query_as::<_, Submission>(&format!(
            "INSERT INTO submissions ( \
                 id, problem_id, submitter_id, exam_id, attempt_id, essay, answers, \
                 essay_hash, feedback, similarity_check, submitted_at \
             ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11) \
             ON CONFLICT (attempt_id, problem_id) WHERE attempt_id IS NOT NULL DO NOTHING \
             RETURNING {COLUMNS}"
        ))
        .bind(&submission.id)
        .bind(&submission.problem_id)
        .bind(&submission.submitter_id)
        .bind(&submission.exam_id)
        .bind(&submission.attempt_id)
        .bind(&submission.essay)
        .bind(&submission.answers)
        .bind(&submission.essay_hash)
        .bind(&submission.feedback)
        .bind(&submission.similarity_check)
        .bind(submission.submitted_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(created) = inserted {
            return Ok(created);
        }

        // Another finish already stored this attempt's answer to the problem.
        let existing = sqlx::query_as::<_, Submission>(&format!(
            "SELECT {COLUMNS} FROM submissions WHERE attempt_id = $1 AND problem_id = $2"
        ))
        .bind(&submission.attempt_id)
        .bind(&submission.problem_id)
        .fetch_optional(&self.pool)
        .await?;
        existing.ok_or_else(|| {
            StoreError::Unavailable(format!(
                "submission for problem {} disappeared during create",
                submission.problem_id
            ))
        })
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Submission>> {
        let submission = sqlx::query_as::<_, Submission>(&format!(
            "SELECT {COLUMNS} FROM submissions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(submission)
    }

    async fn list_by_problem(&self, problem_id: &str) -> StoreResult<Vec<Submission>> {
        let submissions = sqlx::query_as::<_, Submission>(&format!(
            "SELECT {COLUMNS} FROM submissions WHERE problem_id = $1 ORDER BY seq ASC"
        ))
        .bind(problem_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(submissions)
    }

    async fn list_by_attempt(&self, attempt_id: &str) -> StoreResult<Vec<Submission>> {
        let submissions = sqlx::query_as::<_, Submission>(&format!(
            "SELECT {COLUMNS} FROM submissions WHERE attempt_id = $1 ORDER BY seq ASC"
        ))
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(submissions)
    }

    async fn list_for_student_problem(
        &self,
        student_id: &str,
        problem_id: &str,
    ) -> StoreResult<Vec<Submission>> {
        let submissions = sqlx::query_as::<_, Submission>(&format!(
            "SELECT {COLUMNS} FROM submissions \
             WHERE submitter_id = $1 AND problem_id = $2 \
             ORDER BY submitted_at DESC, seq DESC"
        ))
        .bind(student_id)
        .bind(problem_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(submissions)
    }
}

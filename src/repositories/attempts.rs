use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::ExamAttempt;
use crate::repositories::{AttemptStore, AttemptUpdate, NewAttempt, StoreError, StoreResult};

pub(crate) const COLUMNS: &str = "\
    id, exam_id, student_id, started_at, submitted_at, fullscreen_exits, \
    visibility_state_changes, submission_ids, finish_mode, finishing_until";

const QUALIFIED_COLUMNS: &str = "\
    a.id, a.exam_id, a.student_id, a.started_at, a.submitted_at, a.fullscreen_exits, \
    a.visibility_state_changes, a.submission_ids, a.finish_mode, a.finishing_until";

#[derive(Clone)]
pub(crate) struct PgAttemptStore {
    pool: PgPool,
}

impl PgAttemptStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AttemptStore for PgAttemptStore {
    async fn create(&self, attempt: NewAttempt) -> StoreResult<ExamAttempt> {
        let inserted = sqlx::query_as::<_, ExamAttempt>(&format!(
            "INSERT INTO exam_attempts (id, exam_id, student_id, started_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT DO NOTHING \
             RETURNING {COLUMNS}"
        ))
        .bind(&attempt.id)
        .bind(&attempt.exam_id)
        .bind(&attempt.student_id)
        .bind(attempt.started_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(created) = inserted {
            return Ok(created);
        }

        // The partial unique index rejected the insert: another open attempt won.
        self.find_open(&attempt.exam_id, &attempt.student_id).await?.ok_or_else(|| {
            StoreError::Unavailable(format!(
                "open attempt for exam {} disappeared during create",
                attempt.exam_id
            ))
        })
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<ExamAttempt>> {
        let attempt = sqlx::query_as::<_, ExamAttempt>(&format!(
            "SELECT {COLUMNS} FROM exam_attempts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempt)
    }

    async fn find_open(
        &self,
        exam_id: &str,
        student_id: &str,
    ) -> StoreResult<Option<ExamAttempt>> {
        let attempt = sqlx::query_as::<_, ExamAttempt>(&format!(
            "SELECT {COLUMNS} FROM exam_attempts \
             WHERE exam_id = $1 AND student_id = $2 AND submitted_at IS NULL"
        ))
        .bind(exam_id)
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempt)
    }

    async fn update(&self, id: &str, update: AttemptUpdate) -> StoreResult<Option<ExamAttempt>> {
        let updated = match update {
            AttemptUpdate::AppendFullscreenExit(at) => {
                sqlx::query_as::<_, ExamAttempt>(&format!(
                    "UPDATE exam_attempts SET fullscreen_exits = array_append( \
                         fullscreen_exits, \
                         GREATEST($1, COALESCE(fullscreen_exits[array_upper(fullscreen_exits, 1)], $1)) \
                     ) \
                     WHERE id = $2 AND submitted_at IS NULL \
                     RETURNING {COLUMNS}"
                ))
                .bind(at)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            AttemptUpdate::AppendVisibilityChange(change) => {
                sqlx::query_as::<_, ExamAttempt>(&format!(
                    "UPDATE exam_attempts \
                     SET visibility_state_changes = visibility_state_changes || $1 \
                     WHERE id = $2 AND submitted_at IS NULL \
                     RETURNING {COLUMNS}"
                ))
                .bind(Json(vec![change]))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            AttemptUpdate::Close { submitted_at, submission_ids, mode } => {
                sqlx::query_as::<_, ExamAttempt>(&format!(
                    "UPDATE exam_attempts \
                     SET submitted_at = $1, submission_ids = $2, finish_mode = $3, \
                         finishing_until = NULL \
                     WHERE id = $4 AND submitted_at IS NULL \
                     RETURNING {COLUMNS}"
                ))
                .bind(submitted_at)
                .bind(submission_ids)
                .bind(mode)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(updated)
    }

    async fn claim_finish(
        &self,
        id: &str,
        now: PrimitiveDateTime,
        lease_until: PrimitiveDateTime,
    ) -> StoreResult<Option<ExamAttempt>> {
        let claimed = sqlx::query_as::<_, ExamAttempt>(&format!(
            "UPDATE exam_attempts SET finishing_until = $1 \
             WHERE id = $2 AND submitted_at IS NULL \
               AND (finishing_until IS NULL OR finishing_until <= $3) \
             RETURNING {COLUMNS}"
        ))
        .bind(lease_until)
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed)
    }

    async fn release_finish(&self, id: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE exam_attempts SET finishing_until = NULL \
             WHERE id = $1 AND submitted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_exam(&self, exam_id: &str) -> StoreResult<Vec<ExamAttempt>> {
        let attempts = sqlx::query_as::<_, ExamAttempt>(&format!(
            "SELECT {COLUMNS} FROM exam_attempts WHERE exam_id = $1 ORDER BY started_at ASC"
        ))
        .bind(exam_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    async fn list_open_ended_before(
        &self,
        now: PrimitiveDateTime,
    ) -> StoreResult<Vec<ExamAttempt>> {
        let attempts = sqlx::query_as::<_, ExamAttempt>(&format!(
            "SELECT {QUALIFIED_COLUMNS} FROM exam_attempts a \
             JOIN exams e ON e.id = a.exam_id \
             WHERE a.submitted_at IS NULL AND e.end_time <= $1 \
               AND (a.finishing_until IS NULL OR a.finishing_until <= $1) \
             ORDER BY e.end_time ASC, a.started_at ASC"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }
}

use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::models::Exam;
use crate::repositories::{ExamStore, StoreResult};

pub(crate) const COLUMNS: &str = "\
    id, title, description, start_time, end_time, password, created_by, created_at, updated_at";

#[derive(Clone)]
pub(crate) struct PgExamStore {
    pool: PgPool,
}

impl PgExamStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExamStore for PgExamStore {
    async fn create(&self, exam: Exam) -> StoreResult<Exam> {
        let created = sqlx::query_as::<_, Exam>(&format!(
            "INSERT INTO exams ( \
                 id, title, description, start_time, end_time, password, \
                 created_by, created_at, updated_at \
             ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) \
             RETURNING {COLUMNS}"
        ))
        .bind(&exam.id)
        .bind(&exam.title)
        .bind(&exam.description)
        .bind(exam.start_time)
        .bind(exam.end_time)
        .bind(&exam.password)
        .bind(&exam.created_by)
        .bind(exam.created_at)
        .bind(exam.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Exam>> {
        let exam = sqlx::query_as::<_, Exam>(&format!("SELECT {COLUMNS} FROM exams WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(exam)
    }

    async fn list(&self) -> StoreResult<Vec<Exam>> {
        let exams = sqlx::query_as::<_, Exam>(&format!(
            "SELECT {COLUMNS} FROM exams ORDER BY start_time DESC, created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(exams)
    }
}

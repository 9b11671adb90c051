use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::{Problem, RubricItem};
use crate::repositories::{ProblemStore, StoreResult};

pub(crate) const COLUMNS: &str = "\
    id, title, kind, prompt, passage, questions, rubric_items, raw_rubric, \
    custom_max_score, is_rubric_hidden, exam_id, created_by, created_at, updated_at";

#[derive(Clone)]
pub(crate) struct PgProblemStore {
    pool: PgPool,
}

impl PgProblemStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProblemStore for PgProblemStore {
    async fn create(&self, problem: Problem) -> StoreResult<Problem> {
        let created = sqlx::query_as::<_, Problem>(&format!(
            "INSERT INTO problems ( \
                 id, title, kind, prompt, passage, questions, rubric_items, raw_rubric, \
                 custom_max_score, is_rubric_hidden, exam_id, created_by, created_at, updated_at \
             ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14) \
             RETURNING {COLUMNS}"
        ))
        .bind(&problem.id)
        .bind(&problem.title)
        .bind(problem.kind)
        .bind(&problem.prompt)
        .bind(&problem.passage)
        .bind(&problem.questions)
        .bind(&problem.rubric_items)
        .bind(&problem.raw_rubric)
        .bind(problem.custom_max_score)
        .bind(problem.is_rubric_hidden)
        .bind(&problem.exam_id)
        .bind(&problem.created_by)
        .bind(problem.created_at)
        .bind(problem.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Problem>> {
        let problem =
            sqlx::query_as::<_, Problem>(&format!("SELECT {COLUMNS} FROM problems WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(problem)
    }

    async fn list_by_exam(&self, exam_id: &str) -> StoreResult<Vec<Problem>> {
        let problems = sqlx::query_as::<_, Problem>(&format!(
            "SELECT {COLUMNS} FROM problems WHERE exam_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(exam_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(problems)
    }

    async fn list_standalone(&self) -> StoreResult<Vec<Problem>> {
        let problems = sqlx::query_as::<_, Problem>(&format!(
            "SELECT {COLUMNS} FROM problems WHERE exam_id IS NULL ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(problems)
    }

    async fn pin_rubric_items(
        &self,
        id: &str,
        items: Vec<RubricItem>,
        updated_at: PrimitiveDateTime,
    ) -> StoreResult<Option<Problem>> {
        let pinned = sqlx::query_as::<_, Problem>(&format!(
            "UPDATE problems SET rubric_items = $1, updated_at = $2 \
             WHERE id = $3 AND rubric_items = '[]'::jsonb \
             RETURNING {COLUMNS}"
        ))
        .bind(Json(items))
        .bind(updated_at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match pinned {
            Some(problem) => Ok(Some(problem)),
            None => self.find_by_id(id).await,
        }
    }
}

use async_trait::async_trait;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::User;
use crate::db::types::UserRole;
use crate::repositories::{StoreResult, UserStore};

const COLUMNS: &str = "id, username, full_name, role, is_active, created_at, updated_at";

#[derive(Clone)]
pub(crate) struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn create(&self, user: User) -> StoreResult<User> {
        let created = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (id, username, full_name, role, is_active, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7) \
             RETURNING {COLUMNS}"
        ))
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.full_name)
        .bind(user.role)
        .bind(user.is_active)
        .bind(user.created_at)
        .bind(user.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!("SELECT {COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn update_role(
        &self,
        id: &str,
        role: UserRole,
        updated_at: PrimitiveDateTime,
    ) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET role = $1, updated_at = $2 WHERE id = $3 RETURNING {COLUMNS}"
        ))
        .bind(role)
        .bind(updated_at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }
}

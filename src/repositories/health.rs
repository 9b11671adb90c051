use crate::repositories::{StoreResult, Stores};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DatabaseHealth {
    Healthy,
    /// The stores are not backed by Postgres.
    Detached,
}

pub(crate) async fn ping(stores: &Stores) -> StoreResult<DatabaseHealth> {
    let Some(pool) = stores.pool() else {
        return Ok(DatabaseHealth::Detached);
    };

    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(DatabaseHealth::Healthy)
}

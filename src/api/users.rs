use axum::{extract::Path, extract::State, routing::get, routing::patch, Json, Router};

use crate::api::errors::ApiError;
use crate::api::guards::{CurrentAdmin, CurrentUser};
use crate::core::state::AppState;
use crate::schemas::user::{MeResponse, RoleUpdate, UserResponse};

pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/me", get(me)).route("/:user_id/role", patch(update_role))
}

async fn me(CurrentUser(acting): CurrentUser) -> Json<MeResponse> {
    let impersonated_by = acting.impersonator_id().map(str::to_string);
    Json(MeResponse { user: UserResponse::from(acting.user().clone()), impersonated_by })
}

async fn update_role(
    CurrentAdmin(admin): CurrentAdmin,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(payload): Json<RoleUpdate>,
) -> Result<Json<UserResponse>, ApiError> {
    let updated = state
        .stores()
        .users
        .update_role(&user_id, payload.role, state.clock().now())
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    tracing::info!(
        admin_id = %admin.id(),
        user_id = %updated.id,
        role = ?updated.role,
        "User role changed"
    );
    Ok(Json(UserResponse::from(updated)))
}

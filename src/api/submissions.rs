use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use crate::api::errors::ApiError;
use crate::api::guards::CurrentUser;
use crate::core::state::AppState;
use crate::schemas::submission::SubmissionResponse;

pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/:submission_id", get(get_submission))
}

async fn get_submission(
    CurrentUser(acting): CurrentUser,
    State(state): State<AppState>,
    Path(submission_id): Path<String>,
) -> Result<Json<SubmissionResponse>, ApiError> {
    let submission = state
        .stores()
        .submissions
        .find_by_id(&submission_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Submission not found".to_string()))?;

    if !acting.can_view_submission_of(&submission.submitter_id) {
        return Err(ApiError::Forbidden("Not allowed to view this submission"));
    }

    Ok(Json(SubmissionResponse::from(submission)))
}

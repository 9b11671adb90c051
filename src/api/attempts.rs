use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};

use crate::api::errors::ApiError;
use crate::api::guards::CurrentUser;
use crate::core::state::AppState;
use crate::schemas::attempt::{
    AttemptDetailResponse, AttemptResponse, FinishRequest, FinishResponse, ProctoringResponse,
    VisibilityEvent,
};
use crate::schemas::exam::ExamResponse;
use crate::schemas::problem::ProblemResponse;
use crate::schemas::submission::{AnswerInput, SubmissionResponse};
use crate::services::attempts::{FinishOutcome, ProctoringOutcome};
use crate::services::exam_status;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/:attempt_id", get(get_attempt))
        .route("/:attempt_id/answers/:problem_id", put(save_answer))
        .route("/:attempt_id/proctoring/fullscreen-exit", post(fullscreen_exit))
        .route("/:attempt_id/proctoring/visibility", post(visibility))
        .route("/:attempt_id/finish", post(finish))
}

async fn get_attempt(
    CurrentUser(acting): CurrentUser,
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> Result<Json<AttemptDetailResponse>, ApiError> {
    let view = state.attempts().view(&acting, &attempt_id).await?;

    let status = exam_status::status(&view.exam, state.clock().now());
    let problem_count = view.problems.len();
    let is_staff = acting.is_staff();
    Ok(Json(AttemptDetailResponse {
        attempt: AttemptResponse::new(view.attempt, view.state),
        exam: ExamResponse::new(view.exam, status, problem_count),
        remaining_seconds: view.remaining.as_secs(),
        problems: view
            .problems
            .into_iter()
            .map(|problem| ProblemResponse::for_viewer(problem, is_staff))
            .collect(),
        answers: view.answers,
    }))
}

async fn save_answer(
    CurrentUser(acting): CurrentUser,
    State(state): State<AppState>,
    Path((attempt_id, problem_id)): Path<(String, String)>,
    Json(payload): Json<AnswerInput>,
) -> Result<StatusCode, ApiError> {
    let answer = payload.into_answer().ok_or_else(|| {
        ApiError::BadRequest("provide either essay text or choices".to_string())
    })?;

    state.attempts().answer(&acting, &attempt_id, &problem_id, answer).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn proctoring_response(outcome: ProctoringOutcome) -> ProctoringResponse {
    match outcome {
        ProctoringOutcome::Recorded(attempt) => ProctoringResponse {
            status: "recorded",
            fullscreen_exit_count: Some(attempt.fullscreen_exits.len()),
            hidden_count: Some(attempt.hidden_count()),
        },
        ProctoringOutcome::Ignored => {
            ProctoringResponse { status: "ignored", fullscreen_exit_count: None, hidden_count: None }
        }
        ProctoringOutcome::Dropped => {
            ProctoringResponse { status: "dropped", fullscreen_exit_count: None, hidden_count: None }
        }
    }
}

async fn fullscreen_exit(
    CurrentUser(acting): CurrentUser,
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> Result<Json<ProctoringResponse>, ApiError> {
    let outcome = state.attempts().record_fullscreen_exit(&acting, &attempt_id).await?;
    Ok(Json(proctoring_response(outcome)))
}

async fn visibility(
    CurrentUser(acting): CurrentUser,
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
    Json(payload): Json<VisibilityEvent>,
) -> Result<Json<ProctoringResponse>, ApiError> {
    let outcome = state.attempts().record_visibility(&acting, &attempt_id, payload.state).await?;
    Ok(Json(proctoring_response(outcome)))
}

async fn finish(
    CurrentUser(acting): CurrentUser,
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
    payload: Option<Json<FinishRequest>>,
) -> Result<Json<FinishResponse>, ApiError> {
    let Json(payload) = payload.unwrap_or_default();
    let outcome = state.attempts().finish(&acting, &attempt_id, payload.into_answers()).await?;

    let response = match outcome {
        FinishOutcome::Closed(report) => {
            let attempt_state = state.attempts().state_of(&report.attempt);
            FinishResponse {
                attempt: AttemptResponse::new(report.attempt, attempt_state),
                already_closed: false,
                submissions: report.submissions.into_iter().map(SubmissionResponse::from).collect(),
                failed_problem_ids: report.failed_problem_ids,
            }
        }
        FinishOutcome::AlreadyClosed(attempt) => {
            let attempt_state = state.attempts().state_of(&attempt);
            FinishResponse {
                attempt: AttemptResponse::new(attempt, attempt_state),
                already_closed: true,
                submissions: Vec::new(),
                failed_problem_ids: Vec::new(),
            }
        }
        FinishOutcome::InProgress => {
            return Err(ApiError::Conflict("Attempt is being submitted".to_string()));
        }
    };
    Ok(Json(response))
}

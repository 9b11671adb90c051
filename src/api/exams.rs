use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::{CurrentStaff, CurrentUser};
use crate::core::state::AppState;
use crate::core::time::to_primitive_utc;
use crate::db::models::Exam;
use crate::schemas::attempt::{AttemptResponse, StartAttemptResponse};
use crate::schemas::exam::{ExamCreate, ExamMonitorResponse, ExamResponse, ExamStart};
use crate::services::exam_status;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_exam).get(list_exams))
        .route("/:exam_id", get(get_exam))
        .route("/:exam_id/monitor", get(monitor_exam))
        .route("/:exam_id/start", post(start_exam))
}

async fn create_exam(
    CurrentStaff(teacher): CurrentStaff,
    State(state): State<AppState>,
    Json(payload): Json<ExamCreate>,
) -> Result<(StatusCode, Json<ExamResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if payload.end_time <= payload.start_time {
        return Err(ApiError::BadRequest("end_time must be after start_time".to_string()));
    }

    let now = state.clock().now();
    let exam = state
        .stores()
        .exams
        .create(Exam {
            id: Uuid::new_v4().to_string(),
            title: payload.title,
            description: payload.description,
            start_time: to_primitive_utc(payload.start_time),
            end_time: to_primitive_utc(payload.end_time),
            password: payload.password,
            created_by: teacher.id().to_string(),
            created_at: now,
            updated_at: now,
        })
        .await?;

    tracing::info!(exam_id = %exam.id, created_by = %exam.created_by, "Exam created");
    let status = exam_status::status(&exam, now);
    Ok((StatusCode::CREATED, Json(ExamResponse::new(exam, status, 0))))
}

async fn list_exams(
    CurrentUser(_acting): CurrentUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<ExamResponse>>, ApiError> {
    let now = state.clock().now();
    let exams = state.stores().exams.list().await?;

    let mut responses = Vec::with_capacity(exams.len());
    for exam in exams {
        let problem_count = exam_status::problem_count(state.stores(), &exam).await?;
        let status = exam_status::status(&exam, now);
        responses.push(ExamResponse::new(exam, status, problem_count));
    }
    Ok(Json(responses))
}

async fn get_exam(
    CurrentUser(_acting): CurrentUser,
    State(state): State<AppState>,
    Path(exam_id): Path<String>,
) -> Result<Json<ExamResponse>, ApiError> {
    let exam = load_exam(&state, &exam_id).await?;
    let problem_count = exam_status::problem_count(state.stores(), &exam).await?;
    let status = exam_status::status(&exam, state.clock().now());
    Ok(Json(ExamResponse::new(exam, status, problem_count)))
}

async fn monitor_exam(
    CurrentStaff(teacher): CurrentStaff,
    State(state): State<AppState>,
    Path(exam_id): Path<String>,
) -> Result<Json<ExamMonitorResponse>, ApiError> {
    let exam = load_exam(&state, &exam_id).await?;
    if !teacher.can_manage(&exam.created_by) {
        return Err(ApiError::Forbidden("Only the exam owner can monitor attempts"));
    }

    let attempts = state.attempts();
    let monitor = exam_status::monitor(state.stores(), &exam, state.clock().now(), |attempt| {
        attempts.state_of(attempt)
    })
    .await?;
    Ok(Json(ExamMonitorResponse::from(monitor)))
}

async fn start_exam(
    CurrentUser(acting): CurrentUser,
    State(state): State<AppState>,
    Path(exam_id): Path<String>,
    payload: Option<Json<ExamStart>>,
) -> Result<Json<StartAttemptResponse>, ApiError> {
    let Json(payload) = payload.unwrap_or_default();
    let started = state.attempts().start(&acting, &exam_id, payload.password.as_deref()).await?;

    let attempt_state = state.attempts().state_of(&started.attempt);
    Ok(Json(StartAttemptResponse {
        attempt: AttemptResponse::new(started.attempt, attempt_state),
        resumed: started.resumed,
        remaining_seconds: started.remaining.as_secs(),
    }))
}

pub(crate) async fn load_exam(state: &AppState, exam_id: &str) -> Result<Exam, ApiError> {
    state
        .stores()
        .exams
        .find_by_id(exam_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Exam not found".to_string()))
}

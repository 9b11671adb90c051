use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use sqlx::types::Json as SqlxJson;
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::exams::load_exam;
use crate::api::guards::{CurrentStaff, CurrentUser};
use crate::core::state::AppState;
use crate::db::models::{Problem, ReadingQuestion};
use crate::db::types::ProblemKind;
use crate::schemas::problem::{
    CriterionStatsResponse, LeaderboardEntryResponse, ProblemAnalyticsResponse, ProblemCreate,
    ProblemResponse, RubricPreviewRequest, RubricPreviewResponse,
};
use crate::schemas::submission::{
    scale_warning, AnswerInput, PracticeSubmissionResponse, SubmissionResponse,
};
use crate::services::{ledger, practice, rubric};

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    #[serde(default)]
    #[serde(alias = "studentId")]
    student_id: Option<String>,
}

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_problem).get(list_problems))
        .route("/rubric-preview", post(rubric_preview))
        .route("/:problem_id", get(get_problem))
        .route("/:problem_id/submissions", post(submit_practice))
        .route("/:problem_id/history", get(history))
        .route("/:problem_id/leaderboard", get(leaderboard))
        .route("/:problem_id/analytics", get(analytics))
}

fn reading_questions(payload: &ProblemCreate) -> Result<Vec<ReadingQuestion>, ApiError> {
    if payload.questions.is_empty() {
        return Err(ApiError::BadRequest(
            "reading comprehension problems need at least one question".to_string(),
        ));
    }

    payload
        .questions
        .iter()
        .map(|question| {
            if question.correct_option as usize >= question.options.len() {
                return Err(ApiError::BadRequest(format!(
                    "correct_option {} is out of range for '{}'",
                    question.correct_option, question.question
                )));
            }
            Ok(ReadingQuestion {
                id: Uuid::new_v4().to_string(),
                question: question.question.trim().to_string(),
                options: question.options.clone(),
                correct_option: question.correct_option,
            })
        })
        .collect()
}

async fn create_problem(
    CurrentStaff(teacher): CurrentStaff,
    State(state): State<AppState>,
    Json(payload): Json<ProblemCreate>,
) -> Result<(StatusCode, Json<ProblemResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if let Some(exam_id) = payload.exam_id.as_deref() {
        let exam = load_exam(&state, exam_id).await?;
        if !teacher.can_manage(&exam.created_by) {
            return Err(ApiError::Forbidden("Only the exam owner can add problems"));
        }
    }

    let questions = match payload.kind {
        ProblemKind::ReadingComprehension => reading_questions(&payload)?,
        ProblemKind::Essay => Vec::new(),
    };
    let rubric_items: Vec<_> = payload
        .rubric_items
        .iter()
        .map(|item| rubric::new_item(&item.criterion, item.max_score))
        .collect();
    rubric::validate_items(&rubric_items)?;

    let now = state.clock().now();
    let problem = state
        .stores()
        .problems
        .create(Problem {
            id: Uuid::new_v4().to_string(),
            title: payload.title,
            kind: payload.kind,
            prompt: payload.prompt,
            passage: payload.passage,
            questions: SqlxJson(questions),
            rubric_items: SqlxJson(rubric_items),
            raw_rubric: payload.raw_rubric.filter(|text| !text.trim().is_empty()),
            custom_max_score: payload
                .custom_max_score
                .unwrap_or(state.settings().grading().default_max_score),
            is_rubric_hidden: payload.is_rubric_hidden,
            exam_id: payload.exam_id,
            created_by: teacher.id().to_string(),
            created_at: now,
            updated_at: now,
        })
        .await?;

    tracing::info!(
        problem_id = %problem.id,
        exam_id = problem.exam_id.as_deref(),
        kind = ?problem.kind,
        "Problem created"
    );
    Ok((StatusCode::CREATED, Json(ProblemResponse::for_viewer(problem, true))))
}

async fn list_problems(
    CurrentUser(acting): CurrentUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<ProblemResponse>>, ApiError> {
    let problems = state.stores().problems.list_standalone().await?;
    let is_staff = acting.is_staff();
    Ok(Json(
        problems.into_iter().map(|problem| ProblemResponse::for_viewer(problem, is_staff)).collect(),
    ))
}

async fn get_problem(
    CurrentUser(acting): CurrentUser,
    State(state): State<AppState>,
    Path(problem_id): Path<String>,
) -> Result<Json<ProblemResponse>, ApiError> {
    let problem = load_problem(&state, &problem_id).await?;
    if problem.exam_id.is_some() && !acting.is_staff() {
        return Err(ApiError::Forbidden("Exam problems are available through an attempt"));
    }
    Ok(Json(ProblemResponse::for_viewer(problem, acting.is_staff())))
}

async fn rubric_preview(
    CurrentStaff(_teacher): CurrentStaff,
    State(state): State<AppState>,
    Json(payload): Json<RubricPreviewRequest>,
) -> Result<Json<RubricPreviewResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let grading = state.grading();
    let preview =
        rubric::preview(grading.collaborator(), &payload.raw_rubric, grading.timeout()).await?;
    Ok(Json(RubricPreviewResponse::from(preview)))
}

async fn submit_practice(
    CurrentUser(acting): CurrentUser,
    State(state): State<AppState>,
    Path(problem_id): Path<String>,
    Json(payload): Json<AnswerInput>,
) -> Result<(StatusCode, Json<PracticeSubmissionResponse>), ApiError> {
    let answer = payload.into_answer().ok_or_else(|| {
        ApiError::BadRequest("provide either essay text or choices".to_string())
    })?;

    let outcome = practice::submit(
        state.stores(),
        state.grading(),
        state.clock(),
        &acting,
        &problem_id,
        answer,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(PracticeSubmissionResponse {
            scale_warning: scale_warning(&outcome.scale),
            submission: SubmissionResponse::from(outcome.submission),
        }),
    ))
}

async fn history(
    CurrentUser(acting): CurrentUser,
    State(state): State<AppState>,
    Path(problem_id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<Vec<SubmissionResponse>>, ApiError> {
    let student_id = params.student_id.unwrap_or_else(|| acting.id().to_string());
    if !acting.can_view_submission_of(&student_id) {
        return Err(ApiError::Forbidden("Not allowed to view this history"));
    }

    let problem = load_problem(&state, &problem_id).await?;
    let submissions = ledger::history_for(state.stores(), &student_id, &problem.id).await?;
    Ok(Json(submissions.into_iter().map(SubmissionResponse::from).collect()))
}

async fn leaderboard(
    CurrentUser(_acting): CurrentUser,
    State(state): State<AppState>,
    Path(problem_id): Path<String>,
) -> Result<Json<Vec<LeaderboardEntryResponse>>, ApiError> {
    let problem = load_problem(&state, &problem_id).await?;
    let entries = ledger::leaderboard(state.stores(), &problem).await?;
    Ok(Json(LeaderboardEntryResponse::ranked(entries)))
}

async fn analytics(
    CurrentStaff(teacher): CurrentStaff,
    State(state): State<AppState>,
    Path(problem_id): Path<String>,
) -> Result<Json<ProblemAnalyticsResponse>, ApiError> {
    let problem = load_problem(&state, &problem_id).await?;
    if !teacher.can_manage(&problem.created_by) {
        return Err(ApiError::Forbidden("Only the problem owner can view analytics"));
    }

    let grading = state.grading();
    let stats = ledger::problem_analytics(
        state.stores(),
        grading.collaborator(),
        state.clock(),
        &problem,
        grading.timeout(),
    )
    .await?;

    Ok(Json(ProblemAnalyticsResponse {
        problem_id: problem.id,
        criteria: stats.into_iter().map(CriterionStatsResponse::from).collect(),
    }))
}

async fn load_problem(state: &AppState, problem_id: &str) -> Result<Problem, ApiError> {
    state
        .stores()
        .problems
        .find_by_id(problem_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Problem not found".to_string()))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::db::types::UserRole;
    use crate::test_support::{
        self, json_request, read_json, setup_test_context, setup_test_context_with_ai,
        ScriptedCollaborator,
    };

    #[tokio::test]
    async fn teacher_creates_problem_with_rubric() {
        let ctx = setup_test_context().await;
        let (_, token) = ctx.insert_user("t-1", UserRole::Teacher).await;

        let response = ctx
            .app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/problems",
                Some(&token),
                Some(json!({
                    "title": "My city",
                    "prompt": "Describe your city.",
                    "rubricItems": [
                        {"criterion": "Thesis", "maxScore": 4},
                        {"criterion": "Evidence", "maxScore": 6}
                    ]
                })),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = read_json(response).await;
        assert_eq!(body["kind"], "essay");
        assert_eq!(body["custom_max_score"], 10.0);
        assert_eq!(body["rubric_items"].as_array().map(Vec::len), Some(2));
        assert!(body["rubric_items"][0]["id"].as_str().is_some());
    }

    #[tokio::test]
    async fn reading_problem_needs_valid_answer_keys() {
        let ctx = setup_test_context().await;
        let (_, token) = ctx.insert_user("t-1", UserRole::Teacher).await;

        let response = ctx
            .app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/problems",
                Some(&token),
                Some(json!({
                    "title": "Rivers",
                    "kind": "reading_comprehension",
                    "prompt": "Answer the questions.",
                    "passage": "Rivers flow.",
                    "questions": [{"question": "Do rivers flow?", "options": ["Yes", "No"], "correctOption": 5}]
                })),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_rubric_preview_is_retryable() {
        let ai = ScriptedCollaborator::default().with_rubric(json!({"criteria": []}));
        let ctx = setup_test_context_with_ai(ai).await;
        let (_, token) = ctx.insert_user("t-1", UserRole::Teacher).await;

        let response = ctx
            .app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/problems/rubric-preview",
                Some(&token),
                Some(json!({"rawRubric": "Write nicely."})),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(read_json(response).await["retryable"], true);
    }

    #[tokio::test]
    async fn practice_submission_then_history_and_leaderboard() {
        let ctx = setup_test_context().await;
        let (_, token) = ctx.insert_user("s-1", UserRole::Student).await;
        let problem = ctx.insert_problem(test_support::essay_problem("p-1", None)).await;
        let submit_uri = format!("/api/v1/problems/{}/submissions", problem.id);

        let response = ctx
            .app
            .clone()
            .oneshot(json_request(
                Method::POST,
                &submit_uri,
                Some(&token),
                Some(json!({"essay": "My city is old and green."})),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = read_json(response).await;
        assert_eq!(created["total_score"], 8.0);
        assert_eq!(created["similarity_check"]["similarityPercentage"], 0.0);
        assert!(created["scale_warning"].is_null());

        let history = read_json(
            ctx.app
                .clone()
                .oneshot(json_request(
                    Method::GET,
                    &format!("/api/v1/problems/{}/history", problem.id),
                    Some(&token),
                    None,
                ))
                .await
                .expect("response"),
        )
        .await;
        assert_eq!(history.as_array().map(Vec::len), Some(1));

        let board = read_json(
            ctx.app
                .clone()
                .oneshot(json_request(
                    Method::GET,
                    &format!("/api/v1/problems/{}/leaderboard", problem.id),
                    Some(&token),
                    None,
                ))
                .await
                .expect("response"),
        )
        .await;
        assert_eq!(board[0]["rank"], 1);
        assert_eq!(board[0]["student_id"], "s-1");
    }

    #[tokio::test]
    async fn students_cannot_read_other_histories() {
        let ctx = setup_test_context().await;
        let (_, token) = ctx.insert_user("s-1", UserRole::Student).await;
        let problem = ctx.insert_problem(test_support::essay_problem("p-1", None)).await;

        let response = ctx
            .app
            .clone()
            .oneshot(json_request(
                Method::GET,
                &format!("/api/v1/problems/{}/history?student_id=s-2", problem.id),
                Some(&token),
                None,
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}

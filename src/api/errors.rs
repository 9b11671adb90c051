use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::repositories::StoreError;
use crate::services::attempts::AttemptError;
use crate::services::grading::GradingError;
use crate::services::practice::PracticeError;
use crate::services::rubric::RubricError;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
}

#[derive(Debug)]
pub(crate) enum ApiError {
    Unauthorized(&'static str),
    Forbidden(&'static str),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unprocessable { detail: String, retryable: bool },
    ServiceUnavailable(String),
    Internal(String),
}

impl ApiError {
    /// Log the underlying error with context and return an `Internal` variant.
    pub(crate) fn internal(err: impl std::fmt::Display, context: &str) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::Internal(context.to_string())
    }

    fn parts(self) -> (StatusCode, String, Option<bool>) {
        match self {
            ApiError::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message.to_string(), None),
            ApiError::Forbidden(message) => (StatusCode::FORBIDDEN, message.to_string(), None),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message, None),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message, None),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message, None),
            ApiError::Unprocessable { detail, retryable } => {
                (StatusCode::UNPROCESSABLE_ENTITY, detail, Some(retryable))
            }
            ApiError::ServiceUnavailable(message) => {
                tracing::error!(error = %message, "Service unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, message, None)
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, message, None)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let unauthorized = matches!(self, ApiError::Unauthorized(_));
        let (status, detail, retryable) = self.parts();
        let mut response =
            (status, Json(ErrorResponse { status: status.as_u16(), detail, retryable }))
                .into_response();
        if unauthorized {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => {
                ApiError::ServiceUnavailable(format!("Storage unavailable: {message}"))
            }
            other => ApiError::internal(other, "Storage operation failed"),
        }
    }
}

impl From<AttemptError> for ApiError {
    fn from(err: AttemptError) -> Self {
        match err {
            AttemptError::ExamNotFound => ApiError::NotFound("Exam not found".to_string()),
            AttemptError::ExamNotOpen { status } => ApiError::BadRequest(format!(
                "Exam is not open for attempts (status: {})",
                status.as_str()
            )),
            AttemptError::PasswordMismatch => ApiError::Forbidden("Incorrect exam password"),
            AttemptError::AttemptNotFound => ApiError::NotFound("Session not found".to_string()),
            AttemptError::Forbidden => ApiError::Forbidden("Not allowed to act on this attempt"),
            AttemptError::AttemptClosed => {
                ApiError::Conflict("Attempt is already submitted".to_string())
            }
            AttemptError::AttemptFrozen => {
                ApiError::Conflict("Attempt is being submitted".to_string())
            }
            AttemptError::AttemptExpired => ApiError::Conflict("Exam time is over".to_string()),
            AttemptError::UnknownProblem(id) => {
                ApiError::NotFound(format!("Problem {id} is not part of this exam"))
            }
            AttemptError::InvalidAnswer(id) => {
                ApiError::BadRequest(format!("Answer does not fit problem {id}"))
            }
            AttemptError::Store(err) => err.into(),
            AttemptError::Cache(err) => {
                tracing::error!(error = %err, "Answer cache failure");
                ApiError::ServiceUnavailable("Answer cache unavailable".to_string())
            }
        }
    }
}

impl From<RubricError> for ApiError {
    fn from(err: RubricError) -> Self {
        match err {
            RubricError::ParseFailure(_) | RubricError::Empty => {
                ApiError::Unprocessable { detail: err.to_string(), retryable: true }
            }
            RubricError::InvalidMaxScore { .. } => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl From<GradingError> for ApiError {
    fn from(err: GradingError) -> Self {
        match err {
            GradingError::AnswerKindMismatch => ApiError::BadRequest(err.to_string()),
            other => {
                tracing::error!(error = %other, "Grading failed");
                ApiError::ServiceUnavailable(
                    "This answer could not be graded right now".to_string(),
                )
            }
        }
    }
}

impl From<PracticeError> for ApiError {
    fn from(err: PracticeError) -> Self {
        match err {
            PracticeError::ProblemNotFound => ApiError::NotFound("Problem not found".to_string()),
            PracticeError::ExamProblem | PracticeError::BlankAnswer => {
                ApiError::BadRequest(err.to_string())
            }
            PracticeError::Grading(err) => err.into(),
            PracticeError::Store(err) => err.into(),
        }
    }
}

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::{FinishMode, ProblemKind, UserRole, VisibilityState};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct User {
    pub(crate) id: String,
    pub(crate) username: String,
    pub(crate) full_name: String,
    pub(crate) role: UserRole,
    pub(crate) is_active: bool,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Exam {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) description: Option<String>,
    pub(crate) start_time: PrimitiveDateTime,
    pub(crate) end_time: PrimitiveDateTime,
    pub(crate) password: Option<String>,
    pub(crate) created_by: String,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RubricItem {
    pub(crate) id: String,
    pub(crate) criterion: String,
    pub(crate) max_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReadingQuestion {
    pub(crate) id: String,
    pub(crate) question: String,
    pub(crate) options: Vec<String>,
    pub(crate) correct_option: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Problem {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) kind: ProblemKind,
    pub(crate) prompt: String,
    pub(crate) passage: Option<String>,
    pub(crate) questions: Json<Vec<ReadingQuestion>>,
    pub(crate) rubric_items: Json<Vec<RubricItem>>,
    pub(crate) raw_rubric: Option<String>,
    pub(crate) custom_max_score: f64,
    pub(crate) is_rubric_hidden: bool,
    pub(crate) exam_id: Option<String>,
    pub(crate) created_by: String,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

impl Problem {
    pub(crate) fn raw_rubric_text(&self) -> Option<&str> {
        self.raw_rubric.as_deref().map(str::trim).filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct VisibilityChange {
    pub(crate) timestamp: PrimitiveDateTime,
    pub(crate) state: VisibilityState,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct ExamAttempt {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) student_id: String,
    pub(crate) started_at: PrimitiveDateTime,
    pub(crate) submitted_at: Option<PrimitiveDateTime>,
    pub(crate) fullscreen_exits: Vec<PrimitiveDateTime>,
    pub(crate) visibility_state_changes: Json<Vec<VisibilityChange>>,
    pub(crate) submission_ids: Vec<String>,
    pub(crate) finish_mode: Option<FinishMode>,
    /// Set while some process is grading and closing this attempt.
    pub(crate) finishing_until: Option<PrimitiveDateTime>,
}

impl ExamAttempt {
    pub(crate) fn is_open(&self) -> bool {
        self.submitted_at.is_none()
    }

    pub(crate) fn is_finish_claimed(&self, now: PrimitiveDateTime) -> bool {
        self.is_open() && self.finishing_until.is_some_and(|until| until > now)
    }

    pub(crate) fn hidden_count(&self) -> usize {
        self.visibility_state_changes
            .0
            .iter()
            .filter(|change| change.state == VisibilityState::Hidden)
            .count()
    }
}

/// One student answer, as held in the attempt-scoped cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub(crate) enum Answer {
    Essay(String),
    Choices(Vec<Option<u32>>),
}

impl Answer {
    pub(crate) fn is_blank(&self) -> bool {
        match self {
            Self::Essay(text) => text.trim().is_empty(),
            Self::Choices(choices) => choices.iter().all(Option::is_none),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CriterionFeedback {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) criterion_id: Option<String>,
    pub(crate) criterion: String,
    pub(crate) score: f64,
    #[serde(default)]
    pub(crate) feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Feedback {
    pub(crate) detailed_feedback: Vec<CriterionFeedback>,
    pub(crate) total_score: f64,
    pub(crate) max_score: f64,
    #[serde(default)]
    pub(crate) general_suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SimilarityResult {
    pub(crate) similarity_percentage: f64,
    pub(crate) explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Submission {
    pub(crate) id: String,
    pub(crate) problem_id: String,
    pub(crate) submitter_id: String,
    pub(crate) exam_id: Option<String>,
    pub(crate) attempt_id: Option<String>,
    pub(crate) essay: Option<String>,
    pub(crate) answers: Option<Json<Vec<Option<u32>>>>,
    pub(crate) essay_hash: Option<String>,
    pub(crate) feedback: Json<Feedback>,
    pub(crate) similarity_check: Option<Json<SimilarityResult>>,
    pub(crate) submitted_at: PrimitiveDateTime,
}

impl Submission {
    pub(crate) fn total_score(&self) -> f64 {
        self.feedback.0.total_score
    }
}

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::{Problem, ReadingQuestion, RubricItem};
use crate::db::types::ProblemKind;
use crate::services::ledger::{CriterionStats, LeaderboardEntry};
use crate::services::rubric::RubricPreview;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct RubricItemCreate {
    #[validate(length(min = 1, message = "criterion must not be empty"))]
    pub(crate) criterion: String,
    #[serde(alias = "maxScore")]
    #[validate(range(min = 0.0, message = "max_score must be non-negative"))]
    pub(crate) max_score: f64,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ReadingQuestionCreate {
    #[validate(length(min = 1, message = "question must not be empty"))]
    pub(crate) question: String,
    #[validate(length(min = 2, message = "a question needs at least two options"))]
    pub(crate) options: Vec<String>,
    #[serde(alias = "correctOption")]
    pub(crate) correct_option: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ProblemCreate {
    #[validate(length(min = 1, message = "title must not be empty"))]
    pub(crate) title: String,
    #[serde(default = "default_kind")]
    pub(crate) kind: ProblemKind,
    #[validate(length(min = 1, message = "prompt must not be empty"))]
    pub(crate) prompt: String,
    #[serde(default)]
    pub(crate) passage: Option<String>,
    #[serde(default)]
    #[validate(nested)]
    pub(crate) questions: Vec<ReadingQuestionCreate>,
    #[serde(default)]
    #[serde(alias = "rubricItems")]
    #[validate(nested)]
    pub(crate) rubric_items: Vec<RubricItemCreate>,
    #[serde(default)]
    #[serde(alias = "rawRubric")]
    pub(crate) raw_rubric: Option<String>,
    #[serde(default)]
    #[serde(alias = "customMaxScore")]
    #[validate(range(exclusive_min = 0.0, message = "custom_max_score must be positive"))]
    pub(crate) custom_max_score: Option<f64>,
    #[serde(default)]
    #[serde(alias = "isRubricHidden")]
    pub(crate) is_rubric_hidden: bool,
    #[serde(default)]
    #[serde(alias = "examId")]
    pub(crate) exam_id: Option<String>,
}

fn default_kind() -> ProblemKind {
    ProblemKind::Essay
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct RubricPreviewRequest {
    #[serde(alias = "rawRubric")]
    #[validate(length(min = 1, message = "raw_rubric must not be empty"))]
    pub(crate) raw_rubric: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct RubricPreviewResponse {
    pub(crate) items: Vec<RubricItem>,
    pub(crate) total_max_score: f64,
}

impl From<RubricPreview> for RubricPreviewResponse {
    fn from(preview: RubricPreview) -> Self {
        Self { items: preview.items, total_max_score: preview.total_max_score }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct QuestionResponse {
    pub(crate) id: String,
    pub(crate) question: String,
    pub(crate) options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) correct_option: Option<u32>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ProblemResponse {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) kind: ProblemKind,
    pub(crate) prompt: String,
    pub(crate) passage: Option<String>,
    pub(crate) questions: Vec<QuestionResponse>,
    pub(crate) rubric_items: Vec<RubricItem>,
    pub(crate) raw_rubric: Option<String>,
    pub(crate) custom_max_score: f64,
    pub(crate) is_rubric_hidden: bool,
    pub(crate) exam_id: Option<String>,
    pub(crate) created_by: String,
    pub(crate) created_at: String,
}

impl ProblemResponse {
    /// Answer keys are only shown to staff; a hidden rubric is withheld from
    /// everyone else.
    pub(crate) fn for_viewer(problem: Problem, is_staff: bool) -> Self {
        let show_rubric = is_staff || !problem.is_rubric_hidden;
        let questions = problem
            .questions
            .0
            .into_iter()
            .map(|question: ReadingQuestion| QuestionResponse {
                id: question.id,
                question: question.question,
                options: question.options,
                correct_option: is_staff.then_some(question.correct_option),
            })
            .collect();

        Self {
            id: problem.id,
            title: problem.title,
            kind: problem.kind,
            prompt: problem.prompt,
            passage: problem.passage,
            questions,
            rubric_items: if show_rubric { problem.rubric_items.0 } else { Vec::new() },
            raw_rubric: if show_rubric { problem.raw_rubric } else { None },
            custom_max_score: problem.custom_max_score,
            is_rubric_hidden: problem.is_rubric_hidden,
            exam_id: problem.exam_id,
            created_by: problem.created_by,
            created_at: format_primitive(problem.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct LeaderboardEntryResponse {
    pub(crate) rank: usize,
    pub(crate) student_id: String,
    pub(crate) best_score: f64,
    pub(crate) submission_id: String,
    pub(crate) scale_mismatch: bool,
}

impl LeaderboardEntryResponse {
    pub(crate) fn ranked(entries: Vec<LeaderboardEntry>) -> Vec<Self> {
        entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| Self {
                rank: index + 1,
                student_id: entry.student_id,
                best_score: entry.best_score,
                submission_id: entry.submission_id,
                scale_mismatch: entry.scale_mismatch,
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CriterionStatsResponse {
    pub(crate) criterion_id: String,
    pub(crate) criterion: String,
    pub(crate) max_score: f64,
    pub(crate) average_score: f64,
    pub(crate) sample_count: usize,
}

impl From<CriterionStats> for CriterionStatsResponse {
    fn from(stats: CriterionStats) -> Self {
        Self {
            criterion_id: stats.criterion_id,
            criterion: stats.criterion,
            max_score: stats.max_score,
            average_score: stats.average_score,
            sample_count: stats.sample_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ProblemAnalyticsResponse {
    pub(crate) problem_id: String,
    pub(crate) criteria: Vec<CriterionStatsResponse>,
}

use serde::{Deserialize, Serialize};

use crate::core::time::format_primitive;
use crate::db::models::{Answer, Feedback, SimilarityResult, Submission};
use crate::services::grading::ScaleCheck;

/// Wire form of one answer: essay text or selected option indices.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct AnswerInput {
    #[serde(default)]
    pub(crate) essay: Option<String>,
    #[serde(default)]
    pub(crate) choices: Option<Vec<Option<u32>>>,
}

impl AnswerInput {
    pub(crate) fn into_answer(self) -> Option<Answer> {
        match (self.essay, self.choices) {
            (Some(text), None) => Some(Answer::Essay(text)),
            (None, Some(choices)) => Some(Answer::Choices(choices)),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct SubmissionResponse {
    pub(crate) id: String,
    pub(crate) problem_id: String,
    pub(crate) submitter_id: String,
    pub(crate) exam_id: Option<String>,
    pub(crate) attempt_id: Option<String>,
    pub(crate) essay: Option<String>,
    pub(crate) answers: Option<Vec<Option<u32>>>,
    pub(crate) feedback: Feedback,
    pub(crate) total_score: f64,
    pub(crate) similarity_check: Option<SimilarityResult>,
    pub(crate) submitted_at: String,
}

impl From<Submission> for SubmissionResponse {
    fn from(submission: Submission) -> Self {
        Self {
            total_score: submission.total_score(),
            id: submission.id,
            problem_id: submission.problem_id,
            submitter_id: submission.submitter_id,
            exam_id: submission.exam_id,
            attempt_id: submission.attempt_id,
            essay: submission.essay,
            answers: submission.answers.map(|answers| answers.0),
            feedback: submission.feedback.0,
            similarity_check: submission.similarity_check.map(|check| check.0),
            submitted_at: format_primitive(submission.submitted_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PracticeSubmissionResponse {
    #[serde(flatten)]
    pub(crate) submission: SubmissionResponse,
    pub(crate) scale_warning: Option<String>,
}

pub(crate) fn scale_warning(scale: &ScaleCheck) -> Option<String> {
    match scale {
        ScaleCheck::Consistent => None,
        ScaleCheck::MaxScoreMismatch { expected, reported } => {
            Some(format!("graded out of {reported} instead of {expected}"))
        }
        ScaleCheck::TotalOutOfRange { total, max } => {
            Some(format!("total score {total} is outside 0..{max}"))
        }
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::time::format_primitive;
use crate::db::models::{Answer, ExamAttempt};
use crate::db::types::{AttemptState, FinishMode, VisibilityState};
use crate::schemas::exam::ExamResponse;
use crate::schemas::problem::ProblemResponse;
use crate::schemas::submission::{AnswerInput, SubmissionResponse};

#[derive(Debug, Serialize)]
pub(crate) struct AttemptResponse {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) student_id: String,
    pub(crate) state: AttemptState,
    pub(crate) started_at: String,
    pub(crate) submitted_at: Option<String>,
    pub(crate) finish_mode: Option<FinishMode>,
    pub(crate) fullscreen_exit_count: usize,
    pub(crate) hidden_count: usize,
    pub(crate) submission_ids: Vec<String>,
}

impl AttemptResponse {
    pub(crate) fn new(attempt: ExamAttempt, state: AttemptState) -> Self {
        Self {
            fullscreen_exit_count: attempt.fullscreen_exits.len(),
            hidden_count: attempt.hidden_count(),
            id: attempt.id,
            exam_id: attempt.exam_id,
            student_id: attempt.student_id,
            state,
            started_at: format_primitive(attempt.started_at),
            submitted_at: attempt.submitted_at.map(format_primitive),
            finish_mode: attempt.finish_mode,
            submission_ids: attempt.submission_ids,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct StartAttemptResponse {
    pub(crate) attempt: AttemptResponse,
    pub(crate) resumed: bool,
    pub(crate) remaining_seconds: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct AttemptDetailResponse {
    pub(crate) attempt: AttemptResponse,
    pub(crate) exam: ExamResponse,
    pub(crate) remaining_seconds: u64,
    pub(crate) problems: Vec<ProblemResponse>,
    pub(crate) answers: BTreeMap<String, Answer>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VisibilityEvent {
    pub(crate) state: VisibilityState,
}

#[derive(Debug, Serialize)]
pub(crate) struct ProctoringResponse {
    /// `recorded`, `ignored` or `dropped`.
    pub(crate) status: &'static str,
    pub(crate) fullscreen_exit_count: Option<usize>,
    pub(crate) hidden_count: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct FinishRequest {
    #[serde(default)]
    pub(crate) answers: BTreeMap<String, AnswerInput>,
}

impl FinishRequest {
    /// Entries that are neither essay text nor choices are dropped.
    pub(crate) fn into_answers(self) -> BTreeMap<String, Answer> {
        self.answers
            .into_iter()
            .filter_map(|(problem_id, input)| Some((problem_id, input.into_answer()?)))
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct FinishResponse {
    pub(crate) attempt: AttemptResponse,
    pub(crate) already_closed: bool,
    pub(crate) submissions: Vec<SubmissionResponse>,
    pub(crate) failed_problem_ids: Vec<String>,
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::core::config::GradingSettings;
use crate::db::models::{
    Answer, CriterionFeedback, Feedback, Problem, ReadingQuestion, RubricItem, SimilarityResult,
};
use crate::db::types::ProblemKind;
use crate::services::ai_grading::{AiCollaborator, CollaboratorError, GradeRequest};
use crate::services::rubric;

/// Tolerance used when comparing reported and expected scales.
const SCALE_EPSILON: f64 = 1e-6;

#[derive(Debug, Error)]
pub(crate) enum GradingError {
    #[error("invalid grading response shape: {0}")]
    InvalidResponseShape(String),
    #[error("grading timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("answer does not match problem kind")]
    AnswerKindMismatch,
    #[error("grading task was interrupted: {0}")]
    Interrupted(String),
}

impl GradingError {
    fn status_label(&self) -> &'static str {
        match self {
            Self::InvalidResponseShape(_) => "invalid_shape",
            Self::Timeout(_) => "timeout",
            Self::Collaborator(_) => "collaborator_error",
            Self::AnswerKindMismatch => "kind_mismatch",
            Self::Interrupted(_) => "interrupted",
        }
    }
}

/// How the reported scale compares with the problem's target scale.
///
/// Scores are never rescaled; a mismatch is surfaced so views and
/// aggregations can flag it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum ScaleCheck {
    Consistent,
    MaxScoreMismatch { expected: f64, reported: f64 },
    TotalOutOfRange { total: f64, max: f64 },
}

impl ScaleCheck {
    pub(crate) fn evaluate(feedback: &Feedback, expected_max: f64) -> Self {
        if (feedback.max_score - expected_max).abs() > SCALE_EPSILON {
            return Self::MaxScoreMismatch { expected: expected_max, reported: feedback.max_score };
        }
        if feedback.total_score < 0.0 || feedback.total_score > feedback.max_score + SCALE_EPSILON {
            return Self::TotalOutOfRange {
                total: feedback.total_score,
                max: feedback.max_score,
            };
        }
        Self::Consistent
    }

    pub(crate) fn is_consistent(self) -> bool {
        matches!(self, Self::Consistent)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct GradingOutcome {
    pub(crate) feedback: Feedback,
    pub(crate) scale: ScaleCheck,
}

/// Inputs for grading one essay.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EssayInput<'a> {
    pub(crate) prompt: &'a str,
    pub(crate) essay: &'a str,
    pub(crate) rubric_items: &'a [RubricItem],
    pub(crate) raw_rubric: Option<&'a str>,
    pub(crate) target_max_score: f64,
}

#[derive(Debug)]
pub(crate) struct BatchResult {
    pub(crate) problem_id: String,
    pub(crate) result: Result<GradingOutcome, GradingError>,
}

#[derive(Clone)]
pub(crate) struct GradingOrchestrator {
    ai: Arc<dyn AiCollaborator>,
    timeout: Duration,
    concurrency: usize,
}

impl GradingOrchestrator {
    pub(crate) fn new(ai: Arc<dyn AiCollaborator>, settings: &GradingSettings) -> Self {
        Self { ai, timeout: settings.timeout(), concurrency: settings.concurrency.max(1) }
    }

    pub(crate) fn collaborator(&self) -> &dyn AiCollaborator {
        self.ai.as_ref()
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) async fn grade_one(
        &self,
        input: EssayInput<'_>,
    ) -> Result<GradingOutcome, GradingError> {
        let request = GradeRequest {
            prompt: build_instructions(&input),
            essay: input.essay.to_string(),
            rubric_items: input.rubric_items.to_vec(),
            raw_rubric: input.raw_rubric.map(str::to_string),
            target_max_score: input.target_max_score,
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.ai.grade(&request)).await {
            Ok(Ok(raw)) => validate_feedback(&raw),
            Ok(Err(err)) => Err(GradingError::Collaborator(err)),
            Err(_) => Err(GradingError::Timeout(self.timeout)),
        };
        metrics::histogram!("grading_duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(feedback) => {
                let scale = ScaleCheck::evaluate(&feedback, input.target_max_score);
                if !scale.is_consistent() {
                    metrics::counter!("grading_scale_mismatch_total").increment(1);
                    tracing::warn!(
                        ?scale,
                        target_max_score = input.target_max_score,
                        "Grading result is not on the requested scale"
                    );
                }
                metrics::counter!("grading_calls_total", "status" => "success").increment(1);
                Ok(GradingOutcome { feedback, scale })
            }
            Err(err) => {
                metrics::counter!("grading_calls_total", "status" => err.status_label())
                    .increment(1);
                Err(err)
            }
        }
    }

    /// Grades one answer against its problem. Essays use the problem's stored
    /// criteria, so callers pin them first with [`rubric::pin_criteria`].
    /// Reading-comprehension answers are scored locally.
    pub(crate) async fn grade_answer(
        &self,
        problem: &Problem,
        answer: &Answer,
    ) -> Result<GradingOutcome, GradingError> {
        match (problem.kind, answer) {
            (ProblemKind::Essay, Answer::Essay(essay)) => {
                self.grade_one(EssayInput {
                    prompt: &problem.prompt,
                    essay,
                    rubric_items: &problem.rubric_items.0,
                    raw_rubric: problem.raw_rubric_text(),
                    target_max_score: problem.custom_max_score,
                })
                .await
            }
            (ProblemKind::ReadingComprehension, Answer::Choices(choices)) => {
                let feedback =
                    score_reading(&problem.questions.0, choices, problem.custom_max_score);
                Ok(GradingOutcome { feedback, scale: ScaleCheck::Consistent })
            }
            _ => Err(GradingError::AnswerKindMismatch),
        }
    }

    /// Grades every pair with at most `concurrency` calls in flight. One
    /// failure never affects the others; results keep the input order.
    pub(crate) async fn grade_batch(&self, work: Vec<(Problem, Answer)>) -> Vec<BatchResult> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();
        let problem_ids: Vec<String> = work.iter().map(|(problem, _)| problem.id.clone()).collect();

        for (index, (problem, answer)) in work.into_iter().enumerate() {
            let orchestrator = self.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => orchestrator.grade_answer(&problem, &answer).await,
                    Err(err) => Err(GradingError::Interrupted(err.to_string())),
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<Result<GradingOutcome, GradingError>>> =
            problem_ids.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(err) => tracing::error!(error = %err, "Grading task failed to join"),
            }
        }

        problem_ids
            .into_iter()
            .zip(slots)
            .map(|(problem_id, slot)| {
                let result = slot.unwrap_or_else(|| {
                    Err(GradingError::Interrupted("grading task did not complete".to_string()))
                });
                if let Err(err) = &result {
                    tracing::error!(problem_id = %problem_id, error = %err, "Problem could not be graded");
                }
                BatchResult { problem_id, result }
            })
            .collect()
    }

    /// Compares an essay against earlier ones. No prior essays means a zero
    /// result without a remote call.
    pub(crate) async fn check_similarity(
        &self,
        essay: &str,
        prior_essays: &[String],
    ) -> Result<SimilarityResult, GradingError> {
        if prior_essays.is_empty() {
            return Ok(SimilarityResult {
                similarity_percentage: 0.0,
                explanation: "No earlier submissions to compare against.".to_string(),
            });
        }

        let raw =
            match tokio::time::timeout(self.timeout, self.ai.check_similarity(essay, prior_essays))
                .await
            {
                Ok(Ok(raw)) => raw,
                Ok(Err(err)) => return Err(GradingError::Collaborator(err)),
                Err(_) => return Err(GradingError::Timeout(self.timeout)),
            };

        let percentage = raw
            .get("similarityPercentage")
            .and_then(Value::as_f64)
            .filter(|value| value.is_finite())
            .ok_or_else(|| {
                GradingError::InvalidResponseShape("similarityPercentage must be a number".into())
            })?;
        let explanation =
            raw.get("explanation").and_then(Value::as_str).unwrap_or_default().to_string();

        Ok(SimilarityResult { similarity_percentage: percentage.clamp(0.0, 100.0), explanation })
    }
}

/// Grading instructions in priority order: raw rubric text, then structured
/// criteria, then a holistic scale.
pub(crate) fn build_instructions(input: &EssayInput<'_>) -> String {
    let target = input.target_max_score;
    let mut out = format!("Essay prompt:\n{}\n\n", input.prompt.trim());

    if let Some(raw) = input.raw_rubric {
        out.push_str("Grading guide (follow it exactly as written):\n");
        out.push_str(raw);
        out.push_str("\n\n");
        if !input.rubric_items.is_empty() {
            out.push_str("Label each detailedFeedback entry with the matching criterionId:\n");
            push_criteria(&mut out, input.rubric_items);
        }
    } else if !input.rubric_items.is_empty() {
        out.push_str(
            "Score each criterion below. Return exactly one detailedFeedback entry per \
             criterion with its criterionId; totalScore is the sum of the entries.\n",
        );
        push_criteria(&mut out, input.rubric_items);
    } else {
        out.push_str(&format!("Grade the essay holistically on a scale from 0 to {target}.\n"));
    }

    let rubric_total = rubric::total_max_score(input.rubric_items);
    if !input.rubric_items.is_empty() && (rubric_total - target).abs() > SCALE_EPSILON {
        out.push_str(&format!(
            "The criteria add up to {rubric_total} points. Scale every criterion proportionally \
             so that totalScore is reported on a 0 to {target} scale.\n"
        ));
    }

    out.push_str(&format!(
        "\nReport maxScore as {target}. totalScore must be between 0 and {target}.\n"
    ));
    out
}

fn push_criteria(out: &mut String, items: &[RubricItem]) {
    for item in items {
        out.push_str(&format!(
            "- [{}] {} (max {} points)\n",
            item.id, item.criterion, item.max_score
        ));
    }
}

/// Checks the collaborator's JSON against the feedback shape. Nothing is
/// coerced: a wrong type anywhere is an error.
pub(crate) fn validate_feedback(raw: &Value) -> Result<Feedback, GradingError> {
    let object = raw
        .as_object()
        .ok_or_else(|| GradingError::InvalidResponseShape("expected a JSON object".into()))?;

    let entries = object
        .get("detailedFeedback")
        .and_then(Value::as_array)
        .ok_or_else(|| GradingError::InvalidResponseShape("detailedFeedback must be an array".into()))?;
    let total_score = number_field(object.get("totalScore"), "totalScore")?;
    let max_score = number_field(object.get("maxScore"), "maxScore")?;

    let mut detailed_feedback = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let criterion = entry.get("criterion").and_then(Value::as_str).ok_or_else(|| {
            GradingError::InvalidResponseShape(format!(
                "detailedFeedback[{index}].criterion must be a string"
            ))
        })?;
        let score = number_field(entry.get("score"), "detailedFeedback.score")?;
        let feedback = match entry.get("feedback") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(_) => {
                return Err(GradingError::InvalidResponseShape(format!(
                    "detailedFeedback[{index}].feedback must be a string"
                )))
            }
        };
        let criterion_id = entry
            .get("criterionId")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        detailed_feedback.push(CriterionFeedback {
            criterion_id,
            criterion: criterion.to_string(),
            score,
            feedback,
        });
    }

    let general_suggestions = match object.get("generalSuggestions") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    GradingError::InvalidResponseShape(
                        "generalSuggestions must contain strings".into(),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(GradingError::InvalidResponseShape(
                "generalSuggestions must be an array".into(),
            ))
        }
    };

    Ok(Feedback { detailed_feedback, total_score, max_score, general_suggestions })
}

fn number_field(value: Option<&Value>, field: &str) -> Result<f64, GradingError> {
    value
        .and_then(Value::as_f64)
        .filter(|number| number.is_finite())
        .ok_or_else(|| GradingError::InvalidResponseShape(format!("{field} must be a number")))
}

/// Scores multiple-choice answers: correct / total × `max_score`, one
/// feedback entry per question.
pub(crate) fn score_reading(
    questions: &[ReadingQuestion],
    choices: &[Option<u32>],
    max_score: f64,
) -> Feedback {
    if questions.is_empty() {
        return Feedback {
            detailed_feedback: Vec::new(),
            total_score: 0.0,
            max_score,
            general_suggestions: Vec::new(),
        };
    }

    let per_question = max_score / questions.len() as f64;
    let mut correct = 0usize;
    let detailed_feedback = questions
        .iter()
        .enumerate()
        .map(|(index, question)| {
            let selected = choices.get(index).copied().flatten();
            let is_correct = selected == Some(question.correct_option);
            if is_correct {
                correct += 1;
            }
            let feedback = match selected {
                _ if is_correct => "Correct.".to_string(),
                Some(_) => format!("Incorrect. The correct option is {}.", question.correct_option + 1),
                None => "Not answered.".to_string(),
            };
            CriterionFeedback {
                criterion_id: Some(question.id.clone()),
                criterion: question.question.clone(),
                score: if is_correct { per_question } else { 0.0 },
                feedback,
            }
        })
        .collect();

    Feedback {
        detailed_feedback,
        total_score: correct as f64 / questions.len() as f64 * max_score,
        max_score,
        general_suggestions: Vec::new(),
    }
}

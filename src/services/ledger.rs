//! Read-side aggregation over immutable submissions.

use std::collections::HashMap;
use std::time::Duration;

use crate::core::time::Clock;
use crate::db::models::{CriterionFeedback, Problem, RubricItem, Submission};
use crate::repositories::{StoreResult, Stores};
use crate::services::ai_grading::AiCollaborator;
use crate::services::rubric;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderboardEntry {
    pub(crate) student_id: String,
    pub(crate) best_score: f64,
    pub(crate) submission_id: String,
    /// The best submission was graded on a different scale than the problem's.
    pub(crate) scale_mismatch: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CriterionStats {
    pub(crate) criterion_id: String,
    pub(crate) criterion: String,
    pub(crate) max_score: f64,
    pub(crate) average_score: f64,
    pub(crate) sample_count: usize,
}

/// Most recent first.
pub(crate) async fn history_for(
    stores: &Stores,
    student_id: &str,
    problem_id: &str,
) -> StoreResult<Vec<Submission>> {
    stores.submissions.list_for_student_problem(student_id, problem_id).await
}

pub(crate) async fn leaderboard(
    stores: &Stores,
    problem: &Problem,
) -> StoreResult<Vec<LeaderboardEntry>> {
    let submissions = stores.submissions.list_by_problem(&problem.id).await?;
    Ok(rank(&submissions, problem.custom_max_score))
}

/// Best score per student, highest first. `submissions` must be in insertion
/// order; equal scores keep the order in which students first appear.
pub(crate) fn rank(submissions: &[Submission], expected_max: f64) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<LeaderboardEntry> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for submission in submissions {
        let score = submission.total_score();
        let scale_mismatch = (submission.feedback.0.max_score - expected_max).abs() > f64::EPSILON;
        match positions.get(submission.submitter_id.as_str()) {
            Some(&index) => {
                let entry = &mut entries[index];
                if score > entry.best_score {
                    entry.best_score = score;
                    entry.submission_id = submission.id.clone();
                    entry.scale_mismatch = scale_mismatch;
                }
            }
            None => {
                positions.insert(&submission.submitter_id, entries.len());
                entries.push(LeaderboardEntry {
                    student_id: submission.submitter_id.clone(),
                    best_score: score,
                    submission_id: submission.id.clone(),
                    scale_mismatch,
                });
            }
        }
    }

    entries.sort_by(|a, b| b.best_score.total_cmp(&a.best_score));
    entries
}

fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Best-effort join between a rubric criterion and one feedback entry:
/// the echoed criterion id wins, otherwise the trimmed case-insensitive
/// label must match.
fn matching_entry<'a>(
    item: &RubricItem,
    entries: &'a [CriterionFeedback],
) -> Option<&'a CriterionFeedback> {
    entries
        .iter()
        .find(|entry| entry.criterion_id.as_deref() == Some(item.id.as_str()))
        .or_else(|| {
            let label = normalize_label(&item.criterion);
            entries.iter().find(|entry| normalize_label(&entry.criterion) == label)
        })
}

/// Average score per criterion. Criteria nothing matched stay in the result
/// with zero samples.
pub(crate) fn criterion_analysis(
    criteria: &[RubricItem],
    submissions: &[Submission],
) -> Vec<CriterionStats> {
    criteria
        .iter()
        .map(|item| {
            let scores: Vec<f64> = submissions
                .iter()
                .filter_map(|submission| {
                    matching_entry(item, &submission.feedback.0.detailed_feedback)
                })
                .map(|entry| entry.score)
                .collect();
            let sample_count = scores.len();
            let average_score = if sample_count == 0 {
                0.0
            } else {
                scores.iter().sum::<f64>() / sample_count as f64
            };
            CriterionStats {
                criterion_id: item.id.clone(),
                criterion: item.criterion.clone(),
                max_score: item.max_score,
                average_score,
                sample_count,
            }
        })
        .collect()
}

/// Criterion analytics for a problem, keyed by the problem's pinned criteria.
pub(crate) async fn problem_analytics(
    stores: &Stores,
    ai: &dyn AiCollaborator,
    clock: &dyn Clock,
    problem: &Problem,
    timeout: Duration,
) -> StoreResult<Vec<CriterionStats>> {
    let problem =
        rubric::pin_criteria(stores.problems.as_ref(), ai, clock, problem.clone(), timeout).await?;
    if problem.rubric_items.0.is_empty() {
        return Ok(Vec::new());
    }

    let submissions = stores.submissions.list_by_problem(&problem.id).await?;
    Ok(criterion_analysis(&problem.rubric_items.0, &submissions))
}

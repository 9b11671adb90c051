use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::core::time::Clock;
use crate::db::models::{Problem, RubricItem};
use crate::db::types::ProblemKind;
use crate::repositories::{ProblemStore, StoreResult};
use crate::services::ai_grading::AiCollaborator;

#[derive(Debug, Error)]
pub(crate) enum RubricError {
    #[error("rubric parsing failed: {0}")]
    ParseFailure(String),
    #[error("no criteria found in the grading guide")]
    Empty,
    #[error("invalid max score {value} for criterion '{criterion}'")]
    InvalidMaxScore { criterion: String, value: f64 },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RubricPreview {
    pub(crate) items: Vec<RubricItem>,
    /// Informational; never enforced against the problem's max score.
    pub(crate) total_max_score: f64,
}

pub(crate) fn validate_items(items: &[RubricItem]) -> Result<(), RubricError> {
    for item in items {
        if !item.max_score.is_finite() || item.max_score < 0.0 {
            return Err(RubricError::InvalidMaxScore {
                criterion: item.criterion.clone(),
                value: item.max_score,
            });
        }
    }
    Ok(())
}

pub(crate) fn total_max_score(items: &[RubricItem]) -> f64 {
    items.iter().map(|item| item.max_score).sum()
}

pub(crate) fn new_item(criterion: &str, max_score: f64) -> RubricItem {
    RubricItem {
        id: Uuid::new_v4().to_string(),
        criterion: criterion.trim().to_string(),
        max_score,
    }
}

/// Reads the parser's JSON, either a bare array or `{"criteria": [...]}`.
/// Every extracted criterion gets a fresh id.
pub(crate) fn criteria_from_value(value: &Value) -> Result<Vec<RubricItem>, RubricError> {
    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(map) => match map.get("criteria") {
            Some(Value::Array(entries)) => entries,
            _ => return Err(RubricError::ParseFailure("missing criteria array".to_string())),
        },
        _ => return Err(RubricError::ParseFailure("expected an object or array".to_string())),
    };

    let mut items = Vec::with_capacity(entries.len());
    for entry in entries {
        let criterion = entry
            .get("criterion")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| RubricError::ParseFailure("criterion without a name".to_string()))?;
        let max_score = entry
            .get("maxScore")
            .or_else(|| entry.get("max_score"))
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                RubricError::ParseFailure(format!("criterion '{criterion}' has no numeric maxScore"))
            })?;
        items.push(new_item(criterion, max_score));
    }

    validate_items(&items)?;
    Ok(items)
}

/// Parses free-text rubric into criteria. Zero criteria is reported as
/// [`RubricError::Empty`] so authoring callers can ask for a retry.
pub(crate) async fn parse_text(
    ai: &dyn AiCollaborator,
    raw_text: &str,
    timeout: Duration,
) -> Result<Vec<RubricItem>, RubricError> {
    let value = match tokio::time::timeout(timeout, ai.parse_rubric(raw_text)).await {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => return Err(RubricError::ParseFailure(err.to_string())),
        Err(_) => {
            return Err(RubricError::ParseFailure(format!(
                "parser timed out after {}s",
                timeout.as_secs()
            )))
        }
    };

    let items = criteria_from_value(&value)?;
    if items.is_empty() {
        return Err(RubricError::Empty);
    }
    Ok(items)
}

pub(crate) async fn preview(
    ai: &dyn AiCollaborator,
    raw_text: &str,
    timeout: Duration,
) -> Result<RubricPreview, RubricError> {
    let items = parse_text(ai, raw_text, timeout).await?;
    let total_max_score = total_max_score(&items);
    Ok(RubricPreview { items, total_max_score })
}

/// Structured criteria for a problem, or `None` when grading must fall back
/// to a holistic scale. Parser failures are logged and treated as `None`.
pub(crate) async fn derive_criteria(
    problem: &Problem,
    ai: &dyn AiCollaborator,
    timeout: Duration,
) -> Option<Vec<RubricItem>> {
    if !problem.rubric_items.0.is_empty() {
        return Some(problem.rubric_items.0.clone());
    }

    let raw_text = problem.raw_rubric_text()?;
    match parse_text(ai, raw_text, timeout).await {
        Ok(items) => Some(items),
        Err(err) => {
            tracing::warn!(
                problem_id = %problem.id,
                error = %err,
                "Rubric parsing failed, falling back to holistic grading"
            );
            None
        }
    }
}

/// Returns the problem with criteria parsed from its raw rubric text stored
/// on it. Parsing happens once per problem: the first stored parse wins, so
/// grading prompts and analytics share the same criterion ids. A failed
/// parse leaves the problem unchanged and grading falls back to holistic.
pub(crate) async fn pin_criteria(
    problems: &dyn ProblemStore,
    ai: &dyn AiCollaborator,
    clock: &dyn Clock,
    problem: Problem,
    timeout: Duration,
) -> StoreResult<Problem> {
    if problem.kind != ProblemKind::Essay
        || !problem.rubric_items.0.is_empty()
        || problem.raw_rubric_text().is_none()
    {
        return Ok(problem);
    }

    let Some(items) = derive_criteria(&problem, ai, timeout).await else {
        return Ok(problem);
    };
    let count = items.len();
    match problems.pin_rubric_items(&problem.id, items.clone(), clock.now()).await? {
        Some(stored) => {
            tracing::info!(
                problem_id = %stored.id,
                criteria = stored.rubric_items.0.len(),
                parsed = count,
                "Pinned criteria parsed from rubric text"
            );
            Ok(stored)
        }
        None => Ok(Problem { rubric_items: sqlx::types::Json(items), ..problem }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{
        criteria_from_value, derive_criteria, pin_criteria, preview, validate_items, RubricError,
    };
    use crate::db::models::RubricItem;
    use crate::test_support::{self, Harness, ScriptedCollaborator};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn parser_output_gets_fresh_ids() {
        let value = json!({"criteria": [
            {"criterion": " Thesis ", "maxScore": 4},
            {"criterion": "Evidence", "max_score": 6.0}
        ]});

        let items = criteria_from_value(&value).expect("items");

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].criterion, "Thesis");
        assert_ne!(items[0].id, items[1].id);
        assert_eq!(items[1].max_score, 6.0);
    }

    #[test]
    fn negative_max_score_is_rejected() {
        let items = vec![RubricItem {
            id: "c-1".to_string(),
            criterion: "Style".to_string(),
            max_score: -1.0,
        }];

        assert!(matches!(validate_items(&items), Err(RubricError::InvalidMaxScore { .. })));
    }

    #[test]
    fn non_finite_max_score_is_rejected() {
        let items = vec![RubricItem {
            id: "c-1".to_string(),
            criterion: "Style".to_string(),
            max_score: f64::INFINITY,
        }];

        assert!(validate_items(&items).is_err());
    }

    #[test]
    fn malformed_parser_output_is_a_parse_failure() {
        let value = json!({"criteria": [{"criterion": "Thesis"}]});
        assert!(matches!(criteria_from_value(&value), Err(RubricError::ParseFailure(_))));

        let value = json!("not a rubric");
        assert!(matches!(criteria_from_value(&value), Err(RubricError::ParseFailure(_))));
    }

    #[tokio::test]
    async fn structured_items_are_returned_as_is() {
        let ai = ScriptedCollaborator::default();
        let mut problem = test_support::essay_problem("p-1", None);
        problem.rubric_items.0 = vec![test_support::rubric_item("c-1", "Thesis", 5.0)];
        problem.raw_rubric = Some("Thesis: 5 points".to_string());

        let items = derive_criteria(&problem, &ai, TIMEOUT).await.expect("items");

        assert_eq!(items[0].id, "c-1");
        assert_eq!(ai.rubric_calls(), 0);
    }

    #[tokio::test]
    async fn raw_text_is_parsed_when_no_items_exist() {
        let ai = ScriptedCollaborator::default().with_rubric(json!({"criteria": [
            {"criterion": "Mở bài", "maxScore": 2},
            {"criterion": "Thân bài", "maxScore": 6}
        ]}));
        let mut problem = test_support::essay_problem("p-1", None);
        problem.raw_rubric = Some("Mở bài 2đ, Thân bài 6đ".to_string());

        let items = derive_criteria(&problem, &ai, TIMEOUT).await.expect("items");

        assert_eq!(items.len(), 2);
        assert_eq!(ai.rubric_calls(), 1);
    }

    #[tokio::test]
    async fn no_rubric_means_holistic() {
        let ai = ScriptedCollaborator::default();
        let problem = test_support::essay_problem("p-1", None);

        assert!(derive_criteria(&problem, &ai, TIMEOUT).await.is_none());
        assert_eq!(ai.rubric_calls(), 0);
    }

    #[tokio::test]
    async fn parser_failure_degrades_to_none() {
        let ai = ScriptedCollaborator::default().with_rubric(json!({"unexpected": true}));
        let mut problem = test_support::essay_problem("p-1", None);
        problem.raw_rubric = Some("Be thorough".to_string());

        assert!(derive_criteria(&problem, &ai, TIMEOUT).await.is_none());
    }

    #[tokio::test]
    async fn criteria_are_parsed_once_and_reused() {
        let ai = ScriptedCollaborator::default()
            .with_rubric(json!({"criteria": [{"criterion": "Thesis", "maxScore": 5}]}));
        let harness = Harness::with_ai(ai);
        let mut problem = test_support::essay_problem("p-1", None);
        problem.raw_rubric = Some("Thesis: 5 points".to_string());
        harness.stores.problems.create(problem.clone()).await.expect("problem");

        let problems = harness.stores.problems.as_ref();
        let first = pin_criteria(problems, &harness.ai, harness.clock.as_ref(), problem.clone(), TIMEOUT)
            .await
            .expect("pin");
        let stored = problems.find_by_id("p-1").await.expect("find").expect("problem");
        let second = pin_criteria(problems, &harness.ai, harness.clock.as_ref(), stored, TIMEOUT)
            .await
            .expect("pin");

        assert_eq!(harness.ai.rubric_calls(), 1);
        assert_eq!(first.rubric_items.0.len(), 1);
        assert_eq!(first.rubric_items.0[0].id, second.rubric_items.0[0].id);
    }

    #[tokio::test]
    async fn failed_parse_leaves_the_problem_unpinned() {
        let ai = ScriptedCollaborator::default().with_rubric(json!({"criteria": []}));
        let harness = Harness::with_ai(ai);
        let mut problem = test_support::essay_problem("p-1", None);
        problem.raw_rubric = Some("Write well.".to_string());
        harness.stores.problems.create(problem.clone()).await.expect("problem");

        let pinned = pin_criteria(
            harness.stores.problems.as_ref(),
            &harness.ai,
            harness.clock.as_ref(),
            problem,
            TIMEOUT,
        )
        .await
        .expect("pin");

        assert!(pinned.rubric_items.0.is_empty());
        let stored = harness.stores.problems.find_by_id("p-1").await.expect("find").expect("problem");
        assert!(stored.rubric_items.0.is_empty());
    }

    #[tokio::test]
    async fn preview_reports_empty_rubric() {
        let ai = ScriptedCollaborator::default().with_rubric(json!({"criteria": []}));

        let result = preview(&ai, "Write well.", TIMEOUT).await;

        assert!(matches!(result, Err(RubricError::Empty)));
    }

    #[tokio::test]
    async fn preview_totals_max_scores() {
        let ai = ScriptedCollaborator::default().with_rubric(json!([
            {"criterion": "Thesis", "maxScore": 3},
            {"criterion": "Style", "maxScore": 5}
        ]));

        let preview = preview(&ai, "Thesis 3, Style 5", TIMEOUT).await.expect("preview");

        assert_eq!(preview.total_max_score, 8.0);
    }
}

use sha2::{Digest, Sha256};
use sqlx::types::Json;
use thiserror::Error;
use uuid::Uuid;

use crate::core::time::Clock;
use crate::db::models::{Answer, Problem, SimilarityResult, Submission};
use crate::repositories::{StoreError, Stores};
use crate::services::access::ActingUser;
use crate::services::grading::{GradingError, GradingOrchestrator, ScaleCheck};
use crate::services::rubric;

#[derive(Debug, Error)]
pub(crate) enum PracticeError {
    #[error("problem not found")]
    ProblemNotFound,
    #[error("problem belongs to an exam; answer it through an attempt")]
    ExamProblem,
    #[error("answer is empty")]
    BlankAnswer,
    #[error(transparent)]
    Grading(#[from] GradingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub(crate) struct PracticeOutcome {
    pub(crate) submission: Submission,
    pub(crate) scale: ScaleCheck,
}

/// SHA-256 of the trimmed essay, hex encoded.
pub(crate) fn essay_fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.trim().as_bytes()))
}

/// Grades a standalone practice answer and stores it with a similarity check
/// against the student's earlier essays on the same problem.
pub(crate) async fn submit(
    stores: &Stores,
    grading: &GradingOrchestrator,
    clock: &dyn Clock,
    acting: &ActingUser,
    problem_id: &str,
    answer: Answer,
) -> Result<PracticeOutcome, PracticeError> {
    let problem =
        stores.problems.find_by_id(problem_id).await?.ok_or(PracticeError::ProblemNotFound)?;
    if problem.exam_id.is_some() {
        return Err(PracticeError::ExamProblem);
    }
    if answer.is_blank() {
        return Err(PracticeError::BlankAnswer);
    }

    let problem = rubric::pin_criteria(
        stores.problems.as_ref(),
        grading.collaborator(),
        clock,
        problem,
        grading.timeout(),
    )
    .await?;
    let graded = grading.grade_answer(&problem, &answer).await?;

    let (essay, answers, essay_hash, similarity_check) = match answer {
        Answer::Essay(text) => {
            let fingerprint = essay_fingerprint(&text);
            let similarity =
                similarity_for(stores, grading, acting.id(), &problem, &text, &fingerprint).await?;
            (Some(text), None, Some(fingerprint), similarity.map(Json))
        }
        Answer::Choices(choices) => (None, Some(Json(choices)), None, None),
    };

    let submission = stores
        .submissions
        .create(Submission {
            id: Uuid::new_v4().to_string(),
            problem_id: problem.id.clone(),
            submitter_id: acting.id().to_string(),
            exam_id: None,
            attempt_id: None,
            essay,
            answers,
            essay_hash,
            feedback: Json(graded.feedback),
            similarity_check,
            submitted_at: clock.now(),
        })
        .await?;

    tracing::info!(
        submission_id = %submission.id,
        problem_id = %problem.id,
        student_id = %submission.submitter_id,
        total_score = submission.total_score(),
        "Practice submission graded"
    );

    Ok(PracticeOutcome { submission, scale: graded.scale })
}

async fn similarity_for(
    stores: &Stores,
    grading: &GradingOrchestrator,
    student_id: &str,
    problem: &Problem,
    essay: &str,
    fingerprint: &str,
) -> Result<Option<SimilarityResult>, StoreError> {
    let prior = stores.submissions.list_for_student_problem(student_id, &problem.id).await?;

    if prior.iter().any(|submission| submission.essay_hash.as_deref() == Some(fingerprint)) {
        return Ok(Some(SimilarityResult {
            similarity_percentage: 100.0,
            explanation: "Identical to an earlier submission.".to_string(),
        }));
    }

    let prior_essays: Vec<String> =
        prior.into_iter().filter_map(|submission| submission.essay).collect();
    match grading.check_similarity(essay, &prior_essays).await {
        Ok(result) => Ok(Some(result)),
        Err(err) => {
            tracing::warn!(problem_id = %problem.id, error = %err, "Similarity check failed");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{essay_fingerprint, submit, PracticeError};
    use crate::db::models::Answer;
    use crate::test_support::{Harness, ScriptedCollaborator};

    #[test]
    fn fingerprint_ignores_surrounding_whitespace() {
        assert_eq!(essay_fingerprint("  An essay.\n"), essay_fingerprint("An essay."));
        assert_ne!(essay_fingerprint("An essay."), essay_fingerprint("Another essay."));
        assert_eq!(essay_fingerprint("x").len(), 64);
    }

    #[tokio::test]
    async fn first_submission_has_zero_similarity() {
        let harness = Harness::new();
        let problem = harness.standalone_problem().await;
        let student = harness.student("s-1").await;

        let outcome = submit(
            &harness.stores,
            &harness.grading,
            harness.clock.as_ref(),
            &student,
            &problem.id,
            Answer::Essay("My first essay.".into()),
        )
        .await
        .expect("submit");

        let similarity = outcome.submission.similarity_check.expect("similarity").0;
        assert_eq!(similarity.similarity_percentage, 0.0);
        assert_eq!(harness.ai.similarity_calls(), 0);
        assert!(outcome.submission.exam_id.is_none());
    }

    #[tokio::test]
    async fn identical_resubmission_short_circuits() {
        let harness = Harness::new();
        let problem = harness.standalone_problem().await;
        let student = harness.student("s-1").await;
        for _ in 0..2 {
            submit(
                &harness.stores,
                &harness.grading,
                harness.clock.as_ref(),
                &student,
                &problem.id,
                Answer::Essay("Same words.".into()),
            )
            .await
            .expect("submit");
        }

        let history = harness.submission_store.all_sync();
        let latest = history.last().expect("latest");
        assert_eq!(latest.similarity_check.as_ref().expect("similarity").0.similarity_percentage, 100.0);
        assert_eq!(harness.ai.similarity_calls(), 0);
    }

    #[tokio::test]
    async fn changed_essay_is_compared_remotely() {
        let ai = ScriptedCollaborator::default()
            .with_similarity(json!({"similarityPercentage": -5, "explanation": "different"}));
        let harness = Harness::with_ai(ai);
        let problem = harness.standalone_problem().await;
        let student = harness.student("s-1").await;
        for text in ["First draft.", "Second draft."] {
            submit(
                &harness.stores,
                &harness.grading,
                harness.clock.as_ref(),
                &student,
                &problem.id,
                Answer::Essay(text.into()),
            )
            .await
            .expect("submit");
        }

        let history = harness.submission_store.all_sync();
        let similarity = history[1].similarity_check.as_ref().expect("similarity").0.clone();
        assert_eq!(similarity.similarity_percentage, 0.0);
        assert_eq!(harness.ai.similarity_calls(), 1);
    }

    #[tokio::test]
    async fn exam_problems_are_not_practice() {
        let harness = Harness::new();
        let (_, problems) = harness.ongoing_exam(1).await;
        let student = harness.student("s-1").await;

        let result = submit(
            &harness.stores,
            &harness.grading,
            harness.clock.as_ref(),
            &student,
            &problems[0].id,
            Answer::Essay("text".into()),
        )
        .await;

        assert!(matches!(result, Err(PracticeError::ExamProblem)));
    }

    #[tokio::test]
    async fn grading_failure_stores_nothing() {
        let harness = Harness::with_ai(ScriptedCollaborator::default().failing_on("FAIL"));
        let problem = harness.standalone_problem().await;
        let student = harness.student("s-1").await;

        let result = submit(
            &harness.stores,
            &harness.grading,
            harness.clock.as_ref(),
            &student,
            &problem.id,
            Answer::Essay("FAIL".into()),
        )
        .await;

        assert!(matches!(result, Err(PracticeError::Grading(_))));
        assert!(harness.submission_store.all_sync().is_empty());
    }
}

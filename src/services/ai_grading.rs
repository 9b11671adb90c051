use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::config::Settings;
use crate::db::models::RubricItem;

const GRADING_SYSTEM_PROMPT: &str = r#"You are an experienced writing instructor grading a student essay.
Follow the grading instructions exactly. Score only what the student wrote.

Respond with strict JSON in this format:
{
  "detailedFeedback": [
    {"criterionId": "<id when one is given>", "criterion": "<criterion name>", "score": <number>, "feedback": "<comment>"}
  ],
  "totalScore": <number>,
  "maxScore": <number>,
  "generalSuggestions": ["<suggestion>"]
}
"#;

const RUBRIC_SYSTEM_PROMPT: &str = r#"You extract grading criteria from a teacher's grading guide.
Return every criterion the guide names together with the maximum points it awards.
If the guide names no criteria, return an empty list.

Respond with strict JSON in this format:
{"criteria": [{"criterion": "<name>", "maxScore": <number>}]}
"#;

const SIMILARITY_SYSTEM_PROMPT: &str = r#"You compare a new essay against earlier essays by the same student.
Estimate how much of the new essay repeats the earlier ones in wording or structure.

Respond with strict JSON in this format:
{"similarityPercentage": <number from 0 to 100>, "explanation": "<short explanation>"}
"#;

#[derive(Debug, Error)]
pub(crate) enum CollaboratorError {
    #[error("failed to call AI provider: {0}")]
    Http(#[from] reqwest::Error),
    #[error("AI provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed AI provider response: {0}")]
    Malformed(String),
}

/// Everything the grading collaborator receives for one essay.
#[derive(Debug, Clone)]
pub(crate) struct GradeRequest {
    pub(crate) prompt: String,
    pub(crate) essay: String,
    pub(crate) rubric_items: Vec<RubricItem>,
    pub(crate) raw_rubric: Option<String>,
    pub(crate) target_max_score: f64,
}

/// Remote AI service used for grading, rubric parsing and similarity checks.
///
/// Implementations return the provider's JSON untouched; callers own shape
/// validation.
#[async_trait]
pub(crate) trait AiCollaborator: Send + Sync {
    async fn grade(&self, request: &GradeRequest) -> Result<Value, CollaboratorError>;
    async fn parse_rubric(&self, raw_text: &str) -> Result<Value, CollaboratorError>;
    async fn check_similarity(
        &self,
        essay: &str,
        prior_essays: &[String],
    ) -> Result<Value, CollaboratorError>;
}

#[derive(Debug, Clone)]
pub(crate) struct OpenAiCollaborator {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
    max_retries: u32,
}

impl OpenAiCollaborator {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(settings.ai().ai_request_timeout);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key: settings.ai().openai_api_key.clone(),
            base_url: settings.ai().openai_base_url.trim_end_matches('/').to_string(),
            model: settings.ai().ai_model.clone(),
            max_tokens: settings.ai().ai_max_tokens,
            temperature: settings.ai().ai_temperature,
            max_retries: settings.ai().ai_max_retries,
        })
    }

    async fn complete_json(
        &self,
        operation: &'static str,
        system_prompt: &str,
        user_prompt: String,
    ) -> Result<Value, CollaboratorError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt}
            ],
            "max_completion_tokens": self.max_tokens,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"}
        });

        let url = format!("{}/chat/completions", self.base_url);
        let timer = Instant::now();
        let mut last_error = None;
        let mut body = Value::Null;

        for attempt in 0..=self.max_retries {
            let response =
                self.client.post(&url).bearer_auth(&self.api_key).json(&payload).send().await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    body = resp.json().await.unwrap_or(Value::Null);
                    if status.is_success() {
                        last_error = None;
                        break;
                    }
                    last_error = Some(CollaboratorError::Status {
                        status: status.as_u16(),
                        body: body.to_string(),
                    });
                }
                Err(err) => last_error = Some(CollaboratorError::Http(err)),
            }

            if attempt < self.max_retries {
                tracing::warn!(operation, attempt, "AI request failed, retrying");
                tokio::time::sleep(Duration::from_secs(2_u64.pow(attempt.min(5)))).await;
            }
        }

        if let Some(err) = last_error {
            return Err(err);
        }

        let content = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| CollaboratorError::Malformed("missing message content".to_string()))?;

        let result: Value = serde_json::from_str(content)
            .map_err(|err| CollaboratorError::Malformed(format!("content is not JSON: {err}")))?;

        let tokens_used = body
            .get("usage")
            .and_then(|usage| usage.get("total_tokens"))
            .and_then(Value::as_u64);
        tracing::info!(
            operation,
            duration_seconds = timer.elapsed().as_secs_f64(),
            tokens_used,
            model = %self.model,
            "AI request completed"
        );

        Ok(result)
    }
}

#[async_trait]
impl AiCollaborator for OpenAiCollaborator {
    async fn grade(&self, request: &GradeRequest) -> Result<Value, CollaboratorError> {
        tracing::debug!(
            criteria = request.rubric_items.len(),
            has_raw_rubric = request.raw_rubric.is_some(),
            target_max_score = request.target_max_score,
            "Sending AI grading request"
        );
        let user_prompt = format!("{}\n\nStudent essay:\n{}\n", request.prompt, request.essay);
        self.complete_json("grade", GRADING_SYSTEM_PROMPT, user_prompt).await
    }

    async fn parse_rubric(&self, raw_text: &str) -> Result<Value, CollaboratorError> {
        let user_prompt = format!("Grading guide:\n{raw_text}\n");
        self.complete_json("parse_rubric", RUBRIC_SYSTEM_PROMPT, user_prompt).await
    }

    async fn check_similarity(
        &self,
        essay: &str,
        prior_essays: &[String],
    ) -> Result<Value, CollaboratorError> {
        let mut user_prompt = format!("New essay:\n{essay}\n");
        for (index, prior) in prior_essays.iter().enumerate() {
            user_prompt.push_str(&format!("\nEarlier essay {}:\n{prior}\n", index + 1));
        }
        self.complete_json("check_similarity", SIMILARITY_SYSTEM_PROMPT, user_prompt).await
    }
}

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use time::{
    format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime,
    PrimitiveDateTime,
};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::Exam;
use crate::db::types::{AttemptState, ExamStatus};
use crate::services::exam_status::{AttemptMonitorRow, ExamMonitor};

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ExamCreate {
    #[validate(length(min = 1, message = "title must not be empty"))]
    pub(crate) title: String,
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(alias = "startTime", deserialize_with = "deserialize_offset_datetime_flexible")]
    pub(crate) start_time: OffsetDateTime,
    #[serde(alias = "endTime", deserialize_with = "deserialize_offset_datetime_flexible")]
    pub(crate) end_time: OffsetDateTime,
    #[serde(default)]
    #[validate(length(min = 1, message = "password must not be empty"))]
    pub(crate) password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ExamStart {
    #[serde(default)]
    pub(crate) password: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ExamResponse {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) description: Option<String>,
    pub(crate) start_time: String,
    pub(crate) end_time: String,
    pub(crate) status: ExamStatus,
    pub(crate) requires_password: bool,
    pub(crate) problem_count: usize,
    pub(crate) created_by: String,
    pub(crate) created_at: String,
}

impl ExamResponse {
    pub(crate) fn new(exam: Exam, status: ExamStatus, problem_count: usize) -> Self {
        Self {
            requires_password: exam.password.as_deref().is_some_and(|value| !value.is_empty()),
            id: exam.id,
            title: exam.title,
            description: exam.description,
            start_time: format_primitive(exam.start_time),
            end_time: format_primitive(exam.end_time),
            status,
            problem_count,
            created_by: exam.created_by,
            created_at: format_primitive(exam.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct AttemptMonitorResponse {
    pub(crate) attempt_id: String,
    pub(crate) student_id: String,
    pub(crate) state: AttemptState,
    pub(crate) started_at: String,
    pub(crate) submitted_at: Option<String>,
    pub(crate) fullscreen_exit_count: usize,
    pub(crate) hidden_count: usize,
    pub(crate) submission_count: usize,
}

impl From<AttemptMonitorRow> for AttemptMonitorResponse {
    fn from(row: AttemptMonitorRow) -> Self {
        Self {
            attempt_id: row.attempt_id,
            student_id: row.student_id,
            state: row.state,
            started_at: format_primitive(row.started_at),
            submitted_at: row.submitted_at.map(format_primitive),
            fullscreen_exit_count: row.fullscreen_exit_count,
            hidden_count: row.hidden_count,
            submission_count: row.submission_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ExamMonitorResponse {
    pub(crate) exam_id: String,
    pub(crate) status: ExamStatus,
    pub(crate) problem_count: usize,
    pub(crate) attempts: Vec<AttemptMonitorResponse>,
}

impl From<ExamMonitor> for ExamMonitorResponse {
    fn from(monitor: ExamMonitor) -> Self {
        Self {
            exam_id: monitor.exam_id,
            status: monitor.status,
            problem_count: monitor.problem_count,
            attempts: monitor.attempts.into_iter().map(AttemptMonitorResponse::from).collect(),
        }
    }
}

fn parse_offset_datetime_flexible(raw: &str) -> Option<OffsetDateTime> {
    if let Ok(value) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(value);
    }

    // datetime-local inputs arrive without an offset; treat them as UTC.
    if raw.len() == 19 && raw.as_bytes().get(10) == Some(&b'T') {
        if let Ok(value) = OffsetDateTime::parse(&format!("{raw}Z"), &Rfc3339) {
            return Some(value);
        }
    }

    PrimitiveDateTime::parse(raw, &format_description!("[year]-[month]-[day]T[hour]:[minute]"))
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

fn deserialize_offset_datetime_flexible<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_offset_datetime_flexible(&raw)
        .ok_or_else(|| D::Error::custom(format!("invalid datetime: {raw}")))
}

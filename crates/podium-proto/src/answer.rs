use crate::key::StudentKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Student self-rating captured by the optional confidence prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    JustGuessing,
    NotSure,
    Confident,
}

/// Activity counters sampled at submission time and attached to the answer
/// as an audit trail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionTelemetry {
    #[serde(default)]
    pub time_on_question_ms: u64,
    #[serde(default)]
    pub using_calculator: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// One answer as written to the private per-student record.
///
/// Created client-side at submit time and never mutated afterwards, except
/// for `attempts`, which the durable retry queue bumps while the submission
/// is still pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSubmission {
    pub response_id: String,
    pub poll_id: String,
    pub question_index: u32,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<ConfidenceLevel>,
    pub student_email: String,
    /// Server-side receive time, filled by the backend; zero until then.
    #[serde(default)]
    pub timestamp: i64,
    pub client_timestamp: i64,
    #[serde(default)]
    pub telemetry: SubmissionTelemetry,
    #[serde(default)]
    pub attempts: u32,
}

impl AnswerSubmission {
    pub fn new(
        poll_id: impl Into<String>,
        question_index: u32,
        answer: impl Into<String>,
        student_email: impl Into<String>,
        client_timestamp: i64,
    ) -> Self {
        Self {
            response_id: Uuid::new_v4().to_string(),
            poll_id: poll_id.into(),
            question_index,
            answer: answer.into(),
            answer_id: None,
            confidence: None,
            student_email: student_email.into(),
            timestamp: 0,
            client_timestamp,
            telemetry: SubmissionTelemetry::default(),
            attempts: 0,
        }
    }

    pub fn with_answer_id(mut self, id: Option<String>) -> Self {
        self.answer_id = id;
        self
    }

    pub fn with_confidence(mut self, confidence: Option<ConfidenceLevel>) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_telemetry(mut self, telemetry: SubmissionTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Dedupe identity for retried writes: re-sending a submission for the
    /// same key must overwrite, never duplicate.
    pub fn answer_key(&self) -> AnswerKey {
        AnswerKey {
            poll_id: self.poll_id.clone(),
            question_index: self.question_index,
            student_key: StudentKey::derive(&self.poll_id, &self.student_email),
        }
    }
}

/// `(poll, question, student)` identity of a recorded answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnswerKey {
    pub poll_id: String,
    pub question_index: u32,
    pub student_key: StudentKey,
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle of one live session, written wholesale by the teacher console
/// on every advance. `Closed`/`Ended` are terminal: once a poll id reaches
/// either, the session document is never revived for that id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    PreLive,
    Open,
    Paused,
    ResultsHold,
    ResultsRevealed,
    Closed,
    Ended,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Ended)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionKind {
    LivePoll,
    SecureAssessment,
}

impl Default for SessionKind {
    fn default() -> Self {
        SessionKind::LivePoll
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultsVisibility {
    Hidden,
    Revealed,
}

impl Default for ResultsVisibility {
    fn default() -> Self {
        ResultsVisibility::Hidden
    }
}

/// One answer option as authored in the question bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionOption {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
}

impl QuestionOption {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image_url: None,
            id: None,
            is_correct: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn correct(mut self, is_correct: bool) -> Self {
        self.is_correct = Some(is_correct);
        self
    }
}

/// Server-authoritative snapshot of the running session, one per poll.
///
/// Overwritten in full on every teacher action, so clients must treat each
/// snapshot as the complete truth rather than diffing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSessionState {
    pub poll_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub question_index: u32,
    #[serde(default)]
    pub question_text: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub session_kind: SessionKind,
    #[serde(default)]
    pub results_visibility: ResultsVisibility,
    #[serde(default)]
    pub calculator_enabled: bool,
    #[serde(default)]
    pub live_proctoring: bool,
    #[serde(default)]
    pub metacognition_enabled: bool,
    /// Bumped by the teacher to force-replay the current index; part of the
    /// question identity tuple so clients treat the replay as a new question.
    #[serde(default)]
    pub reset_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_percentages: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub timestamp: i64,
}

impl LiveSessionState {
    pub fn question_tag(&self) -> QuestionTag {
        QuestionTag {
            poll_id: self.poll_id.clone(),
            question_index: self.question_index,
            reset_timestamp: self.reset_timestamp,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.session_kind, SessionKind::SecureAssessment)
    }

    pub fn results_revealed(&self) -> bool {
        matches!(self.results_visibility, ResultsVisibility::Revealed)
            || matches!(self.status, SessionStatus::ResultsRevealed)
    }
}

/// Identity of one rendered question. Equality of the whole tuple is the
/// only "same question" test: the same index with a fresh `reset_timestamp`
/// is a different question.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionTag {
    pub poll_id: String,
    pub question_index: u32,
    pub reset_timestamp: i64,
}

//! The student session state machine.
//!
//! All session/proctoring decisions live in one explicit object:
//! subscription snapshots, local intent, connectivity flips, and unlock
//! confirmations come in as [`MachineInput`]s; I/O goes out as [`Effect`]
//! values executed by the driver; the rendered view is a pure projection of
//! the current state. The two subscription feeds (live session, student
//! status) carry no cross-feed ordering guarantee, so the transition policy
//! re-evaluates its priority rules on every input regardless of source.

use crate::proctor::{LocalLockState, reasons};
use podium_proto::{
    AnswerSubmission, ConfidenceLevel, LiveSessionState, QuestionTag, SessionStatus, StatusPatch,
    StudentKey, StudentStatus, StudentStatusRecord,
};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Resolved student identity for one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub poll_id: String,
    pub email: String,
    pub key: StudentKey,
}

impl Identity {
    pub fn resolve(poll_id: impl Into<String>, email: impl Into<String>) -> Self {
        let poll_id = poll_id.into();
        let email = email.into();
        let key = StudentKey::derive(&poll_id, &email);
        Self {
            poll_id,
            email,
            key,
        }
    }
}

/// Durable state re-applied before the first render after a reload.
#[derive(Debug, Clone, Default)]
pub struct RestoredState {
    pub lock: Option<LocalLockState>,
    pub submitted_tag: Option<QuestionTag>,
    pub eliminations: Option<(QuestionTag, Vec<usize>)>,
    pub cached_session: Option<LiveSessionState>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserIntent {
    BeginSession,
    SelectOption(usize),
    ToggleElimination(usize),
    Submit,
    ChooseConfidence(ConfidenceLevel),
    /// Timer expiry or teacher-forced submission; skips the confidence step.
    ForceSubmit,
    RequestFullscreen,
    FullscreenEntered,
    FullscreenExited,
    TabHidden,
    WindowBlurred,
}

#[derive(Debug, Clone)]
pub enum MachineInput {
    SessionSnapshot(Option<LiveSessionState>),
    StatusSnapshot(Option<StudentStatusRecord>),
    Intent(UserIntent),
    Connectivity(bool),
    /// Server acknowledged a violation report and assigned this version.
    ViolationAcknowledged { lock_version: u64 },
    /// Server-approved unlock (resume accepted, or teacher unlock).
    UnlockConfirmed { lock_version: u64 },
    /// Resume rejected (stale version); the next status push will correct us.
    ResumeRejected { reason: String },
    FatalError(String),
}

/// Side effects requested by a transition, executed by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    MergeStatus(StatusPatch),
    SubmitAnswer(AnswerSubmission),
    ReportViolation { reason: String },
    ConfirmResume { lock_version: u64 },
    PersistLock(LocalLockState),
    ClearLock,
    SaveSubmissionGuard(QuestionTag),
    SaveEliminations {
        tag: QuestionTag,
        eliminated: Vec<usize>,
    },
    ClearEliminations(QuestionTag),
    RestartQuestionTimer,
    /// Re-read the live session after an unlock; pushes that arrived while
    /// locked were discarded, not buffered.
    RefreshSession,
    RequestFullscreen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptionView {
    pub text: String,
    pub image_url: Option<String>,
    pub eliminated: bool,
    pub chosen: bool,
    pub percentage: Option<f64>,
    pub is_correct: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuestionView {
    pub question_index: u32,
    pub question_text: String,
    pub options: Vec<OptionView>,
    pub selected: Option<usize>,
    pub awaiting_confidence: bool,
    pub calculator_enabled: bool,
}

/// Mutually exclusive render targets. Exactly one is active at a time; the
/// lock view pre-empts everything else.
#[derive(Debug, Clone, PartialEq)]
pub enum View {
    Entry,
    Lobby,
    FullscreenGate,
    QuestionActive(QuestionView),
    AwaitingNext,
    Results(QuestionView),
    Locked { reason: String },
    TeacherPaused,
    AwaitingFullscreenResume,
    SessionEnded,
    Fatal { message: String },
}

impl View {
    pub fn label(&self) -> &'static str {
        match self {
            View::Entry => "entry",
            View::Lobby => "lobby",
            View::FullscreenGate => "fullscreen_gate",
            View::QuestionActive(_) => "question_active",
            View::AwaitingNext => "awaiting_next",
            View::Results(_) => "results",
            View::Locked { .. } => "locked",
            View::TeacherPaused => "teacher_paused",
            View::AwaitingFullscreenResume => "awaiting_fullscreen_resume",
            View::SessionEnded => "session_ended",
            View::Fatal { .. } => "fatal",
        }
    }
}

pub struct SessionStateMachine {
    identity: Option<Identity>,
    session: Option<LiveSessionState>,
    status: Option<StudentStatusRecord>,
    lock: LocalLockState,
    /// Highest lock version this client has applied; the tie-breaker that
    /// makes a stale `LOCKED` duplicate harmless after a legitimate unlock.
    applied_lock_version: u64,
    rendered_tag: Option<QuestionTag>,
    submitted_tag: Option<QuestionTag>,
    selected: Option<usize>,
    staged_for_confidence: bool,
    last_answer: Option<String>,
    eliminated: BTreeSet<usize>,
    fullscreen_confirmed: bool,
    online: bool,
    fatal: Option<String>,
}

impl SessionStateMachine {
    pub fn new(identity: Option<Identity>, restored: RestoredState) -> Self {
        let lock = restored.lock.unwrap_or_else(LocalLockState::inactive);
        let applied_lock_version = lock.lock_version;
        let mut machine = Self {
            identity,
            session: None,
            status: None,
            lock,
            applied_lock_version,
            rendered_tag: None,
            submitted_tag: restored.submitted_tag,
            selected: None,
            staged_for_confidence: false,
            last_answer: None,
            eliminated: BTreeSet::new(),
            fullscreen_confirmed: false,
            online: true,
            fatal: None,
        };
        if let Some(cached) = restored.cached_session {
            // Instant re-render from the cached snapshot; the first fresh
            // read replaces it. Never applied over an active lock.
            if !machine.lock.active {
                machine.rendered_tag = Some(cached.question_tag());
                if let Some((tag, marks)) = restored.eliminations {
                    if Some(&tag) == machine.rendered_tag.as_ref() {
                        machine.eliminated = marks.into_iter().collect();
                    }
                }
                machine.session = Some(cached);
            }
        }
        machine
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_reconnecting(&self) -> bool {
        !self.online
    }

    pub fn applied_lock_version(&self) -> u64 {
        self.applied_lock_version
    }

    pub fn apply(&mut self, input: MachineInput, now_ms: i64) -> Vec<Effect> {
        match input {
            MachineInput::SessionSnapshot(snapshot) => self.on_session(snapshot),
            MachineInput::StatusSnapshot(record) => self.on_status(record, now_ms),
            MachineInput::Intent(intent) => self.on_intent(intent, now_ms),
            MachineInput::Connectivity(online) => {
                self.online = online;
                Vec::new()
            }
            MachineInput::ViolationAcknowledged { lock_version } => {
                self.applied_lock_version = self.applied_lock_version.max(lock_version);
                if self.lock.active {
                    self.lock.lock_version = lock_version;
                    return vec![Effect::PersistLock(self.lock.clone())];
                }
                Vec::new()
            }
            MachineInput::UnlockConfirmed { lock_version } => self.on_unlock(lock_version),
            MachineInput::ResumeRejected { reason } => {
                debug!(target = "podium::machine", %reason, "resume rejected");
                Vec::new()
            }
            MachineInput::FatalError(message) => {
                self.fatal = Some(message);
                Vec::new()
            }
        }
    }

    fn on_session(&mut self, snapshot: Option<LiveSessionState>) -> Vec<Effect> {
        if self.lock.active {
            // Hard invariant: a locked student never sees a question, even
            // when the push race delivers one right after the lock.
            debug!(
                target = "podium::machine",
                "discarding session push while locked"
            );
            return Vec::new();
        }
        let mut effects = Vec::new();
        if let Some(session) = &snapshot {
            if !session.status.is_terminal() {
                let tag = session.question_tag();
                if self.rendered_tag.as_ref() != Some(&tag) {
                    if let Some(previous) = self.rendered_tag.take() {
                        effects.push(Effect::ClearEliminations(previous));
                    }
                    self.rendered_tag = Some(tag);
                    self.selected = None;
                    self.staged_for_confidence = false;
                    self.eliminated.clear();
                    effects.push(Effect::RestartQuestionTimer);
                }
            }
        }
        self.session = snapshot;
        effects
    }

    fn on_status(&mut self, record: Option<StudentStatusRecord>, now_ms: i64) -> Vec<Effect> {
        let Some(record) = record else {
            self.status = None;
            return Vec::new();
        };
        let mut effects = Vec::new();
        match record.status {
            StudentStatus::Locked => {
                if !StudentStatusRecord::lock_is_newer(
                    self.applied_lock_version,
                    record.lock_version,
                ) {
                    debug!(
                        target = "podium::machine",
                        applied = self.applied_lock_version,
                        incoming = record.lock_version,
                        "ignoring stale lock push"
                    );
                    return Vec::new();
                }
                self.applied_lock_version = record.lock_version;
                if !self.lock.active {
                    let reason = record
                        .last_violation_reason
                        .clone()
                        .unwrap_or_else(|| "locked by proctor".to_string());
                    self.lock = LocalLockState::engaged(reason, record.lock_version, now_ms);
                } else {
                    self.lock.lock_version = record.lock_version;
                }
                effects.push(Effect::PersistLock(self.lock.clone()));
                self.status = Some(record);
            }
            StudentStatus::AwaitingFullscreen => {
                // Teacher granted re-entry: the pill is released so the
                // resume ceremony can render; question content stays hidden
                // behind the resume view either way.
                if record.lock_version >= self.lock.lock_version {
                    self.applied_lock_version =
                        self.applied_lock_version.max(record.lock_version);
                    if self.lock.active {
                        self.lock = LocalLockState::inactive();
                        effects.push(Effect::ClearLock);
                    }
                    self.status = Some(record);
                } else {
                    debug!(
                        target = "podium::machine",
                        "ignoring stale awaiting-fullscreen push"
                    );
                }
            }
            StudentStatus::Active => {
                if self.lock.active {
                    if record.lock_version > self.applied_lock_version {
                        // Server-approved unlock raced ahead of the resume
                        // ack; honor it.
                        self.applied_lock_version = record.lock_version;
                        self.lock = LocalLockState::inactive();
                        effects.push(Effect::ClearLock);
                        effects.push(Effect::RefreshSession);
                        self.status = Some(record);
                    } else {
                        debug!(
                            target = "podium::machine",
                            "ignoring active echo while locked"
                        );
                    }
                } else {
                    self.applied_lock_version =
                        self.applied_lock_version.max(record.lock_version);
                    self.status = Some(record);
                }
            }
            _ => {
                self.applied_lock_version = self.applied_lock_version.max(record.lock_version);
                self.status = Some(record);
            }
        }
        effects
    }

    fn on_unlock(&mut self, lock_version: u64) -> Vec<Effect> {
        if !self.lock.active {
            self.applied_lock_version = self.applied_lock_version.max(lock_version);
            return Vec::new();
        }
        if !self.lock.released_by(lock_version) {
            debug!(
                target = "podium::machine",
                pill = self.lock.lock_version,
                unlock = lock_version,
                "ignoring unlock for older lock"
            );
            return Vec::new();
        }
        info!(target = "podium::machine", lock_version, "lock released");
        self.lock = LocalLockState::inactive();
        self.applied_lock_version = self.applied_lock_version.max(lock_version);
        vec![Effect::ClearLock, Effect::RefreshSession]
    }

    fn on_intent(&mut self, intent: UserIntent, now_ms: i64) -> Vec<Effect> {
        if self.fatal.is_some() {
            return Vec::new();
        }
        match intent {
            UserIntent::FullscreenExited => self.on_violation(reasons::EXIT_FULLSCREEN, now_ms),
            UserIntent::TabHidden => self.on_violation(reasons::TAB_HIDDEN, now_ms),
            UserIntent::WindowBlurred => self.on_violation(reasons::WINDOW_BLUR, now_ms),
            _ if self.lock.active => Vec::new(),
            UserIntent::BeginSession | UserIntent::RequestFullscreen => {
                if matches!(self.view(), View::FullscreenGate) {
                    vec![Effect::RequestFullscreen]
                } else {
                    Vec::new()
                }
            }
            UserIntent::FullscreenEntered => {
                let resuming = matches!(
                    self.status.as_ref().map(|record| record.status),
                    Some(StudentStatus::AwaitingFullscreen)
                );
                self.fullscreen_confirmed = true;
                if resuming {
                    vec![Effect::ConfirmResume {
                        lock_version: self.applied_lock_version,
                    }]
                } else {
                    vec![Effect::MergeStatus(
                        StatusPatch::new()
                            .status(StudentStatus::Active)
                            .last_active_at(now_ms),
                    )]
                }
            }
            UserIntent::SelectOption(index) => self.on_select(index),
            UserIntent::ToggleElimination(index) => self.on_toggle_elimination(index),
            UserIntent::Submit => {
                let metacognition = self
                    .session
                    .as_ref()
                    .map(|session| session.metacognition_enabled)
                    .unwrap_or(false);
                if metacognition {
                    // The confidence choice is the submit gesture here.
                    Vec::new()
                } else {
                    self.finalize_submission(None, now_ms)
                }
            }
            UserIntent::ChooseConfidence(level) => {
                if self.staged_for_confidence {
                    self.finalize_submission(Some(level), now_ms)
                } else {
                    Vec::new()
                }
            }
            UserIntent::ForceSubmit => self.finalize_submission(None, now_ms),
        }
    }

    fn on_violation(&mut self, reason: &str, now_ms: i64) -> Vec<Effect> {
        if !self.proctoring_engaged() {
            return Vec::new();
        }
        if self.lock.active {
            // Idempotent re-lock: refresh the displayed reason, report once.
            self.lock.reason = reason.to_string();
            return vec![Effect::PersistLock(self.lock.clone())];
        }
        self.fullscreen_confirmed = false;
        self.lock = LocalLockState::engaged(reason, self.applied_lock_version, now_ms);
        info!(target = "podium::machine", %reason, "violation detected, locking");
        // Fail-closed: the pill is persisted before (and regardless of) the
        // report reaching the backend.
        vec![
            Effect::PersistLock(self.lock.clone()),
            Effect::ReportViolation {
                reason: reason.to_string(),
            },
        ]
    }

    fn proctoring_engaged(&self) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        session.is_secure()
            && !session.status.is_terminal()
            && session.status != SessionStatus::PreLive
            && self.fullscreen_confirmed
    }

    fn on_select(&mut self, index: usize) -> Vec<Effect> {
        let View::QuestionActive(question) = self.view() else {
            return Vec::new();
        };
        if index >= question.options.len() {
            return Vec::new();
        }
        self.selected = Some(index);
        let metacognition = self
            .session
            .as_ref()
            .map(|session| session.metacognition_enabled)
            .unwrap_or(false);
        if metacognition {
            // Stage locally; nothing is written until confidence is chosen.
            self.staged_for_confidence = true;
        }
        Vec::new()
    }

    fn on_toggle_elimination(&mut self, index: usize) -> Vec<Effect> {
        let View::QuestionActive(question) = self.view() else {
            return Vec::new();
        };
        if index >= question.options.len() {
            return Vec::new();
        }
        if !self.eliminated.remove(&index) {
            self.eliminated.insert(index);
        }
        let Some(tag) = self.rendered_tag.clone() else {
            return Vec::new();
        };
        vec![Effect::SaveEliminations {
            tag,
            eliminated: self.eliminated.iter().copied().collect(),
        }]
    }

    fn finalize_submission(&mut self, confidence: Option<ConfidenceLevel>, now_ms: i64) -> Vec<Effect> {
        if !matches!(self.view(), View::QuestionActive(_)) {
            return Vec::new();
        }
        let (Some(identity), Some(session), Some(index)) =
            (&self.identity, &self.session, self.selected)
        else {
            return Vec::new();
        };
        let Some(option) = session.options.get(index) else {
            return Vec::new();
        };
        let tag = session.question_tag();
        let submission = AnswerSubmission::new(
            session.poll_id.clone(),
            session.question_index,
            option.text.clone(),
            identity.email.clone(),
            now_ms,
        )
        .with_answer_id(option.id.clone())
        .with_confidence(confidence);

        self.last_answer = Some(option.text.clone());
        self.submitted_tag = Some(tag.clone());
        self.staged_for_confidence = false;
        info!(
            target = "podium::machine",
            question = session.question_index,
            "answer committed, awaiting next"
        );
        vec![
            Effect::SaveSubmissionGuard(tag),
            Effect::SubmitAnswer(submission),
            Effect::MergeStatus(
                StatusPatch::new()
                    .status(StudentStatus::Submitted)
                    .last_active_at(now_ms),
            ),
        ]
    }

    fn submitted_current_question(&self) -> bool {
        match (&self.submitted_tag, &self.session) {
            (Some(tag), Some(session)) => *tag == session.question_tag(),
            _ => false,
        }
    }

    /// Pure projection of the current state onto one render target,
    /// evaluated in strict priority order.
    pub fn view(&self) -> View {
        if let Some(message) = &self.fatal {
            return View::Fatal {
                message: message.clone(),
            };
        }
        if self.lock.active {
            return View::Locked {
                reason: self.lock.reason.clone(),
            };
        }
        if self.identity.is_none() {
            return View::Entry;
        }
        match self.status.as_ref().map(|record| record.status) {
            Some(StudentStatus::Blocked) => return View::TeacherPaused,
            Some(StudentStatus::AwaitingFullscreen) => return View::AwaitingFullscreenResume,
            _ => {}
        }
        let Some(session) = &self.session else {
            return View::Lobby;
        };
        if session.status.is_terminal() {
            return View::SessionEnded;
        }
        if session.status == SessionStatus::Paused {
            return View::TeacherPaused;
        }
        if self.submitted_current_question() && !session.results_revealed() {
            return View::AwaitingNext;
        }
        if session.results_revealed() {
            return View::Results(self.project_question(session, true));
        }
        if session.status == SessionStatus::PreLive {
            return View::Lobby;
        }
        if session.status == SessionStatus::ResultsHold {
            return View::AwaitingNext;
        }
        if session.is_secure() && !self.fullscreen_confirmed {
            return View::FullscreenGate;
        }
        View::QuestionActive(self.project_question(session, false))
    }

    fn project_question(&self, session: &LiveSessionState, decorated: bool) -> QuestionView {
        let options = session
            .options
            .iter()
            .enumerate()
            .map(|(index, option)| OptionView {
                text: option.text.clone(),
                image_url: option.image_url.clone(),
                eliminated: self.eliminated.contains(&index),
                chosen: self
                    .last_answer
                    .as_ref()
                    .map(|answer| *answer == option.text)
                    .unwrap_or(false)
                    || self.selected == Some(index),
                percentage: if decorated {
                    session
                        .result_percentages
                        .as_ref()
                        .and_then(|percentages| percentages.get(&option.text).copied())
                } else {
                    None
                },
                is_correct: if decorated { option.is_correct } else { None },
            })
            .collect();
        QuestionView {
            question_index: session.question_index,
            question_text: session.question_text.clone(),
            options,
            selected: self.selected,
            awaiting_confidence: self.staged_for_confidence,
            calculator_enabled: session.calculator_enabled,
        }
    }
}

//! Shared wire types for the podium live-polling platform.
//!
//! The remote session tree is shared with non-Rust writers (the teacher
//! console and the callable backend), so every type here serializes with
//! explicit field casing and tolerates missing fields on the way in. Keeping
//! the shapes in a dedicated crate lets the client core and local harnesses
//! consume a single source of truth.

pub mod answer;
pub mod key;
pub mod session;
pub mod status;

pub use answer::{AnswerKey, AnswerSubmission, ConfidenceLevel, SubmissionTelemetry};
pub use key::StudentKey;
pub use session::{
    LiveSessionState, QuestionOption, QuestionTag, ResultsVisibility, SessionKind, SessionStatus,
};
pub use status::{StatusPatch, StudentStatus, StudentStatusRecord};

//! Remote tree layout. Every store path used by the client is built here so
//! the layout stays in one place.

use podium_proto::StudentKey;

/// Live session document, overwritten wholesale on every teacher action.
pub fn live_session(poll_id: &str) -> String {
    format!("sessions/{poll_id}")
}

/// Shared-write status record for one student.
pub fn student_status(poll_id: &str, key: &StudentKey) -> String {
    format!("polls/{poll_id}/students/{key}")
}

/// Private answer record, the source of truth for grading.
pub fn answer(poll_id: &str, question_index: u32, key: &StudentKey) -> String {
    format!("polls/{poll_id}/answers/q{question_index}/{key}")
}

/// Append-only telemetry audit trail for one student.
pub fn audit(poll_id: &str, key: &StudentKey) -> String {
    format!("polls/{poll_id}/audit/{key}")
}

//! Normalised operation outcome surfaced to the protocol layer.
//!
//! Every coordination component and every facade operation reports through
//! [`OperationResult`], so callers never see raw remote errors.

use crate::error::{VsphereError, VsphereErrorKind};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Ok,
    /// Bounded wait exceeded; the remote operation may still complete.
    Timeout,
    NotFound,
    /// Rejected because of current remote state.
    PreconditionFailed,
    /// Definite remote failure; message carries the remote text verbatim.
    RemoteError,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub kind: OutcomeKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl OperationResult {
    pub fn new(kind: OutcomeKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), payload: None }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Ok, message)
    }

    /// A timeout result. The wording always tells the caller the remote
    /// operation may still be running, so it is not mistaken for a failure.
    pub fn timeout(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(
            OutcomeKind::Timeout,
            format!(
                "{message}. The operation may still be in progress on the server and was not cancelled; \
                 check its state before retrying"
            ),
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::NotFound, message)
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::PreconditionFailed, message)
    }

    pub fn remote_error(message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::RemoteError, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Cancelled, message)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.kind == OutcomeKind::Ok
    }

    /// Replace the message of a successful result, keeping any payload.
    /// Non-ok results pass through untouched.
    pub fn on_success(self, message: impl Into<String>) -> Self {
        if self.is_ok() {
            Self { message: message.into(), ..self }
        } else {
            self
        }
    }
}

impl From<VsphereError> for OperationResult {
    fn from(e: VsphereError) -> Self {
        match e.kind {
            VsphereErrorKind::NotFound => Self::not_found(e.message),
            VsphereErrorKind::Timeout => Self::timeout(e.message),
            VsphereErrorKind::InvalidState => Self::precondition_failed(e.message),
            _ => Self::remote_error(e.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timeout_wording_mentions_in_progress() {
        let r = OperationResult::timeout("Task task-7 did not finish within 5s");
        assert_eq!(r.kind, OutcomeKind::Timeout);
        assert!(r.message.contains("may still be in progress"));
    }

    #[test]
    fn remote_message_is_preserved() {
        let r: OperationResult = VsphereError::fault("The operation is not allowed in the current state.").into();
        assert_eq!(r.kind, OutcomeKind::RemoteError);
        assert_eq!(r.message, "The operation is not allowed in the current state.");
    }

    #[test]
    fn error_kinds_map_onto_taxonomy() {
        let r: OperationResult = VsphereError::not_found("gone").into();
        assert_eq!(r.kind, OutcomeKind::NotFound);
        let r: OperationResult = VsphereError::invalid_state("busy").into();
        assert_eq!(r.kind, OutcomeKind::PreconditionFailed);
        let r: OperationResult = VsphereError::connection("refused").into();
        assert_eq!(r.kind, OutcomeKind::RemoteError);
    }

    #[test]
    fn serialises_snake_case_without_empty_payload() {
        let v = serde_json::to_value(OperationResult::precondition_failed("x")).unwrap();
        assert_eq!(v, json!({"kind": "precondition_failed", "message": "x"}));
    }

    #[test]
    fn on_success_keeps_failures() {
        let r = OperationResult::remote_error("boom").on_success("done");
        assert_eq!(r.message, "boom");
        let r = OperationResult::ok("Task completed").with_payload(json!(1)).on_success("done");
        assert_eq!(r.message, "done");
        assert_eq!(r.payload, Some(json!(1)));
    }
}

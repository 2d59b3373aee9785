use crate::call::state::CallStatus;
use thiserror::Error;

/// Failures surfaced by the call controller and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("phone number is required")]
    MissingPhoneNumber,

    #[error("a call is already {0}")]
    CallInProgress(CallStatus),

    #[error("no active call (status: {0})")]
    NoActiveCall(CallStatus),

    #[error("call initiation failed: {0}")]
    Initiation(String),

    #[error("call transport failed: {0}")]
    Transport(String),
}

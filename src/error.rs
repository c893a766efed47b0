//! Error taxonomy for the session engine

use thiserror::Error;

/// Errors returned to the issuer of a command.
///
/// None of these stop the hub or the scheduler; a failed command leaves the
/// authoritative state untouched.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transition not legal from the current state (e.g. Pause while stopped)
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Rejected before reaching the state machine
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unknown IANA timezone; the previous configuration stays active
    #[error("Unknown timezone '{0}'")]
    TimezoneResolution(String),

    /// The session's hub task is gone (shutdown in progress)
    #[error("Session hub unavailable")]
    HubUnavailable,

    /// No confirmation within the acknowledgement window; re-fetch state
    #[error("No acknowledgement within {0}s")]
    AckTimeout(u64),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    /// Stable machine-readable code for clients
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::InvalidTransition(_) => "invalid_transition",
            SyncError::InvalidInput(_) => "invalid_input",
            SyncError::TimezoneResolution(_) => "unknown_timezone",
            SyncError::HubUnavailable => "hub_unavailable",
            SyncError::AckTimeout(_) => "ack_timeout",
            SyncError::Store(_) => "store_error",
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

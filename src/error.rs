//! Crate-wide error type for the clinic ops core.
//!
//! Precondition violations (open clock session, inactive cashier session,
//! unpaid refund, ...) carry user-facing messages and block the action
//! before any write. Storage errors wrap SQLite/lock failures.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OpsError>;

#[derive(Debug, Error)]
pub enum OpsError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Staff member not found: {0}")]
    StaffNotFound(String),

    #[error("You already have an open clock session. Clock out first.")]
    OpenSessionExists,

    #[error("No open clock session to close")]
    NoOpenSession,

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("An active cashier session already exists for this user")]
    SessionAlreadyActive,

    #[error("Cashier session is not active")]
    InactiveSession,

    #[error("Cashier session has already ended")]
    AlreadyEnded,

    #[error("Appointment session id is required")]
    MissingSessionId,

    #[error("You must mark attendance before performing this action")]
    MustMarkAttendance,

    #[error("You must start a cashier session before performing this action")]
    NoCashierSession,

    #[error("Cannot refund an appointment that has not been paid")]
    CannotRefundUnpaid,

    #[error("Cannot change arrival: the doctor session has already been settled")]
    CannotChangeArrival,

    #[error("{0}")]
    Invalid(String),

    #[error("storage: {0}")]
    Storage(String),
}

impl OpsError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        OpsError::NotFound {
            what,
            id: id.into(),
        }
    }
}

impl From<rusqlite::Error> for OpsError {
    fn from(e: rusqlite::Error) -> Self {
        OpsError::Storage(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for OpsError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        OpsError::Storage(format!("connection lock poisoned: {e}"))
    }
}

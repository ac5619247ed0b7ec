//! Error taxonomy surfaced by the dashboard-facing service.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DashboardError {
    /// Caller failed the admin gate on a gated write.
    #[error("FORBIDDEN: {0}")]
    Forbidden(String),
    /// Rejected input, nothing was written.
    #[error("INVALID: {0}")]
    Invalid(String),
    /// A concurrent writer won a race (busy/locked database or a lost insert).
    #[error("TRANSIENT_CONFLICT: {0}")]
    TransientConflict(String),
    #[error("STORAGE: {0}")]
    Storage(String),
}

impl DashboardError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientConflict(_))
    }

    fn is_conflict_code(err: &rusqlite::Error) -> bool {
        matches!(
            err.sqlite_error_code(),
            Some(
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::ConstraintViolation
            )
        )
    }
}

impl From<rusqlite::Error> for DashboardError {
    fn from(value: rusqlite::Error) -> Self {
        if Self::is_conflict_code(&value) {
            Self::TransientConflict(value.to_string())
        } else {
            Self::Storage(value.to_string())
        }
    }
}

impl From<anyhow::Error> for DashboardError {
    fn from(value: anyhow::Error) -> Self {
        let value = match value.downcast::<DashboardError>() {
            Ok(err) => return err,
            Err(value) => value,
        };
        let conflict = value
            .downcast_ref::<rusqlite::Error>()
            .is_some_and(Self::is_conflict_code);
        if conflict {
            Self::TransientConflict(format!("{value:#}"))
        } else {
            Self::Storage(format!("{value:#}"))
        }
    }
}

pub type DashboardResult<T> = Result<T, DashboardError>;

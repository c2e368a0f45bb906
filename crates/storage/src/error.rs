#![forbid(unsafe_code)]

use crate::migrations::MigrationError;
use std::time::Duration;
use thiserror::Error;
use uow_core::ids::ScopeId;
use uow_core::{LockId, LockMode};

#[derive(Debug, Error)]
pub enum ScopeError {
    /// Disposal out of stack order, use of a detached scope before attach,
    /// or use of a scope that is already disposed.
    #[error("scope nesting violation ({scope}): {detail}")]
    ScopeNesting { scope: ScopeId, detail: String },

    #[error("{scope} already completed with success={first}, cannot complete with success={second}")]
    DoubleCompletion {
        scope: ScopeId,
        first: bool,
        second: bool,
    },

    #[error("configuration conflict on {option}: ambient scope uses {established}, nested scope requested {requested}")]
    ConfigurationConflict {
        option: &'static str,
        established: String,
        requested: String,
    },

    #[error("unknown lock target: {id} is not a registered lock")]
    UnknownLockTarget { id: LockId },

    #[error("timed out acquiring {mode} lock on {id} after {waited:?}")]
    LockTimeout {
        id: LockId,
        mode: LockMode,
        waited: Duration,
    },

    /// A thread panicked while holding the local lock table. Neither a
    /// caller bug nor retryable: the process should stop using the provider.
    #[error("lock table poisoned")]
    LockPoisoned,

    #[error("migration plan {plan} failed at step {step} (completed: {completed_steps:?}): {source}")]
    MigrationStepFailure {
        plan: String,
        step: String,
        completed_steps: Vec<String>,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("cannot reach database: {0}")]
    ConnectivityFailure(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ScopeError {
    /// Stable category string, safe to match on from calling code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ScopeNesting { .. } => "SCOPE_NESTING",
            Self::DoubleCompletion { .. } => "DOUBLE_COMPLETION",
            Self::ConfigurationConflict { .. } => "CONFIGURATION_CONFLICT",
            Self::UnknownLockTarget { .. } => "UNKNOWN_LOCK_TARGET",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::LockPoisoned => "LOCK_POISONED",
            Self::MigrationStepFailure { .. } => "MIGRATION_STEP_FAILURE",
            Self::ConnectivityFailure(_) => "CONNECTIVITY_FAILURE",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Sql(_) => "SQLITE",
            Self::Io(_) => "IO",
        }
    }

    /// Caller bugs. These are never retried and never swallowed.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::ScopeNesting { .. }
                | Self::DoubleCompletion { .. }
                | Self::ConfigurationConflict { .. }
                | Self::UnknownLockTarget { .. }
                | Self::InvalidInput(_)
        )
    }

    /// Transient conditions where retrying the whole unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::ConnectivityFailure(_)
        )
    }

    pub(crate) fn nesting(scope: ScopeId, detail: impl Into<String>) -> Self {
        Self::ScopeNesting {
            scope,
            detail: detail.into(),
        }
    }
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_split_caller_bugs_from_transient_failures() {
        let timeout = ScopeError::LockTimeout {
            id: LockId::SERVERS,
            mode: LockMode::Write,
            waited: Duration::from_millis(10),
        };
        assert_eq!(timeout.code(), "LOCK_TIMEOUT");
        assert!(timeout.is_retryable());
        assert!(!timeout.is_programming_error());

        let unknown = ScopeError::UnknownLockTarget {
            id: LockId::new(-666),
        };
        assert_eq!(unknown.code(), "UNKNOWN_LOCK_TARGET");
        assert!(unknown.is_programming_error());
        assert!(!unknown.is_retryable());
        assert_eq!(
            unknown.to_string(),
            "unknown lock target: -666 is not a registered lock"
        );
    }

    #[test]
    fn a_poisoned_lock_table_is_fatal() {
        let poisoned = ScopeError::LockPoisoned;
        assert_eq!(poisoned.code(), "LOCK_POISONED");
        assert!(!poisoned.is_retryable());
        assert!(!poisoned.is_programming_error());
    }
}

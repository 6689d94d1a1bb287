mod context;
mod exit_codes;
mod format;

pub use context::ErrorContext;
pub use exit_codes::get_exit_code;
pub use format::{format_error_chain, format_error_with_color};

use std::fmt;
use thiserror::Error;

/// Why a lock could not be handed out to a waiting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    Timeout,
    Interrupted,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::Timeout => f.write_str("timed out"),
            UnavailableReason::Interrupted => f.write_str("interrupted"),
        }
    }
}

#[derive(Error, Debug)]
pub enum KeylockError {
    #[error("Lock on '{key}' is unavailable: {reason} after {waited_secs:.3}s")]
    LockUnavailable {
        key: String,
        reason: UnavailableReason,
        waited_secs: f64,
    },

    #[error("Lock object for '{key}' was already used to acquire")]
    InvalidHandleReuse { key: String },

    #[error("Lock table inconsistency on '{key}': {details}")]
    InternalInconsistency { key: String, details: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Mutual exclusion violated: {0}")]
    ExclusionViolated(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl KeylockError {
    pub fn is_lock_unavailable(&self) -> bool {
        matches!(self, KeylockError::LockUnavailable { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            KeylockError::LockUnavailable {
                reason: UnavailableReason::Timeout,
                ..
            }
        )
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            KeylockError::LockUnavailable {
                reason: UnavailableReason::Interrupted,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, KeylockError>;

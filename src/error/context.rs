use crate::error::{KeylockError, UnavailableReason};
use std::fmt;

/// An error paired with what the user should know and try next.
pub struct ErrorContext<'a> {
    pub error: &'a KeylockError,
    pub suggestion: Option<String>,
    pub details: Option<String>,
}

fn suggestion_for(error: &KeylockError) -> Option<&'static str> {
    Some(match error {
        KeylockError::LockUnavailable {
            reason: UnavailableReason::Timeout,
            ..
        } => {
            "Another owner still holds this key. Retry with backoff or raise the timeout with \
             --lock-timeout.\nIf the key must not be shared, report the conflict to the caller."
        }
        KeylockError::LockUnavailable {
            reason: UnavailableReason::Interrupted,
            ..
        } => "Rerun the operation once the interruption is resolved.",
        KeylockError::InvalidHandleReuse { .. } => {
            "Create a fresh lock object with LockManager::lock_for for every acquisition."
        }
        KeylockError::InternalInconsistency { .. } => {
            "Run with -vv and report the log output along with the key involved."
        }
        KeylockError::InvalidConfig(_) => {
            "Check keylock.toml and the KEYLOCK_* environment variables.\nLeases and intervals \
             are milliseconds; timeouts accept '250ms', '5s' or 'infinite'."
        }
        KeylockError::ConfigError(_) => "Fix the configuration file syntax and retry.",
        KeylockError::ExclusionViolated(_) => {
            "Rerun the stress command with -vv to capture the interleaving."
        }
        KeylockError::Io(_) | KeylockError::Json(_) => return None,
    })
}

fn details_for(error: &KeylockError) -> Option<String> {
    match error {
        KeylockError::LockUnavailable {
            key,
            reason: UnavailableReason::Timeout,
            waited_secs,
        } => Some(format!("Gave up waiting for '{key}' after {waited_secs:.3}s.")),
        KeylockError::LockUnavailable { key, .. } => {
            Some(format!("The wait for '{key}' was cancelled."))
        }
        KeylockError::InvalidHandleReuse { key } => {
            Some(format!("The lock object for '{key}' is single-use."))
        }
        KeylockError::InternalInconsistency { details, .. } => Some(details.clone()),
        KeylockError::InvalidConfig(message)
        | KeylockError::ConfigError(message)
        | KeylockError::ExclusionViolated(message) => Some(message.clone()),
        KeylockError::Io(_) | KeylockError::Json(_) => None,
    }
}

impl<'a> ErrorContext<'a> {
    pub fn new(error: &'a KeylockError) -> Self {
        Self {
            error,
            suggestion: suggestion_for(error).map(str::to_owned),
            details: details_for(error),
        }
    }

    pub fn with_suggestion(self, suggestion: String) -> Self {
        Self {
            suggestion: Some(suggestion),
            ..self
        }
    }

    pub fn with_details(self, details: String) -> Self {
        Self {
            details: Some(details),
            ..self
        }
    }
}

impl fmt::Display for ErrorContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}", self.error)?;
        if let Some(details) = &self.details {
            write!(f, "\n\nDetails: {details}")?;
        }
        match &self.suggestion {
            Some(suggestion) => write!(f, "\n\nSuggestion: {suggestion}"),
            None => Ok(()),
        }
    }
}

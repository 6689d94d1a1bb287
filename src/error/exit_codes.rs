use crate::error::{KeylockError, UnavailableReason};

pub fn get_exit_code(error: &KeylockError) -> i32 {
    match error {
        KeylockError::InvalidConfig(_) | KeylockError::ConfigError(_) => 2,

        KeylockError::LockUnavailable {
            reason: UnavailableReason::Timeout,
            ..
        } => 75, // EX_TEMPFAIL: the caller may retry later

        KeylockError::LockUnavailable {
            reason: UnavailableReason::Interrupted,
            ..
        } => 130, // Conventional exit code after SIGINT

        KeylockError::InvalidHandleReuse { .. } => 64,

        KeylockError::InternalInconsistency { .. } | KeylockError::ExclusionViolated(_) => 70,

        KeylockError::Io(_) => 74,

        _ => 1,
    }
}

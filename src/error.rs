//! Custom error types for the bridge.
//!
//! This module defines the primary error type, `BridgeError`, for the library
//! surface. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failures the host can see directly: bad
//! configuration, lifecycle misuse (double `begin`), and capability
//! registration conflicts.
//!
//! Failures that occur *inside* a running script take a different route: they
//! are latched onto the session's terminal outcome by the session controller
//! and surfaced through the session report, never as an `Err` from `begin`.
//! Dispatch-level failures have their own type, `DispatchError`, defined next
//! to the dispatcher.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("A session named '{0}' is already running")]
    SessionActive(String),

    #[error("The previous session's teardown has not completed")]
    TeardownPending,

    #[error("A capability is already registered under the identifier '{0}'")]
    DuplicateCapability(String),

    #[error("Duplicate lookup key '{0}' in the capability manifest")]
    DuplicateLookupKey(String),

    #[error("Method '{0}' declares {1} parameters, above the arity ceiling of {2}")]
    ArityCeilingExceeded(String, usize, usize),

    #[error("Session stop was requested and the grace period elapsed")]
    StopEnforced,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::DuplicateCapability("left_motor".to_string());
        assert_eq!(
            err.to_string(),
            "A capability is already registered under the identifier 'left_motor'"
        );
    }

    #[test]
    fn test_lifecycle_error_display() {
        let err = BridgeError::SessionActive("auto".to_string());
        assert!(err.to_string().contains("already running"));
        assert!(BridgeError::TeardownPending.to_string().contains("teardown"));
    }
}

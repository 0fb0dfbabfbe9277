//! Error types and handling for chargeguard
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for chargeguard operations
pub type Result<T> = std::result::Result<T, ChargeGuardError>;

/// Main error type for chargeguard
#[derive(Debug, Error)]
pub enum ChargeGuardError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Telemetry link errors (device missing, read failures)
    #[error("Telemetry error: {message}")]
    Telemetry { message: String },

    /// Relay output rejected a commanded state
    #[error("Actuation error: {message}")]
    Actuation { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl ChargeGuardError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        ChargeGuardError::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        ChargeGuardError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new telemetry error
    pub fn telemetry<S: Into<String>>(message: S) -> Self {
        ChargeGuardError::Telemetry {
            message: message.into(),
        }
    }

    /// Create a new actuation error
    pub fn actuation<S: Into<String>>(message: S) -> Self {
        ChargeGuardError::Actuation {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        ChargeGuardError::Io {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        ChargeGuardError::Generic {
            message: message.into(),
        }
    }

    /// Whether this error belongs to the fatal startup class
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ChargeGuardError::Config { .. } | ChargeGuardError::Validation { .. }
        )
    }
}

impl From<std::io::Error> for ChargeGuardError {
    fn from(err: std::io::Error) -> Self {
        ChargeGuardError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for ChargeGuardError {
    fn from(err: serde_yaml::Error) -> Self {
        ChargeGuardError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ChargeGuardError::config("test config error");
        assert!(matches!(err, ChargeGuardError::Config { .. }));

        let err = ChargeGuardError::actuation("relay stuck");
        assert!(matches!(err, ChargeGuardError::Actuation { .. }));

        let err = ChargeGuardError::validation("field", "test validation error");
        assert!(matches!(err, ChargeGuardError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = ChargeGuardError::config("test error");
        assert_eq!(format!("{}", err), "Configuration error: test error");

        let err = ChargeGuardError::validation("control.low_threshold_v", "must be below high");
        assert_eq!(
            format!("{}", err),
            "Validation error: control.low_threshold_v - must be below high"
        );
    }

    #[test]
    fn test_configuration_class() {
        assert!(ChargeGuardError::config("x").is_configuration());
        assert!(ChargeGuardError::validation("a", "b").is_configuration());
        assert!(!ChargeGuardError::telemetry("gone").is_configuration());
        assert!(!ChargeGuardError::actuation("stuck").is_configuration());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such device");
        let err: ChargeGuardError = io.into();
        assert!(matches!(err, ChargeGuardError::Io { .. }));
        assert!(err.to_string().contains("no such device"));
    }
}

//! Error types and reporting for pipeline stages.

use crate::error::ParleyError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while a stage processes a frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    /// Recoverable error that allows the stage to continue processing.
    #[error("Recoverable error: {0}")]
    Recoverable(String),
    /// A backend call did not answer in time. Recoverable.
    #[error("Timed out after {}ms waiting for {operation}", after.as_millis())]
    Timeout { operation: String, after: Duration },
    /// Fatal error that requires the stage to shut down.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::Fatal(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StageError::Timeout { .. })
    }
}

impl From<ParleyError> for StageError {
    fn from(error: ParleyError) -> Self {
        StageError::Recoverable(error.to_string())
    }
}

/// Trait for reporting stage errors.
pub trait ErrorReporter: Send + Sync {
    /// Reports an error from a stage.
    fn report(&self, stage: &str, error: &StageError);
}

/// Reporter that logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, stage: &str, error: &StageError) {
        if error.is_fatal() {
            tracing::error!(stage, %error, "stage failed");
        } else {
            tracing::warn!(stage, %error, "stage error, continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_display() {
        let recoverable = StageError::Recoverable("temporary failure".to_string());
        assert_eq!(
            recoverable.to_string(),
            "Recoverable error: temporary failure"
        );

        let fatal = StageError::Fatal("critical failure".to_string());
        assert_eq!(fatal.to_string(), "Fatal error: critical failure");

        let timeout = StageError::Timeout {
            operation: "generate".to_string(),
            after: Duration::from_millis(150),
        };
        assert_eq!(
            timeout.to_string(),
            "Timed out after 150ms waiting for generate"
        );
    }

    #[test]
    fn test_classification() {
        assert!(StageError::Fatal("x".to_string()).is_fatal());
        assert!(!StageError::Recoverable("x".to_string()).is_fatal());
        let timeout = StageError::Timeout {
            operation: "synthesize".to_string(),
            after: Duration::from_secs(1),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_fatal());
    }

    #[test]
    fn test_from_crate_error_is_recoverable() {
        let error: StageError = ParleyError::Other("backend hiccup".to_string()).into();
        assert_eq!(error, StageError::Recoverable("backend hiccup".to_string()));
    }

    #[test]
    fn test_log_reporter() {
        let reporter = LogReporter;
        // Just ensure it doesn't panic
        reporter.report("TestStage", &StageError::Recoverable("test error".to_string()));
        reporter.report("TestStage", &StageError::Fatal("test error".to_string()));
    }
}

//! Error types for parley.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParleyError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Pipeline assembly errors
    #[error("Pipeline must contain at least one stage")]
    EmptyPipeline,

    #[error("Duplicate stage name in pipeline: {name}")]
    DuplicateStage { name: String },

    #[error("Invalid pipeline topology: {message}")]
    InvalidTopology { message: String },

    // Backend errors
    #[error("Backend '{stage}' failed: {message}")]
    Backend { stage: String, message: String },

    #[error("Backend '{stage}' timed out after {after_ms}ms")]
    BackendTimeout { stage: String, after_ms: u64 },

    // Transport and task lifecycle errors
    #[error("Transport disconnected")]
    TransportDisconnected,

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Task is not accepting frames (state: {state})")]
    TaskNotAccepting { state: String },

    #[error("Context serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_file_not_found_display() {
        let error = ParleyError::ConfigFileNotFound {
            path: "/path/to/config.toml".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Configuration file not found at /path/to/config.toml"
        );
    }

    #[test]
    fn test_config_invalid_value_display() {
        let error = ParleyError::ConfigInvalidValue {
            key: "pipeline.queue_capacity".to_string(),
            message: "must be greater than zero".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for pipeline.queue_capacity: must be greater than zero"
        );
    }

    #[test]
    fn test_assembly_errors_display() {
        assert_eq!(
            ParleyError::EmptyPipeline.to_string(),
            "Pipeline must contain at least one stage"
        );
        let error = ParleyError::DuplicateStage {
            name: "llm".to_string(),
        };
        assert_eq!(error.to_string(), "Duplicate stage name in pipeline: llm");
    }

    #[test]
    fn test_backend_timeout_display() {
        let error = ParleyError::BackendTimeout {
            stage: "llm".to_string(),
            after_ms: 250,
        };
        assert_eq!(error.to_string(), "Backend 'llm' timed out after 250ms");
    }

    #[test]
    fn test_task_not_accepting_display() {
        let error = ParleyError::TaskNotAccepting {
            state: "Stopped".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Task is not accepting frames (state: Stopped)"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: ParleyError = io_error.into();
        assert!(matches!(error, ParleyError::Io(_)));
        assert!(error.to_string().starts_with("I/O error:"));
    }

    #[test]
    fn test_toml_error_conversion() {
        let parse: std::result::Result<toml::Table, toml::de::Error> = toml::from_str("[broken");
        let error: ParleyError = parse.unwrap_err().into();
        assert!(matches!(error, ParleyError::Config(_)));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<ParleyError>();
        assert_sync::<ParleyError>();
    }
}

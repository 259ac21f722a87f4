//! parley - Real-time conversational media pipelines
//!
//! Frames flow through a chain of concurrently running stages. Interruptions
//! preempt in-flight work, and paired aggregators keep the dialogue context
//! in step with what the assistant actually said.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

#[cfg(feature = "cli")]
pub mod chat;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod context;
pub mod defaults;
pub mod error;
pub mod interruption;
pub mod pipeline;
pub mod services;
pub mod transport;

// Composition root - needs everything
pub mod app;

// Core traits (stage → backend → transport)
pub use pipeline::stage::Stage;
pub use services::{LanguageModel, SpeechRecognizer, SpeechSynthesizer};
pub use transport::{Transport, TransportEventHandler};

// Frames
pub use pipeline::types::{
    AudioChunk, ControlSignal, ErrorSignal, Frame, FrameKind, TranscriptDelta, TurnId,
};

// Pipeline, task and runner
pub use pipeline::orchestrator::{Pipeline, PipelineBuilder, PipelineConfig, PipelineHandle};
pub use pipeline::runner::PipelineRunner;
pub use pipeline::task::{PipelineTask, StopReason, TaskHandle, TaskParams, TaskReport, TaskState};

// Context and interruption
pub use context::{ContextAggregatorPair, ConversationContext, Role, SharedContext, Turn};
pub use interruption::{InterruptionPolicy, InterruptionStrategy};

// Error handling
pub use error::{ParleyError, Result};
pub use pipeline::error::{ErrorReporter, StageError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }

    #[test]
    fn version_string_has_hash_suffix_only_with_git_hash() {
        let ver = version_string();
        match option_env!("GIT_HASH") {
            Some(hash) if !hash.is_empty() => {
                assert_eq!(ver, format!("{}+{}", env!("CARGO_PKG_VERSION"), hash));
            }
            _ => assert_eq!(ver, env!("CARGO_PKG_VERSION")),
        }
    }
}

//! Backend-facing stages: recognition, generation and synthesis.
//!
//! Each module defines the pipeline-facing trait a backend implements, the
//! stage that drives it, and a scriptable mock backend.

pub mod llm;
pub mod stt;
pub mod tts;

pub use llm::{GenerationStage, LanguageModel, MockLanguageModel};
pub use stt::{MockRecognizer, Recognition, RecognitionStage, SpeechRecognizer};
pub use tts::{MockSynthesizer, SpeechSynthesizer, SynthesisStage};

use crate::pipeline::error::StageError;
use std::future::Future;
use std::time::Duration;

/// Awaits one backend step, converting an elapsed timeout into a
/// [`StageError::Timeout`].
pub(crate) async fn with_timeout<T>(
    operation: &str,
    after: Duration,
    step: impl Future<Output = T>,
) -> Result<T, StageError> {
    tokio::time::timeout(after, step)
        .await
        .map_err(|_| StageError::Timeout {
            operation: operation.to_string(),
            after,
        })
}

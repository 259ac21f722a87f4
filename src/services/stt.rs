//! Speech recognition stage.

use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::pipeline::error::StageError;
use crate::pipeline::stage::{Stage, StageContext};
use crate::pipeline::types::{AudioChunk, ControlSignal, Frame, FrameKind, TranscriptDelta};
use crate::services::with_timeout;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One recognition result for the current utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recognition {
    pub text: String,
    /// The utterance is complete; no further results refer to it.
    pub is_final: bool,
}

impl Recognition {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn complete(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Trait for speech-to-text backends.
///
/// Fed audio chunk by chunk; returns whatever text became available.
#[async_trait]
pub trait SpeechRecognizer: Send {
    fn name(&self) -> &str;

    /// Feeds one chunk of user audio.
    ///
    /// # Returns
    /// Zero or more results. Partial results carry only new words.
    async fn recognize(&mut self, audio: &AudioChunk) -> Result<Vec<Recognition>>;
}

/// Wraps a [`SpeechRecognizer`]: consumes user audio, emits user
/// transcripts and an `EndOfTurn` after each final result.
pub struct RecognitionStage {
    recognizer: Box<dyn SpeechRecognizer>,
    timeout: Duration,
    in_utterance: bool,
}

impl RecognitionStage {
    pub fn new(recognizer: impl SpeechRecognizer + 'static) -> Self {
        Self {
            recognizer: Box::new(recognizer),
            timeout: Duration::from_millis(defaults::BACKEND_TIMEOUT_MS),
            in_utterance: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Stage for RecognitionStage {
    fn name(&self) -> &str {
        "stt"
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> std::result::Result<(), StageError> {
        // Assistant audio is not ours to recognize.
        let FrameKind::Audio(chunk) = frame.kind() else {
            return ctx.push(frame).await;
        };
        if frame.turn().is_some() {
            return ctx.push(frame).await;
        }

        let results = with_timeout("recognize", self.timeout, self.recognizer.recognize(chunk))
            .await?
            .map_err(|e| StageError::Recoverable(e.to_string()))?;

        for result in results {
            if !self.in_utterance {
                self.in_utterance = true;
                ctx.emit(FrameKind::Control(ControlSignal::UserStartedSpeaking))
                    .await?;
            }
            let is_final = result.is_final;
            ctx.emit(FrameKind::Transcript(TranscriptDelta::user(
                result.text,
                is_final,
            )))
            .await?;
            if is_final {
                self.in_utterance = false;
                ctx.emit(FrameKind::Control(ControlSignal::UserStoppedSpeaking))
                    .await?;
                ctx.emit(FrameKind::Control(ControlSignal::EndOfTurn)).await?;
            }
        }
        Ok(())
    }
}

/// Shared queue of scripted recognition results.
///
/// Each audio chunk fed to the recognizer pops one entry; an empty queue
/// yields no results.
#[derive(Debug, Clone, Default)]
pub struct RecognizerScript {
    queue: Arc<Mutex<VecDeque<Vec<Recognition>>>>,
}

impl RecognizerScript {
    /// Results for the next audio chunk.
    pub fn push(&self, results: Vec<Recognition>) {
        self.queue.lock().push_back(results);
    }

    /// A complete utterance, recognized from the next audio chunk.
    pub fn push_utterance(&self, text: &str) {
        self.push(vec![Recognition::complete(text)]);
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Mock recognizer for testing
#[derive(Debug, Clone)]
pub struct MockRecognizer {
    script: RecognizerScript,
    delay: Duration,
    failure: Option<String>,
}

impl MockRecognizer {
    pub fn new() -> Self {
        Self {
            script: RecognizerScript::default(),
            delay: Duration::ZERO,
            failure: None,
        }
    }

    /// Configure the results returned for successive audio chunks
    pub fn with_script(self, chunks: Vec<Vec<Recognition>>) -> Self {
        for results in chunks {
            self.script.push(results);
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Configure the mock to fail every call
    pub fn with_failure(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Handle for scripting results while the recognizer runs.
    pub fn script(&self) -> RecognizerScript {
        self.script.clone()
    }
}

impl Default for MockRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechRecognizer for MockRecognizer {
    fn name(&self) -> &str {
        "mock-recognizer"
    }

    async fn recognize(&mut self, _audio: &AudioChunk) -> Result<Vec<Recognition>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(ParleyError::Backend {
                stage: "stt".to_string(),
                message: message.clone(),
            });
        }
        Ok(self.script.queue.lock().pop_front().unwrap_or_default())
    }
}

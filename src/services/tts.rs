//! Speech synthesis stage.

use crate::context::Role;
use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::pipeline::error::StageError;
use crate::pipeline::stage::{Stage, StageContext};
use crate::pipeline::types::{
    AudioChunk, ControlSignal, FailedResponse, Frame, FrameKind, TranscriptDelta, TurnId,
};
use crate::services::with_timeout;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Trait for text-to-speech backends.
pub trait SpeechSynthesizer: Send {
    fn name(&self) -> &str;

    /// Renders `text` as a lazy stream of audio chunks. Dropping the stream
    /// cancels the synthesis.
    fn synthesize(&mut self, text: &str) -> BoxStream<'static, Result<AudioChunk>>;
}

/// Wraps a [`SpeechSynthesizer`].
///
/// Assistant text is buffered until a sentence boundary (or the end of the
/// response), then each sentence is synthesized. The stage emits the audio
/// followed by the sentence text, both tagged with the response turn, so
/// downstream stages only see text that was actually voiced. Text still
/// queued for a response that failed upstream is not synthesized.
pub struct SynthesisStage {
    synthesizer: Box<dyn SpeechSynthesizer>,
    timeout: Duration,
    buffer: String,
    turn: Option<TurnId>,
    failed: FailedResponse,
}

impl SynthesisStage {
    pub fn new(synthesizer: impl SpeechSynthesizer + 'static) -> Self {
        Self {
            synthesizer: Box::new(synthesizer),
            timeout: Duration::from_millis(defaults::BACKEND_TIMEOUT_MS),
            buffer: String::new(),
            turn: None,
            failed: FailedResponse::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Text received but not yet synthesized.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    async fn speak(&mut self, sentence: String, ctx: &StageContext) -> std::result::Result<(), StageError> {
        if sentence.trim().is_empty() {
            return Ok(());
        }
        tracing::trace!(turn = ?self.turn, chars = sentence.len(), "synthesizing sentence");
        let mut audio = self.synthesizer.synthesize(&sentence);
        while let Some(chunk) = with_timeout("synthesize", self.timeout, audio.next()).await? {
            let chunk = chunk.map_err(|e| StageError::Recoverable(e.to_string()))?;
            ctx.emit_for_turn(self.turn, FrameKind::Audio(chunk)).await?;
        }
        ctx.emit_for_turn(
            self.turn,
            FrameKind::Transcript(TranscriptDelta::assistant(sentence)),
        )
        .await
    }
}

/// Byte offset just past the first sentence terminator that is followed by
/// whitespace, including that whitespace.
fn sentence_end(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        if let Some(&(at, next)) = chars.peek()
            && next.is_whitespace()
        {
            return Some(at + next.len_utf8());
        }
    }
    None
}

#[async_trait]
impl Stage for SynthesisStage {
    fn name(&self) -> &str {
        "tts"
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> std::result::Result<(), StageError> {
        if self.failed.covers(&frame) {
            return match frame.kind() {
                FrameKind::Transcript(delta) if delta.role == Role::Assistant => Ok(()),
                _ => ctx.push(frame).await,
            };
        }
        match frame.kind() {
            FrameKind::Transcript(delta) if delta.role == Role::Assistant => {
                if frame.turn() != self.turn {
                    self.buffer.clear();
                    self.turn = frame.turn();
                }
                self.buffer.push_str(&delta.text);
                while let Some(end) = sentence_end(&self.buffer) {
                    let rest = self.buffer.split_off(end);
                    let sentence = std::mem::replace(&mut self.buffer, rest);
                    self.speak(sentence, ctx).await?;
                }
                Ok(())
            }
            FrameKind::Control(ControlSignal::ResponseStart) => {
                self.buffer.clear();
                self.turn = frame.turn();
                ctx.push(frame).await
            }
            FrameKind::Control(ControlSignal::ResponseComplete) => {
                let rest = std::mem::take(&mut self.buffer);
                self.speak(rest, ctx).await?;
                ctx.push(frame).await
            }
            FrameKind::Control(ControlSignal::Error(_)) => {
                if let Some(turn) = self.failed.record(&frame)
                    && self.turn == Some(turn)
                {
                    tracing::debug!(turn, chars = self.buffer.len(), "dropping text of failed response");
                    self.buffer.clear();
                    self.turn = None;
                }
                ctx.push(frame).await
            }
            _ => ctx.push(frame).await,
        }
    }

    fn on_interrupt(&mut self) {
        if !self.buffer.is_empty() {
            tracing::debug!(chars = self.buffer.len(), "dropping unsynthesized text");
        }
        self.buffer.clear();
        self.turn = None;
    }
}

/// Mock synthesizer for testing
///
/// Renders each sentence as a fixed number of 20 ms tone chunks and records
/// what it was asked to say.
#[derive(Debug, Clone)]
pub struct MockSynthesizer {
    chunks_per_sentence: usize,
    chunk_delay: Duration,
    sample_rate: u32,
    failure: Option<String>,
    spoken: Arc<Mutex<Vec<String>>>,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self {
            chunks_per_sentence: 2,
            chunk_delay: Duration::ZERO,
            sample_rate: defaults::SAMPLE_RATE,
            failure: None,
            spoken: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_chunks_per_sentence(mut self, chunks: usize) -> Self {
        self.chunks_per_sentence = chunks;
        self
    }

    /// Delay before each chunk, simulating real-time rendering.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Configure the mock to fail every call
    pub fn with_failure(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Sentences passed to `synthesize`, shared with clones.
    pub fn spoken(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.spoken)
    }

    fn tone(&self) -> AudioChunk {
        let len = (self.sample_rate / 50) as usize;
        let samples = (0..len)
            .map(|i| if (i / 8) % 2 == 0 { 4000 } else { -4000 })
            .collect();
        AudioChunk::new(samples, self.sample_rate)
    }
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechSynthesizer for MockSynthesizer {
    fn name(&self) -> &str {
        "mock-synthesizer"
    }

    fn synthesize(&mut self, text: &str) -> BoxStream<'static, Result<AudioChunk>> {
        self.spoken.lock().push(text.to_string());
        if let Some(message) = &self.failure {
            let error = ParleyError::Backend {
                stage: "tts".to_string(),
                message: message.clone(),
            };
            return stream::once(async move { Err(error) }).boxed();
        }
        let tone = self.tone();
        let delay = self.chunk_delay;
        stream::iter(0..self.chunks_per_sentence)
            .then(move |_| {
                let chunk = tone.clone();
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(chunk)
                }
            })
            .boxed()
    }
}

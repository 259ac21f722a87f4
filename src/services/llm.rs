//! Response generation stage.

use crate::context::ContextSnapshot;
use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::pipeline::error::StageError;
use crate::pipeline::stage::{Stage, StageContext};
use crate::pipeline::types::{ControlSignal, Frame, FrameKind, TranscriptDelta};
use crate::services::with_timeout;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Trait for text generation backends.
pub trait LanguageModel: Send {
    fn name(&self) -> &str;

    /// Starts generating a reply to `context`.
    ///
    /// The stream is lazy and not resumable: dropping it cancels the
    /// generation, and a retry needs a fresh call.
    fn generate(&mut self, context: &ContextSnapshot) -> BoxStream<'static, Result<String>>;
}

/// Wraps a [`LanguageModel`]: turns each context snapshot into
/// `ResponseStart`, a sequence of assistant text deltas and
/// `ResponseComplete`, all tagged with the snapshot's turn.
pub struct GenerationStage {
    model: Box<dyn LanguageModel>,
    timeout: Duration,
}

impl GenerationStage {
    pub fn new(model: impl LanguageModel + 'static) -> Self {
        Self {
            model: Box::new(model),
            timeout: Duration::from_millis(defaults::BACKEND_TIMEOUT_MS),
        }
    }

    /// Timeout for the first token and for each following token.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Stage for GenerationStage {
    fn name(&self) -> &str {
        "llm"
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> std::result::Result<(), StageError> {
        let FrameKind::Context(snapshot) = frame.kind() else {
            return ctx.push(frame).await;
        };
        let turn = frame.turn();
        tracing::debug!(turn = ?turn, turns = snapshot.len(), "generating response");

        ctx.emit_for_turn(turn, FrameKind::Control(ControlSignal::ResponseStart))
            .await?;
        let mut tokens = self.model.generate(snapshot);
        while let Some(token) = with_timeout("generate", self.timeout, tokens.next()).await? {
            let text = token.map_err(|e| StageError::Recoverable(e.to_string()))?;
            ctx.emit_for_turn(turn, FrameKind::Transcript(TranscriptDelta::assistant(text)))
                .await?;
        }
        ctx.emit_for_turn(turn, FrameKind::Control(ControlSignal::ResponseComplete))
            .await
    }
}

#[derive(Debug, Clone)]
enum Behavior {
    Reply(String),
    /// Replies "You said: <last user turn>".
    Echo,
    Hang,
    /// Streams the reply, then never finishes.
    Stall(String),
    Fail(String),
}

/// Mock language model for testing
///
/// Streams its reply word by word, each word keeping its trailing space so
/// the deltas concatenate back to the reply.
#[derive(Debug, Clone)]
pub struct MockLanguageModel {
    behavior: Behavior,
    token_delay: Duration,
    received: Arc<Mutex<Vec<ContextSnapshot>>>,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self {
            behavior: Behavior::Reply("Hello! How can I help you today?".to_string()),
            token_delay: Duration::ZERO,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Configure the mock to return a specific reply
    pub fn with_reply(mut self, reply: &str) -> Self {
        self.behavior = Behavior::Reply(reply.to_string());
        self
    }

    /// Reply by repeating the last user turn.
    pub fn echo(mut self) -> Self {
        self.behavior = Behavior::Echo;
        self
    }

    /// Never produce a token.
    pub fn with_hang(mut self) -> Self {
        self.behavior = Behavior::Hang;
        self
    }

    /// Stream `reply`, then stop producing tokens without completing.
    pub fn with_stalled_reply(mut self, reply: &str) -> Self {
        self.behavior = Behavior::Stall(reply.to_string());
        self
    }

    /// Configure the mock to fail every call
    pub fn with_failure(mut self, message: &str) -> Self {
        self.behavior = Behavior::Fail(message.to_string());
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Snapshots passed to `generate`, shared with clones.
    pub fn received(&self) -> Arc<Mutex<Vec<ContextSnapshot>>> {
        Arc::clone(&self.received)
    }
}

impl Default for MockLanguageModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits text into words that keep their trailing whitespace.
pub(crate) fn word_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_whitespace() {
            current.push(c);
        } else {
            if current.chars().last().is_some_and(char::is_whitespace) {
                tokens.push(std::mem::take(&mut current));
            }
            current.push(c);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

impl LanguageModel for MockLanguageModel {
    fn name(&self) -> &str {
        "mock-llm"
    }

    fn generate(&mut self, context: &ContextSnapshot) -> BoxStream<'static, Result<String>> {
        self.received.lock().push(context.clone());
        let (reply, stall) = match &self.behavior {
            Behavior::Reply(reply) => (reply.clone(), false),
            Behavior::Stall(reply) => (reply.clone(), true),
            Behavior::Echo => match context.last_user() {
                Some(text) => (format!("You said: {text}"), false),
                None => ("Hello! I am listening.".to_string(), false),
            },
            Behavior::Hang => return stream::pending().boxed(),
            Behavior::Fail(message) => {
                let error = ParleyError::Backend {
                    stage: "llm".to_string(),
                    message: message.clone(),
                };
                return stream::once(async move { Err(error) }).boxed();
            }
        };
        let delay = self.token_delay;
        let tokens = stream::iter(word_tokens(&reply)).then(move |token| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(token)
        });
        if stall {
            tokens.chain(stream::pending()).boxed()
        } else {
            tokens.boxed()
        }
    }
}

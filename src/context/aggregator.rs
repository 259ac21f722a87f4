//! User and assistant context aggregators.
//!
//! The user aggregator sits between recognition and generation; it turns a
//! finished user utterance into a committed turn and a context snapshot.
//! The assistant aggregator sits at the end of the chain; it collects the
//! text that was actually spoken and commits it when the response completes.

use crate::context::{Role, SharedContext};
use crate::pipeline::error::StageError;
use crate::pipeline::stage::{Stage, StageContext};
use crate::pipeline::types::{ControlSignal, FailedResponse, Frame, FrameKind, TurnId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What happens to assistant text that was spoken before an interruption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptedTurnPolicy {
    /// The pending assistant turn is dropped; the context never sees it.
    #[default]
    Discard,
    /// The spoken prefix is committed with `partial = true`.
    MarkPartial,
}

#[derive(Debug)]
struct PendingTurn {
    turn: Option<TurnId>,
    text: String,
}

/// The assistant turn being spoken, shared by both halves of a pair.
///
/// Whichever aggregator notices the interruption first settles the turn,
/// so a partial assistant turn is always committed before the user turn
/// that cut it off.
#[derive(Debug, Clone)]
struct SpokenTurn {
    context: SharedContext,
    policy: InterruptedTurnPolicy,
    pending: Arc<Mutex<Option<PendingTurn>>>,
}

impl SpokenTurn {
    fn new(context: SharedContext, policy: InterruptedTurnPolicy) -> Self {
        Self {
            context,
            policy,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Applies the interrupted-turn policy to whatever is pending.
    fn settle(&self) {
        let Some(pending) = self.pending.lock().take() else {
            return;
        };
        match self.policy {
            InterruptedTurnPolicy::Discard => {
                tracing::debug!(text = %pending.text, "discarded interrupted assistant turn");
            }
            InterruptedTurnPolicy::MarkPartial => {
                if self.context.commit_partial(&pending.text) {
                    tracing::debug!(text = %pending.text, "committed partial assistant turn");
                }
            }
        }
    }

    /// Settles the pending turn only if it belongs to a cancelled turn.
    fn settle_if_stale(&self, ctx: &StageContext) {
        let stale = self
            .pending
            .lock()
            .as_ref()
            .is_some_and(|p| ctx.shared().turns().is_stale_turn(p.turn));
        if stale {
            self.settle();
        }
    }
}

/// Builds the two aggregators over one shared context.
#[derive(Debug, Clone)]
pub struct ContextAggregatorPair {
    context: SharedContext,
    policy: InterruptedTurnPolicy,
}

impl ContextAggregatorPair {
    pub fn new(context: SharedContext, policy: InterruptedTurnPolicy) -> Self {
        Self { context, policy }
    }

    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    pub fn into_parts(self) -> (UserAggregator, AssistantAggregator) {
        let spoken = SpokenTurn::new(self.context.clone(), self.policy);
        let user = UserAggregator {
            context: self.context,
            pending: Vec::new(),
            spoken: Some(spoken.clone()),
        };
        let assistant = AssistantAggregator {
            spoken,
            failed: FailedResponse::default(),
        };
        (user, assistant)
    }
}

/// Accumulates user transcripts into a pending turn.
///
/// A turn that ends while the assistant is audibly speaking is dropped.
/// A turn that ends while a response is still being generated, before any
/// of it was played, is committed and sent on as a new snapshot in the same
/// response turn: the pending reply plays, then the reply to the updated
/// context.
#[derive(Debug)]
pub struct UserAggregator {
    context: SharedContext,
    pending: Vec<String>,
    /// Assistant side of the pair, if built as one.
    spoken: Option<SpokenTurn>,
}

impl UserAggregator {
    pub fn new(context: SharedContext) -> Self {
        Self {
            context,
            pending: Vec::new(),
            spoken: None,
        }
    }

    /// Text of the pending (uncommitted) user turn.
    pub fn pending(&self) -> String {
        self.pending.join(" ")
    }
}

#[async_trait]
impl Stage for UserAggregator {
    fn name(&self) -> &str {
        "user-aggregator"
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> Result<(), StageError> {
        match frame.kind() {
            FrameKind::Transcript(delta) if delta.role == Role::User => {
                let text = delta.text.trim();
                if !text.is_empty() {
                    self.pending.push(text.to_string());
                }
                ctx.push(frame).await
            }
            FrameKind::Control(ControlSignal::EndOfTurn) => {
                let text = self.pending();
                self.pending.clear();
                if text.is_empty() {
                    return Ok(());
                }
                if ctx.assistant_speaking() {
                    tracing::debug!(%text, "user spoke over the assistant, dropping turn");
                    return Ok(());
                }
                if let Some(spoken) = &self.spoken {
                    spoken.settle_if_stale(ctx);
                }
                self.context.commit(Role::User, &text);
                tracing::debug!(%text, "committed user turn");
                ctx.emit(self.context.context_frame()).await
            }
            _ => ctx.push(frame).await,
        }
    }
}

/// Accumulates spoken assistant text and commits it on completion.
#[derive(Debug)]
pub struct AssistantAggregator {
    spoken: SpokenTurn,
    /// Response whose generation failed; its frames are ignored.
    failed: FailedResponse,
}

impl AssistantAggregator {
    pub fn new(context: SharedContext, policy: InterruptedTurnPolicy) -> Self {
        Self {
            spoken: SpokenTurn::new(context, policy),
            failed: FailedResponse::default(),
        }
    }

    /// Text of the pending (uncommitted) assistant turn, if any.
    pub fn pending(&self) -> Option<String> {
        self.spoken.pending.lock().as_ref().map(|p| p.text.clone())
    }
}

#[async_trait]
impl Stage for AssistantAggregator {
    fn name(&self) -> &str {
        "assistant-aggregator"
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> Result<(), StageError> {
        if self.failed.covers(&frame) {
            return ctx.push(frame).await;
        }
        match frame.kind() {
            FrameKind::Control(ControlSignal::ResponseStart) => {
                let mut pending = self.spoken.pending.lock();
                if let Some(leftover) = pending.take() {
                    tracing::debug!(text = %leftover.text, "dropping unfinished assistant turn");
                }
                *pending = Some(PendingTurn {
                    turn: frame.turn(),
                    text: String::new(),
                });
            }
            FrameKind::Transcript(delta) if delta.role == Role::Assistant => {
                if let Some(pending) = self.spoken.pending.lock().as_mut()
                    && pending.turn == frame.turn()
                {
                    pending.text.push_str(&delta.text);
                }
            }
            FrameKind::Control(ControlSignal::ResponseComplete) => {
                let pending = self.spoken.pending.lock().take();
                if let Some(pending) = pending
                    && self.spoken.context.commit(Role::Assistant, &pending.text)
                {
                    tracing::debug!(text = %pending.text.trim(), "committed assistant turn");
                }
            }
            FrameKind::Control(ControlSignal::Error(_)) => {
                if let Some(turn) = self.failed.record(&frame) {
                    let mut pending = self.spoken.pending.lock();
                    if pending.as_ref().is_some_and(|p| p.turn == Some(turn)) {
                        *pending = None;
                        tracing::debug!(turn, "discarded assistant turn after error");
                    }
                }
            }
            _ => {}
        }
        ctx.push(frame).await
    }

    fn on_interrupt(&mut self) {
        self.spoken.settle();
    }
}

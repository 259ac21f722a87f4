//! Conversation context: the ordered dialogue history shared by the
//! aggregators and read by the generation stage.

pub mod aggregator;

pub use aggregator::{
    AssistantAggregator, ContextAggregatorPair, InterruptedTurnPolicy, UserAggregator,
};

use crate::error::Result;
use crate::pipeline::types::FrameKind;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One contiguous utterance attributed to a single role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Set on assistant turns cut short by an interruption.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            partial: false,
        }
    }
}

/// Ordered dialogue history.
///
/// Committed user and assistant turns always alternate: committing a turn
/// with the same role as the last dialogue turn extends that turn. System
/// messages sit outside the alternation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    turns: Vec<Turn>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(prompt: &str) -> Self {
        let mut context = Self::new();
        context.push_system(prompt);
        context
    }

    /// Rebuilds a context by committing `turns` in order.
    pub fn replay(turns: impl IntoIterator<Item = Turn>) -> Self {
        let mut context = Self::new();
        for turn in turns {
            context.commit_turn(turn);
        }
        context
    }

    /// Appends a system message. Empty messages are ignored.
    pub fn push_system(&mut self, content: &str) -> bool {
        self.commit_turn(Turn::new(Role::System, content))
    }

    /// Commits a complete turn. Returns false if nothing was added.
    pub fn commit(&mut self, role: Role, content: &str) -> bool {
        self.commit_turn(Turn::new(role, content))
    }

    /// Commits assistant text that was cut short by an interruption.
    pub fn commit_partial(&mut self, content: &str) -> bool {
        self.commit_turn(Turn {
            role: Role::Assistant,
            content: content.to_string(),
            partial: true,
        })
    }

    pub fn commit_turn(&mut self, turn: Turn) -> bool {
        let content = turn.content.trim();
        if content.is_empty() {
            return false;
        }
        if turn.role == Role::System {
            self.turns.push(Turn {
                content: content.to_string(),
                ..turn
            });
            return true;
        }
        if let Some(last) = self.turns.iter_mut().rev().find(|t| t.role != Role::System)
            && last.role == turn.role
        {
            last.content.push(' ');
            last.content.push_str(content);
            last.partial = turn.partial;
            return true;
        }
        self.turns.push(Turn {
            content: content.to_string(),
            ..turn
        });
        true
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// User and assistant turns, without system messages.
    pub fn dialogue(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|t| t.role != Role::System)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Read-only copy of the committed history.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            turns: self.turns.as_slice().into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: ConversationContext = serde_json::from_str(json)?;
        Ok(Self::replay(parsed.turns))
    }
}

/// A committed, read-only view of conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnapshot {
    turns: Arc<[Turn]>,
}

impl ContextSnapshot {
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn dialogue(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|t| t.role != Role::System)
    }

    /// Content of the most recent user turn.
    pub fn last_user(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
    }
}

/// Conversation context shared between the aggregators, the generation
/// stage and the application.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    inner: Arc<RwLock<ConversationContext>>,
}

impl SharedContext {
    pub fn new(context: ConversationContext) -> Self {
        Self {
            inner: Arc::new(RwLock::new(context)),
        }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.inner.read().snapshot()
    }

    /// A frame carrying the current snapshot; queuing it triggers a response.
    pub fn context_frame(&self) -> FrameKind {
        FrameKind::Context(self.snapshot())
    }

    pub fn add_system_message(&self, content: &str) -> bool {
        self.inner.write().push_system(content)
    }

    pub fn commit(&self, role: Role, content: &str) -> bool {
        self.inner.write().commit(role, content)
    }

    pub fn commit_partial(&self, content: &str) -> bool {
        self.inner.write().commit_partial(content)
    }

    /// Runs `f` with read access to the context.
    pub fn read<T>(&self, f: impl FnOnce(&ConversationContext) -> T) -> T {
        f(&self.inner.read())
    }

    /// Copy of the full context.
    pub fn get(&self) -> ConversationContext {
        self.inner.read().clone()
    }

    pub fn to_json(&self) -> Result<String> {
        self.inner.read().to_json()
    }
}

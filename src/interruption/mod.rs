//! Interruption strategies.
//!
//! A strategy looks at user-speech evidence while the assistant is speaking
//! and decides whether the user has said enough to cut the assistant off.
//! Strategies are small `evaluate` / `reset` capabilities; the task-owned
//! [`InterruptionController`] feeds them and runs the cancel sequence.

pub mod clock;
pub mod controller;

pub use clock::{Clock, MockClock, SystemClock};
pub use controller::InterruptionController;

use crate::defaults;
use crate::pipeline::types::{Frame, FrameKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Result of evaluating one piece of evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Interrupt,
}

/// Evidence accumulated since the assistant last started speaking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterruptionState {
    /// Words recognized in consecutive user transcripts.
    pub words: usize,
    /// Consecutive voiced user audio frames.
    pub voiced_frames: usize,
    /// When the last user-speech evidence was seen.
    pub last_evidence: Option<Instant>,
}

impl InterruptionState {
    pub fn is_reset(&self) -> bool {
        self.words == 0 && self.voiced_frames == 0
    }
}

pub trait InterruptionStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Folds one user-speech frame into `state` and decides.
    fn evaluate(&self, state: &mut InterruptionState, evidence: &Frame) -> Decision;

    /// Whether `frame` shows the user actually talking. Only such frames
    /// hold off the silence reset; quiet microphone audio does not.
    fn is_evidence(&self, frame: &Frame) -> bool {
        match frame.kind() {
            FrameKind::Transcript(delta) => delta.word_count() > 0,
            _ => false,
        }
    }

    fn reset(&self, state: &mut InterruptionState) {
        *state = InterruptionState::default();
    }
}

/// Built-in strategies, selectable from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterruptionPolicy {
    /// Interrupt once the user said at least `min_words` words.
    MinWords { min_words: usize },
    /// Interrupt after `min_frames` consecutive user audio frames whose
    /// energy exceeds `energy_threshold`.
    VoiceActivity {
        energy_threshold: f32,
        min_frames: usize,
    },
}

impl InterruptionPolicy {
    pub fn min_words(min_words: usize) -> Self {
        InterruptionPolicy::MinWords { min_words }
    }

    pub fn voice_activity(energy_threshold: f32, min_frames: usize) -> Self {
        InterruptionPolicy::VoiceActivity {
            energy_threshold,
            min_frames,
        }
    }
}

impl Default for InterruptionPolicy {
    fn default() -> Self {
        InterruptionPolicy::MinWords {
            min_words: defaults::MIN_WORDS,
        }
    }
}

impl InterruptionStrategy for InterruptionPolicy {
    fn name(&self) -> &'static str {
        match self {
            InterruptionPolicy::MinWords { .. } => "min_words",
            InterruptionPolicy::VoiceActivity { .. } => "voice_activity",
        }
    }

    fn evaluate(&self, state: &mut InterruptionState, evidence: &Frame) -> Decision {
        match (self, evidence.kind()) {
            (InterruptionPolicy::MinWords { min_words }, FrameKind::Transcript(delta)) => {
                state.words += delta.word_count();
                if state.words >= *min_words {
                    Decision::Interrupt
                } else {
                    Decision::Continue
                }
            }
            (
                InterruptionPolicy::VoiceActivity {
                    energy_threshold,
                    min_frames,
                },
                FrameKind::Audio(chunk),
            ) => {
                if chunk.rms() >= *energy_threshold {
                    state.voiced_frames += 1;
                } else {
                    state.voiced_frames = 0;
                }
                if state.voiced_frames >= *min_frames {
                    Decision::Interrupt
                } else {
                    Decision::Continue
                }
            }
            _ => Decision::Continue,
        }
    }

    fn is_evidence(&self, frame: &Frame) -> bool {
        match (self, frame.kind()) {
            (_, FrameKind::Transcript(delta)) => delta.word_count() > 0,
            (InterruptionPolicy::VoiceActivity { energy_threshold, .. }, FrameKind::Audio(chunk)) => {
                chunk.rms() >= *energy_threshold
            }
            _ => false,
        }
    }
}

//! Frame types flowing between pipeline stages.

use crate::context::{ContextSnapshot, Role};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Identifier of one assistant response turn.
///
/// Every frame produced for a response carries the turn id it belongs to.
/// Interruption advances the current id, which makes all frames of the
/// cancelled response stale.
pub type TurnId = u64;

/// A chunk of 16-bit mono PCM audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Samples shared between clones; frames are immutable once created.
    pub samples: Arc<[i16]>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Creates a chunk of digital silence lasting `duration_ms`.
    pub fn silence(duration_ms: u32, sample_rate: u32) -> Self {
        let len = (sample_rate as u64 * duration_ms as u64 / 1000) as usize;
        Self::new(vec![0; len], sample_rate)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }

    /// Root mean square energy normalized to 0.0..=1.0.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = s as f64 / i16::MAX as f64;
                v * v
            })
            .sum();
        (sum / self.samples.len() as f64).sqrt() as f32
    }
}

/// A fragment of recognized or generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptDelta {
    pub role: Role,
    pub text: String,
    /// True when the recognizer will not revise this fragment again.
    pub is_final: bool,
}

impl TranscriptDelta {
    pub fn user(text: impl Into<String>, is_final: bool) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            is_final,
        }
    }

    /// Generated assistant text. Assistant deltas are always final.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            is_final: true,
        }
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Failure of a stage, carried downstream as a control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorSignal {
    /// Name of the stage that failed.
    pub stage: String,
    pub message: String,
    pub timed_out: bool,
    /// Response turn the failed work belonged to, if any.
    pub turn: Option<TurnId>,
}

/// Lifecycle and turn-taking signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    Start,
    /// Graceful end of the stream. Stages drain their input, forward it and stop.
    End,
    /// Immediate stop of every stage that receives it.
    Cancel,
    /// The current assistant response was cancelled by the user.
    Interrupt,
    UserStartedSpeaking,
    UserStoppedSpeaking,
    /// The user finished an utterance; commits the pending user turn.
    EndOfTurn,
    ResponseStart,
    ResponseComplete,
    BotStartedSpeaking,
    BotStoppedSpeaking,
    Error(ErrorSignal),
}

impl ControlSignal {
    /// Priority signals bypass the bounded data queues and overtake any backlog.
    pub fn is_priority(&self) -> bool {
        matches!(
            self,
            ControlSignal::Interrupt | ControlSignal::Cancel | ControlSignal::Error(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlSignal::Start => "start",
            ControlSignal::End => "end",
            ControlSignal::Cancel => "cancel",
            ControlSignal::Interrupt => "interrupt",
            ControlSignal::UserStartedSpeaking => "user-started-speaking",
            ControlSignal::UserStoppedSpeaking => "user-stopped-speaking",
            ControlSignal::EndOfTurn => "end-of-turn",
            ControlSignal::ResponseStart => "response-start",
            ControlSignal::ResponseComplete => "response-complete",
            ControlSignal::BotStartedSpeaking => "bot-started-speaking",
            ControlSignal::BotStoppedSpeaking => "bot-stopped-speaking",
            ControlSignal::Error(_) => "error",
        }
    }
}

/// Payload of a frame.
#[derive(Debug, Clone)]
pub enum FrameKind {
    Audio(AudioChunk),
    Transcript(TranscriptDelta),
    Control(ControlSignal),
    Context(ContextSnapshot),
}

impl FrameKind {
    pub fn control(signal: ControlSignal) -> Self {
        FrameKind::Control(signal)
    }
}

/// Immutable, sequenced unit flowing through the pipeline.
///
/// Frames are created through [`FrameSequencer`] (directly, or via a stage
/// context) so the sequence number reflects ingress order.
#[derive(Debug, Clone)]
pub struct Frame {
    sequence: u64,
    timestamp: Instant,
    turn: Option<TurnId>,
    kind: FrameKind,
}

impl Frame {
    pub fn new(sequence: u64, kind: FrameKind) -> Self {
        Self {
            sequence,
            timestamp: Instant::now(),
            turn: None,
            kind,
        }
    }

    /// Returns the frame tagged with a response turn.
    pub fn with_turn(mut self, turn: Option<TurnId>) -> Self {
        self.turn = turn;
        self
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn turn(&self) -> Option<TurnId> {
        self.turn
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }

    pub fn into_kind(self) -> FrameKind {
        self.kind
    }

    pub fn control(&self) -> Option<&ControlSignal> {
        match &self.kind {
            FrameKind::Control(signal) => Some(signal),
            _ => None,
        }
    }

    pub fn is_priority(&self) -> bool {
        self.control().is_some_and(ControlSignal::is_priority)
    }

    /// Evidence that the user is speaking: user transcripts, and audio that
    /// does not belong to an assistant response.
    pub fn is_user_speech(&self) -> bool {
        match &self.kind {
            FrameKind::Transcript(delta) => delta.role == Role::User,
            FrameKind::Audio(_) => self.turn.is_none(),
            _ => false,
        }
    }
}

/// Assigns monotonically increasing sequence numbers.
#[derive(Debug, Default)]
pub struct FrameSequencer {
    next: AtomicU64,
}

impl FrameSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn frame(&self, kind: FrameKind) -> Frame {
        Frame::new(self.next(), kind)
    }
}

/// Tracks the current assistant turn id for one pipeline.
#[derive(Debug, Default)]
pub struct TurnTracker {
    current: AtomicU64,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> TurnId {
        self.current.load(Ordering::SeqCst)
    }

    /// Cancels the current turn and returns the new current id.
    pub fn advance(&self) -> TurnId {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_stale_turn(&self, turn: Option<TurnId>) -> bool {
        turn.is_some_and(|t| t < self.current())
    }

    /// A frame is stale when it belongs to a cancelled turn.
    pub fn is_stale(&self, frame: &Frame) -> bool {
        self.is_stale_turn(frame.turn)
    }
}

/// Remembers the response whose generation or synthesis failed, so stages
/// further down can drop what is still queued for it.
///
/// Turn ids only advance on interruption, so a later response may reuse the
/// failed one's id. A `ResponseStart` created after the failure marks that
/// new response and clears the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailedResponse {
    failed: Option<(TurnId, u64)>,
}

impl FailedResponse {
    /// Records the failure carried by `frame`, if it is an error signal for
    /// a response turn. Returns the failed turn.
    pub fn record(&mut self, frame: &Frame) -> Option<TurnId> {
        let Some(ControlSignal::Error(ErrorSignal {
            turn: Some(turn), ..
        })) = frame.control()
        else {
            return None;
        };
        self.failed = Some((*turn, frame.sequence()));
        Some(*turn)
    }

    /// True when `frame` belongs to the failed response.
    pub fn covers(&mut self, frame: &Frame) -> bool {
        let Some((turn, at)) = self.failed else {
            return false;
        };
        if frame.turn != Some(turn) {
            return false;
        }
        if frame.control() == Some(&ControlSignal::ResponseStart) && frame.sequence > at {
            self.failed = None;
            return false;
        }
        true
    }

    pub fn turn(&self) -> Option<TurnId> {
        self.failed.map(|(turn, _)| turn)
    }
}

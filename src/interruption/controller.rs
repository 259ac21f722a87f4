//! Applies an interruption strategy to a running pipeline.

use crate::interruption::{Clock, Decision, InterruptionState, InterruptionStrategy};
use crate::pipeline::observer::FrameObserver;
use crate::pipeline::shared::PipelineShared;
use crate::pipeline::types::{ControlSignal, Frame, TurnId};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Observes every frame entering the pipeline, evaluates user speech while
/// the assistant is speaking and runs the cancel sequence on `Interrupt`.
///
/// The state lock is held across evaluation and the whole cancel sequence,
/// so evidence arriving meanwhile is evaluated against the reset state.
pub struct InterruptionController {
    strategy: Arc<dyn InterruptionStrategy>,
    state: Mutex<InterruptionState>,
    clock: Arc<dyn Clock>,
    silence_reset: Duration,
    enabled: bool,
    pipeline: Weak<PipelineShared>,
}

impl InterruptionController {
    pub fn new(
        pipeline: &Arc<PipelineShared>,
        strategy: Arc<dyn InterruptionStrategy>,
        clock: Arc<dyn Clock>,
        silence_reset: Duration,
        enabled: bool,
    ) -> Self {
        Self {
            strategy,
            state: Mutex::new(InterruptionState::default()),
            clock,
            silence_reset,
            enabled,
            pipeline: Arc::downgrade(pipeline),
        }
    }

    pub fn strategy(&self) -> &dyn InterruptionStrategy {
        self.strategy.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> InterruptionState {
        self.state.lock().clone()
    }

    /// Interrupts the current assistant turn unconditionally.
    ///
    /// Returns the new current turn, or `None` if the pipeline is gone.
    pub fn interrupt(&self) -> Option<TurnId> {
        let pipeline = self.pipeline.upgrade()?;
        let mut state = self.state.lock();
        Some(self.cancel_turn(&pipeline, &mut state))
    }

    fn cancel_turn(&self, pipeline: &PipelineShared, state: &mut InterruptionState) -> TurnId {
        let turn = pipeline.interrupt();
        self.strategy.reset(state);
        tracing::info!(strategy = self.strategy.name(), turn, "user interrupted the assistant");
        turn
    }
}

impl FrameObserver for InterruptionController {
    fn on_frame(&self, _origin: &str, frame: &Frame) {
        if matches!(
            frame.control(),
            Some(ControlSignal::BotStartedSpeaking | ControlSignal::BotStoppedSpeaking)
        ) {
            // Evidence only counts from the moment the assistant starts
            // speaking, and is void once its turn completes.
            self.strategy.reset(&mut self.state.lock());
            return;
        }
        if !self.enabled || !frame.is_user_speech() {
            return;
        }
        let Some(pipeline) = self.pipeline.upgrade() else {
            return;
        };
        if !pipeline.assistant_speaking() {
            return;
        }

        let mut state = self.state.lock();
        let now = self.clock.now();
        if let Some(last) = state.last_evidence
            && now.saturating_duration_since(last) > self.silence_reset
        {
            tracing::debug!("user silence exceeded threshold, resetting evidence");
            self.strategy.reset(&mut state);
        }
        if self.strategy.is_evidence(frame) {
            state.last_evidence = Some(now);
        }

        if self.strategy.evaluate(&mut state, frame) == Decision::Interrupt {
            self.cancel_turn(&pipeline, &mut state);
        }
    }
}

impl std::fmt::Debug for InterruptionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptionController")
            .field("strategy", &self.strategy)
            .field("state", &*self.state.lock())
            .field("silence_reset", &self.silence_reset)
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interruption::{InterruptionPolicy, MockClock};
    use crate::pipeline::types::{AudioChunk, FrameKind, TranscriptDelta};
    use tokio::sync::mpsc;

    struct Fixture {
        shared: Arc<PipelineShared>,
        controller: InterruptionController,
        clock: MockClock,
        interrupts: mpsc::UnboundedReceiver<Frame>,
    }

    fn fixture(min_words: usize, enabled: bool) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PipelineShared::new(vec![(Arc::from("tts"), tx)], Vec::new()));
        let clock = MockClock::new();
        let controller = InterruptionController::new(
            &shared,
            Arc::new(InterruptionPolicy::min_words(min_words)),
            Arc::new(clock.clone()),
            Duration::from_millis(1500),
            enabled,
        );
        Fixture {
            shared,
            controller,
            clock,
            interrupts: rx,
        }
    }

    impl Fixture {
        fn feed(&self, kind: FrameKind) {
            let frame = self.shared.stamp(kind);
            // Keep the pipeline's speaking flag in step, as observe() would.
            self.shared.observe("test", &frame);
            self.controller.on_frame("test", &frame);
        }

        fn bot_starts(&self) {
            self.feed(FrameKind::Control(ControlSignal::BotStartedSpeaking));
        }

        fn word(&self) {
            self.feed(FrameKind::Transcript(TranscriptDelta::user("word", false)));
        }

        fn say(&self, text: &str) {
            self.feed(FrameKind::Transcript(TranscriptDelta::user(text, false)));
        }
    }

    #[test]
    fn test_k_words_interrupt_and_k_minus_one_do_not() {
        for k in 1..=5 {
            let mut f = fixture(k, true);
            f.bot_starts();
            for _ in 0..k - 1 {
                f.word();
            }
            assert_eq!(f.shared.metrics().snapshot().interruptions, 0, "k = {k}");
            assert_eq!(f.controller.state().words, k - 1);

            f.word();
            assert_eq!(f.shared.metrics().snapshot().interruptions, 1, "k = {k}");
            assert!(f.controller.state().is_reset());
            assert_eq!(
                f.interrupts.try_recv().unwrap().control(),
                Some(&ControlSignal::Interrupt)
            );
            assert!(!f.shared.assistant_speaking());
        }
    }

    #[test]
    fn test_no_evaluation_while_assistant_silent() {
        let f = fixture(1, true);
        f.word();
        f.word();
        assert_eq!(f.shared.metrics().snapshot().interruptions, 0);
        assert!(f.controller.state().is_reset());
    }

    #[test]
    fn test_disabled_controller_never_interrupts() {
        let f = fixture(1, false);
        f.bot_starts();
        f.word();
        assert_eq!(f.shared.metrics().snapshot().interruptions, 0);
    }

    #[test]
    fn test_silence_resets_evidence() {
        let f = fixture(3, true);
        f.bot_starts();
        f.word();
        f.word();
        f.clock.advance(Duration::from_millis(2000));
        f.word();
        assert_eq!(f.shared.metrics().snapshot().interruptions, 0);
        assert_eq!(f.controller.state().words, 1);
    }

    #[test]
    fn test_silent_audio_does_not_hold_off_reset() {
        let f = fixture(3, true);
        f.bot_starts();
        f.say("uh huh");
        assert_eq!(f.controller.state().words, 2);

        // Ten seconds of quiet microphone audio.
        for _ in 0..20 {
            f.clock.advance(Duration::from_millis(500));
            f.feed(FrameKind::Audio(AudioChunk::silence(20, 16000)));
        }
        assert!(f.controller.state().is_reset());

        f.say("ok");
        assert_eq!(f.controller.state().words, 1);
        assert_eq!(f.shared.metrics().snapshot().interruptions, 0);
    }

    #[test]
    fn test_short_pause_keeps_evidence() {
        let f = fixture(3, true);
        f.bot_starts();
        f.word();
        f.clock.advance(Duration::from_millis(500));
        f.word();
        f.word();
        assert_eq!(f.shared.metrics().snapshot().interruptions, 1);
    }

    #[test]
    fn test_assistant_turn_completion_resets() {
        let f = fixture(3, true);
        f.bot_starts();
        f.word();
        f.word();
        f.feed(FrameKind::Control(ControlSignal::BotStoppedSpeaking));
        assert!(f.controller.state().is_reset());
    }

    #[test]
    fn test_manual_interrupt_advances_turn() {
        let f = fixture(3, true);
        let before = f.shared.turns().current();
        assert_eq!(f.controller.interrupt(), Some(before + 1));
        assert_eq!(f.shared.metrics().snapshot().interruptions, 1);
    }
}

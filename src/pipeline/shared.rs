//! State shared by all stages of one pipeline.

use crate::pipeline::metrics::PipelineMetrics;
use crate::pipeline::observer::FrameObserver;
use crate::pipeline::types::{ControlSignal, Frame, FrameKind, FrameSequencer, TurnId, TurnTracker};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Sequencing, turn tracking, observation and the interrupt broadcast.
pub struct PipelineShared {
    sequencer: FrameSequencer,
    turns: TurnTracker,
    metrics: PipelineMetrics,
    observers: RwLock<Arc<[Arc<dyn FrameObserver>]>>,
    assistant_speaking: AtomicBool,
    /// Priority queue of every stage, in assembly order.
    interrupt_links: Vec<(Arc<str>, mpsc::UnboundedSender<Frame>)>,
}

impl PipelineShared {
    pub(crate) fn new(
        interrupt_links: Vec<(Arc<str>, mpsc::UnboundedSender<Frame>)>,
        observers: Vec<Arc<dyn FrameObserver>>,
    ) -> Self {
        Self {
            sequencer: FrameSequencer::new(),
            turns: TurnTracker::new(),
            metrics: PipelineMetrics::default(),
            observers: RwLock::new(observers.into()),
            assistant_speaking: AtomicBool::new(false),
            interrupt_links,
        }
    }

    pub fn turns(&self) -> &TurnTracker {
        &self.turns
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn assistant_speaking(&self) -> bool {
        self.assistant_speaking.load(Ordering::SeqCst)
    }

    /// Creates a sequenced frame. Context snapshots open a response and are
    /// tagged with the current turn.
    pub fn stamp(&self, kind: FrameKind) -> Frame {
        let turn = matches!(kind, FrameKind::Context(_)).then(|| self.turns.current());
        self.sequencer.frame(kind).with_turn(turn)
    }

    /// Records a frame entering the pipeline and notifies observers.
    pub fn observe(&self, origin: &str, frame: &Frame) {
        match frame.control() {
            Some(ControlSignal::BotStartedSpeaking) => {
                self.assistant_speaking.store(true, Ordering::SeqCst)
            }
            Some(ControlSignal::BotStoppedSpeaking) => {
                self.assistant_speaking.store(false, Ordering::SeqCst)
            }
            _ => {}
        }
        self.metrics.record_observed();
        let observers = self.observers.read().clone();
        for observer in observers.iter() {
            observer.on_frame(origin, frame);
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn FrameObserver>) {
        let mut observers = self.observers.write();
        let mut next: Vec<Arc<dyn FrameObserver>> = observers.iter().cloned().collect();
        next.push(observer);
        *observers = next.into();
    }

    /// Cancels the current assistant turn.
    ///
    /// Advances the turn id first, so every frame of the cancelled turn is
    /// stale before any stage sees the interrupt, then delivers `Interrupt`
    /// to every stage's priority queue. Returns the new current turn.
    pub fn interrupt(&self) -> TurnId {
        let turn = self.turns.advance();
        let frame = self
            .sequencer
            .frame(FrameKind::Control(ControlSignal::Interrupt));
        for (stage, link) in &self.interrupt_links {
            if link.send(frame.clone()).is_err() {
                tracing::trace!(stage = %stage, "stage already stopped, interrupt not delivered");
            }
        }
        self.assistant_speaking.store(false, Ordering::SeqCst);
        self.metrics.record_interruption();
        turn
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.interrupt_links.iter().map(|(name, _)| name.as_ref())
    }
}

impl std::fmt::Debug for PipelineShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineShared")
            .field("turn", &self.turns.current())
            .field("assistant_speaking", &self.assistant_speaking())
            .field("stages", &self.interrupt_links.len())
            .finish()
    }
}

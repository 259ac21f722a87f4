//! Core stage abstraction and runner.

use crate::pipeline::error::{ErrorReporter, StageError};
use crate::pipeline::link::{LinkReceiver, LinkSender};
use crate::pipeline::shared::PipelineShared;
use crate::pipeline::types::{ControlSignal, ErrorSignal, Frame, FrameKind, TurnId};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A processing stage in the pipeline.
///
/// Each stage runs on its own tokio task, receives frames from its input
/// link in FIFO order and emits zero or more frames through its
/// [`StageContext`]. Frames a stage does not consume must be forwarded with
/// [`StageContext::push`].
#[async_trait]
pub trait Stage: Send + 'static {
    /// Unique name within the pipeline, used for links, logs and errors.
    fn name(&self) -> &str;

    /// Processes a single frame.
    ///
    /// The returned future may be dropped mid-way when the frame belongs to
    /// a turn that gets interrupted; implementations must not rely on
    /// running to completion.
    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> Result<(), StageError>;

    /// Called when the current assistant turn is interrupted.
    ///
    /// Drop any buffered state that belongs to the cancelled turn.
    fn on_interrupt(&mut self) {}

    /// Called once when the stage stops, whatever the reason.
    async fn shutdown(&mut self) {}

    /// External frames entering the pipeline at this stage (transport input).
    ///
    /// Called once before the first frame is processed.
    fn ingress(&mut self) -> Option<mpsc::Receiver<FrameKind>> {
        None
    }
}

/// Emission handle given to a stage while it processes a frame.
pub struct StageContext {
    name: Arc<str>,
    downstream: Vec<LinkSender>,
    shared: Arc<PipelineShared>,
}

impl StageContext {
    pub fn new(name: &str, downstream: Vec<LinkSender>, shared: Arc<PipelineShared>) -> Self {
        Self {
            name: Arc::from(name),
            downstream,
            shared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shared(&self) -> &PipelineShared {
        &self.shared
    }

    pub fn current_turn(&self) -> TurnId {
        self.shared.turns().current()
    }

    pub fn assistant_speaking(&self) -> bool {
        self.shared.assistant_speaking()
    }

    /// Names of the downstream links, main link first.
    pub fn downstream(&self) -> impl Iterator<Item = &str> {
        self.downstream.iter().map(LinkSender::name)
    }

    /// Forwards an existing frame to every downstream link.
    ///
    /// Frames of a cancelled turn are dropped and counted.
    pub async fn push(&self, frame: Frame) -> Result<(), StageError> {
        if self.shared.turns().is_stale(&frame) {
            self.shared.metrics().record_stale(1);
            tracing::trace!(stage = %self.name, seq = frame.sequence(), "dropped stale frame");
            return Ok(());
        }
        // The last link takes ownership, the others get clones.
        if let Some((last, rest)) = self.downstream.split_last() {
            for link in rest {
                link.send(frame.clone())
                    .await
                    .map_err(|e| StageError::Fatal(e.to_string()))?;
            }
            last.send(frame)
                .await
                .map_err(|e| StageError::Fatal(e.to_string()))?;
        }
        self.shared.metrics().record_forwarded();
        Ok(())
    }

    /// Creates a new frame originating at this stage and forwards it.
    pub async fn emit(&self, kind: FrameKind) -> Result<(), StageError> {
        let frame = self.shared.stamp(kind);
        self.publish(frame).await
    }

    /// Creates a new frame belonging to a response turn and forwards it.
    pub async fn emit_for_turn(
        &self,
        turn: Option<TurnId>,
        kind: FrameKind,
    ) -> Result<(), StageError> {
        let frame = self.shared.stamp(kind).with_turn(turn);
        self.publish(frame).await
    }

    /// Stamps and observes an external frame entering at this stage.
    pub(crate) fn admit(&self, kind: FrameKind) -> Frame {
        let frame = self.shared.stamp(kind);
        self.shared.observe(&self.name, &frame);
        frame
    }

    async fn publish(&self, frame: Frame) -> Result<(), StageError> {
        if self.shared.turns().is_stale(&frame) {
            self.shared.metrics().record_stale(1);
            return Ok(());
        }
        self.shared.observe(&self.name, &frame);
        self.push(frame).await
    }
}

/// Outcome of one `process` call raced against interrupts and cancellation.
enum Outcome {
    Done(Result<(), StageError>),
    Preempted,
    Cancelled,
}

/// Runs a stage on a tokio task.
pub struct StageRunner {
    stage: Box<dyn Stage>,
    input: LinkReceiver,
    ctx: StageContext,
    cancel: CancellationToken,
    error_reporter: Arc<dyn ErrorReporter>,
}

impl StageRunner {
    /// # Arguments
    /// * `stage` - The stage implementation to run
    /// * `input` - Link to receive frames from
    /// * `ctx` - Emission handle wired to the downstream links
    /// * `cancel` - Stops the stage immediately when cancelled
    /// * `error_reporter` - Reporter for handling errors
    pub fn new(
        stage: Box<dyn Stage>,
        input: LinkReceiver,
        ctx: StageContext,
        cancel: CancellationToken,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            stage,
            input,
            ctx,
            cancel,
            error_reporter,
        }
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    /// Main processing loop. Returns the stage name when the stage stops.
    pub async fn run(self) -> String {
        let Self {
            mut stage,
            mut input,
            mut ctx,
            cancel,
            error_reporter,
        } = self;
        let name = ctx.name().to_string();
        let shared = Arc::clone(&ctx.shared);
        let mut ingress = stage.ingress();
        // Priority frames that arrived while a frame was in flight.
        let mut deferred: VecDeque<Frame> = VecDeque::new();

        tracing::debug!(stage = %name, "stage started");

        loop {
            let frame = match deferred.pop_front() {
                Some(frame) => frame,
                None => tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    frame = input.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    Some(kind) = recv_ingress(&mut ingress) => ctx.admit(kind),
                },
            };

            if shared.turns().is_stale(&frame) {
                shared.metrics().record_stale(1);
                tracing::trace!(stage = %name, seq = frame.sequence(), "dropped stale frame");
                continue;
            }

            match frame.control() {
                Some(ControlSignal::Interrupt) => {
                    stage.on_interrupt();
                    let flushed = input.flush_stale(shared.turns());
                    shared.metrics().record_stale(flushed);
                    tracing::debug!(stage = %name, flushed, "interrupted");
                    continue;
                }
                Some(ControlSignal::Cancel) => {
                    if let Err(e) = ctx.push(frame).await {
                        tracing::debug!(stage = %name, error = %e, "cancel not forwarded");
                    }
                    break;
                }
                _ => {}
            }

            let is_end = frame.control() == Some(&ControlSignal::End);
            let in_flight_turn = frame.turn();
            let mut interrupted = false;

            let outcome = {
                let mut work = stage.process(frame, &mut ctx);
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break Outcome::Cancelled,
                        priority = input.recv_priority() => {
                            if priority.control() == Some(&ControlSignal::Interrupt) {
                                interrupted = true;
                                if shared.turns().is_stale_turn(in_flight_turn) {
                                    break Outcome::Preempted;
                                }
                            } else {
                                deferred.push_back(priority);
                            }
                        }
                        result = &mut work => break Outcome::Done(result),
                    }
                }
            };

            match outcome {
                Outcome::Cancelled => break,
                Outcome::Preempted => {
                    shared.metrics().record_preempted();
                    tracing::debug!(stage = %name, turn = ?in_flight_turn, "in-flight work cancelled");
                }
                Outcome::Done(Ok(())) => {}
                Outcome::Done(Err(error)) => {
                    error_reporter.report(&name, &error);
                    shared.metrics().record_error(error.is_timeout());
                    let signal = ErrorSignal {
                        stage: name.clone(),
                        message: error.to_string(),
                        timed_out: error.is_timeout(),
                        turn: in_flight_turn,
                    };
                    if let Err(e) = ctx.emit(FrameKind::Control(ControlSignal::Error(signal))).await {
                        tracing::debug!(stage = %name, error = %e, "error signal not forwarded");
                    }
                    if error.is_fatal() {
                        break;
                    }
                }
            }

            if interrupted {
                stage.on_interrupt();
                let flushed = input.flush_stale(shared.turns());
                shared.metrics().record_stale(flushed);
                tracing::debug!(stage = %name, flushed, "interrupted");
            }

            if is_end {
                break;
            }
        }

        // Cleanup on shutdown
        stage.shutdown().await;
        tracing::debug!(stage = %name, "stage stopped");
        name
    }
}

async fn recv_ingress(ingress: &mut Option<mpsc::Receiver<FrameKind>>) -> Option<FrameKind> {
    match ingress {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

//! Task: runtime wrapper owning one pipeline's lifecycle.
//!
//! ```text
//! Created ──run()──> Running ──cancel() / disconnect / end──> Cancelling ──> Stopped
//! ```
//!
//! Transitions only move forward. Frames can be queued while the task is
//! `Created` or `Running`; once it reaches `Cancelling` the injection queue
//! is closed for good.

use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::interruption::{
    Clock, InterruptionController, InterruptionPolicy, InterruptionState, InterruptionStrategy,
    SystemClock,
};
use crate::pipeline::link::LinkSender;
use crate::pipeline::metrics::MetricsSnapshot;
use crate::pipeline::orchestrator::Pipeline;
use crate::pipeline::shared::PipelineShared;
use crate::pipeline::types::{ControlSignal, FrameKind, TurnId};
use crate::transport::{Transport, TransportEvent, TransportEventHandler};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a [`PipelineTask`]. Ordered by progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Created,
    Running,
    Cancelling,
    Stopped,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Created => "created",
            TaskState::Running => "running",
            TaskState::Cancelling => "cancelling",
            TaskState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why a task left `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every stage finished after a graceful `End`.
    Finished,
    Cancelled,
    ClientDisconnected,
}

/// Task parameters.
#[derive(Clone)]
pub struct TaskParams {
    pub allow_interruptions: bool,
    pub strategy: Arc<dyn InterruptionStrategy>,
    /// User silence after which accumulated interruption evidence is reset.
    pub silence_reset: Duration,
    /// Time stages get to stop after cancellation before being aborted.
    pub cancel_grace: Duration,
    pub clock: Arc<dyn Clock>,
}

impl TaskParams {
    pub fn allow_interruptions(mut self, allow: bool) -> Self {
        self.allow_interruptions = allow;
        self
    }

    pub fn with_strategy(mut self, strategy: impl InterruptionStrategy + 'static) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    pub fn with_silence_reset(mut self, silence_reset: Duration) -> Self {
        self.silence_reset = silence_reset;
        self
    }

    pub fn with_cancel_grace(mut self, cancel_grace: Duration) -> Self {
        self.cancel_grace = cancel_grace;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            allow_interruptions: true,
            strategy: Arc::new(InterruptionPolicy::default()),
            silence_reset: Duration::from_millis(defaults::SILENCE_RESET_MS),
            cancel_grace: Duration::from_millis(defaults::CANCEL_GRACE_MS),
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for TaskParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskParams")
            .field("allow_interruptions", &self.allow_interruptions)
            .field("strategy", &self.strategy)
            .field("silence_reset", &self.silence_reset)
            .field("cancel_grace", &self.cancel_grace)
            .finish_non_exhaustive()
    }
}

/// Summary returned when a task stops.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub state: TaskState,
    pub reason: StopReason,
    pub metrics: MetricsSnapshot,
    /// Stages that did not stop within the cancel grace and were aborted.
    pub aborted_stages: usize,
}

struct TaskInner {
    state: watch::Sender<TaskState>,
    history: Mutex<Vec<TaskState>>,
    head: LinkSender,
    shared: Arc<PipelineShared>,
    cancel: CancellationToken,
    controller: Arc<InterruptionController>,
}

impl TaskInner {
    /// Moves to `next` if it is later than the current state.
    fn transition(&self, next: TaskState) -> bool {
        let mut history = self.history.lock();
        let moved = self.state.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            history.push(next);
            tracing::info!(state = %next, "task state changed");
        }
        moved
    }
}

/// Cloneable control surface of a task, usable from any async context.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    pub fn state(&self) -> TaskState {
        *self.inner.state.borrow()
    }

    /// Every state the task has been in, in order.
    pub fn history(&self) -> Vec<TaskState> {
        self.inner.history.lock().clone()
    }

    /// Waits until the task reaches `target` or a later state.
    pub async fn wait_for_state(&self, target: TaskState) -> TaskState {
        let mut rx = self.inner.state.subscribe();
        match rx.wait_for(|state| *state >= target).await {
            Ok(state) => *state,
            // The sender lives in `inner`, which we hold.
            Err(_) => self.state(),
        }
    }

    /// Injects a frame at the head of the pipeline.
    ///
    /// Blocks while the first stage's queue is full. Fails once the task is
    /// cancelling or stopped.
    pub async fn queue_frame(&self, kind: FrameKind) -> Result<()> {
        let state = self.state();
        if state >= TaskState::Cancelling {
            return Err(ParleyError::TaskNotAccepting {
                state: state.to_string(),
            });
        }
        let frame = self.inner.shared.stamp(kind);
        self.inner.shared.observe("task", &frame);
        self.inner
            .head
            .send(frame)
            .await
            .map_err(|_| ParleyError::TaskNotAccepting {
                state: self.state().to_string(),
            })
    }

    pub async fn queue_frames(&self, kinds: impl IntoIterator<Item = FrameKind>) -> Result<()> {
        for kind in kinds {
            self.queue_frame(kind).await?;
        }
        Ok(())
    }

    /// Queues an in-band `End`: stages finish what is queued ahead of it,
    /// then stop.
    pub async fn stop_when_done(&self) -> Result<()> {
        self.queue_frame(FrameKind::Control(ControlSignal::End)).await
    }

    /// Cancels the task. A no-op once the task is stopped.
    pub fn cancel(&self) {
        if self.state() == TaskState::Stopped {
            tracing::debug!("cancel on stopped task ignored");
            return;
        }
        self.inner.cancel.cancel();
    }

    /// Interrupts the current assistant turn, regardless of the strategy.
    ///
    /// Returns the new current turn id.
    pub fn interrupt(&self) -> Option<TurnId> {
        self.inner.controller.interrupt()
    }

    pub fn current_turn(&self) -> TurnId {
        self.inner.shared.turns().current()
    }

    pub fn interruption_state(&self) -> InterruptionState {
        self.inner.controller.state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.shared.metrics().snapshot()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("state", &self.state())
            .field("turn", &self.current_turn())
            .finish()
    }
}

/// Owns one pipeline and drives it from `Created` to `Stopped`.
pub struct PipelineTask {
    pipeline: Pipeline,
    params: TaskParams,
    inner: Arc<TaskInner>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    handler: Option<Arc<dyn TransportEventHandler>>,
}

impl PipelineTask {
    pub fn new(pipeline: Pipeline, params: TaskParams) -> Self {
        Self::with_token(pipeline, params, CancellationToken::new())
    }

    /// Creates a task cancelled together with `token`.
    pub fn with_token(pipeline: Pipeline, params: TaskParams, token: CancellationToken) -> Self {
        let controller = Arc::new(InterruptionController::new(
            pipeline.shared(),
            Arc::clone(&params.strategy),
            Arc::clone(&params.clock),
            params.silence_reset,
            params.allow_interruptions,
        ));
        pipeline.add_observer(controller.clone());
        let (state, _) = watch::channel(TaskState::Created);
        let inner = Arc::new(TaskInner {
            state,
            history: Mutex::new(vec![TaskState::Created]),
            head: pipeline.head(),
            shared: Arc::clone(pipeline.shared()),
            cancel: token,
            controller,
        });
        Self {
            pipeline,
            params,
            inner,
            events: None,
            handler: None,
        }
    }

    /// Delivers client lifecycle events from `events` once running.
    pub fn with_transport_events(mut self, events: mpsc::Receiver<TransportEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Takes the transport's event channel.
    pub fn with_transport(self, transport: &mut dyn Transport) -> Self {
        match transport.take_events() {
            Some(events) => self.with_transport_events(events),
            None => self,
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn TransportEventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn params(&self) -> &TaskParams {
        &self.params
    }

    /// Runs the pipeline until it finishes, the task is cancelled or the
    /// client disconnects.
    pub async fn run(self) -> TaskReport {
        let Self {
            pipeline,
            params,
            inner,
            mut events,
            handler,
        } = self;
        let handle = TaskHandle {
            inner: Arc::clone(&inner),
        };

        let stages = inner.cancel.child_token();
        let mut running = pipeline.start(stages.clone());
        if let Err(e) = handle.queue_frame(FrameKind::Control(ControlSignal::Start)).await {
            tracing::debug!(error = %e, "start frame not delivered");
        }
        inner.transition(TaskState::Running);

        let reason = loop {
            tokio::select! {
                () = inner.cancel.cancelled() => break StopReason::Cancelled,
                () = running.wait() => break StopReason::Finished,
                event = recv_event(&mut events) => match event {
                    Some(TransportEvent::ClientConnected { client }) => {
                        if let Some(handler) = &handler
                            && let Err(e) = handler.on_client_connected(&handle, &client).await
                        {
                            tracing::warn!(client = %client, error = %e, "connect handler failed");
                        }
                    }
                    Some(TransportEvent::ClientDisconnected { client }) => {
                        if let Some(handler) = &handler
                            && let Err(e) = handler.on_client_disconnected(&handle, &client).await
                        {
                            tracing::warn!(client = %client, error = %e, "disconnect handler failed");
                        }
                        break StopReason::ClientDisconnected;
                    }
                    None => events = None,
                },
            }
        };

        tracing::info!(reason = ?reason, "task stopping");
        inner.transition(TaskState::Cancelling);
        stages.cancel();
        let aborted_stages = running.shutdown(params.cancel_grace).await;
        inner.cancel.cancel();
        inner.transition(TaskState::Stopped);

        TaskReport {
            state: handle.state(),
            reason,
            metrics: handle.metrics(),
            aborted_stages,
        }
    }
}

async fn recv_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

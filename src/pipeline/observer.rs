//! Frame observers.
//!
//! An observer sees every frame exactly once, at the point where the frame
//! enters the pipeline: injection by the task, transport ingress, or
//! creation by a stage. Forwarded frames are not observed again.

use crate::context::Role;
use crate::pipeline::types::{ControlSignal, Frame, FrameKind};

pub trait FrameObserver: Send + Sync {
    /// Called synchronously on the producing stage's task. Keep it short.
    fn on_frame(&self, origin: &str, frame: &Frame);
}

impl<F> FrameObserver for F
where
    F: Fn(&str, &Frame) + Send + Sync,
{
    fn on_frame(&self, origin: &str, frame: &Frame) {
        self(origin, frame)
    }
}

/// Logs transcripts, generated text and control flow through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl FrameObserver for LogObserver {
    fn on_frame(&self, origin: &str, frame: &Frame) {
        match frame.kind() {
            FrameKind::Transcript(delta) if delta.role == Role::User => {
                tracing::debug!(
                    origin,
                    seq = frame.sequence(),
                    text = %delta.text,
                    is_final = delta.is_final,
                    "user transcript"
                );
            }
            FrameKind::Transcript(delta) => {
                tracing::debug!(origin, turn = ?frame.turn(), text = %delta.text, "assistant text");
            }
            FrameKind::Control(ControlSignal::Error(error)) => {
                tracing::warn!(
                    origin,
                    stage = %error.stage,
                    timed_out = error.timed_out,
                    message = %error.message,
                    "error signal"
                );
            }
            FrameKind::Control(signal) => {
                tracing::trace!(origin, seq = frame.sequence(), signal = signal.name(), "control");
            }
            FrameKind::Context(snapshot) => {
                tracing::debug!(origin, turn = ?frame.turn(), turns = snapshot.len(), "context snapshot");
            }
            FrameKind::Audio(_) => {}
        }
    }
}

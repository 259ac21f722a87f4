//! Pipeline execution engine.
//!
//! Stages run concurrently, one tokio task each, connected by links that
//! pair a bounded data queue with an unbounded priority queue for
//! interrupt, cancel and error signals. A [`PipelineTask`] owns one
//! pipeline and its lifecycle; a [`PipelineRunner`] drives tasks and maps
//! process shutdown onto them.

pub mod error;
pub mod link;
pub mod metrics;
pub mod observer;
pub mod orchestrator;
pub mod runner;
pub mod shared;
pub mod stage;
pub mod task;
pub mod types;

pub use error::{ErrorReporter, LogReporter, StageError};
pub use link::{LinkClosed, LinkReceiver, LinkSender, link};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use observer::{FrameObserver, LogObserver};
pub use orchestrator::{Pipeline, PipelineBuilder, PipelineConfig, PipelineHandle, compose};
pub use runner::PipelineRunner;
pub use shared::PipelineShared;
pub use stage::{Stage, StageContext, StageRunner};
pub use task::{PipelineTask, StopReason, TaskHandle, TaskParams, TaskReport, TaskState};
pub use types::{
    AudioChunk, ControlSignal, ErrorSignal, FailedResponse, Frame, FrameKind, FrameSequencer,
    TranscriptDelta, TurnId, TurnTracker,
};

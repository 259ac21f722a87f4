//! Transport collaborator boundary.
//!
//! A transport terminates the external media connection. It contributes an
//! input stage (user audio entering the pipeline) and an output stage
//! (assistant audio and text leaving it), and reports client lifecycle
//! events to the task that owns the pipeline.

pub mod loopback;

pub use loopback::{ClientOutput, LoopbackClient, LoopbackTransport};

use crate::context::SharedContext;
use crate::error::Result;
use crate::pipeline::stage::Stage;
use crate::pipeline::task::TaskHandle;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Client lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ClientConnected { client: String },
    ClientDisconnected { client: String },
}

pub trait Transport: Send {
    /// Stage producing user audio frames. Can be taken once.
    fn input(&mut self) -> Result<Box<dyn Stage>>;

    /// Stage playing assistant audio and text back to the client. Can be
    /// taken once.
    fn output(&mut self) -> Result<Box<dyn Stage>>;

    /// Lifecycle events, delivered to the task.
    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;
}

/// Reacts to client lifecycle events.
///
/// Registered at task construction; invoked only once the task is running.
/// Whatever the disconnect handler does, a disconnect ends the task.
#[async_trait]
pub trait TransportEventHandler: Send + Sync {
    async fn on_client_connected(&self, _task: &TaskHandle, _client: &str) -> Result<()> {
        Ok(())
    }

    async fn on_client_disconnected(&self, _task: &TaskHandle, _client: &str) -> Result<()> {
        Ok(())
    }
}

/// Kicks off the conversation when a client connects: appends the greeting
/// instruction as a system message and queues a context snapshot, so the
/// assistant speaks first.
#[derive(Debug, Clone)]
pub struct GreetingHandler {
    context: SharedContext,
    greeting: String,
}

impl GreetingHandler {
    pub fn new(context: SharedContext, greeting: impl Into<String>) -> Self {
        Self {
            context,
            greeting: greeting.into(),
        }
    }
}

#[async_trait]
impl TransportEventHandler for GreetingHandler {
    async fn on_client_connected(&self, task: &TaskHandle, client: &str) -> Result<()> {
        tracing::info!(client, "client connected");
        if !self.greeting.trim().is_empty() {
            self.context.add_system_message(&self.greeting);
        }
        task.queue_frame(self.context.context_frame()).await
    }

    async fn on_client_disconnected(&self, _task: &TaskHandle, client: &str) -> Result<()> {
        tracing::info!(client, "client disconnected");
        Ok(())
    }
}

//! Process-level driver for tasks.

use crate::error::{ParleyError, Result};
use crate::pipeline::task::{PipelineTask, TaskHandle, TaskReport};
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Drives tasks to completion and turns shutdown requests (the runner's
/// token, and optionally SIGINT/SIGTERM) into `cancel()` on every task it
/// runs.
#[derive(Debug, Clone, Default)]
pub struct PipelineRunner {
    shutdown: CancellationToken,
    handle_signals: bool,
}

impl PipelineRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shuts down when `token` is cancelled.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Listens for SIGINT and SIGTERM while tasks run.
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels every task this runner is running.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Runs one task until it stops.
    pub async fn run(&self, task: PipelineTask) -> TaskReport {
        let watcher = self.watch(vec![task.handle()]);
        let report = task.run().await;
        watcher.abort();
        report
    }

    /// Runs several tasks concurrently until all of them stop.
    ///
    /// Reports are returned in the order the tasks were given.
    pub async fn run_all(&self, tasks: Vec<PipelineTask>) -> Vec<TaskReport> {
        let handles = tasks.iter().map(PipelineTask::handle).collect();
        let watcher = self.watch(handles);
        let reports = join_all(tasks.into_iter().map(PipelineTask::run)).await;
        watcher.abort();
        reports
    }

    fn watch(&self, tasks: Vec<TaskHandle>) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        let signals = self.handle_signals;
        tokio::spawn(async move {
            if signals {
                tokio::select! {
                    () = shutdown.cancelled() => {}
                    result = shutdown_signal() => {
                        match result {
                            Ok(signal) => tracing::info!(signal, "received shutdown signal"),
                            Err(e) => tracing::error!(error = %e, "signal handler failed"),
                        }
                        shutdown.cancel();
                    }
                }
            } else {
                shutdown.cancelled().await;
            }
            tracing::info!(tasks = tasks.len(), "cancelling tasks");
            for task in &tasks {
                task.cancel();
            }
        })
    }
}

/// Resolves on SIGINT or SIGTERM with the signal name.
async fn shutdown_signal() -> Result<&'static str> {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("SIGINT")
        }
        result = wait_for_sigterm() => {
            result?;
            Ok("SIGTERM")
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| ParleyError::Other(format!("failed to register SIGTERM handler: {e}")))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::StageError;
    use crate::pipeline::orchestrator::Pipeline;
    use crate::pipeline::stage::{Stage, StageContext};
    use crate::pipeline::task::{StopReason, TaskParams, TaskState};
    use crate::pipeline::types::Frame;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Forward(&'static str);

    #[async_trait]
    impl Stage for Forward {
        fn name(&self) -> &str {
            self.0
        }

        async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> std::result::Result<(), StageError> {
            ctx.push(frame).await
        }
    }

    fn task() -> PipelineTask {
        let pipeline = Pipeline::builder().stage(Forward("only")).build().unwrap();
        PipelineTask::new(pipeline, TaskParams::default())
    }

    #[tokio::test]
    async fn test_shutdown_token_cancels_all_tasks() {
        let runner = PipelineRunner::new();
        let tasks = vec![task(), task(), task()];
        let handles: Vec<TaskHandle> = tasks.iter().map(PipelineTask::handle).collect();

        let token = runner.shutdown_token();
        let probe = handles[0].clone();
        tokio::spawn(async move {
            probe.wait_for_state(TaskState::Running).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let reports = runner.run_all(tasks).await;
        assert_eq!(reports.len(), 3);
        for report in &reports {
            assert_eq!(report.state, TaskState::Stopped);
            assert_eq!(report.reason, StopReason::Cancelled);
        }
        assert!(handles.iter().all(|h| h.state() == TaskState::Stopped));
    }

    #[tokio::test]
    async fn test_run_returns_when_task_finishes_on_its_own() {
        let runner = PipelineRunner::new();
        let task = task();
        let handle = task.handle();
        let stopper = tokio::spawn(async move {
            handle.wait_for_state(TaskState::Running).await;
            handle.stop_when_done().await
        });

        let report = runner.run(task).await;
        assert_eq!(report.reason, StopReason::Finished);
        assert!(stopper.await.unwrap().is_ok());
        assert!(!runner.shutdown_token().is_cancelled());
    }
}

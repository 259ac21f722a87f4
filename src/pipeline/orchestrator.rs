//! Pipeline assembly and execution.
//!
//! Stages are composed into a chain: stage *i*'s emissions are enqueued on
//! stage *i+1*'s input link. Every stage may additionally feed side
//! branches ("taps") through named downstream links. The last stage of the
//! chain writes to the pipeline output link.

use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::pipeline::error::{ErrorReporter, LogReporter};
use crate::pipeline::link::{LinkReceiver, LinkSender, link};
use crate::pipeline::observer::FrameObserver;
use crate::pipeline::shared::PipelineShared;
use crate::pipeline::stage::{Stage, StageContext, StageRunner};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Name of the link the last stage of the chain writes to.
pub const OUTPUT_LINK: &str = "output";

/// Configuration for the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Capacity of each bounded data queue
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::QUEUE_CAPACITY,
        }
    }
}

/// Composes stages into a [`Pipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    stages: Vec<Box<dyn Stage>>,
    /// Side branches, keyed by the index of the stage that feeds them.
    taps: Vec<(usize, Box<dyn Stage>)>,
    observers: Vec<Arc<dyn FrameObserver>>,
    error_reporter: Arc<dyn ErrorReporter>,
    misplaced_tap: Option<String>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
            taps: Vec::new(),
            observers: Vec::new(),
            error_reporter: Arc::new(LogReporter),
            misplaced_tap: None,
        }
    }

    /// Appends a stage to the chain.
    pub fn stage(self, stage: impl Stage) -> Self {
        self.boxed(Box::new(stage))
    }

    pub fn boxed(mut self, stage: Box<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(mut self, stages: impl IntoIterator<Item = Box<dyn Stage>>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Attaches a side branch fed by the most recently added stage.
    ///
    /// The tap receives a copy of everything that stage emits. Its own
    /// emissions go nowhere.
    pub fn tap(mut self, stage: impl Stage) -> Self {
        match self.stages.len().checked_sub(1) {
            Some(index) => self.taps.push((index, Box::new(stage))),
            None => self.misplaced_tap = Some(stage.name().to_string()),
        }
        self
    }

    pub fn observer(mut self, observer: Arc<dyn FrameObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Sets a custom error reporter.
    pub fn error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    /// Validates the topology and wires the links.
    ///
    /// Fails on an empty chain, a tap with no feeding stage, or duplicate
    /// stage names.
    pub fn build(self) -> Result<Pipeline> {
        if self.stages.is_empty() {
            return Err(ParleyError::EmptyPipeline);
        }
        if let Some(name) = self.misplaced_tap {
            return Err(ParleyError::InvalidTopology {
                message: format!("tap '{name}' added before any stage"),
            });
        }

        let mut seen = HashSet::new();
        let all_names = self
            .stages
            .iter()
            .chain(self.taps.iter().map(|(_, tap)| tap))
            .map(|stage| stage.name().to_string());
        for name in all_names {
            if name == OUTPUT_LINK || !seen.insert(name.clone()) {
                return Err(ParleyError::DuplicateStage { name });
            }
        }

        let capacity = self.config.queue_capacity;
        let mut inputs: Vec<(LinkSender, LinkReceiver)> = self
            .stages
            .iter()
            .map(|stage| link(stage.name(), capacity))
            .collect();
        let mut tap_inputs: Vec<(LinkSender, LinkReceiver)> = self
            .taps
            .iter()
            .map(|(_, tap)| link(tap.name(), capacity))
            .collect();
        let (output_tx, output_rx) = link(OUTPUT_LINK, capacity);

        let interrupt_links = self
            .stages
            .iter()
            .zip(&inputs)
            .chain(self.taps.iter().map(|(_, tap)| tap).zip(&tap_inputs))
            .map(|(stage, (tx, _))| (Arc::from(stage.name()), tx.priority_sender()))
            .collect();
        let shared = Arc::new(PipelineShared::new(interrupt_links, self.observers));
        let head = inputs[0].0.clone();

        // Downstream of stage i: the next stage (or the output), then its taps.
        let count = self.stages.len();
        let mut downstream: Vec<Vec<LinkSender>> = (0..count)
            .map(|i| {
                if i + 1 < count {
                    vec![inputs[i + 1].0.clone()]
                } else {
                    vec![output_tx.clone()]
                }
            })
            .collect();
        for ((feeder, _), (tx, _)) in self.taps.iter().zip(&tap_inputs) {
            downstream[*feeder].push(tx.clone());
        }
        drop(output_tx);

        let mut nodes = Vec::with_capacity(count + self.taps.len());
        for ((stage, (_, rx)), links) in self
            .stages
            .into_iter()
            .zip(inputs.drain(..))
            .zip(downstream)
        {
            let ctx = StageContext::new(stage.name(), links, Arc::clone(&shared));
            nodes.push(Node {
                stage,
                input: rx,
                ctx,
            });
        }
        for ((_, tap), (_, rx)) in self.taps.into_iter().zip(tap_inputs.drain(..)) {
            let ctx = StageContext::new(tap.name(), Vec::new(), Arc::clone(&shared));
            nodes.push(Node {
                stage: tap,
                input: rx,
                ctx,
            });
        }

        Ok(Pipeline {
            nodes,
            head,
            output: Some(output_rx),
            shared,
            error_reporter: self.error_reporter,
        })
    }
}

/// Composes an ordered sequence of stages with the default configuration.
pub fn compose(stages: Vec<Box<dyn Stage>>) -> Result<Pipeline> {
    PipelineBuilder::new(PipelineConfig::default())
        .stages(stages)
        .build()
}

struct Node {
    stage: Box<dyn Stage>,
    input: LinkReceiver,
    ctx: StageContext,
}

/// An assembled, not yet started chain of stages.
pub struct Pipeline {
    nodes: Vec<Node>,
    head: LinkSender,
    output: Option<LinkReceiver>,
    shared: Arc<PipelineShared>,
    error_reporter: Arc<dyn ErrorReporter>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new(PipelineConfig::default())
    }

    /// Stage names in assembly order, chain first, then taps.
    pub fn stage_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.ctx.name()).collect()
    }

    pub fn shared(&self) -> &Arc<PipelineShared> {
        &self.shared
    }

    /// Sender feeding the first stage.
    pub fn head(&self) -> LinkSender {
        self.head.clone()
    }

    /// Takes the receiver of the last stage's output.
    ///
    /// If nobody takes it, the output is drained and dropped once the
    /// pipeline starts.
    pub fn take_output(&mut self) -> Option<LinkReceiver> {
        self.output.take()
    }

    pub fn add_observer(&self, observer: Arc<dyn FrameObserver>) {
        self.shared.add_observer(observer);
    }

    /// Spawns one runner per stage.
    pub fn start(self, cancel: CancellationToken) -> PipelineHandle {
        let mut runners = JoinSet::new();
        for node in self.nodes {
            let runner = StageRunner::new(
                node.stage,
                node.input,
                node.ctx,
                cancel.clone(),
                Arc::clone(&self.error_reporter),
            );
            runners.spawn(runner.run());
        }
        if let Some(mut output) = self.output {
            let cancel = cancel.clone();
            runners.spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        frame = output.recv() => if frame.is_none() { break },
                    }
                }
                OUTPUT_LINK.to_string()
            });
        }
        tracing::debug!(tasks = runners.len(), "pipeline started");
        PipelineHandle {
            runners,
            shared: self.shared,
        }
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    runners: JoinSet<String>,
    shared: Arc<PipelineShared>,
}

impl PipelineHandle {
    pub fn shared(&self) -> &Arc<PipelineShared> {
        &self.shared
    }

    /// Number of stage tasks still running.
    pub fn running(&self) -> usize {
        self.runners.len()
    }

    /// Waits until every stage has stopped. Cancel safe.
    pub async fn wait(&mut self) {
        while let Some(result) = self.runners.join_next().await {
            match result {
                Ok(name) => tracing::trace!(stage = %name, "stage joined"),
                Err(e) => tracing::error!(error = %e, "stage task failed"),
            }
        }
    }

    /// Waits up to `grace` for the stages to stop, then aborts the rest.
    ///
    /// Returns the number of stages that had to be aborted.
    pub async fn shutdown(mut self, grace: Duration) -> usize {
        if tokio::time::timeout(grace, self.wait()).await.is_ok() {
            return 0;
        }
        let remaining = self.runners.len();
        tracing::warn!(remaining, "shutdown timeout, aborting stages");
        self.runners.abort_all();
        while self.runners.join_next().await.is_some() {}
        remaining
    }
}

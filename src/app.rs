//! Conversation assembly.
//!
//! Wires the standard voice-bot chain:
//! transport input → recognition → user aggregation → generation →
//! synthesis → transport output → assistant aggregation

use crate::config::Config;
use crate::context::{ContextAggregatorPair, ConversationContext, SharedContext};
use crate::error::Result;
use crate::pipeline::observer::LogObserver;
use crate::pipeline::orchestrator::PipelineBuilder;
use crate::pipeline::task::{PipelineTask, TaskHandle};
use crate::services::{
    GenerationStage, LanguageModel, RecognitionStage, SpeechRecognizer, SpeechSynthesizer,
    SynthesisStage,
};
use crate::transport::{GreetingHandler, Transport};
use std::sync::Arc;

/// The backends a conversation talks to.
pub struct Backends<R, L, S> {
    pub recognizer: R,
    pub model: L,
    pub synthesizer: S,
}

/// An assembled conversation, ready to run.
pub struct Conversation {
    pub task: PipelineTask,
    /// Dialogue history, shared with the aggregators.
    pub context: SharedContext,
}

impl Conversation {
    pub fn handle(&self) -> TaskHandle {
        self.task.handle()
    }
}

/// Builds a conversation task over `transport`.
///
/// The task gets the transport's lifecycle events; connecting a client
/// appends the configured greeting and lets the assistant speak first.
///
/// # Errors
/// Invalid configuration, or a transport whose stages were already taken.
pub fn build_conversation<R, L, S>(
    config: &Config,
    transport: &mut dyn Transport,
    backends: Backends<R, L, S>,
) -> Result<Conversation>
where
    R: SpeechRecognizer + 'static,
    L: LanguageModel + 'static,
    S: SpeechSynthesizer + 'static,
{
    config.validate()?;

    let context = SharedContext::new(ConversationContext::with_system_prompt(
        &config.context.system_prompt,
    ));
    let (user, assistant) =
        ContextAggregatorPair::new(context.clone(), config.interruption.interrupted_turn)
            .into_parts();
    let timeout = config.pipeline.backend_timeout();

    let pipeline = PipelineBuilder::new(config.pipeline_config())
        .boxed(transport.input()?)
        .stage(RecognitionStage::new(backends.recognizer).with_timeout(timeout))
        .stage(user)
        .stage(GenerationStage::new(backends.model).with_timeout(timeout))
        .stage(SynthesisStage::new(backends.synthesizer).with_timeout(timeout))
        .boxed(transport.output()?)
        .stage(assistant)
        .observer(Arc::new(LogObserver))
        .build()?;
    tracing::debug!(stages = ?pipeline.stage_names(), "conversation assembled");

    let greeting = GreetingHandler::new(context.clone(), config.context.greeting.clone());
    let task = PipelineTask::new(pipeline, config.task_params())
        .with_transport(transport)
        .with_event_handler(Arc::new(greeting));

    Ok(Conversation { task, context })
}

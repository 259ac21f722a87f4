//! End-to-end conversations over the loopback transport with scripted
//! backends.

use async_trait::async_trait;
use parley::app::{Backends, build_conversation};
use parley::config::Config;
use parley::context::{ConversationContext, InterruptedTurnPolicy, Role, SharedContext};
use parley::interruption::InterruptionPolicy;
use parley::pipeline::{
    AudioChunk, ControlSignal, Frame, FrameKind, PipelineRunner, Stage, StageContext, StageError,
    StopReason, TaskHandle, TaskReport, TaskState, TranscriptDelta, compose,
};
use parley::services::stt::RecognizerScript;
use parley::services::{MockLanguageModel, MockRecognizer, MockSynthesizer};
use parley::transport::{ClientOutput, LoopbackClient, LoopbackTransport};
use parley::{ParleyError, PipelineTask};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Call {
    client: LoopbackClient,
    handle: TaskHandle,
    context: SharedContext,
    script: RecognizerScript,
    task: JoinHandle<TaskReport>,
}

impl Call {
    fn start(config: Config, model: MockLanguageModel, playback: Duration) -> Self {
        let (transport, client) = LoopbackTransport::new();
        let mut transport = transport.with_playback_delay(playback);
        let recognizer = MockRecognizer::new();
        let script = recognizer.script();
        let backends = Backends {
            recognizer,
            model,
            synthesizer: MockSynthesizer::new(),
        };
        let conversation = build_conversation(&config, &mut transport, backends).unwrap();
        let handle = conversation.handle();
        let context = conversation.context.clone();
        let task = tokio::spawn(conversation.task.run());
        Self {
            client,
            handle,
            context,
            script,
            task,
        }
    }

    fn echo(config: Config, playback: Duration) -> Self {
        Self::start(config, MockLanguageModel::new().echo(), playback)
    }

    /// The user says `text`, carried by one chunk of audio.
    async fn say(&self, text: &str) {
        self.script.push_utterance(text);
        self.client
            .send_audio(AudioChunk::silence(20, 16_000))
            .await
            .unwrap();
    }

    /// Collects client output up to and including the first match.
    async fn until(&mut self, mut done: impl FnMut(&ClientOutput) -> bool) -> Vec<ClientOutput> {
        let mut seen = Vec::new();
        let client = &mut self.client;
        tokio::time::timeout(WAIT, async {
            while let Some(output) = client.recv().await {
                let stop = done(&output);
                seen.push(output);
                if stop {
                    return;
                }
            }
            panic!("client output closed, saw {seen:?}");
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for client output"));
        seen
    }

    async fn hang_up(self) -> TaskReport {
        self.client.disconnect().await.unwrap();
        tokio::time::timeout(WAIT, self.task).await.unwrap().unwrap()
    }
}

fn spoken_text(outputs: &[ClientOutput]) -> String {
    outputs
        .iter()
        .filter_map(|o| match o {
            ClientOutput::Text(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn dialogue(context: &SharedContext) -> Vec<(Role, String, bool)> {
    context.read(|c| {
        c.dialogue()
            .map(|t| (t.role, t.content.clone(), t.partial))
            .collect()
    })
}

/// Polls until `condition` holds.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_greeting_is_spoken_then_committed() {
    let mut call = Call::echo(Config::default(), Duration::ZERO);
    call.client.connect().await.unwrap();

    let outputs = call
        .until(|o| *o == ClientOutput::BotStoppedSpeaking)
        .await;
    assert_eq!(outputs.first(), Some(&ClientOutput::BotStartedSpeaking));
    assert_eq!(spoken_text(&outputs), "Hello! I am listening.");
    // Two sentences, two chunks each.
    let audio = outputs
        .iter()
        .filter(|o| matches!(o, ClientOutput::Audio(_)))
        .count();
    assert_eq!(audio, 4);

    let context = call.context.clone();
    eventually("assistant greeting commit", || dialogue(&context).len() == 1).await;
    assert_eq!(
        dialogue(&call.context),
        vec![(Role::Assistant, "Hello! I am listening.".to_string(), false)]
    );
    // System prompt plus the kick-off message.
    let system = call
        .context
        .read(|c| c.turns().iter().filter(|t| t.role == Role::System).count());
    assert_eq!(system, 2);

    let handle = call.handle.clone();
    let report = call.hang_up().await;
    assert_eq!(report.reason, StopReason::ClientDisconnected);
    assert_eq!(report.state, TaskState::Stopped);
    assert_eq!(report.aborted_stages, 0);

    // A hung-up conversation takes no more frames.
    assert!(handle.history().contains(&TaskState::Cancelling));
    let queued = handle
        .queue_frame(FrameKind::Control(ControlSignal::Start))
        .await;
    assert!(matches!(queued, Err(ParleyError::TaskNotAccepting { .. })));
}

#[tokio::test]
async fn test_user_speech_reaches_generation() {
    let model = MockLanguageModel::new().echo();
    let received = model.received();
    let mut call = Call::start(Config::default(), model, Duration::ZERO);

    // No client connected, so no greeting: the user speaks first.
    call.say("hello there").await;
    let outputs = call
        .until(|o| *o == ClientOutput::BotStoppedSpeaking)
        .await;
    assert_eq!(spoken_text(&outputs), "You said: hello there");

    let snapshots = received.lock().clone();
    assert_eq!(snapshots.len(), 1);
    let turns: Vec<(Role, String)> = snapshots[0]
        .dialogue()
        .map(|t| (t.role, t.content.clone()))
        .collect();
    assert_eq!(turns, vec![(Role::User, "hello there".to_string())]);
    call.hang_up().await;
}

#[tokio::test]
async fn test_user_turn_gets_a_reply() {
    let mut call = Call::echo(Config::default(), Duration::ZERO);
    call.client.connect().await.unwrap();
    call.until(|o| *o == ClientOutput::BotStoppedSpeaking).await;

    call.say("what time is it").await;
    let outputs = call
        .until(|o| *o == ClientOutput::BotStoppedSpeaking)
        .await;
    assert_eq!(spoken_text(&outputs), "You said: what time is it");

    let context = call.context.clone();
    eventually("reply commit", || dialogue(&context).len() == 3).await;
    assert_eq!(
        dialogue(&call.context),
        vec![
            (Role::Assistant, "Hello! I am listening.".to_string(), false),
            (Role::User, "what time is it".to_string(), false),
            (Role::Assistant, "You said: what time is it".to_string(), false),
        ]
    );

    // The history survives a save and load.
    let json = call.context.to_json().unwrap();
    let restored = ConversationContext::from_json(&json).unwrap();
    assert_eq!(restored, call.context.get());

    let handle = call.handle.clone();
    let report = call.hang_up().await;
    assert_eq!(report.metrics.interruptions, 0);
    assert_eq!(
        handle.history(),
        vec![
            TaskState::Created,
            TaskState::Running,
            TaskState::Cancelling,
            TaskState::Stopped
        ]
    );
}

#[tokio::test]
async fn test_user_interrupts_assistant() {
    let mut call = Call::echo(Config::default(), Duration::from_millis(100));
    call.client.connect().await.unwrap();
    call.until(|o| *o == ClientOutput::BotStartedSpeaking).await;

    call.say("stop right there please").await;
    call.until(|o| *o == ClientOutput::Interrupted).await;
    assert_eq!(call.handle.current_turn(), 1);
    let handle = call.handle.clone();
    eventually("interruption state reset", || handle.interruption_state().is_reset()).await;

    let reply = call
        .until(|o| *o == ClientOutput::BotStoppedSpeaking)
        .await;
    assert_eq!(reply.first(), Some(&ClientOutput::BotStartedSpeaking));
    assert_eq!(spoken_text(&reply), "You said: stop right there please");

    // The interrupted greeting never reaches the context.
    let context = call.context.clone();
    eventually("reply commit", || dialogue(&context).len() == 2).await;
    assert_eq!(
        dialogue(&call.context),
        vec![
            (Role::User, "stop right there please".to_string(), false),
            (
                Role::Assistant,
                "You said: stop right there please".to_string(),
                false
            ),
        ]
    );

    let report = call.hang_up().await;
    assert_eq!(report.metrics.interruptions, 1);
    assert!(report.metrics.preempted >= 1);
}

#[tokio::test]
async fn test_interrupted_turn_kept_as_partial() {
    let mut config = Config::default();
    config.interruption.interrupted_turn = InterruptedTurnPolicy::MarkPartial;
    let mut call = Call::echo(config, Duration::from_millis(100));
    call.client.connect().await.unwrap();

    // Wait for the first sentence to be voiced, then let it settle in the
    // assistant aggregator while the second sentence plays.
    call.until(|o| matches!(o, ClientOutput::Text(_))).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    call.say("hold on a second").await;
    call.until(|o| *o == ClientOutput::Interrupted).await;
    call.until(|o| *o == ClientOutput::BotStoppedSpeaking).await;

    let context = call.context.clone();
    eventually("reply commit", || dialogue(&context).len() == 3).await;
    assert_eq!(
        dialogue(&call.context),
        vec![
            (Role::Assistant, "Hello!".to_string(), true),
            (Role::User, "hold on a second".to_string(), false),
            (Role::Assistant, "You said: hold on a second".to_string(), false),
        ]
    );
    call.hang_up().await;
}

#[tokio::test]
async fn test_short_backchannel_does_not_interrupt() {
    let mut call = Call::echo(Config::default(), Duration::from_millis(50));
    call.client.connect().await.unwrap();
    call.until(|o| *o == ClientOutput::BotStartedSpeaking).await;

    // Two words, below the default threshold of three.
    call.say("uh huh").await;
    let outputs = call
        .until(|o| *o == ClientOutput::BotStoppedSpeaking)
        .await;
    assert!(!outputs.contains(&ClientOutput::Interrupted));
    assert_eq!(spoken_text(&outputs), "Hello! I am listening.");
    assert_eq!(call.script.remaining(), 0);

    // Speech over the assistant that did not interrupt is not a turn.
    let context = call.context.clone();
    eventually("greeting commit", || dialogue(&context).len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        dialogue(&call.context),
        vec![(Role::Assistant, "Hello! I am listening.".to_string(), false)]
    );
    assert!(call.handle.interruption_state().is_reset());

    let report = call.hang_up().await;
    assert_eq!(report.metrics.interruptions, 0);
}

#[tokio::test]
async fn test_interruptions_disabled() {
    let mut config = Config::default();
    config.interruption.allow_interruptions = false;
    let mut call = Call::echo(config, Duration::from_millis(50));
    call.client.connect().await.unwrap();
    call.until(|o| *o == ClientOutput::BotStartedSpeaking).await;

    call.say("please stop talking right now").await;
    let outputs = call
        .until(|o| *o == ClientOutput::BotStoppedSpeaking)
        .await;
    assert!(!outputs.contains(&ClientOutput::Interrupted));
    assert_eq!(spoken_text(&outputs), "Hello! I am listening.");
    assert_eq!(call.handle.current_turn(), 0);

    let report = call.hang_up().await;
    assert_eq!(report.metrics.interruptions, 0);
}

#[tokio::test]
async fn test_single_word_threshold() {
    let mut config = Config::default();
    config.interruption.policy = InterruptionPolicy::min_words(1);
    let mut call = Call::echo(config, Duration::from_millis(100));
    call.client.connect().await.unwrap();
    call.until(|o| *o == ClientOutput::BotStartedSpeaking).await;

    call.say("wait").await;
    call.until(|o| *o == ClientOutput::Interrupted).await;
    let reply = call
        .until(|o| *o == ClientOutput::BotStoppedSpeaking)
        .await;
    assert_eq!(spoken_text(&reply), "You said: wait");
    call.hang_up().await;
}

#[tokio::test]
async fn test_forced_interrupt_from_handle() {
    let mut call = Call::echo(Config::default(), Duration::from_millis(100));
    call.client.connect().await.unwrap();
    call.until(|o| *o == ClientOutput::BotStartedSpeaking).await;

    assert_eq!(call.handle.interrupt(), Some(1));
    call.until(|o| *o == ClientOutput::Interrupted).await;

    // Nothing of the cancelled greeting plays after the interruption.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(call.client.try_recv(), None);
    assert!(dialogue(&call.context).is_empty());
    call.hang_up().await;
}

#[tokio::test]
async fn test_backend_timeout_is_reported() {
    let mut config = Config::default();
    config.pipeline.backend_timeout_ms = 50;
    let mut call = Call::start(config, MockLanguageModel::new().with_hang(), Duration::ZERO);
    call.client.connect().await.unwrap();

    let outputs = call
        .until(|o| matches!(o, ClientOutput::Error(_)))
        .await;
    let Some(ClientOutput::Error(signal)) = outputs.last() else {
        panic!("expected an error, got {outputs:?}");
    };
    assert_eq!(signal.stage, "llm");
    assert!(signal.timed_out);
    assert_eq!(signal.turn, Some(0));

    // The conversation keeps running.
    assert_eq!(call.handle.state(), TaskState::Running);
    let metrics = call.handle.metrics();
    assert_eq!(metrics.timeouts, 1);
    assert_eq!(metrics.stage_errors, 1);
    assert!(dialogue(&call.context).is_empty());

    call.handle.cancel();
    let report = tokio::time::timeout(WAIT, call.task).await.unwrap().unwrap();
    assert_eq!(report.reason, StopReason::Cancelled);
}

#[tokio::test]
async fn test_timeout_mid_response_leaves_conversation_usable() {
    let mut config = Config::default();
    config.pipeline.backend_timeout_ms = 50;
    // Playback outlasts the timeout, so audio is still queued at the error.
    let model = MockLanguageModel::new().with_stalled_reply("Hello there. ");
    let mut call = Call::start(config, model, Duration::from_millis(100));
    call.client.connect().await.unwrap();

    let mut outputs = call
        .until(|o| matches!(o, ClientOutput::Error(_)))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Some(output) = call.client.try_recv() {
        outputs.push(output);
    }
    let started = outputs
        .iter()
        .filter(|o| **o == ClientOutput::BotStartedSpeaking)
        .count();
    let stopped = outputs
        .iter()
        .filter(|o| **o == ClientOutput::BotStoppedSpeaking)
        .count();
    assert_eq!(started, 1, "{outputs:?}");
    assert_eq!(stopped, 1, "{outputs:?}");
    assert_eq!(outputs.last(), Some(&ClientOutput::BotStoppedSpeaking));

    // A short reply is a turn again, not speech over the assistant.
    call.say("yes").await;
    let context = call.context.clone();
    eventually("user turn commit", || !dialogue(&context).is_empty()).await;
    assert_eq!(
        dialogue(&call.context),
        vec![(Role::User, "yes".to_string(), false)]
    );
    assert_eq!(call.handle.state(), TaskState::Running);
    call.hang_up().await;
}

#[tokio::test]
async fn test_cancel_mid_response() {
    let mut call = Call::echo(Config::default(), Duration::from_millis(100));
    call.client.connect().await.unwrap();
    call.until(|o| *o == ClientOutput::BotStartedSpeaking).await;

    call.handle.cancel();
    call.handle.cancel();
    let report = tokio::time::timeout(WAIT, call.task).await.unwrap().unwrap();
    assert_eq!(report.state, TaskState::Stopped);
    assert_eq!(report.reason, StopReason::Cancelled);

    // Stopped tasks ignore cancel and refuse frames.
    call.handle.cancel();
    assert_eq!(call.handle.state(), TaskState::Stopped);
    let queued = call
        .handle
        .queue_frame(FrameKind::Control(ControlSignal::Start))
        .await;
    assert!(matches!(queued, Err(ParleyError::TaskNotAccepting { .. })));

    // The output stage is gone, so the client sees the end of the stream.
    let drained = tokio::time::timeout(WAIT, async {
        while call.client.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok());
}

#[tokio::test]
async fn test_runner_shuts_down_concurrent_conversations() {
    let runner = PipelineRunner::new();
    let mut tasks = Vec::new();
    let mut clients = Vec::new();
    let mut contexts = Vec::new();
    for _ in 0..2 {
        let (mut transport, client) = LoopbackTransport::new();
        let backends = Backends {
            recognizer: MockRecognizer::new(),
            model: MockLanguageModel::new().with_reply("Hi there."),
            synthesizer: MockSynthesizer::new(),
        };
        let conversation = build_conversation(&Config::default(), &mut transport, backends).unwrap();
        contexts.push(conversation.context.clone());
        tasks.push(conversation.task);
        clients.push(client);
    }

    let driver = runner.clone();
    let running = tokio::spawn(async move { driver.run_all(tasks).await });
    for client in &mut clients {
        client.connect().await.unwrap();
        tokio::time::timeout(WAIT, async {
            while let Some(output) = client.recv().await {
                if output == ClientOutput::BotStoppedSpeaking {
                    break;
                }
            }
        })
        .await
        .unwrap();
    }
    for context in &contexts {
        let context = context.clone();
        eventually("greeting commit", move || dialogue(&context).len() == 1).await;
    }

    runner.shutdown();
    let reports = tokio::time::timeout(WAIT, running).await.unwrap().unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.reason == StopReason::Cancelled));
    // Each conversation kept its own history.
    for context in &contexts {
        assert_eq!(
            dialogue(context),
            vec![(Role::Assistant, "Hi there.".to_string(), false)]
        );
    }
}

struct Relay(&'static str);

#[async_trait]
impl Stage for Relay {
    fn name(&self) -> &str {
        self.0
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> Result<(), StageError> {
        ctx.push(frame).await
    }
}

#[tokio::test]
async fn test_frames_leave_in_order() {
    let mut pipeline = compose(vec![
        Box::new(Relay("a")),
        Box::new(Relay("b")),
        Box::new(Relay("c")),
    ])
    .unwrap();
    let head = pipeline.head();
    let shared = pipeline.shared().clone();
    let mut output = pipeline.take_output().unwrap();
    let mut running = pipeline.start(CancellationToken::new());

    let count = 500;
    let feeder = tokio::spawn(async move {
        for i in 0..count {
            let text = FrameKind::Transcript(TranscriptDelta::user(i.to_string(), false));
            head.send(shared.stamp(text)).await.unwrap();
        }
        head.send(shared.stamp(FrameKind::Control(ControlSignal::End)))
            .await
            .unwrap();
    });

    let mut received = Vec::new();
    while let Some(frame) = output.recv().await {
        if let FrameKind::Transcript(delta) = frame.kind() {
            received.push(delta.text.parse::<usize>().unwrap());
        }
    }
    feeder.await.unwrap();
    running.wait().await;

    assert_eq!(received, (0..count).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_task_end_drains_queued_frames() {
    let pipeline = compose(vec![Box::new(Relay("only"))]).unwrap();
    let task = PipelineTask::new(pipeline, Default::default());
    let handle = task.handle();
    let running = tokio::spawn(task.run());

    handle.wait_for_state(TaskState::Running).await;
    for i in 0..10 {
        handle
            .queue_frame(FrameKind::Transcript(TranscriptDelta::user(
                i.to_string(),
                false,
            )))
            .await
            .unwrap();
    }
    handle.stop_when_done().await.unwrap();

    let report = tokio::time::timeout(WAIT, running).await.unwrap().unwrap();
    assert_eq!(report.reason, StopReason::Finished);
    // Start, ten transcripts and End were all forwarded.
    assert_eq!(report.metrics.frames_forwarded, 12);
}

//! Interactive demo conversation.
//!
//! Runs the full chain over the loopback transport with the scripted
//! backends: stdin lines stand in for recognized speech, the echo model
//! answers word by word and the tone synthesizer "speaks" it.

use crate::app::{Backends, build_conversation};
use crate::config::Config;
use crate::error::{ParleyError, Result};
use crate::pipeline::runner::PipelineRunner;
use crate::pipeline::task::TaskReport;
use crate::pipeline::types::AudioChunk;
use crate::services::{MockLanguageModel, MockRecognizer, MockSynthesizer};
use crate::transport::{ClientOutput, LoopbackTransport};
use owo_colors::OwoColorize;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Options for [`run_chat`].
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub word_delay: Duration,
    pub playback: Duration,
    pub quiet: bool,
}

/// Runs the chat until stdin closes or a shutdown signal arrives.
pub async fn run_chat(config: Config, options: ChatOptions) -> Result<TaskReport> {
    let (transport, mut client) = LoopbackTransport::new();
    let mut transport = transport.with_playback_delay(options.playback);

    let recognizer = MockRecognizer::new();
    let script = recognizer.script();
    let backends = Backends {
        recognizer,
        model: MockLanguageModel::new()
            .echo()
            .with_token_delay(options.word_delay),
        synthesizer: MockSynthesizer::new(),
    };
    let conversation = build_conversation(&config, &mut transport, backends)?;
    let runner = PipelineRunner::new().handle_signals(true);
    let task = conversation.task;
    let running = tokio::spawn(async move { runner.run(task).await });

    if !options.quiet {
        eprintln!(
            "{} {}",
            format!("parley {}.", crate::version_string()).bold(),
            "Type a line and press Enter to speak. Ctrl+D hangs up.".dimmed()
        );
    }
    client.connect().await?;

    // Each utterance is carried by one chunk of audio; the scripted
    // recognizer supplies its text.
    let carrier = AudioChunk::silence(20, config.pipeline.sample_rate);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    script.push_utterance(text);
                    if client.send_audio(carrier.clone()).await.is_err() {
                        break;
                    }
                }
                None => {
                    stdin_open = false;
                    if client.disconnect().await.is_err() {
                        break;
                    }
                }
            },
            output = client.recv() => match output {
                Some(output) => show(&output),
                None => break,
            },
        }
    }

    running
        .await
        .map_err(|e| ParleyError::Other(format!("conversation task failed: {e}")))
}

fn show(output: &ClientOutput) {
    if let Some(text) = render(output) {
        print!("{text}");
        // Best effort: a closed stdout only loses the echo.
        let _ = std::io::stdout().flush();
    }
}

/// What the user sees for one piece of client output. Backend failures are
/// logged, not shown.
fn render(output: &ClientOutput) -> Option<String> {
    match output {
        ClientOutput::BotStartedSpeaking => Some(format!("{} ", "assistant:".bold())),
        ClientOutput::Text(text) => Some(text.green().to_string()),
        ClientOutput::BotStoppedSpeaking => Some("\n".to_string()),
        ClientOutput::Interrupted => Some(format!(" {}\n", "[interrupted]".yellow())),
        ClientOutput::Error(signal) => {
            tracing::warn!(
                stage = %signal.stage,
                timed_out = signal.timed_out,
                message = %signal.message,
                "backend failure"
            );
            None
        }
        ClientOutput::Audio(_) => None,
    }
}

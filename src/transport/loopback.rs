//! In-process transport.
//!
//! The [`LoopbackClient`] plays the remote party: it sends user audio and
//! lifecycle events in, and receives whatever the assistant "plays" back.

use crate::context::Role;
use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::pipeline::error::StageError;
use crate::pipeline::stage::{Stage, StageContext};
use crate::pipeline::types::{
    AudioChunk, ControlSignal, ErrorSignal, FailedResponse, Frame, FrameKind, TurnId,
};
use crate::transport::{Transport, TransportEvent};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// What the client receives from the assistant side.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOutput {
    BotStartedSpeaking,
    Audio(AudioChunk),
    /// Assistant text, sent once the matching audio was played.
    Text(String),
    BotStoppedSpeaking,
    /// Playback was cut off by an interruption.
    Interrupted,
    Error(ErrorSignal),
}

/// Loopback transport: hands out its input/output stages once and the
/// lifecycle event channel once.
pub struct LoopbackTransport {
    input: Option<LoopbackInput>,
    output: Option<LoopbackOutput>,
    events: Option<mpsc::Receiver<TransportEvent>>,
}

impl LoopbackTransport {
    /// Creates a transport and the client connected to it.
    pub fn new() -> (Self, LoopbackClient) {
        let (audio_tx, audio_rx) = mpsc::channel(defaults::INGRESS_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(16);
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let transport = Self {
            input: Some(LoopbackInput {
                ingress: Some(audio_rx),
            }),
            output: Some(LoopbackOutput {
                client: output_tx,
                speaking: None,
                failed: FailedResponse::default(),
                playback_delay: Duration::ZERO,
            }),
            events: Some(events_rx),
        };
        let client = LoopbackClient {
            name: "loopback".to_string(),
            audio: audio_tx,
            events: events_tx,
            output: output_rx,
        };
        (transport, client)
    }

    /// Time the output stage spends "playing" each audio chunk.
    pub fn with_playback_delay(mut self, delay: Duration) -> Self {
        if let Some(output) = self.output.as_mut() {
            output.playback_delay = delay;
        }
        self
    }
}

impl Transport for LoopbackTransport {
    fn input(&mut self) -> Result<Box<dyn Stage>> {
        let input = self.input.take().ok_or_else(|| ParleyError::Transport {
            message: "input stage already taken".to_string(),
        })?;
        Ok(Box::new(input))
    }

    fn output(&mut self) -> Result<Box<dyn Stage>> {
        let output = self.output.take().ok_or_else(|| ParleyError::Transport {
            message: "output stage already taken".to_string(),
        })?;
        Ok(Box::new(output))
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.take()
    }
}

struct LoopbackInput {
    ingress: Option<mpsc::Receiver<FrameKind>>,
}

#[async_trait]
impl Stage for LoopbackInput {
    fn name(&self) -> &str {
        "transport.input"
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> std::result::Result<(), StageError> {
        ctx.push(frame).await
    }

    fn ingress(&mut self) -> Option<mpsc::Receiver<FrameKind>> {
        self.ingress.take()
    }
}

struct LoopbackOutput {
    client: mpsc::UnboundedSender<ClientOutput>,
    /// Turn whose audio is currently playing.
    speaking: Option<Option<TurnId>>,
    /// Audio and text still queued for a failed response are not played.
    failed: FailedResponse,
    playback_delay: Duration,
}

impl LoopbackOutput {
    fn send(&self, output: ClientOutput) {
        if self.client.send(output).is_err() {
            tracing::trace!("loopback client gone, output dropped");
        }
    }

    async fn stop_speaking(&mut self, ctx: &StageContext) -> std::result::Result<(), StageError> {
        if let Some(turn) = self.speaking.take() {
            ctx.emit_for_turn(turn, FrameKind::Control(ControlSignal::BotStoppedSpeaking))
                .await?;
            self.send(ClientOutput::BotStoppedSpeaking);
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for LoopbackOutput {
    fn name(&self) -> &str {
        "transport.output"
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> std::result::Result<(), StageError> {
        if self.failed.covers(&frame)
            && matches!(frame.kind(), FrameKind::Audio(_) | FrameKind::Transcript(_))
        {
            tracing::trace!(turn = ?frame.turn(), "dropping output of failed response");
            return Ok(());
        }
        match frame.kind() {
            FrameKind::Audio(chunk) if frame.turn().is_some() => {
                if self.speaking.is_none() {
                    self.speaking = Some(frame.turn());
                    ctx.emit_for_turn(
                        frame.turn(),
                        FrameKind::Control(ControlSignal::BotStartedSpeaking),
                    )
                    .await?;
                    self.send(ClientOutput::BotStartedSpeaking);
                }
                if !self.playback_delay.is_zero() {
                    tokio::time::sleep(self.playback_delay).await;
                }
                self.send(ClientOutput::Audio(chunk.clone()));
                Ok(())
            }
            FrameKind::Transcript(delta) if delta.role == Role::Assistant => {
                self.send(ClientOutput::Text(delta.text.clone()));
                ctx.push(frame).await
            }
            FrameKind::Control(ControlSignal::ResponseComplete) => {
                self.stop_speaking(ctx).await?;
                ctx.push(frame).await
            }
            FrameKind::Control(ControlSignal::Error(signal)) => {
                self.send(ClientOutput::Error(signal.clone()));
                if self.failed.record(&frame).is_some() {
                    self.stop_speaking(ctx).await?;
                }
                ctx.push(frame).await
            }
            _ => ctx.push(frame).await,
        }
    }

    fn on_interrupt(&mut self) {
        if self.speaking.take().is_some() {
            self.send(ClientOutput::Interrupted);
        }
    }
}

/// The remote end of a [`LoopbackTransport`].
pub struct LoopbackClient {
    name: String,
    audio: mpsc::Sender<FrameKind>,
    events: mpsc::Sender<TransportEvent>,
    output: mpsc::UnboundedReceiver<ClientOutput>,
}

impl LoopbackClient {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn connect(&self) -> Result<()> {
        self.event(TransportEvent::ClientConnected {
            client: self.name.clone(),
        })
        .await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.event(TransportEvent::ClientDisconnected {
            client: self.name.clone(),
        })
        .await
    }

    /// Sends one chunk of user audio.
    pub async fn send_audio(&self, chunk: AudioChunk) -> Result<()> {
        self.audio
            .send(FrameKind::Audio(chunk))
            .await
            .map_err(|_| ParleyError::TransportDisconnected)
    }

    /// Next output from the assistant side, `None` once the output stage is gone.
    pub async fn recv(&mut self) -> Option<ClientOutput> {
        self.output.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ClientOutput> {
        self.output.try_recv().ok()
    }

    async fn event(&self, event: TransportEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| ParleyError::TransportDisconnected)
    }
}

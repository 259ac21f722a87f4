//! Links between stages.
//!
//! A link is a pair of queues: a bounded data queue that carries audio,
//! text, context snapshots and in-band control frames in FIFO order, and an
//! unbounded priority queue for [`ControlSignal::is_priority`] frames. The
//! receiving side always drains the priority queue first, so an interrupt
//! overtakes any backlog of audio.
//!
//! [`ControlSignal::is_priority`]: crate::pipeline::types::ControlSignal::is_priority

use crate::pipeline::types::{Frame, TurnTracker};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// The receiving stage has stopped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("link '{0}' is closed")]
pub struct LinkClosed(pub String);

/// Creates a link named after the stage it feeds.
pub fn link(name: &str, capacity: usize) -> (LinkSender, LinkReceiver) {
    let (data_tx, data_rx) = mpsc::channel(capacity.max(1));
    let (priority_tx, priority_rx) = mpsc::unbounded_channel();
    (
        LinkSender {
            name: Arc::from(name),
            data: data_tx,
            priority: priority_tx,
        },
        LinkReceiver {
            data: data_rx,
            priority: priority_rx,
            backlog: VecDeque::new(),
        },
    )
}

/// Sending half of a link. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LinkSender {
    name: Arc<str>,
    data: mpsc::Sender<Frame>,
    priority: mpsc::UnboundedSender<Frame>,
}

impl LinkSender {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends a frame, waiting for queue space unless it is a priority frame.
    pub async fn send(&self, frame: Frame) -> Result<(), LinkClosed> {
        if frame.is_priority() {
            return self.send_priority(frame);
        }
        self.data
            .send(frame)
            .await
            .map_err(|_| LinkClosed(self.name.to_string()))
    }

    /// Sends on the priority queue regardless of the frame kind.
    pub fn send_priority(&self, frame: Frame) -> Result<(), LinkClosed> {
        self.priority
            .send(frame)
            .map_err(|_| LinkClosed(self.name.to_string()))
    }

    pub(crate) fn priority_sender(&self) -> mpsc::UnboundedSender<Frame> {
        self.priority.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.data.is_closed()
    }
}

/// Receiving half of a link, owned by exactly one stage.
#[derive(Debug)]
pub struct LinkReceiver {
    data: mpsc::Receiver<Frame>,
    priority: mpsc::UnboundedReceiver<Frame>,
    /// Data frames pulled out of the queue by [`LinkReceiver::flush_stale`].
    backlog: VecDeque<Frame>,
}

impl LinkReceiver {
    /// Receives the next frame: priority frames first, then data in FIFO order.
    ///
    /// Returns `None` once every sender is gone and the data queue is drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        if let Ok(frame) = self.priority.try_recv() {
            return Some(frame);
        }
        if let Some(frame) = self.backlog.pop_front() {
            return Some(frame);
        }
        tokio::select! {
            biased;
            Some(frame) = self.priority.recv() => Some(frame),
            frame = self.data.recv() => frame,
        }
    }

    /// Waits for the next priority frame only.
    ///
    /// Never resolves once the priority queue is closed.
    pub async fn recv_priority(&mut self) -> Frame {
        match self.priority.recv().await {
            Some(frame) => frame,
            None => std::future::pending().await,
        }
    }

    /// Drops queued data frames that belong to a cancelled turn.
    ///
    /// Surviving frames keep their order. Returns the number dropped.
    pub fn flush_stale(&mut self, turns: &TurnTracker) -> usize {
        while let Ok(frame) = self.data.try_recv() {
            self.backlog.push_back(frame);
        }
        let before = self.backlog.len();
        self.backlog.retain(|frame| !turns.is_stale(frame));
        before - self.backlog.len()
    }

    /// Number of data frames waiting, including the backlog.
    pub fn pending(&self) -> usize {
        self.backlog.len() + self.data.len()
    }
}

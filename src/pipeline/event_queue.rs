//! Completion queue between node sessions and the scheduler.
//!
//! Every finished node session pushes exactly one `(node, session key)`
//! event. Synchronous nodes push from the scheduler thread itself; DL nodes
//! push from the accelerator's completion callback through a cloned
//! [`EventSender`].

use super::id::NodeId;
use super::session_metadata::SessionKey;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// A finished node session
pub type PipelineEvent = (NodeId, SessionKey);

/// Cloneable producer half of a [`PipelineEventQueue`]
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: Sender<PipelineEvent>,
}

impl EventSender {
    pub fn push(&self, node: NodeId, session_key: SessionKey) {
        tracing::trace!("Pushing event for node {:?} session {}", node, session_key);
        // The receiver lives as long as the pipeline; after a failed request
        // has been torn down, late completions are dropped.
        let _ = self.tx.send((node, session_key));
    }
}

/// Per-request queue of finished node sessions
#[derive(Debug)]
pub struct PipelineEventQueue {
    tx: Sender<PipelineEvent>,
    rx: Receiver<PipelineEvent>,
}

impl PipelineEventQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    pub fn push(&self, node: NodeId, session_key: SessionKey) {
        self.sender().push(node, session_key);
    }

    /// Wait up to `timeout` for the next event.
    pub fn try_pull(&self, timeout: Duration) -> Option<PipelineEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for PipelineEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

//! Scoped ownership of one pooled accelerator stream.
//!
//! A [`StreamIdGuard`] is created per DL node session. It acquires at most
//! one stream id and hands it back exactly once, when the guard is dropped
//! or disarmed, on every exit path of the session.

use crate::accelerator::{InferRequestsQueue, StreamId};
use std::sync::Arc;
use std::time::Duration;

pub struct StreamIdGuard {
    queue: Arc<InferRequestsQueue>,
    id: Option<StreamId>,
}

impl StreamIdGuard {
    /// A guard for `queue` that holds no stream yet.
    pub fn new(queue: Arc<InferRequestsQueue>) -> Self {
        Self { queue, id: None }
    }

    /// Acquire a stream, waiting at most `timeout`. Once acquired, the same
    /// id is returned on every call.
    pub fn try_get_id(&mut self, timeout: Duration) -> Option<StreamId> {
        if self.id.is_none() {
            self.id = self.queue.try_get_id(timeout);
        }
        self.id
    }

    pub fn id(&self) -> Option<StreamId> {
        self.id
    }

    pub fn queue(&self) -> &Arc<InferRequestsQueue> {
        &self.queue
    }

    /// Give back the reservation. Returns false if no stream was held.
    pub fn disarm(&mut self) -> bool {
        match self.id.take() {
            Some(id) => {
                self.queue.return_stream(id);
                true
            }
            None => false,
        }
    }
}

impl Drop for StreamIdGuard {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl std::fmt::Debug for StreamIdGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamIdGuard").field("id", &self.id).finish()
    }
}

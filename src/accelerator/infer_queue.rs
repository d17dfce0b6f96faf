//! Bounded pool of inference requests ("streams")
//!
//! Idle stream ids travel through a bounded channel sized to the pool. A
//! caller acquires one with [`InferRequestsQueue::try_get_id`], which waits
//! at most the given timeout and never blocks indefinitely, and hands it back
//! with [`InferRequestsQueue::return_stream`]. Engine code does not call
//! these directly; it holds a [`StreamIdGuard`](crate::pipeline::StreamIdGuard).

use super::InferRequest;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Index of one inference request in its pool
pub type StreamId = usize;

/// Acquisition statistics of a stream pool
///
/// Tracks acquisitions, releases, timeouts and how long callers waited.
#[derive(Debug, Clone)]
pub struct StreamPoolStats {
    /// Successful acquisitions
    pub acquires: u64,
    /// Streams handed back
    pub releases: u64,
    /// Acquisition attempts that timed out
    pub timeouts: u64,
    /// Total wait of successful acquisitions in microseconds
    pub total_wait_us: u64,
    /// Minimum wait observed (microseconds)
    pub min_wait_us: u64,
    /// Maximum wait observed (microseconds)
    pub max_wait_us: u64,
}

impl Default for StreamPoolStats {
    fn default() -> Self {
        Self {
            acquires: 0,
            releases: 0,
            timeouts: 0,
            total_wait_us: 0,
            min_wait_us: u64::MAX,
            max_wait_us: 0,
        }
    }
}

impl StreamPoolStats {
    /// Average wait of successful acquisitions in microseconds
    pub fn avg_wait_us(&self) -> f64 {
        if self.acquires == 0 {
            0.0
        } else {
            self.total_wait_us as f64 / self.acquires as f64
        }
    }

    /// Streams currently held by callers
    pub fn outstanding(&self) -> u64 {
        self.acquires.saturating_sub(self.releases)
    }

    fn record_acquire(&mut self, wait_us: u64) {
        self.acquires += 1;
        self.total_wait_us += wait_us;
        self.min_wait_us = self.min_wait_us.min(wait_us);
        self.max_wait_us = self.max_wait_us.max(wait_us);
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Fixed-size pool of inference requests of one model instance.
pub struct InferRequestsQueue {
    requests: Vec<Mutex<Box<dyn InferRequest>>>,
    idle_tx: Sender<StreamId>,
    idle_rx: Receiver<StreamId>,
    stats: Mutex<StreamPoolStats>,
}

impl InferRequestsQueue {
    pub fn new(requests: Vec<Box<dyn InferRequest>>) -> Self {
        let (idle_tx, idle_rx) = bounded(requests.len().max(1));
        for id in 0..requests.len() {
            // Capacity equals the pool size, so this cannot fail.
            let _ = idle_tx.try_send(id);
        }
        Self {
            requests: requests.into_iter().map(Mutex::new).collect(),
            idle_tx,
            idle_rx,
            stats: Mutex::new(StreamPoolStats::default()),
        }
    }

    /// Number of streams in the pool
    pub fn size(&self) -> usize {
        self.requests.len()
    }

    /// Streams currently free
    pub fn idle_count(&self) -> usize {
        self.idle_rx.len()
    }

    /// Take an idle stream, waiting at most `timeout`.
    pub fn try_get_id(&self, timeout: Duration) -> Option<StreamId> {
        let start = Instant::now();
        match self.idle_rx.recv_timeout(timeout) {
            Ok(id) => {
                let waited = start.elapsed().as_micros() as u64;
                self.lock_stats().record_acquire(waited);
                tracing::trace!("Acquired stream {} after {}us", id, waited);
                Some(id)
            }
            Err(_) => {
                self.lock_stats().timeouts += 1;
                None
            }
        }
    }

    /// Hand a stream back to the pool.
    pub fn return_stream(&self, id: StreamId) {
        if id >= self.requests.len() {
            tracing::error!("Tried to return unknown stream {}", id);
            return;
        }
        if self.idle_tx.try_send(id).is_err() {
            tracing::error!("Stream {} returned to a full pool", id);
            return;
        }
        self.lock_stats().releases += 1;
        tracing::trace!("Returned stream {}", id);
    }

    /// Borrow the inference request behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this pool.
    pub fn infer_request(&self, id: StreamId) -> MutexGuard<'_, Box<dyn InferRequest>> {
        self.requests[id]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> StreamPoolStats {
        self.lock_stats().clone()
    }

    pub fn reset_stats(&self) {
        self.lock_stats().reset();
    }

    fn lock_stats(&self) -> MutexGuard<'_, StreamPoolStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for InferRequestsQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferRequestsQueue")
            .field("size", &self.size())
            .field("idle", &self.idle_count())
            .finish()
    }
}

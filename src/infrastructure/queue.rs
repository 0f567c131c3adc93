//! At-least-once work queue for pending build jobs.
//!
//! Messages carry the full job record at enqueue time; the dequeuer
//! reloads from persistence before acting (orphan rule). Delivery is
//! at-least-once: an unacked message is redelivered via `nack`, and a
//! duplicate delivery is harmless because the worker re-checks the record.
//! Ack is idempotent.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::build::BuildJob;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
}

/// One delivery of a job. `attempt` starts at 1 and counts redeliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub job: BuildJob,
    pub attempt: u32,
}

/// Ordered delivery of pending jobs to workers.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, job: &BuildJob) -> Result<(), QueueError>;

    /// Block until a message is available or the queue shuts down.
    /// Returns `None` on shutdown.
    async fn dequeue(&self) -> Option<QueueMessage>;

    /// Acknowledge a delivery. Idempotent.
    async fn ack(&self, id: &str) -> Result<(), QueueError>;

    /// Return an in-flight delivery to the queue for redelivery.
    async fn nack(&self, id: &str) -> Result<(), QueueError>;

    async fn is_acked(&self, id: &str) -> bool;
}

#[derive(Default)]
struct State {
    ready: VecDeque<QueueMessage>,
    in_flight: HashMap<String, QueueMessage>,
    acked: HashSet<String>,
}

/// In-memory reference queue.
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop delivery: blocked dequeuers return `None`.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, job: &BuildJob) -> Result<(), QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }
        {
            let mut state = self.state.lock().await;
            state.ready.push_back(QueueMessage {
                job: job.clone(),
                attempt: 1,
            });
        }
        debug!(build_id = %job.id, "enqueued build job");
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Option<QueueMessage> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            {
                let mut state = self.state.lock().await;
                if let Some(message) = state.ready.pop_front() {
                    state
                        .in_flight
                        .insert(message.job.id.clone(), message.clone());
                    return Some(message);
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    async fn ack(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(id);
        state.acked.insert(id.to_string());
        Ok(())
    }

    async fn nack(&self, id: &str) -> Result<(), QueueError> {
        let redelivered = {
            let mut state = self.state.lock().await;
            match state.in_flight.remove(id) {
                Some(mut message) => {
                    message.attempt += 1;
                    state.ready.push_back(message);
                    true
                }
                None => false,
            }
        };
        if redelivered {
            debug!(build_id = %id, "nacked; message returned for redelivery");
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn is_acked(&self, id: &str) -> bool {
        self.state.lock().await.acked.contains(id)
    }
}

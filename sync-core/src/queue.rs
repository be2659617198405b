//! Pending operation queue for liftsync.
//!
//! Local mutations that could not be delivered wait here until a flush gets
//! them to the peer. The queue provides:
//! - Strict ascending sequence order (the flush always starts at the front)
//! - Retry bookkeeping (retry count, last attempt) for the backoff policy
//! - A failed set for operations that exhausted their attempts
//! - A byte snapshot so the queue survives suspension and relaunch
//!
//! Nothing is ever dropped silently: an operation leaves the queue only when
//! it is delivered, acknowledged, or moved to the failed set.

use std::collections::{BTreeMap, VecDeque};

use liftsync_types::{OperationId, SequenceNumber, SyncMessage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Error type for queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The persisted snapshot could not be encoded.
    #[error("queue snapshot encode failed: {0}")]
    Encode(#[source] rmp_serde::encode::Error),

    /// The persisted snapshot could not be decoded.
    #[error("queue snapshot corrupt: {0}")]
    Corrupt(String),
}

/// A local mutation waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique identifier of this operation.
    pub id: OperationId,
    /// The message to deliver.
    pub message: SyncMessage,
    /// When the operation was queued, Unix milliseconds.
    pub enqueued_at: u64,
    /// Failed flush attempts so far.
    pub retry_count: u32,
    /// Last flush attempt, Unix milliseconds.
    pub last_attempt_at: Option<u64>,
}

impl PendingOperation {
    /// Wrap a message that just failed its immediate send.
    pub fn new(message: SyncMessage, now_ms: u64) -> Self {
        Self {
            id: OperationId::new(),
            message,
            enqueued_at: now_ms,
            retry_count: 0,
            last_attempt_at: None,
        }
    }

    /// Sequence number of the wrapped message (the queue order key).
    pub fn sequence(&self) -> SequenceNumber {
        self.message.sequence
    }
}

/// What happened after a failed flush attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// The operation stays queued and is due again after `delay`.
    Retry {
        /// Failures so far.
        attempt: u32,
        /// Backoff until the next attempt.
        delay: std::time::Duration,
    },
    /// The operation exhausted its attempts and moved to the failed set.
    GaveUp(PendingOperation),
}

#[derive(Serialize, Deserialize)]
struct QueueSnapshot {
    pending: Vec<PendingOperation>,
    failed: Vec<PendingOperation>,
    failed_total: u64,
}

/// Ordered queue of undelivered operations.
#[derive(Debug)]
pub struct PendingQueue {
    /// Maximum number of pending operations.
    capacity: usize,
    /// Pending operations keyed by sequence number.
    pending: BTreeMap<SequenceNumber, PendingOperation>,
    /// Most recent permanently failed operations (bounded by capacity).
    failed: VecDeque<PendingOperation>,
    /// Operations failed since the queue was created.
    failed_total: u64,
}

impl PendingQueue {
    /// Create an empty queue holding at most `capacity` pending operations.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: BTreeMap::new(),
            failed: VecDeque::new(),
            failed_total: 0,
        }
    }

    /// Add an operation.
    ///
    /// When the queue is full the oldest pending operation is moved to the
    /// failed set and returned.
    pub fn enqueue(&mut self, op: PendingOperation) -> Option<PendingOperation> {
        let evicted = if self.pending.len() >= self.capacity {
            self.pending.pop_first().map(|(_, oldest)| {
                self.mark_failed(oldest.clone());
                oldest
            })
        } else {
            None
        };
        self.pending.insert(op.sequence(), op);
        evicted
    }

    /// The operation with the lowest sequence number.
    pub fn front(&self) -> Option<&PendingOperation> {
        self.pending.values().next()
    }

    /// Remove an operation that was delivered or acknowledged.
    pub fn remove(&mut self, sequence: SequenceNumber) -> Option<PendingOperation> {
        self.pending.remove(&sequence)
    }

    /// Record a failed flush attempt at `now_ms`.
    ///
    /// Returns `None` if no operation has this sequence number.
    pub fn record_failure(
        &mut self,
        sequence: SequenceNumber,
        now_ms: u64,
        policy: &RetryPolicy,
    ) -> Option<RetryOutcome> {
        let op = self.pending.get_mut(&sequence)?;
        op.retry_count = op.retry_count.saturating_add(1);
        op.last_attempt_at = Some(now_ms);

        if policy.exhausted(op.retry_count) {
            let op = self.pending.remove(&sequence)?;
            self.mark_failed(op.clone());
            return Some(RetryOutcome::GaveUp(op));
        }

        Some(RetryOutcome::Retry {
            attempt: op.retry_count,
            delay: policy.delay_for(op.retry_count),
        })
    }

    fn mark_failed(&mut self, op: PendingOperation) {
        self.failed_total = self.failed_total.saturating_add(1);
        self.failed.push_back(op);
        while self.failed.len() > self.capacity {
            self.failed.pop_front();
        }
    }

    /// Pending operations in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingOperation> {
        self.pending.values()
    }

    /// Number of pending operations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Operations permanently failed since creation (or restore).
    pub fn failed_count(&self) -> u64 {
        self.failed_total
    }

    /// The most recent permanently failed operations, oldest first.
    pub fn failed(&self) -> impl Iterator<Item = &PendingOperation> {
        self.failed.iter()
    }

    /// Serialize pending and failed operations for durable storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, QueueError> {
        let snapshot = QueueSnapshot {
            pending: self.pending.values().cloned().collect(),
            failed: self.failed.iter().cloned().collect(),
            failed_total: self.failed_total,
        };
        rmp_serde::to_vec_named(&snapshot).map_err(QueueError::Encode)
    }

    /// Restore a queue from [`PendingQueue::to_bytes`] output.
    pub fn from_bytes(bytes: &[u8], capacity: usize) -> Result<Self, QueueError> {
        let snapshot: QueueSnapshot =
            rmp_serde::from_slice(bytes).map_err(|e| QueueError::Corrupt(e.to_string()))?;

        let mut queue = Self::new(capacity);
        queue.failed_total = snapshot.failed_total;
        queue.failed = snapshot.failed.into();
        for op in snapshot.pending {
            queue.enqueue(op);
        }
        Ok(queue)
    }
}

//! Error types for liftsync-client.

use std::time::Duration;

use liftsync_core::QueueError;
use liftsync_store::PersistenceError;
use liftsync_types::CodecError;
use thiserror::Error;

use crate::config::ConfigError;

/// A send that did not reach the peer.
///
/// Always recovered by queueing and retrying; never returned from the
/// coordinator's mutation calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransmissionError {
    /// Peer out of range or asleep.
    #[error("peer unreachable")]
    Unreachable,

    /// The send did not complete in time.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    /// Peer reachable but the companion app is not installed.
    #[error("peer app not installed")]
    PeerAppMissing,

    /// Session not established (never activated or deactivated).
    #[error("transport not activated")]
    NotActivated,

    /// Any other transport failure.
    #[error("send failed: {0}")]
    Failed(String),
}

/// Coordinator errors.
///
/// Only returned from start-up, from the diagnostic ping, or once the
/// coordinator has stopped. Sync problems during normal operation degrade to
/// queueing instead.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Configuration rejected at start-up.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Durable store failure.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Message encoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Persisted queue could not be read or written.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The diagnostic ping could not be sent.
    #[error("transmission error: {0}")]
    Transmission(#[from] TransmissionError),

    /// The coordinator task has stopped.
    #[error("coordinator stopped")]
    Closed,
}

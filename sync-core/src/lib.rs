//! # sync-core
//!
//! Pure logic for liftsync (no I/O, instant tests).
//!
//! This crate implements the queue, conflict rules and state machines of the
//! handheld/wrist sync pair without any network or disk I/O, enabling fast
//! unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (transport, durable store) is performed by `sync-client`,
//! which drives these structures from its coordinator task.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod connection;
pub mod queue;
pub mod retry;
pub mod sequence;

pub use conflict::{ConflictResolver, EntityKey, Resolution, Version};
pub use connection::{ConnectionState, ConnectionStatus, LinkAction, LinkEvent};
pub use queue::{PendingOperation, PendingQueue, QueueError, RetryOutcome};
pub use retry::RetryPolicy;
pub use sequence::{AppliedLog, AppliedLogSnapshot, SequenceWindow};

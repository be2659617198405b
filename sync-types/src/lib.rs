//! # sync-types
//!
//! Message types and codec for liftsync, the handheld/wrist workout sync pair.
//!
//! This crate provides the foundational types used across all liftsync crates:
//! - [`DeviceId`], [`DeviceRole`], [`SequenceNumber`], [`MessageId`], [`OperationId`] - identity and ordering
//! - [`SyncMessage`] and [`Payload`] - the closed set of sync messages
//! - [`codec`] - the private byte format
//! - [`CodecError`] - error types

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
mod error;
mod ids;
mod messages;

pub use error::CodecError;
pub use ids::{DeviceId, DeviceRole, MessageId, OperationId, SequenceNumber};
pub use messages::{
    now_millis, AckOutcome, AckPayload, MessageKind, Payload, PingDirection,
    SetCompletionPayload, SharedWorkoutSessionSnapshot, SyncMessage, TestPingPayload,
    TimerStatePayload, WorkoutCompletionPayload, PROTOCOL_VERSION,
};

//! # sync-client
//!
//! Sync coordinator for the liftsync handheld/wrist workout pair.
//!
//! This is the library the business layer on each device talks to. It turns
//! local workout mutations into sync messages, gets them to the peer over an
//! unreliable companion link, and applies the peer's messages to the shared
//! store.
//!
//! ## Features
//!
//! - **Offline-first**: failed sends are queued durably and flushed in order
//! - **Idempotent receive**: duplicates are acknowledged but never re-applied
//! - **Deterministic conflicts**: newest write wins, handheld wins ties
//! - **Transport Abstraction**: Pluggable transport layer (companion link, mock)
//! - **Pure State Machine**: Uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use liftsync_client::{CoordinatorConfig, MockTransport, SyncCoordinator};
//!
//! let config = CoordinatorConfig::from_file(Path::new("liftsync.toml"))?;
//! let coordinator = SyncCoordinator::start(config, transport, store).await?;
//!
//! // Share a logged set
//! coordinator.sync_set_completion(set).await?;
//!
//! // React to the peer's changes
//! let mut events = coordinator.subscribe();
//! while let Ok(event) = events.recv().await { /* ... */ }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod coordinator;
mod error;
pub mod transport;

pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{
    keys, AppliedState, AppliedUpdate, CoordinatorStatus, Delivery, FlushReport, SyncCoordinator,
    SyncEvent, SyncOutcome,
};
pub use error::{CoordinatorError, TransmissionError};
pub use transport::{LinkHandler, MockTransport, ReceiveHandler, Transport};

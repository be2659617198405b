//! Transport abstraction for liftsync.
//!
//! This module provides a pluggable transport layer that abstracts the
//! session between the handheld and the wrist device (the platform's
//! companion-device link in production, an in-process mock for testing).
//!
//! # Design
//!
//! The transport is session-oriented and push-based:
//! - `activate()` establishes the session and reports the resulting state
//! - `send()` transmits encoded message bytes
//! - `on_receive()` registers the callback for inbound bytes
//! - `on_link_action()` registers the callback for state changes
//! - `deactivate()` tears the session down on suspension
//!
//! The transport owns the [`ConnectionState`]; everything else only reads it.
//! Handlers are called from whatever context the transport delivers on, so
//! they must not block. The coordinator's handlers only post a command.
//!
//! # Example
//!
//! ```ignore
//! let (phone, watch) = MockTransport::pair();
//! phone.activate().await;
//! watch.on_receive(Arc::new(|bytes| println!("{} bytes", bytes.len())));
//! phone.send(&bytes).await?;
//! ```

mod mock;

pub use mock::MockTransport;

use std::sync::Arc;

use async_trait::async_trait;
use liftsync_core::{ConnectionState, LinkAction};

use crate::error::TransmissionError;

/// Callback invoked with the raw bytes of each inbound message.
pub type ReceiveHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Callback invoked with every state-change action the link produces.
pub type LinkHandler = Arc<dyn Fn(LinkAction) + Send + Sync>;

/// Transport trait for exchanging sync messages with the peer device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin session establishment and return the resulting state.
    async fn activate(&self) -> ConnectionState;

    /// Send bytes to the peer.
    ///
    /// May hang if the link stalls; callers bound it with a timeout.
    async fn send(&self, bytes: &[u8]) -> Result<(), TransmissionError>;

    /// Register the inbound message handler, replacing any previous one.
    fn on_receive(&self, handler: ReceiveHandler);

    /// Register the state-change handler, replacing any previous one.
    fn on_link_action(&self, handler: LinkHandler);

    /// Current session state.
    fn state(&self) -> ConnectionState;

    /// Check if messages can currently be delivered.
    fn is_reachable(&self) -> bool {
        self.state().is_reachable()
    }

    /// Check if the companion app is installed on the peer.
    fn peer_app_installed(&self) -> bool;

    /// Tear the session down.
    async fn deactivate(&self);
}

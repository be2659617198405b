//! Connection state machine for the handheld/wrist link.
//!
//! This module provides a pure, side-effect-free state machine for the
//! transport session lifecycle. It takes events as input and produces a new
//! state plus a list of actions to execute.
//!
//! The transport owns the state and performs the actual I/O; the coordinator
//! only reads it.

use serde::{Deserialize, Serialize};

/// Transport session state - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Session never started.
    NotActivated,
    /// Session establishment in progress.
    Activating,
    /// Peer reachable and its app installed.
    Reachable,
    /// Peer out of range or asleep.
    Unreachable,
    /// Peer reachable but the companion app is not installed.
    PeerAppMissing,
    /// Session torn down (process suspended or terminated).
    Deactivated,
}

impl ConnectionState {
    /// Create a new state machine in the NotActivated state.
    pub fn new() -> Self {
        Self::NotActivated
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. Unknown transitions leave
    /// the state unchanged and produce no actions.
    pub fn on_event(self, event: LinkEvent) -> (Self, Vec<LinkAction>) {
        match (self, event) {
            (Self::NotActivated | Self::Deactivated, LinkEvent::ActivateRequested)
            | (Self::Deactivated, LinkEvent::EnteredForeground) => {
                (Self::Activating, vec![LinkAction::BeginActivation])
            }

            (
                Self::Activating,
                LinkEvent::ActivationCompleted {
                    reachable,
                    peer_installed,
                },
            ) => {
                let next = classify(reachable, peer_installed);
                (next, transition_actions(self, next))
            }

            (
                Self::Reachable | Self::Unreachable | Self::PeerAppMissing,
                LinkEvent::ReachabilityChanged {
                    reachable,
                    peer_installed,
                },
            ) => {
                let next = classify(reachable, peer_installed);
                if next == self {
                    (self, vec![])
                } else {
                    (next, transition_actions(self, next))
                }
            }

            (
                Self::Activating | Self::Reachable | Self::Unreachable | Self::PeerAppMissing,
                LinkEvent::EnteredBackground | LinkEvent::DeactivateRequested,
            ) => (
                Self::Deactivated,
                vec![LinkAction::NotifyStateChanged {
                    from: self,
                    to: Self::Deactivated,
                }],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if messages can be delivered.
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Reachable)
    }

    /// Check if the session is up in any form (reachable or not).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Reachable | Self::Unreachable | Self::PeerAppMissing
        )
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(reachable: bool, peer_installed: bool) -> ConnectionState {
    match (reachable, peer_installed) {
        (false, _) => ConnectionState::Unreachable,
        (true, false) => ConnectionState::PeerAppMissing,
        (true, true) => ConnectionState::Reachable,
    }
}

fn transition_actions(from: ConnectionState, to: ConnectionState) -> Vec<LinkAction> {
    let mut actions = vec![LinkAction::NotifyStateChanged { from, to }];
    if to.is_reachable() {
        actions.push(LinkAction::FlushPending);
    }
    actions
}

/// Events that drive the link lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The process asked to start the session.
    ActivateRequested,
    /// Session establishment finished.
    ActivationCompleted {
        /// Peer currently reachable.
        reachable: bool,
        /// Companion app installed on the peer.
        peer_installed: bool,
    },
    /// Reachability or installation status changed.
    ReachabilityChanged {
        /// Peer currently reachable.
        reachable: bool,
        /// Companion app installed on the peer.
        peer_installed: bool,
    },
    /// Process moved to the background.
    EnteredBackground,
    /// Process returned to the foreground.
    EnteredForeground,
    /// Explicit teardown.
    DeactivateRequested,
}

/// Actions for the transport owner to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    /// Start establishing the session.
    BeginActivation,
    /// Tell observers the state changed.
    NotifyStateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// The peer just became reachable; queued operations can go out.
    FlushPending,
}

/// Connection state plus the time of the last successful heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Transport session state.
    pub state: ConnectionState,
    /// Last successful heartbeat, Unix milliseconds.
    pub last_heartbeat_at: Option<u64>,
}

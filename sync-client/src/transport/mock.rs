//! Mock transport for testing.
//!
//! [`MockTransport::pair`] returns two endpoints sharing one in-process link.
//! Bytes sent from one endpoint are handed to the other endpoint's receive
//! handler. Switches on the link simulate the failures a real companion link
//! has: the peer walking out of range, the companion app being uninstalled,
//! sends that hang, and one-off send errors.
//!
//! Session state is driven through the pure state machine in
//! `liftsync_core::connection`, the same way a production transport would.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use liftsync_core::{ConnectionState, LinkAction, LinkEvent};

use super::{LinkHandler, ReceiveHandler, Transport};
use crate::error::TransmissionError;

/// One endpoint of an in-process link.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MockTransport {
    link: Arc<Mutex<Link>>,
    side: usize,
}

struct Link {
    /// Radio-level reachability, shared by both ends.
    reachable: bool,
    endpoints: [Endpoint; 2],
}

struct Endpoint {
    state: ConnectionState,
    /// Whether this endpoint sees the companion app on the other side.
    peer_installed: bool,
    receive: Option<ReceiveHandler>,
    link_handler: Option<LinkHandler>,
    /// Frames delivered to this endpoint (including injected ones).
    delivered: Vec<Vec<u8>>,
    fail_next_send: Option<TransmissionError>,
    stall_sends: bool,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            state: ConnectionState::new(),
            peer_installed: true,
            receive: None,
            link_handler: None,
            delivered: Vec::new(),
            fail_next_send: None,
            stall_sends: false,
        }
    }
}

impl Link {
    fn signals(&self, side: usize) -> (bool, bool) {
        (self.reachable, self.endpoints[side].peer_installed)
    }
}

impl MockTransport {
    /// Create two linked endpoints. The link starts reachable with the
    /// companion app installed on both sides; neither end is activated.
    pub fn pair() -> (Self, Self) {
        let link = Arc::new(Mutex::new(Link {
            reachable: true,
            endpoints: [Endpoint::default(), Endpoint::default()],
        }));
        (
            Self {
                link: Arc::clone(&link),
                side: 0,
            },
            Self { link, side: 1 },
        )
    }

    fn peer(&self) -> usize {
        1 - self.side
    }

    /// Feed an event into one endpoint's state machine, run the actions it
    /// produces, and notify that endpoint's link handler outside the lock.
    fn drive(&self, side: usize, event: LinkEvent) {
        let mut notify = Vec::new();
        {
            let mut link = self.link.lock().unwrap();
            let mut events = vec![event];
            while let Some(event) = events.pop() {
                let (next, actions) = link.endpoints[side].state.on_event(event);
                link.endpoints[side].state = next;
                for action in actions {
                    match action {
                        LinkAction::BeginActivation => {
                            let (reachable, peer_installed) = link.signals(side);
                            events.push(LinkEvent::ActivationCompleted {
                                reachable,
                                peer_installed,
                            });
                        }
                        other => {
                            if let Some(handler) = &link.endpoints[side].link_handler {
                                notify.push((Arc::clone(handler), other));
                            }
                        }
                    }
                }
            }
        }
        for (handler, action) in notify {
            handler(action);
        }
    }

    fn refresh(&self, side: usize) {
        let (reachable, peer_installed) = self.link.lock().unwrap().signals(side);
        self.drive(
            side,
            LinkEvent::ReachabilityChanged {
                reachable,
                peer_installed,
            },
        );
    }

    /// Bring the peer in or out of range (affects both endpoints).
    pub fn set_reachable(&self, reachable: bool) {
        self.link.lock().unwrap().reachable = reachable;
        self.refresh(self.side);
        self.refresh(self.peer());
    }

    /// Install or remove the companion app as seen from this endpoint.
    pub fn set_peer_app_installed(&self, installed: bool) {
        self.link.lock().unwrap().endpoints[self.side].peer_installed = installed;
        self.refresh(self.side);
    }

    /// Make sends from this endpoint hang until the switch is cleared.
    pub fn stall_sends(&self, stall: bool) {
        self.link.lock().unwrap().endpoints[self.side].stall_sends = stall;
    }

    /// Cause the next send from this endpoint to fail with `error`.
    pub fn fail_next_send(&self, error: TransmissionError) {
        self.link.lock().unwrap().endpoints[self.side].fail_next_send = Some(error);
    }

    /// Simulate the process moving to the background.
    pub fn enter_background(&self) {
        self.drive(self.side, LinkEvent::EnteredBackground);
    }

    /// Simulate the process returning to the foreground.
    pub fn enter_foreground(&self) {
        self.drive(self.side, LinkEvent::EnteredForeground);
    }

    /// Frames delivered to this endpoint so far.
    pub fn delivered(&self) -> Vec<Vec<u8>> {
        self.link.lock().unwrap().endpoints[self.side].delivered.clone()
    }

    /// Forget the delivered frames.
    pub fn clear_delivered(&self) {
        self.link.lock().unwrap().endpoints[self.side].delivered.clear();
    }

    /// Deliver raw bytes to this endpoint as if the peer had sent them.
    pub fn inject(&self, bytes: Vec<u8>) {
        let handler = {
            let mut link = self.link.lock().unwrap();
            let endpoint = &mut link.endpoints[self.side];
            endpoint.delivered.push(bytes.clone());
            endpoint.receive.clone()
        };
        if let Some(handler) = handler {
            handler(bytes);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn activate(&self) -> ConnectionState {
        self.drive(self.side, LinkEvent::ActivateRequested);
        self.state()
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), TransmissionError> {
        let handler = {
            let mut link = self.link.lock().unwrap();
            let peer = self.peer();
            let me = &mut link.endpoints[self.side];

            match me.state {
                ConnectionState::Reachable => {}
                ConnectionState::Unreachable => return Err(TransmissionError::Unreachable),
                ConnectionState::PeerAppMissing => return Err(TransmissionError::PeerAppMissing),
                ConnectionState::NotActivated
                | ConnectionState::Activating
                | ConnectionState::Deactivated => return Err(TransmissionError::NotActivated),
            }
            if let Some(error) = me.fail_next_send.take() {
                return Err(error);
            }
            if me.stall_sends {
                None
            } else {
                // A suspended peer cannot take delivery.
                if !link.endpoints[peer].state.is_active() {
                    return Err(TransmissionError::Unreachable);
                }
                let target = &mut link.endpoints[peer];
                target.delivered.push(bytes.to_vec());
                Some(target.receive.clone())
            }
        };

        match handler {
            Some(receive) => {
                if let Some(receive) = receive {
                    receive(bytes.to_vec());
                }
                Ok(())
            }
            None => std::future::pending::<Result<(), TransmissionError>>().await,
        }
    }

    fn on_receive(&self, handler: ReceiveHandler) {
        self.link.lock().unwrap().endpoints[self.side].receive = Some(handler);
    }

    fn on_link_action(&self, handler: LinkHandler) {
        self.link.lock().unwrap().endpoints[self.side].link_handler = Some(handler);
    }

    fn state(&self) -> ConnectionState {
        self.link.lock().unwrap().endpoints[self.side].state
    }

    fn peer_app_installed(&self) -> bool {
        self.link.lock().unwrap().endpoints[self.side].peer_installed
    }

    async fn deactivate(&self) {
        self.drive(self.side, LinkEvent::DeactivateRequested);
    }
}

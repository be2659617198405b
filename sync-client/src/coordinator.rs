//! SyncCoordinator - the only component the business layer talks to.
//!
//! # Architecture
//!
//! The coordinator is a single-writer actor. [`SyncCoordinator`] is a cheap,
//! cloneable handle; every public call, every inbound frame, every link
//! state change, every heartbeat tick and every retry tick becomes a
//! [`Command`] on one channel, processed in order by one task that owns the
//! queue, the conflict resolver and the applied-sequence log.
//!
//! ```text
//! business layer ──┐
//! transport rx ────┤
//! heartbeat tick ──┼──▶ mpsc ──▶ actor ──▶ Transport ──▶ peer
//! retry timer ─────┘               │
//!                                  ├──▶ SharedStore (snapshots, queue)
//!                                  └──▶ broadcast ──▶ subscribers
//! ```
//!
//! # Delivery rules
//!
//! - A mutation is sent immediately; if that fails it is queued. While the
//!   queue is non-empty new mutations go behind it so the peer never sees
//!   them out of sequence order.
//! - A flush sends the queue front to back and stops at the first operation
//!   that is not yet due or fails again.
//! - Heartbeats, pings and acks are never queued.
//! - The queue is written to the store after every change.
//!
//! # Example
//!
//! ```ignore
//! let (phone_link, _watch_link) = MockTransport::pair();
//! let coordinator = SyncCoordinator::start(
//!     CoordinatorConfig::for_role(DeviceRole::Handheld),
//!     Arc::new(phone_link),
//!     Arc::new(MemoryStore::new()),
//! )
//! .await?;
//!
//! let mut events = coordinator.subscribe();
//! coordinator.sync_set_completion(set).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use liftsync_core::{
    AppliedLog, AppliedLogSnapshot, ConflictResolver, ConnectionState, ConnectionStatus,
    EntityKey, LinkAction, PendingOperation, PendingQueue, Resolution, RetryOutcome, RetryPolicy,
    Version,
};
use liftsync_store::{SharedStore, SharedStoreExt};
use liftsync_types::{
    codec, now_millis, AckOutcome, AckPayload, DeviceId, DeviceRole, MessageId, MessageKind,
    OperationId, Payload, PingDirection, SequenceNumber, SetCompletionPayload,
    SharedWorkoutSessionSnapshot, SyncMessage, TestPingPayload, TimerStatePayload,
    WorkoutCompletionPayload,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, TransmissionError};
use crate::transport::Transport;

/// Keys the coordinator writes in the shared store.
///
/// The business layer may read any of them at any time.
pub mod keys {
    /// This device's id.
    pub const DEVICE_ID: &str = "device.id";
    /// Next local sequence number.
    pub const NEXT_SEQUENCE: &str = "sequence.next";
    /// Latest [`SharedWorkoutSessionSnapshot`](liftsync_types::SharedWorkoutSessionSnapshot).
    pub const SESSION: &str = "snapshot.session";
    /// Latest [`TimerStatePayload`](liftsync_types::TimerStatePayload).
    pub const TIMER: &str = "snapshot.timer";
    /// Latest [`WorkoutCompletionPayload`](liftsync_types::WorkoutCompletionPayload).
    pub const COMPLETION: &str = "snapshot.completion";
    /// Applied-sequence windows per origin.
    pub const APPLIED: &str = "applied.sequences";
    /// Blob holding the pending and failed operations.
    pub const PENDING_QUEUE: &str = "pending_operations";

    /// Key of the latest [`SetCompletionPayload`](liftsync_types::SetCompletionPayload) for a set.
    pub fn set(set_id: &str) -> String {
        format!("snapshot.set.{}", set_id)
    }

    /// Key of the winning [`Version`](liftsync_core::Version) of an entity.
    pub fn version(entity: &liftsync_core::EntityKey) -> String {
        match entity {
            liftsync_core::EntityKey::Session(id) => format!("conflict.session.{}", id),
            liftsync_core::EntityKey::Set(id) => format!("conflict.set.{}", id),
            liftsync_core::EntityKey::Timer => "conflict.timer".to_string(),
        }
    }
}

const EVENT_CAPACITY: usize = 256;
const MAX_OUTSTANDING_PINGS: usize = 16;

/// How a mutation left the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the transport successfully.
    Sent,
    /// Waiting in the pending queue.
    Queued,
}

/// Result of a mutation call. Mutations never fail because of sync problems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Sent or queued.
    pub delivery: Delivery,
    /// Sequence number assigned to the message.
    pub sequence: SequenceNumber,
    /// Set when the durable store could not be written; the in-memory queue
    /// is unaffected and is written again on the next change.
    pub warning: Option<String>,
}

/// Result of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// The transport was not usable; nothing was attempted.
    pub skipped: bool,
    /// Operations delivered in this pass.
    pub delivered: usize,
    /// Operations given up on in this pass.
    pub failed: usize,
    /// Operations still pending afterwards.
    pub remaining: usize,
    /// Set when the queue could not be written to the durable store. It is
    /// written again on the next flush or change.
    pub warning: Option<String>,
}

/// Winning state carried by [`SyncEvent::Applied`].
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedState {
    /// Session started or progressed.
    Session(SharedWorkoutSessionSnapshot),
    /// A set was completed or edited.
    Set(SetCompletionPayload),
    /// Rest timer changed.
    Timer(TimerStatePayload),
    /// Session finished.
    Completion(WorkoutCompletionPayload),
}

impl AppliedState {
    fn from_payload(payload: &Payload) -> Option<Self> {
        match payload {
            Payload::WorkoutStart(s) => Some(Self::Session(s.clone())),
            Payload::SetCompletion(s) => Some(Self::Set(s.clone())),
            Payload::TimerState(t) => Some(Self::Timer(t.clone())),
            Payload::WorkoutCompletion(c) => Some(Self::Completion(c.clone())),
            Payload::Heartbeat | Payload::TestPing(_) | Payload::Ack(_) => None,
        }
    }
}

/// An inbound message that won conflict resolution and was stored.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedUpdate {
    /// Identity of the applied message.
    pub id: MessageId,
    /// Role of the device it came from.
    pub origin_role: DeviceRole,
    /// Creation time on the origin, Unix milliseconds.
    pub created_at: u64,
    /// The new state.
    pub state: AppliedState,
}

/// Notifications for the business layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Inbound state was accepted and written to the store.
    Applied(AppliedUpdate),
    /// Inbound state lost conflict resolution and was dropped.
    Discarded {
        /// The losing message.
        id: MessageId,
        /// Its kind.
        kind: MessageKind,
        /// The message whose state was kept.
        winner: MessageId,
    },
    /// A local operation was given up on.
    OperationFailed {
        /// The operation.
        operation: OperationId,
        /// Its sequence number.
        sequence: SequenceNumber,
        /// Its message kind.
        kind: MessageKind,
        /// Failed flush attempts.
        attempts: u32,
    },
    /// A diagnostic ping was answered.
    PongReceived {
        /// Nonce returned by [`SyncCoordinator::send_test_message`].
        nonce: u64,
        /// Time from sending the ping to processing the pong.
        round_trip: Duration,
    },
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    /// This device.
    pub device_id: DeviceId,
    /// This device's role.
    pub role: DeviceRole,
    /// Link state and last successful heartbeat.
    pub connection: ConnectionStatus,
    /// Operations waiting for delivery.
    pub pending: usize,
    /// Operations given up on.
    pub failed: u64,
    /// Inbound messages dropped because they could not be decoded.
    pub malformed_dropped: u64,
    /// Durable store writes that failed since start.
    pub persistence_failures: u64,
    /// Sequence number the next message will get.
    pub next_sequence: SequenceNumber,
    /// Between `suspend()` and `resume()`.
    pub suspended: bool,
}

enum Command {
    Mutate {
        payload: Payload,
        reply: oneshot::Sender<SyncOutcome>,
    },
    Heartbeat {
        reply: Option<oneshot::Sender<bool>>,
    },
    Flush {
        reply: Option<oneshot::Sender<FlushReport>>,
    },
    Validate {
        reply: oneshot::Sender<bool>,
    },
    TestPing {
        reply: oneshot::Sender<Result<u64, TransmissionError>>,
    },
    Status {
        reply: oneshot::Sender<CoordinatorStatus>,
    },
    Inbound(Vec<u8>),
    Link(LinkAction),
    Suspend {
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    Resume {
        reply: oneshot::Sender<ConnectionState>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
}

/// Handle to a running sync coordinator.
///
/// Clones share the same coordinator. The coordinator stops on
/// [`SyncCoordinator::shutdown`] or when the last handle is dropped.
#[derive(Clone)]
pub struct SyncCoordinator {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SyncEvent>,
    device_id: DeviceId,
    role: DeviceRole,
}

impl SyncCoordinator {
    /// Restore persisted state, activate the transport and start the
    /// coordinator task and heartbeat ticker.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, the store cannot be read, or
    /// the persisted queue is corrupt.
    pub async fn start(
        config: CoordinatorConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SharedStore>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let role = config.coordinator.role;

        let device_id = match store.get::<DeviceId>(keys::DEVICE_ID).await? {
            Some(id) => id,
            None => {
                let id = DeviceId::random();
                store.set(keys::DEVICE_ID, &id).await?;
                tracing::info!("Generated device id {}", id);
                id
            }
        };

        let queue = match store.read_blob(keys::PENDING_QUEUE).await? {
            Some(bytes) => PendingQueue::from_bytes(&bytes, config.queue.capacity)?,
            None => PendingQueue::new(config.queue.capacity),
        };

        let window = config.queue.applied_window;
        let applied = match store.get::<AppliedLogSnapshot>(keys::APPLIED).await? {
            Some(snapshot) => AppliedLog::from_snapshot(snapshot, window),
            None => AppliedLog::new(window),
        };

        // Never reuse a sequence number, even if `sequence.next` lagged
        // behind the queue when the process died.
        let stored_next = store.get::<u64>(keys::NEXT_SEQUENCE).await?.unwrap_or(1);
        let after_queue = queue
            .iter()
            .chain(queue.failed())
            .map(|op| op.sequence().value() + 1)
            .max()
            .unwrap_or(1);
        let next_sequence = SequenceNumber::new(stored_next.max(after_queue).max(1));

        let (commands, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let weak = commands.downgrade();

        {
            let weak = weak.clone();
            transport.on_receive(Arc::new(move |bytes| {
                if let Some(tx) = weak.upgrade() {
                    let _ = tx.send(Command::Inbound(bytes));
                }
            }));
        }
        {
            let weak = weak.clone();
            transport.on_link_action(Arc::new(move |action| {
                if let Some(tx) = weak.upgrade() {
                    let _ = tx.send(Command::Link(action));
                }
            }));
        }

        let state = transport.activate().await;
        tracing::info!(
            "Sync coordinator starting as {} {} (link {:?}, {} pending, next {})",
            role,
            device_id,
            state,
            queue.len(),
            next_sequence
        );

        let mut actor = Actor {
            policy: config.retry_policy(),
            resolver: ConflictResolver::new(config.queue.conflict_window),
            config,
            device_id,
            role,
            transport,
            store,
            next_sequence,
            queue,
            applied,
            last_heartbeat_at: None,
            pings: HashMap::new(),
            malformed_dropped: 0,
            persistence_failures: 0,
            queue_dirty: false,
            suspended: false,
            commands: weak,
            events: events.clone(),
            heartbeat_task: None,
            retry_timer: None,
        };
        actor.start_heartbeat();
        tokio::spawn(actor.run(receiver));

        Ok(Self {
            commands,
            events,
            device_id,
            role,
        })
    }

    /// This device's id.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// This device's role.
    pub fn role(&self) -> DeviceRole {
        self.role
    }

    /// Receive [`SyncEvent`]s from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, CoordinatorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| CoordinatorError::Closed)?;
        response.await.map_err(|_| CoordinatorError::Closed)
    }

    async fn mutate(&self, payload: Payload) -> Result<SyncOutcome, CoordinatorError> {
        self.request(|reply| Command::Mutate { payload, reply }).await
    }

    /// Share a started or progressed workout session.
    pub async fn sync_workout_start(
        &self,
        session: SharedWorkoutSessionSnapshot,
    ) -> Result<SyncOutcome, CoordinatorError> {
        self.mutate(Payload::WorkoutStart(session)).await
    }

    /// Share a completed or edited set.
    pub async fn sync_set_completion(
        &self,
        set: SetCompletionPayload,
    ) -> Result<SyncOutcome, CoordinatorError> {
        self.mutate(Payload::SetCompletion(set)).await
    }

    /// Share the rest timer state.
    pub async fn sync_timer_state(
        &self,
        timer: TimerStatePayload,
    ) -> Result<SyncOutcome, CoordinatorError> {
        self.mutate(Payload::TimerState(timer)).await
    }

    /// Share that a session finished.
    pub async fn sync_workout_completion(
        &self,
        session_id: impl Into<String>,
        duration_secs: Option<u64>,
    ) -> Result<SyncOutcome, CoordinatorError> {
        self.mutate(Payload::WorkoutCompletion(WorkoutCompletionPayload {
            session_id: session_id.into(),
            duration_secs,
        }))
        .await
    }

    /// Send a heartbeat now. On success the pending queue is flushed.
    ///
    /// Returns whether the heartbeat reached the peer.
    pub async fn send_heartbeat(&self) -> Result<bool, CoordinatorError> {
        self.request(|reply| Command::Heartbeat { reply: Some(reply) })
            .await
    }

    /// True iff the link is reachable, the companion app is installed, and
    /// the last heartbeat is younger than the staleness threshold.
    pub async fn validate_connection(&self) -> Result<bool, CoordinatorError> {
        self.request(|reply| Command::Validate { reply }).await
    }

    /// Operations waiting for delivery.
    pub async fn pending_operations_count(&self) -> Result<usize, CoordinatorError> {
        Ok(self.status().await?.pending)
    }

    /// Operations given up on.
    pub async fn failed_operations_count(&self) -> Result<u64, CoordinatorError> {
        Ok(self.status().await?.failed)
    }

    /// Run one flush pass over the pending queue.
    pub async fn process_pending_operations(&self) -> Result<FlushReport, CoordinatorError> {
        self.request(|reply| Command::Flush { reply: Some(reply) })
            .await
    }

    /// Send a diagnostic ping. The answer arrives as
    /// [`SyncEvent::PongReceived`] carrying the returned nonce.
    pub async fn send_test_message(&self) -> Result<u64, CoordinatorError> {
        Ok(self.request(|reply| Command::TestPing { reply }).await??)
    }

    /// Current status.
    pub async fn status(&self) -> Result<CoordinatorStatus, CoordinatorError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Persist everything, stop the timers and deactivate the transport.
    ///
    /// Mutations made while suspended are queued.
    pub async fn suspend(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::Suspend { reply }).await?
    }

    /// Reactivate the transport and restart the heartbeat, which flushes
    /// the queue as soon as the peer answers.
    pub async fn resume(&self) -> Result<ConnectionState, CoordinatorError> {
        self.request(|reply| Command::Resume { reply }).await
    }

    /// Persist everything and stop the coordinator.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::Shutdown { reply }).await?
    }
}

struct Actor {
    config: CoordinatorConfig,
    policy: RetryPolicy,
    device_id: DeviceId,
    role: DeviceRole,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SharedStore>,
    next_sequence: SequenceNumber,
    queue: PendingQueue,
    applied: AppliedLog,
    resolver: ConflictResolver,
    last_heartbeat_at: Option<u64>,
    /// Outstanding ping nonces and when they were sent.
    pings: HashMap<u64, Instant>,
    malformed_dropped: u64,
    persistence_failures: u64,
    /// The last queue write failed.
    queue_dirty: bool,
    suspended: bool,
    commands: mpsc::WeakUnboundedSender<Command>,
    events: broadcast::Sender<SyncEvent>,
    heartbeat_task: Option<JoinHandle<()>>,
    retry_timer: Option<(Instant, JoinHandle<()>)>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            if !self.handle(command).await {
                break;
            }
        }
        self.stop_timers();
        tracing::info!("Sync coordinator {} stopped", self.device_id);
    }

    /// Process one command. Returns `false` to stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Mutate { payload, reply } => {
                let outcome = self.mutate(payload).await;
                let _ = reply.send(outcome);
            }
            Command::Heartbeat { reply } => {
                let delivered = self.heartbeat().await;
                if let Some(reply) = reply {
                    let _ = reply.send(delivered);
                }
            }
            Command::Flush { reply } => {
                let report = self.flush().await;
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
            Command::Validate { reply } => {
                let _ = reply.send(self.connection_is_valid());
            }
            Command::TestPing { reply } => {
                let result = self.test_ping().await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Inbound(bytes) => self.receive(bytes).await,
            Command::Link(action) => self.on_link_action(action).await,
            Command::Suspend { reply } => {
                let result = self.suspend().await;
                let _ = reply.send(result);
            }
            Command::Resume { reply } => {
                let state = self.resume().await;
                let _ = reply.send(state);
            }
            Command::Shutdown { reply } => {
                self.stop_timers();
                let result = self.persist_all().await;
                self.transport.deactivate().await;
                let _ = reply.send(result);
                return false;
            }
        }
        true
    }

    // ===========================================
    // Outbound
    // ===========================================

    fn next_message(&mut self, payload: Payload) -> SyncMessage {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.next();
        SyncMessage::new(self.device_id, self.role, sequence, payload)
    }

    /// Failures are logged and counted in the status.
    async fn persist_sequence(&mut self) -> Result<(), CoordinatorError> {
        let result = self
            .store
            .set(keys::NEXT_SEQUENCE, &self.next_sequence.value())
            .await;
        if let Err(e) = &result {
            tracing::error!("Failed to persist next sequence: {}", e);
            self.persistence_failures += 1;
        }
        Ok(result?)
    }

    async fn transmit(&self, message: &SyncMessage) -> Result<(), TransmissionError> {
        let bytes = codec::encode(message).map_err(|e| TransmissionError::Failed(e.to_string()))?;
        let limit = self.config.send_timeout();
        match tokio::time::timeout(limit, self.transport.send(&bytes)).await {
            Ok(result) => result,
            Err(_) => Err(TransmissionError::Timeout(limit)),
        }
    }

    async fn mutate(&mut self, payload: Payload) -> SyncOutcome {
        let message = self.next_message(payload);
        let sequence = message.sequence;
        let kind = message.kind();
        let mut warning = self.persist_sequence().await.err().map(|e| e.to_string());

        // Keep the local snapshot current unless a newer remote write already won.
        if self.resolve(&message).await == Resolution::Accept {
            if let Err(e) = self.store_winner(&message).await {
                tracing::error!("Failed to store local {:?} {}: {}", kind, sequence, e);
                warning.get_or_insert_with(|| e.to_string());
            }
        }

        if !self.queue.is_empty() {
            tracing::debug!(
                "{:?} {} queued behind {} pending operations",
                kind,
                sequence,
                self.queue.len()
            );
            let op = PendingOperation::new(message, now_millis());
            let id = op.id;
            if let Err(e) = self.enqueue(op).await {
                warning.get_or_insert_with(|| e.to_string());
            }
            if let Some(flush_warning) = self.flush().await.warning {
                warning.get_or_insert(flush_warning);
            }
            let delivery = if self.queue.iter().chain(self.queue.failed()).any(|op| op.id == id) {
                Delivery::Queued
            } else {
                Delivery::Sent
            };
            return SyncOutcome {
                delivery,
                sequence,
                warning,
            };
        }

        match self.transmit(&message).await {
            Ok(()) => {
                tracing::debug!("Sent {:?} {}", kind, sequence);
                SyncOutcome {
                    delivery: Delivery::Sent,
                    sequence,
                    warning,
                }
            }
            Err(e) => {
                tracing::warn!("Send of {:?} {} failed ({}), queueing", kind, sequence, e);
                if let Err(e) = self.enqueue(PendingOperation::new(message, now_millis())).await {
                    warning.get_or_insert_with(|| e.to_string());
                }
                if self.transport.is_reachable() {
                    self.schedule_retry(self.policy.jittered(self.policy.base_delay));
                }
                SyncOutcome {
                    delivery: Delivery::Queued,
                    sequence,
                    warning,
                }
            }
        }
    }

    async fn enqueue(&mut self, op: PendingOperation) -> Result<(), CoordinatorError> {
        if let Some(evicted) = self.queue.enqueue(op) {
            tracing::warn!(
                "Pending queue full, giving up on {:?} {}",
                evicted.message.kind(),
                evicted.sequence()
            );
            self.publish_failed(&evicted);
        }
        self.persist_queue().await
    }

    async fn persist_queue(&mut self) -> Result<(), CoordinatorError> {
        let result = match self.queue.to_bytes() {
            Ok(bytes) => self
                .store
                .write_blob(keys::PENDING_QUEUE, &bytes)
                .await
                .map_err(CoordinatorError::from),
            Err(e) => Err(CoordinatorError::from(e)),
        };
        if let Err(e) = &result {
            tracing::error!("Failed to persist pending queue: {}", e);
            self.persistence_failures += 1;
        }
        self.queue_dirty = result.is_err();
        result
    }

    async fn persist_applied(&mut self) -> Result<(), CoordinatorError> {
        let result = self
            .store
            .set(keys::APPLIED, &self.applied.to_snapshot())
            .await;
        if let Err(e) = &result {
            tracing::error!("Failed to persist applied sequences: {}", e);
            self.persistence_failures += 1;
        }
        Ok(result?)
    }

    async fn persist_all(&mut self) -> Result<(), CoordinatorError> {
        let sequence = self.persist_sequence().await;
        let queue = self.persist_queue().await;
        let applied = self.persist_applied().await;
        sequence.and(queue).and(applied)
    }

    fn publish(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_failed(&self, op: &PendingOperation) {
        self.publish(SyncEvent::OperationFailed {
            operation: op.id,
            sequence: op.sequence(),
            kind: op.message.kind(),
            attempts: op.retry_count,
        });
    }

    // ===========================================
    // Heartbeat and flush
    // ===========================================

    async fn heartbeat(&mut self) -> bool {
        if !self.transport.is_reachable() {
            tracing::debug!("Heartbeat skipped, link is {:?}", self.transport.state());
            return false;
        }
        let message = self.next_message(Payload::Heartbeat);
        let _ = self.persist_sequence().await;

        match self.transmit(&message).await {
            Ok(()) => {
                self.last_heartbeat_at = Some(now_millis());
                if !self.queue.is_empty() {
                    self.flush().await;
                }
                true
            }
            Err(e) => {
                tracing::debug!("Heartbeat {} failed: {}", message.sequence, e);
                false
            }
        }
    }

    async fn flush(&mut self) -> FlushReport {
        let mut report = FlushReport::default();
        if !self.transport.is_reachable() {
            report.skipped = true;
            if self.queue_dirty {
                report.warning = self.persist_queue().await.err().map(|e| e.to_string());
            }
            report.remaining = self.queue.len();
            return report;
        }

        let mut changed = false;
        while let Some(head) = self.queue.front() {
            let now = now_millis();
            if !self.policy.is_due(head, now) {
                let wait = self.policy.remaining(head, now);
                self.schedule_retry(self.policy.jittered(wait));
                break;
            }

            let sequence = head.sequence();
            let message = head.message.clone();
            match self.transmit(&message).await {
                Ok(()) => {
                    self.queue.remove(sequence);
                    changed = true;
                    report.delivered += 1;
                }
                Err(e) => {
                    changed = true;
                    match self.queue.record_failure(sequence, now_millis(), &self.policy) {
                        Some(RetryOutcome::Retry { attempt, delay }) => {
                            tracing::warn!(
                                "Flush of {:?} {} failed (attempt {}): {}, retrying in {:?}",
                                message.kind(),
                                sequence,
                                attempt,
                                e,
                                delay
                            );
                            self.schedule_retry(self.policy.jittered(delay));
                            break;
                        }
                        Some(RetryOutcome::GaveUp(op)) => {
                            tracing::warn!(
                                "Giving up on {:?} {} after {} attempts: {}",
                                message.kind(),
                                sequence,
                                op.retry_count,
                                e
                            );
                            self.publish_failed(&op);
                            report.failed += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        if changed || self.queue_dirty {
            if let Err(e) = self.persist_queue().await {
                report.warning = Some(e.to_string());
            }
        }
        report.remaining = self.queue.len();
        if report.delivered > 0 || report.failed > 0 {
            tracing::info!(
                "Flushed {} operations ({} failed, {} remaining)",
                report.delivered,
                report.failed,
                report.remaining
            );
        }
        report
    }

    fn schedule_retry(&mut self, delay: Duration) {
        let Some(deadline) = Instant::now().checked_add(delay) else {
            tracing::warn!("Retry delay {:?} out of range, not scheduling", delay);
            return;
        };
        if let Some((existing, handle)) = &self.retry_timer {
            if !handle.is_finished() && *existing <= deadline {
                return;
            }
            handle.abort();
        }

        let commands = self.commands.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::Flush { reply: None });
            }
        });
        tracing::debug!("Retry flush in {:?}", delay);
        self.retry_timer = Some((deadline, handle));
    }

    fn start_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        let commands = self.commands.clone();
        let period = self.config.heartbeat_interval();
        self.heartbeat_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tx) = commands.upgrade() else {
                    break;
                };
                if tx.send(Command::Heartbeat { reply: None }).is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_timers(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        if let Some((_, handle)) = self.retry_timer.take() {
            handle.abort();
        }
    }

    fn connection_is_valid(&self) -> bool {
        let stale_after = self.config.coordinator.stale_after_ms;
        let fresh = self
            .last_heartbeat_at
            .is_some_and(|at| now_millis().saturating_sub(at) < stale_after);
        self.transport.is_reachable() && self.transport.peer_app_installed() && fresh
    }

    async fn test_ping(&mut self) -> Result<u64, TransmissionError> {
        let nonce = random_nonce();
        let message = self.next_message(Payload::TestPing(TestPingPayload {
            nonce,
            direction: PingDirection::Ping,
        }));
        let _ = self.persist_sequence().await;

        if self.pings.len() >= MAX_OUTSTANDING_PINGS {
            if let Some(oldest) = self
                .pings
                .iter()
                .min_by_key(|(_, sent_at)| **sent_at)
                .map(|(nonce, _)| *nonce)
            {
                self.pings.remove(&oldest);
            }
        }
        self.pings.insert(nonce, Instant::now());

        match self.transmit(&message).await {
            Ok(()) => {
                tracing::debug!("Ping {} sent", nonce);
                Ok(nonce)
            }
            Err(e) => {
                self.pings.remove(&nonce);
                tracing::warn!("Ping not delivered: {}", e);
                Err(e)
            }
        }
    }

    fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            device_id: self.device_id,
            role: self.role,
            connection: ConnectionStatus {
                state: self.transport.state(),
                last_heartbeat_at: self.last_heartbeat_at,
            },
            pending: self.queue.len(),
            failed: self.queue.failed_count(),
            malformed_dropped: self.malformed_dropped,
            persistence_failures: self.persistence_failures,
            next_sequence: self.next_sequence,
            suspended: self.suspended,
        }
    }

    // ===========================================
    // Inbound
    // ===========================================

    async fn receive(&mut self, bytes: Vec<u8>) {
        let message = match codec::decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                self.malformed_dropped += 1;
                tracing::warn!("Dropping malformed message ({} bytes): {}", bytes.len(), e);
                return;
            }
        };

        if message.origin == self.device_id {
            tracing::debug!("Ignoring own message {}", message.id());
            return;
        }

        let id = message.id();
        if self.applied.contains(&id) {
            tracing::debug!("Duplicate {:?} {}", message.kind(), id);
            if message.payload.is_state() {
                self.acknowledge(&message, AckOutcome::Duplicate).await;
            }
            return;
        }

        match &message.payload {
            Payload::WorkoutStart(_)
            | Payload::SetCompletion(_)
            | Payload::TimerState(_)
            | Payload::WorkoutCompletion(_) => self.apply(&message).await,
            Payload::Heartbeat => tracing::debug!("Heartbeat {} from peer", id),
            Payload::TestPing(ping) => self.on_ping(ping).await,
            Payload::Ack(ack) => self.on_ack(ack).await,
        }

        self.applied.record(&id);
        let _ = self.persist_applied().await;
    }

    async fn apply(&mut self, message: &SyncMessage) {
        let id = message.id();
        let kind = message.kind();

        match self.resolve(message).await {
            Resolution::Accept => {
                if let Err(e) = self.store_winner(message).await {
                    tracing::error!("Failed to store {:?} {}: {}", kind, id, e);
                }
                tracing::debug!("Applied {:?} {}", kind, id);
                if let Some(state) = AppliedState::from_payload(&message.payload) {
                    self.publish(SyncEvent::Applied(AppliedUpdate {
                        id,
                        origin_role: message.origin_role,
                        created_at: message.created_at,
                        state,
                    }));
                }
                self.acknowledge(message, AckOutcome::Applied).await;
            }
            Resolution::Discard { winner } => {
                tracing::info!(
                    "Conflict on {:?}: discarding {} (created {}) for {} (created {})",
                    EntityKey::for_payload(&message.payload),
                    id,
                    message.created_at,
                    winner.id,
                    winner.created_at
                );
                self.publish(SyncEvent::Discarded {
                    id,
                    kind,
                    winner: winner.id,
                });
                self.acknowledge(message, AckOutcome::Discarded).await;
            }
        }
    }

    async fn write_snapshot(
        &self,
        payload: &Payload,
    ) -> Result<(), liftsync_store::PersistenceError> {
        match payload {
            Payload::WorkoutStart(session) => self.store.set(keys::SESSION, session).await,
            Payload::SetCompletion(set) => self.store.set(&keys::set(&set.set_id), set).await,
            Payload::TimerState(timer) => self.store.set(keys::TIMER, timer).await,
            Payload::WorkoutCompletion(done) => self.store.set(keys::COMPLETION, done).await,
            Payload::Heartbeat | Payload::TestPing(_) | Payload::Ack(_) => Ok(()),
        }
    }

    /// Resolves against the held version, falling back to the stored one
    /// when the resolver has forgotten the entity.
    async fn resolve(&mut self, message: &SyncMessage) -> Resolution {
        if let Some(key) = EntityKey::for_payload(&message.payload) {
            if self.resolver.current(&key).is_none() {
                match self.store.get::<Version>(&keys::version(&key)).await {
                    Ok(Some(version)) => {
                        self.resolver.seed(key, version);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::error!("Failed to read stored version of {:?}: {}", key, e),
                }
            }
        }
        self.resolver.resolve(message)
    }

    /// Records a winning write and stores its snapshot and version.
    async fn store_winner(
        &mut self,
        message: &SyncMessage,
    ) -> Result<(), liftsync_store::PersistenceError> {
        let Some((key, version)) = self.resolver.record(message) else {
            return Ok(());
        };
        let result = match self.write_snapshot(&message.payload).await {
            Ok(()) => self.store.set(&keys::version(&key), &version).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.persistence_failures += 1;
        }
        result
    }

    async fn acknowledge(&mut self, message: &SyncMessage, outcome: AckOutcome) {
        let ack = self.next_message(Payload::Ack(AckPayload {
            acknowledged: message.id(),
            outcome,
        }));
        let _ = self.persist_sequence().await;
        if let Err(e) = self.transmit(&ack).await {
            tracing::debug!("Ack for {} not delivered: {}", message.id(), e);
        }
    }

    async fn on_ack(&mut self, ack: &AckPayload) {
        if ack.acknowledged.origin != self.device_id {
            return;
        }
        if ack.outcome == AckOutcome::Discarded {
            tracing::info!("Peer kept its own state over {}", ack.acknowledged);
        }
        if self.queue.remove(ack.acknowledged.sequence).is_some() {
            tracing::debug!("Ack cleared queued {}", ack.acknowledged);
            let _ = self.persist_queue().await;
        }
    }

    async fn on_ping(&mut self, ping: &TestPingPayload) {
        match ping.direction {
            PingDirection::Ping => {
                let pong = self.next_message(Payload::TestPing(TestPingPayload {
                    nonce: ping.nonce,
                    direction: PingDirection::Pong,
                }));
                let _ = self.persist_sequence().await;
                if let Err(e) = self.transmit(&pong).await {
                    tracing::debug!("Pong {} not delivered: {}", ping.nonce, e);
                }
            }
            PingDirection::Pong => match self.pings.remove(&ping.nonce) {
                Some(sent_at) => {
                    let round_trip = sent_at.elapsed();
                    tracing::info!("Pong {} after {:?}", ping.nonce, round_trip);
                    self.publish(SyncEvent::PongReceived {
                        nonce: ping.nonce,
                        round_trip,
                    });
                }
                None => tracing::debug!("Unsolicited pong {}", ping.nonce),
            },
        }
    }

    async fn on_link_action(&mut self, action: LinkAction) {
        match action {
            LinkAction::NotifyStateChanged { from, to } => {
                tracing::info!("Link {:?} -> {:?}", from, to);
            }
            LinkAction::FlushPending => {
                if !self.suspended {
                    self.heartbeat().await;
                }
            }
            LinkAction::BeginActivation => {}
        }
    }

    // ===========================================
    // Lifecycle
    // ===========================================

    async fn suspend(&mut self) -> Result<(), CoordinatorError> {
        self.suspended = true;
        self.stop_timers();
        let result = self.persist_all().await;
        self.transport.deactivate().await;
        tracing::info!("Suspended with {} pending operations", self.queue.len());
        result
    }

    async fn resume(&mut self) -> ConnectionState {
        self.suspended = false;
        let state = self.transport.activate().await;
        self.start_heartbeat();
        tracing::info!("Resumed, link {:?}", state);
        state
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        self.stop_timers();
    }
}

fn random_nonce() -> u64 {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use async_trait::async_trait;
    use liftsync_store::{MemoryStore, PersistenceError};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fast_config(role: DeviceRole) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::for_role(role);
        config.coordinator.heartbeat_interval_ms = 60_000;
        config.coordinator.stale_after_ms = 120_000;
        config.coordinator.send_timeout_ms = 100;
        config.retry.base_delay_ms = 20;
        config.retry.max_delay_ms = 80;
        config.retry.jitter_ms = 0;
        config
    }

    fn set(set_id: &str, reps: u32) -> SetCompletionPayload {
        SetCompletionPayload {
            set_id: set_id.into(),
            session_exercise_id: "squat".into(),
            reps,
            weight: 100.0,
            is_completed: true,
        }
    }

    async fn start(
        transport: &MockTransport,
        store: &MemoryStore,
        role: DeviceRole,
    ) -> SyncCoordinator {
        SyncCoordinator::start(
            fast_config(role),
            Arc::new(transport.clone()),
            Arc::new(store.clone()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let (a, _b) = MockTransport::pair();
        let mut config = fast_config(DeviceRole::Handheld);
        config.coordinator.heartbeat_interval_ms = 0;

        let result = SyncCoordinator::start(config, Arc::new(a), Arc::new(MemoryStore::new())).await;
        assert!(matches!(result, Err(CoordinatorError::Config(_))));
    }

    #[tokio::test]
    async fn start_persists_device_id() {
        let (a, _b) = MockTransport::pair();
        let store = MemoryStore::new();
        let coordinator = start(&a, &store, DeviceRole::Handheld).await;

        let stored: Option<DeviceId> = store.get(keys::DEVICE_ID).await.unwrap();
        assert_eq!(stored, Some(coordinator.device_id()));
        assert_eq!(coordinator.role(), DeviceRole::Handheld);
    }

    #[tokio::test]
    async fn start_rejects_corrupt_queue() {
        let (a, _b) = MockTransport::pair();
        let store = MemoryStore::new();
        store
            .write_blob(keys::PENDING_QUEUE, b"garbage")
            .await
            .unwrap();

        let result = SyncCoordinator::start(
            fast_config(DeviceRole::Wrist),
            Arc::new(a),
            Arc::new(store),
        )
        .await;
        assert!(matches!(result, Err(CoordinatorError::Queue(_))));
    }

    #[tokio::test]
    async fn mutation_without_peer_is_queued() {
        let (a, _b) = MockTransport::pair();
        a.set_reachable(false);
        let store = MemoryStore::new();
        let coordinator = start(&a, &store, DeviceRole::Handheld).await;

        let outcome = coordinator.sync_set_completion(set("s1", 5)).await.unwrap();
        assert_eq!(outcome.delivery, Delivery::Queued);
        assert!(outcome.warning.is_none());
        assert_eq!(coordinator.pending_operations_count().await.unwrap(), 1);

        // Queue was persisted and the local snapshot written.
        assert!(store.read_blob(keys::PENDING_QUEUE).await.unwrap().is_some());
        let local: Option<SetCompletionPayload> = store.get(&keys::set("s1")).await.unwrap();
        assert_eq!(local.unwrap().reps, 5);
    }

    #[tokio::test]
    async fn later_mutations_queue_behind_earlier_ones() {
        let (a, _b) = MockTransport::pair();
        a.set_reachable(false);
        let coordinator = start(&a, &MemoryStore::new(), DeviceRole::Handheld).await;

        let first = coordinator.sync_set_completion(set("s1", 5)).await.unwrap();
        let second = coordinator.sync_timer_state(TimerStatePayload {
            is_running: true,
            duration_secs: 90,
            start_time: Some(1),
            exercise_name: None,
        });
        let second = second.await.unwrap();

        assert_eq!(second.delivery, Delivery::Queued);
        assert!(second.sequence > first.sequence);
        let report = coordinator.process_pending_operations().await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.remaining, 2);
    }

    #[tokio::test]
    async fn sequence_numbers_survive_restart() {
        let (a, _b) = MockTransport::pair();
        a.set_reachable(false);
        let store = MemoryStore::new();

        let first = start(&a, &store, DeviceRole::Wrist).await;
        let outcome = first.sync_set_completion(set("s1", 1)).await.unwrap();
        first.shutdown().await.unwrap();

        let second = start(&a, &store, DeviceRole::Wrist).await;
        let status = second.status().await.unwrap();
        assert_eq!(status.device_id, first.device_id());
        assert_eq!(status.pending, 1);
        assert!(status.next_sequence > outcome.sequence);
    }

    #[tokio::test]
    async fn calls_after_shutdown_report_closed() {
        let (a, _b) = MockTransport::pair();
        let coordinator = start(&a, &MemoryStore::new(), DeviceRole::Handheld).await;
        coordinator.shutdown().await.unwrap();

        let result = coordinator.status().await;
        assert!(matches!(result, Err(CoordinatorError::Closed)));
    }

    #[tokio::test]
    async fn malformed_inbound_is_counted() {
        let (a, _b) = MockTransport::pair();
        let coordinator = start(&a, &MemoryStore::new(), DeviceRole::Handheld).await;

        a.inject(vec![0xc1, 0x00, 0x13]);
        let status = coordinator.status().await.unwrap();
        assert_eq!(status.malformed_dropped, 1);
    }

    #[tokio::test]
    async fn own_messages_are_ignored() {
        let (a, _b) = MockTransport::pair();
        let store = MemoryStore::new();
        let coordinator = start(&a, &store, DeviceRole::Handheld).await;
        let mut events = coordinator.subscribe();

        let echo = SyncMessage::new(
            coordinator.device_id(),
            DeviceRole::Handheld,
            SequenceNumber::new(999),
            Payload::SetCompletion(set("echo", 1)),
        );
        a.inject(codec::encode(&echo).unwrap());
        coordinator.status().await.unwrap();

        assert!(events.try_recv().is_err());
        assert!(store.get_raw(&keys::set("echo")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn suspend_deactivates_and_resume_reactivates() {
        let (a, b) = MockTransport::pair();
        b.activate().await;
        let coordinator = start(&a, &MemoryStore::new(), DeviceRole::Handheld).await;

        coordinator.suspend().await.unwrap();
        let status = coordinator.status().await.unwrap();
        assert!(status.suspended);
        assert_eq!(status.connection.state, ConnectionState::Deactivated);

        let outcome = coordinator.sync_set_completion(set("s1", 3)).await.unwrap();
        assert_eq!(outcome.delivery, Delivery::Queued);

        assert_eq!(coordinator.resume().await.unwrap(), ConnectionState::Reachable);
        assert!(coordinator.send_heartbeat().await.unwrap());
        assert_eq!(coordinator.pending_operations_count().await.unwrap(), 0);
    }

    // ===========================================
    // Conflict State Across Restarts
    // ===========================================

    fn wrist_set(
        origin: DeviceId,
        seq: u64,
        created_at: u64,
        payload: SetCompletionPayload,
    ) -> SyncMessage {
        SyncMessage::new(
            origin,
            DeviceRole::Wrist,
            SequenceNumber::new(seq),
            Payload::SetCompletion(payload),
        )
        .with_created_at(created_at)
    }

    fn timer(duration_secs: u32) -> TimerStatePayload {
        TimerStatePayload {
            is_running: true,
            duration_secs,
            start_time: Some(1),
            exercise_name: None,
        }
    }

    fn discarded(events: &mut broadcast::Receiver<SyncEvent>) -> bool {
        std::iter::from_fn(|| events.try_recv().ok())
            .any(|event| matches!(event, SyncEvent::Discarded { .. }))
    }

    #[tokio::test]
    async fn stale_write_after_restart_is_discarded() {
        let (a, _b) = MockTransport::pair();
        a.set_reachable(false);
        let store = MemoryStore::new();

        let first = start(&a, &store, DeviceRole::Handheld).await;
        first.sync_set_completion(set("s1", 8)).await.unwrap();
        first.shutdown().await.unwrap();

        let second = start(&a, &store, DeviceRole::Handheld).await;
        let mut events = second.subscribe();
        let old = wrist_set(DeviceId::random(), 1, 1_000, set("s1", 5));
        a.inject(codec::encode(&old).unwrap());
        second.status().await.unwrap();

        let kept: Option<SetCompletionPayload> = store.get(&keys::set("s1")).await.unwrap();
        assert_eq!(kept.unwrap().reps, 8);
        assert!(discarded(&mut events));
    }

    #[tokio::test]
    async fn timer_outlives_a_burst_of_remote_sets() {
        let (a, _b) = MockTransport::pair();
        a.set_reachable(false);
        let store = MemoryStore::new();
        let mut config = fast_config(DeviceRole::Handheld);
        config.queue.conflict_window = 4;
        let coordinator =
            SyncCoordinator::start(config, Arc::new(a.clone()), Arc::new(store.clone()))
                .await
                .unwrap();

        coordinator.sync_timer_state(timer(90)).await.unwrap();
        let wrist = DeviceId::random();
        let now = now_millis();
        for n in 1..=300u64 {
            let message = wrist_set(wrist, n, now, set(&format!("w{}", n), 1));
            a.inject(codec::encode(&message).unwrap());
        }
        coordinator.status().await.unwrap();
        let mut events = coordinator.subscribe();
        let old = SyncMessage::new(
            wrist,
            DeviceRole::Wrist,
            SequenceNumber::new(301),
            Payload::TimerState(timer(30)),
        )
        .with_created_at(1_000);
        a.inject(codec::encode(&old).unwrap());
        coordinator.status().await.unwrap();

        let kept: Option<TimerStatePayload> = store.get(keys::TIMER).await.unwrap();
        assert_eq!(kept.unwrap().duration_secs, 90);
        assert!(discarded(&mut events));
    }

    #[tokio::test]
    async fn evicted_set_falls_back_to_stored_version() {
        let (a, _b) = MockTransport::pair();
        a.set_reachable(false);
        let store = MemoryStore::new();
        let mut config = fast_config(DeviceRole::Handheld);
        config.queue.conflict_window = 4;
        let coordinator =
            SyncCoordinator::start(config, Arc::new(a.clone()), Arc::new(store.clone()))
                .await
                .unwrap();

        coordinator.sync_set_completion(set("s1", 8)).await.unwrap();
        let wrist = DeviceId::random();
        for n in 1..=10u64 {
            let message = wrist_set(wrist, n, now_millis(), set(&format!("w{}", n), 1));
            a.inject(codec::encode(&message).unwrap());
        }
        coordinator.status().await.unwrap();
        let mut events = coordinator.subscribe();
        a.inject(codec::encode(&wrist_set(wrist, 11, 1_000, set("s1", 5))).unwrap());
        coordinator.status().await.unwrap();

        let kept: Option<SetCompletionPayload> = store.get(&keys::set("s1")).await.unwrap();
        assert_eq!(kept.unwrap().reps, 8);
        assert!(discarded(&mut events));
        let version_key = keys::version(&EntityKey::Set("s1".into()));
        let version = store.get_raw(&version_key);
        assert!(version.await.unwrap().is_some());
    }

    // ===========================================
    // Durable Store Failures
    // ===========================================

    /// A [`MemoryStore`] whose writes can be switched off.
    #[derive(Clone, Default)]
    struct FlakyStore {
        inner: MemoryStore,
        broken: Arc<AtomicBool>,
    }

    impl FlakyStore {
        fn break_writes(&self, broken: bool) {
            self.broken.store(broken, Ordering::SeqCst);
        }

        fn check(&self, key: &str) -> Result<(), PersistenceError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(PersistenceError::Io {
                    path: key.into(),
                    source: std::io::Error::other("disk full"),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SharedStore for FlakyStore {
        async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
            self.inner.get_raw(key).await
        }

        async fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<(), PersistenceError> {
            self.check(key)?;
            self.inner.set_raw(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<bool, PersistenceError> {
            self.check(key)?;
            self.inner.remove(key).await
        }

        async fn write_blob(&self, name: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
            self.check(name)?;
            self.inner.write_blob(name, bytes).await
        }

        async fn read_blob(&self, name: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
            self.inner.read_blob(name).await
        }
    }

    async fn stored_queue_len(store: &FlakyStore) -> usize {
        match store.read_blob(keys::PENDING_QUEUE).await.unwrap() {
            Some(bytes) => PendingQueue::from_bytes(&bytes, 1_000).unwrap().len(),
            None => 0,
        }
    }

    #[tokio::test]
    async fn failed_queue_write_warns_and_is_written_later() {
        let (a, _b) = MockTransport::pair();
        a.set_reachable(false);
        let store = FlakyStore::default();
        let coordinator = SyncCoordinator::start(
            fast_config(DeviceRole::Handheld),
            Arc::new(a.clone()),
            Arc::new(store.clone()),
        )
        .await
        .unwrap();

        store.break_writes(true);
        let outcome = coordinator.sync_set_completion(set("s1", 5)).await.unwrap();
        assert_eq!(outcome.delivery, Delivery::Queued);
        assert!(outcome.warning.is_some());
        assert_eq!(coordinator.pending_operations_count().await.unwrap(), 1);
        assert_eq!(stored_queue_len(&store).await, 0);
        assert!(coordinator.status().await.unwrap().persistence_failures > 0);

        // The flush retries the write while the store is still down.
        let report = coordinator.process_pending_operations().await.unwrap();
        assert!(report.skipped);
        assert!(report.warning.is_some());

        store.break_writes(false);
        let report = coordinator.process_pending_operations().await.unwrap();
        assert!(report.warning.is_none());
        assert_eq!(stored_queue_len(&store).await, 1);

        let outcome = coordinator.sync_set_completion(set("s2", 6)).await.unwrap();
        assert!(outcome.warning.is_none());
        assert_eq!(stored_queue_len(&store).await, 2);
    }

    #[tokio::test]
    async fn flush_reports_queue_write_failure() {
        let (a, _b) = MockTransport::pair();
        let store = FlakyStore::default();
        let mut config = fast_config(DeviceRole::Handheld);
        config.retry.base_delay_ms = 10_000;
        config.retry.max_delay_ms = 20_000;
        let coordinator =
            SyncCoordinator::start(config, Arc::new(a.clone()), Arc::new(store.clone()))
                .await
                .unwrap();

        // The peer never activated, so the send fails and the op is queued.
        store.break_writes(true);
        let outcome = coordinator.sync_set_completion(set("s1", 5)).await.unwrap();
        assert_eq!(outcome.delivery, Delivery::Queued);

        let report = coordinator.process_pending_operations().await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.remaining, 1);
        assert!(report.warning.is_some());

        store.break_writes(false);
        let report = coordinator.process_pending_operations().await.unwrap();
        assert!(report.warning.is_none());
        assert_eq!(stored_queue_len(&store).await, 1);
    }

    // ===========================================
    // Late Arrivals
    // ===========================================

    #[tokio::test]
    async fn late_message_behind_applied_window_is_applied() {
        let (a, _b) = MockTransport::pair();
        let store = MemoryStore::new();
        let mut config = fast_config(DeviceRole::Handheld);
        config.queue.applied_window = 2;
        let coordinator =
            SyncCoordinator::start(config, Arc::new(a.clone()), Arc::new(store.clone()))
                .await
                .unwrap();
        let mut events = coordinator.subscribe();

        let wrist = DeviceId::random();
        for seq in [5, 6, 8] {
            let message = wrist_set(wrist, seq, now_millis(), set(&format!("w{}", seq), 1));
            a.inject(codec::encode(&message).unwrap());
        }
        let late = wrist_set(wrist, 3, now_millis(), set("late", 4));
        a.inject(codec::encode(&late).unwrap());
        a.inject(codec::encode(&late).unwrap());
        coordinator.status().await.unwrap();

        let stored: Option<SetCompletionPayload> = store.get(&keys::set("late")).await.unwrap();
        assert_eq!(stored.unwrap().reps, 4);
        let applied = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|event| matches!(event, SyncEvent::Applied(update) if update.id == late.id()))
            .count();
        assert_eq!(applied, 1);
    }
}

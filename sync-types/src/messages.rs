//! Sync messages exchanged between the handheld and the wrist device.
//!
//! The set of message kinds is closed. Adding a kind needs a coordinated
//! release on both devices, so everything here is matched exhaustively.

use serde::{Deserialize, Serialize};

use crate::{DeviceId, DeviceRole, MessageId, SequenceNumber};

/// Current protocol version carried by every message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Milliseconds since the Unix epoch, from the system clock.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Message kind discriminator, used for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// A workout session was started.
    WorkoutStart,
    /// A set was logged or edited.
    SetCompletion,
    /// The rest timer changed.
    TimerState,
    /// A workout session was finished.
    WorkoutCompletion,
    /// Liveness probe.
    Heartbeat,
    /// Diagnostic ping/pong.
    TestPing,
    /// Acknowledgement of a processed message.
    Ack,
}

/// A single sync message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Protocol version (currently 1).
    pub version: u8,
    /// Device that created this message.
    pub origin: DeviceId,
    /// Role of the origin device (handheld or wrist).
    pub origin_role: DeviceRole,
    /// Per-origin monotonic sequence number.
    pub sequence: SequenceNumber,
    /// Creation time, Unix milliseconds on the origin's clock.
    pub created_at: u64,
    /// Kind-specific content.
    pub payload: Payload,
}

impl SyncMessage {
    /// Create a message stamped with the current time.
    pub fn new(
        origin: DeviceId,
        origin_role: DeviceRole,
        sequence: SequenceNumber,
        payload: Payload,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            origin,
            origin_role,
            sequence,
            created_at: now_millis(),
            payload,
        }
    }

    /// Override the creation timestamp.
    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// The `(origin, sequence)` identity of this message.
    pub fn id(&self) -> MessageId {
        MessageId::new(self.origin, self.sequence)
    }

    /// The kind of this message.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

/// Message content, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
pub enum Payload {
    /// A workout session was started (or its progress moved on).
    WorkoutStart(SharedWorkoutSessionSnapshot),
    /// A set was completed or edited.
    SetCompletion(SetCompletionPayload),
    /// Rest timer state.
    TimerState(TimerStatePayload),
    /// A workout session finished.
    WorkoutCompletion(WorkoutCompletionPayload),
    /// Liveness probe, no content.
    Heartbeat,
    /// Diagnostic ping or its pong.
    TestPing(TestPingPayload),
    /// Acknowledgement sent back to the origin.
    Ack(AckPayload),
}

impl Payload {
    /// The kind discriminator for this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::WorkoutStart(_) => MessageKind::WorkoutStart,
            Payload::SetCompletion(_) => MessageKind::SetCompletion,
            Payload::TimerState(_) => MessageKind::TimerState,
            Payload::WorkoutCompletion(_) => MessageKind::WorkoutCompletion,
            Payload::Heartbeat => MessageKind::Heartbeat,
            Payload::TestPing(_) => MessageKind::TestPing,
            Payload::Ack(_) => MessageKind::Ack,
        }
    }

    /// True for the kinds that carry workout state and get queued when
    /// delivery fails.
    pub fn is_state(&self) -> bool {
        match self {
            Payload::WorkoutStart(_)
            | Payload::SetCompletion(_)
            | Payload::TimerState(_)
            | Payload::WorkoutCompletion(_) => true,
            Payload::Heartbeat | Payload::TestPing(_) | Payload::Ack(_) => false,
        }
    }
}

/// Latest known cross-device session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedWorkoutSessionSnapshot {
    /// Session identifier (owned by the domain layer).
    pub id: String,
    /// Display title.
    pub title: String,
    /// Start time, Unix milliseconds.
    pub start_time: u64,
    /// Total duration in seconds, once known.
    pub duration_secs: Option<u64>,
    /// Index of the exercise currently in progress.
    pub current_exercise_index: u32,
    /// Number of exercises in the session.
    pub total_exercises: u32,
}

/// A set was completed or edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetCompletionPayload {
    /// Set identifier (the conflict-resolution entity).
    pub set_id: String,
    /// Exercise-within-session this set belongs to.
    pub session_exercise_id: String,
    /// Repetitions performed.
    pub reps: u32,
    /// Weight lifted.
    pub weight: f64,
    /// Whether the set is marked complete.
    pub is_completed: bool,
}

/// Rest timer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerStatePayload {
    /// Whether the countdown is running.
    pub is_running: bool,
    /// Countdown length in seconds.
    pub duration_secs: u32,
    /// When the countdown started, Unix milliseconds.
    pub start_time: Option<u64>,
    /// Exercise the rest period belongs to.
    pub exercise_name: Option<String>,
}

/// A workout session finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutCompletionPayload {
    /// The finished session.
    pub session_id: String,
    /// Final duration in seconds, if the origin measured it.
    pub duration_secs: Option<u64>,
}

/// Direction of a diagnostic test message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingDirection {
    /// Request; the peer answers with a pong.
    Ping,
    /// Answer to a ping.
    Pong,
}

/// Diagnostic ping/pong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPingPayload {
    /// Correlates a pong with its ping.
    pub nonce: u64,
    /// Ping or pong.
    pub direction: PingDirection,
}

/// How the receiver handled an acknowledged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckOutcome {
    /// Applied to the receiver's state.
    Applied,
    /// Lost a conflict and was discarded.
    Discarded,
    /// Already seen; ignored.
    Duplicate,
}

/// Acknowledgement of a processed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// The message being acknowledged.
    pub acknowledged: MessageId,
    /// What the receiver did with it.
    pub outcome: AckOutcome,
}

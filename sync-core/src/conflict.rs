//! Conflict resolution between the two devices.
//!
//! Every state message addresses one entity (a session, a set, or the rest
//! timer). The resolver remembers the winning version per entity, from both
//! local writes and applied inbound messages, and decides whether an inbound
//! message replaces it:
//!
//! 1. The later `created_at` wins.
//! 2. On an exact tie the handheld beats the wrist device. This only works
//!    because the topology is fixed at exactly two peers.
//! 3. On a tie between equal roles (only seen in tests and replays) the higher
//!    `(sequence, origin)` wins, so the rule stays total and deterministic.
//!
//! Losers are discarded by the caller, never re-queued.
//!
//! The resolver is a bounded cache. Entities leave it least recently written
//! first, except the rest timer and the active session, which are never
//! evicted. Callers persist every winning [`Version`] and hand it back through
//! [`ConflictResolver::seed`] when [`ConflictResolver::current`] misses.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use liftsync_types::{DeviceRole, MessageId, Payload, SyncMessage};
use serde::{Deserialize, Serialize};

/// The entity a state message writes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    /// A workout session (start and completion share it).
    Session(String),
    /// A single set.
    Set(String),
    /// The rest timer (one per pair).
    Timer,
}

impl EntityKey {
    /// The entity addressed by a payload, or `None` for control messages.
    pub fn for_payload(payload: &Payload) -> Option<Self> {
        match payload {
            Payload::WorkoutStart(snapshot) => Some(Self::Session(snapshot.id.clone())),
            Payload::WorkoutCompletion(done) => Some(Self::Session(done.session_id.clone())),
            Payload::SetCompletion(set) => Some(Self::Set(set.set_id.clone())),
            Payload::TimerState(_) => Some(Self::Timer),
            Payload::Heartbeat | Payload::TestPing(_) | Payload::Ack(_) => None,
        }
    }
}

/// The competing attributes of one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Creation time on the origin, Unix milliseconds.
    pub created_at: u64,
    /// Role of the origin device.
    pub role: DeviceRole,
    /// Identity of the message.
    pub id: MessageId,
}

impl Version {
    /// Extract the version of a message.
    pub fn of(message: &SyncMessage) -> Self {
        Self {
            created_at: message.created_at,
            role: message.origin_role,
            id: message.id(),
        }
    }

    /// Total order used to pick a winner; greater wins.
    pub fn precedence(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then(self.role.priority().cmp(&other.role.priority()))
            .then(self.id.sequence.cmp(&other.id.sequence))
            .then(self.id.origin.cmp(&other.id.origin))
    }
}

/// Verdict for an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Apply it.
    Accept,
    /// Drop it; `winner` is the version that beat it.
    Discard {
        /// The version currently held for the entity.
        winner: Version,
    },
}

/// Per-entity last-writer tracker.
#[derive(Debug)]
pub struct ConflictResolver {
    /// Maximum number of tracked entities.
    capacity: usize,
    /// Winning version per entity.
    versions: HashMap<EntityKey, Version>,
    /// Least recently written first.
    order: VecDeque<EntityKey>,
    /// Most recently written session; pinned like the timer.
    active_session: Option<EntityKey>,
}

impl ConflictResolver {
    /// Create a resolver tracking at most `capacity` entities.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            versions: HashMap::new(),
            order: VecDeque::new(),
            active_session: None,
        }
    }

    /// Decide whether an inbound message should be applied.
    ///
    /// Control messages and messages for untracked entities are accepted.
    pub fn resolve(&self, message: &SyncMessage) -> Resolution {
        let Some(key) = EntityKey::for_payload(&message.payload) else {
            return Resolution::Accept;
        };
        let Some(current) = self.versions.get(&key) else {
            return Resolution::Accept;
        };

        let incoming = Version::of(message);
        match incoming.precedence(current) {
            Ordering::Greater => Resolution::Accept,
            Ordering::Less | Ordering::Equal => Resolution::Discard { winner: *current },
        }
    }

    /// Remember a local write or an applied inbound message.
    ///
    /// A version older than the one already held is ignored, so recording can
    /// never move an entity backwards. Returns the entity and its new version
    /// when the held version changed.
    pub fn record(&mut self, message: &SyncMessage) -> Option<(EntityKey, Version)> {
        let key = EntityKey::for_payload(&message.payload)?;
        let version = Version::of(message);
        self.seed(key.clone(), version).then_some((key, version))
    }

    /// Install a version for an entity, typically one restored from storage.
    ///
    /// Same rule as [`ConflictResolver::record`]: only a greater version
    /// replaces the held one. Returns `true` if the held version changed.
    pub fn seed(&mut self, key: EntityKey, version: Version) -> bool {
        let changed = match self.versions.get_mut(&key) {
            Some(current) if version.precedence(current) != Ordering::Greater => false,
            Some(current) => {
                *current = version;
                true
            }
            None => {
                self.versions.insert(key.clone(), version);
                true
            }
        };
        if changed {
            self.touch(key);
            self.evict();
        }
        changed
    }

    fn touch(&mut self, key: EntityKey) {
        if let Some(pos) = self.order.iter().position(|k| *k == key) {
            self.order.remove(pos);
        }
        if matches!(key, EntityKey::Session(_)) {
            self.active_session = Some(key.clone());
        }
        self.order.push_back(key);
    }

    fn is_pinned(&self, key: &EntityKey) -> bool {
        *key == EntityKey::Timer || self.active_session.as_ref() == Some(key)
    }

    fn evict(&mut self) {
        while self.order.len() > self.capacity {
            let Some(pos) = self.order.iter().position(|k| !self.is_pinned(k)) else {
                break;
            };
            if let Some(oldest) = self.order.remove(pos) {
                self.versions.remove(&oldest);
            }
        }
    }

    /// The version currently held for an entity.
    pub fn current(&self, key: &EntityKey) -> Option<&Version> {
        self.versions.get(key)
    }

    /// Number of tracked entities.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Check if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

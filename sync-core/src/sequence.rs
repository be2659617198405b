//! Applied-sequence tracking for idempotent delivery.
//!
//! A message can reach the peer more than once: a send that timed out may
//! still have been delivered, and the queue will send it again. This module
//! remembers which `(origin, sequence)` pairs were already processed.
//!
//! Sequences do not arrive in order (a heartbeat can overtake an older queued
//! mutation), so each origin keeps:
//! - A contiguous watermark (everything at or below it has been seen)
//! - A set of seen sequences above the watermark
//!
//! The set is bounded. When it overflows the watermark jumps to the lowest
//! seen sequence and the gap it jumped over is kept as a skipped range. A
//! late arrival inside a skipped range is still new and gets applied once.
//! Skipped ranges are bounded too; the oldest is forgotten first.

use std::collections::{BTreeSet, HashMap};

use liftsync_types::{DeviceId, MessageId};
use serde::{Deserialize, Serialize};

/// Seen sequences of a single origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceWindow {
    /// The last contiguous sequence (no gaps up to this point).
    contiguous: u64,
    /// Seen sequences above `contiguous`.
    seen: BTreeSet<u64>,
    /// Inclusive ranges at or below `contiguous` that were never seen.
    /// Ascending.
    skipped: Vec<(u64, u64)>,
    /// Maximum size of `seen`, and of `skipped`.
    max_window: usize,
}

impl SequenceWindow {
    /// Create an empty window.
    pub fn new(max_window: usize) -> Self {
        Self {
            contiguous: 0,
            seen: BTreeSet::new(),
            skipped: Vec::new(),
            max_window: max_window.max(1),
        }
    }

    /// Check whether a sequence was already recorded.
    pub fn contains(&self, sequence: u64) -> bool {
        if sequence <= self.contiguous {
            return self.skipped_index(sequence).is_none();
        }
        self.seen.contains(&sequence)
    }

    /// Record a sequence. Returns `false` if it was already seen.
    pub fn record(&mut self, sequence: u64) -> bool {
        if let Some(index) = self.skipped_index(sequence) {
            self.unskip(index, sequence);
            return true;
        }
        if self.contains(sequence) {
            return false;
        }
        self.seen.insert(sequence);
        self.compact();

        while self.seen.len() > self.max_window {
            if let Some(lowest) = self.seen.pop_first() {
                if lowest > self.contiguous + 1 {
                    self.skip(self.contiguous + 1, lowest - 1);
                }
                self.contiguous = lowest;
                self.compact();
            }
        }
        true
    }

    fn skipped_index(&self, sequence: u64) -> Option<usize> {
        self.skipped
            .iter()
            .position(|&(low, high)| low <= sequence && sequence <= high)
    }

    fn skip(&mut self, low: u64, high: u64) {
        self.skipped.push((low, high));
        self.trim_skipped();
    }

    fn unskip(&mut self, index: usize, sequence: u64) {
        let (low, high) = self.skipped.remove(index);
        let mut at = index;
        if low < sequence {
            self.skipped.insert(at, (low, sequence - 1));
            at += 1;
        }
        if sequence < high {
            self.skipped.insert(at, (sequence + 1, high));
        }
        self.trim_skipped();
    }

    fn trim_skipped(&mut self) {
        if self.skipped.len() > self.max_window {
            let excess = self.skipped.len() - self.max_window;
            self.skipped.drain(..excess);
        }
    }

    fn compact(&mut self) {
        while self.seen.remove(&(self.contiguous + 1)) {
            self.contiguous += 1;
        }
    }

    /// The contiguous watermark.
    pub fn contiguous(&self) -> u64 {
        self.contiguous
    }

    /// The highest sequence seen.
    pub fn highest(&self) -> u64 {
        self.seen.last().copied().unwrap_or(self.contiguous)
    }

    /// Sequences missing below the highest seen.
    pub fn gaps(&self) -> Vec<u64> {
        (self.contiguous + 1..self.highest())
            .filter(|s| !self.seen.contains(s))
            .collect()
    }

    /// Ranges the watermark jumped over that have not arrived since.
    pub fn skipped(&self) -> &[(u64, u64)] {
        &self.skipped
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OriginWindow {
    origin: DeviceId,
    contiguous: u64,
    seen: Vec<u64>,
    #[serde(default)]
    skipped: Vec<(u64, u64)>,
}

/// Seen sequences for every origin.
#[derive(Debug, Clone)]
pub struct AppliedLog {
    windows: HashMap<DeviceId, SequenceWindow>,
    max_window: usize,
}

impl AppliedLog {
    /// Create an empty log.
    pub fn new(max_window: usize) -> Self {
        Self {
            windows: HashMap::new(),
            max_window,
        }
    }

    /// Check whether a message was already processed.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.windows
            .get(&id.origin)
            .is_some_and(|w| w.contains(id.sequence.value()))
    }

    /// Record a processed message. Returns `false` if it was already there.
    pub fn record(&mut self, id: &MessageId) -> bool {
        let max_window = self.max_window;
        self.windows
            .entry(id.origin)
            .or_insert_with(|| SequenceWindow::new(max_window))
            .record(id.sequence.value())
    }

    /// The window of one origin.
    pub fn window(&self, origin: &DeviceId) -> Option<&SequenceWindow> {
        self.windows.get(origin)
    }

    /// Persistable form (serializes as a list; `DeviceId` is not a map key in JSON).
    pub fn to_snapshot(&self) -> AppliedLogSnapshot {
        AppliedLogSnapshot {
            origins: self
                .windows
                .iter()
                .map(|(origin, w)| OriginWindow {
                    origin: *origin,
                    contiguous: w.contiguous,
                    seen: w.seen.iter().copied().collect(),
                    skipped: w.skipped.clone(),
                })
                .collect(),
        }
    }

    /// Rebuild from a persisted snapshot.
    pub fn from_snapshot(snapshot: AppliedLogSnapshot, max_window: usize) -> Self {
        let mut log = Self::new(max_window);
        for entry in snapshot.origins {
            let mut window = SequenceWindow::new(max_window);
            window.contiguous = entry.contiguous;
            window.skipped = entry.skipped;
            window.trim_skipped();
            for seq in entry.seen {
                window.record(seq);
            }
            log.windows.insert(entry.origin, window);
        }
        log
    }
}

/// Serializable state of an [`AppliedLog`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppliedLogSnapshot {
    origins: Vec<OriginWindow>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftsync_types::SequenceNumber;

    #[test]
    fn in_order_sequences_advance_watermark() {
        let mut window = SequenceWindow::new(16);
        assert!(window.record(1));
        assert!(window.record(2));
        assert!(window.record(3));
        assert_eq!(window.contiguous(), 3);
        assert!(window.gaps().is_empty());
    }

    #[test]
    fn duplicate_is_detected() {
        let mut window = SequenceWindow::new(16);
        assert!(window.record(1));
        assert!(!window.record(1));
    }

    #[test]
    fn out_of_order_sequence_fills_gap() {
        let mut window = SequenceWindow::new(16);
        window.record(1);
        window.record(4);
        window.record(3);

        assert_eq!(window.contiguous(), 1);
        assert_eq!(window.gaps(), vec![2]);
        assert!(window.contains(4));
        assert!(!window.contains(2));

        assert!(window.record(2));
        assert_eq!(window.contiguous(), 4);
        assert_eq!(window.highest(), 4);
    }

    #[test]
    fn overflow_keeps_jumped_gap_open() {
        let mut window = SequenceWindow::new(2);
        window.record(5);
        window.record(6);
        window.record(8);

        // The watermark passed 1..=4 without seeing them.
        assert_eq!(window.contiguous(), 6);
        assert_eq!(window.skipped(), &[(1, 4)]);
        assert!(!window.contains(3));
        assert!(window.contains(5));
        assert!(window.contains(8));
        assert!(!window.contains(7));

        // A late arrival is new exactly once.
        assert!(window.record(3));
        assert!(window.contains(3));
        assert!(!window.record(3));
        assert_eq!(window.skipped(), &[(1, 2), (4, 4)]);

        assert!(window.record(4));
        assert!(window.record(1));
        assert_eq!(window.skipped(), &[(2, 2)]);
    }

    #[test]
    fn skipped_ranges_are_bounded() {
        let mut window = SequenceWindow::new(1);
        window.record(3);
        window.record(5);
        window.record(7);

        // Only the newest range survives; the oldest is forgotten first.
        assert_eq!(window.contiguous(), 5);
        assert_eq!(window.skipped(), &[(4, 4)]);
        assert!(window.contains(1));
        assert!(!window.contains(4));
    }

    #[test]
    fn log_tracks_origins_separately() {
        let a = DeviceId::random();
        let b = DeviceId::random();
        let mut log = AppliedLog::new(16);

        assert!(log.record(&MessageId::new(a, SequenceNumber::new(1))));
        assert!(log.contains(&MessageId::new(a, SequenceNumber::new(1))));
        assert!(!log.contains(&MessageId::new(b, SequenceNumber::new(1))));
        assert!(log.record(&MessageId::new(b, SequenceNumber::new(1))));
        assert!(!log.record(&MessageId::new(a, SequenceNumber::new(1))));
    }

    #[test]
    fn snapshot_roundtrip_through_json() {
        let origin = DeviceId::random();
        let mut log = AppliedLog::new(16);
        for seq in [1, 2, 5] {
            log.record(&MessageId::new(origin, SequenceNumber::new(seq)));
        }

        let json = serde_json::to_string(&log.to_snapshot()).unwrap();
        let restored = AppliedLog::from_snapshot(serde_json::from_str(&json).unwrap(), 16);

        let window = restored.window(&origin).unwrap();
        assert_eq!(window.contiguous(), 2);
        assert!(restored.contains(&MessageId::new(origin, SequenceNumber::new(5))));
        assert!(!restored.contains(&MessageId::new(origin, SequenceNumber::new(3))));
    }

    #[test]
    fn snapshot_keeps_skipped_ranges() {
        let origin = DeviceId::random();
        let mut log = AppliedLog::new(2);
        for seq in [5, 6, 8] {
            log.record(&MessageId::new(origin, SequenceNumber::new(seq)));
        }

        let json = serde_json::to_string(&log.to_snapshot()).unwrap();
        let mut restored = AppliedLog::from_snapshot(serde_json::from_str(&json).unwrap(), 2);

        let late = MessageId::new(origin, SequenceNumber::new(2));
        assert!(!restored.contains(&late));
        assert!(restored.record(&late));
        assert!(!restored.record(&late));
    }

    #[test]
    fn snapshot_without_skipped_ranges_still_loads() {
        let origin = DeviceId::random();
        let mut log = AppliedLog::new(16);
        log.record(&MessageId::new(origin, SequenceNumber::new(1)));
        let mut value = serde_json::to_value(log.to_snapshot()).unwrap();
        value["origins"][0].as_object_mut().unwrap().remove("skipped");

        let restored = AppliedLog::from_snapshot(serde_json::from_value(value).unwrap(), 16);
        assert!(restored.contains(&MessageId::new(origin, SequenceNumber::new(1))));
    }
}

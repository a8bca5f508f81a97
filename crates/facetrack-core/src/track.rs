//! Track state: lifecycle, bounded box history and per-track identity cache.

use std::time::Instant;

use crate::kalman::MotionEstimator;
use crate::spoof::LivenessGate;
use crate::types::{BoundingBox, Embedding};

/// Monotonic track identifier, unique among live tracks for the lifetime of
/// one `TrackManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track-{}", self.0)
    }
}

/// Track lifecycle states.
///
/// `Tentative` until `min_hits` observations, then `Confirmed`; `Lost` while
/// unmatched but within `max_age`; `Removed` is terminal and the track is
/// evicted from the live set in the same frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Lost,
    Removed,
}

/// Fixed-capacity, index-based ring buffer of past boxes. Old entries are
/// overwritten in place; no reallocation after construction.
#[derive(Debug, Clone)]
pub struct BoxHistory {
    slots: Vec<BoundingBox>,
    cap: usize,
    head: usize,
    len: usize,
}

impl BoxHistory {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "history capacity must be non-zero");
        Self {
            slots: Vec::with_capacity(capacity),
            cap: capacity,
            head: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, bbox: BoundingBox) {
        if self.len < self.cap {
            self.slots.push(bbox);
            self.len += 1;
        } else {
            self.slots[self.head] = bbox;
        }
        self.head = (self.head + 1) % self.cap;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Most recent entry.
    pub fn latest(&self) -> Option<&BoundingBox> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.cap - 1) % self.cap;
        self.slots.get(idx)
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &BoundingBox> {
        let start = if self.len < self.cap { 0 } else { self.head };
        (0..self.len).map(move |i| &self.slots[(start + i) % self.cap])
    }
}

/// Identity resolved for a track by the similarity index, cached on the
/// track to avoid re-querying every frame.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub face_id: String,
    pub person_id: String,
    pub confidence: f32,
}

/// One tracked face across consecutive frames.
///
/// The manager exclusively owns every `Track` and its motion-estimator
/// state; callers only see snapshots.
#[derive(Debug)]
pub struct Track {
    pub id: TrackId,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub state: TrackState,
    /// Frames in which this track was observed (matched). At least 1 while live.
    pub age: u32,
    pub time_since_update: u32,
    pub last_seen: Instant,
    pub anti_spoof_score: Option<f32>,
    /// Set once the liveness gate reports `Failed`; the track is withheld
    /// from identity resolution but keeps reporting geometry.
    pub liveness_failed: bool,
    pub identity: Option<ResolvedIdentity>,
    pub embedding: Option<Embedding>,
    pub(crate) estimator: MotionEstimator,
    pub(crate) gate: LivenessGate,
    pub(crate) history: BoxHistory,
}

impl Track {
    pub fn velocity(&self) -> (f32, f32) {
        self.estimator.velocity()
    }

    /// Box predicted for the current frame from the motion state.
    pub fn predicted_bbox(&self) -> BoundingBox {
        let (cx, cy) = self.estimator.position();
        self.bbox.with_center(cx, cy)
    }

    pub fn history(&self) -> &BoxHistory {
        &self.history
    }

    /// Whether this track should be offered to the similarity index.
    pub fn eligible_for_resolution(&self) -> bool {
        self.state == TrackState::Confirmed
            && !self.liveness_failed
            && self.identity.is_none()
            && self.embedding.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bx(x: f32) -> BoundingBox {
        BoundingBox::new(x, 0.0, 10.0, 10.0)
    }

    #[test]
    fn test_history_bounded() {
        let mut h = BoxHistory::new(3);
        for i in 0..5 {
            h.push(bx(i as f32));
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.capacity(), 3);
        let xs: Vec<f32> = h.iter().map(|b| b.x).collect();
        assert_eq!(xs, vec![2.0, 3.0, 4.0]);
        assert_eq!(h.latest().unwrap().x, 4.0);
    }

    #[test]
    fn test_history_partial_fill() {
        let mut h = BoxHistory::new(4);
        assert!(h.is_empty());
        h.push(bx(1.0));
        h.push(bx(2.0));
        assert_eq!(h.len(), 2);
        let xs: Vec<f32> = h.iter().map(|b| b.x).collect();
        assert_eq!(xs, vec![1.0, 2.0]);
        assert_eq!(h.latest().unwrap().x, 2.0);
    }

    #[test]
    fn test_history_no_reallocation() {
        let mut h = BoxHistory::new(2);
        let cap_before = h.slots.capacity();
        for i in 0..10 {
            h.push(bx(i as f32));
        }
        assert_eq!(h.slots.capacity(), cap_before);
    }
}

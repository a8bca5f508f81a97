//! Track manager: per-frame predict → match → update → age → spawn cycle.

use std::time::Instant;

use crate::assignment::{assign, Assignment};
use crate::kalman::{MotionEstimator, MotionNoise};
use crate::spoof::{LivenessGate, LivenessVerdict, SpoofWeights};
use crate::track::{BoxHistory, ResolvedIdentity, Track, TrackId, TrackState};
use crate::types::{BoundingBox, Detection, Embedding};

/// Tracker configuration. All thresholds are tunable deployment parameters.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Frames a track may stay unmatched before removal.
    pub max_age: u32,
    /// Observations required before a track is confirmed.
    pub min_hits: u32,
    /// Minimum IoU for a track/detection pair to count as a match.
    pub iou_threshold: f32,
    /// Ring-buffer capacity of per-track box history.
    pub history_capacity: usize,
    pub spoof_weights: SpoofWeights,
    /// Liveness score below this counts as a spoof failure.
    pub spoof_threshold: f32,
    /// Consecutive failures tolerated before the track is marked invalid.
    pub max_spoof_failures: u32,
    pub motion_noise: MotionNoise,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_age: 30,
            min_hits: 3,
            iou_threshold: 0.3,
            history_capacity: 32,
            spoof_weights: SpoofWeights::default(),
            spoof_threshold: 0.8,
            max_spoof_failures: 5,
            motion_noise: MotionNoise::default(),
        }
    }
}

/// Value snapshot of one live track, safe to hand to callers.
#[derive(Debug, Clone)]
pub struct TrackSnapshot {
    pub id: TrackId,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub state: TrackState,
    pub age: u32,
    pub time_since_update: u32,
    pub velocity: (f32, f32),
    pub anti_spoof_score: Option<f32>,
    pub liveness_failed: bool,
    pub identity: Option<ResolvedIdentity>,
}

/// Owns the live track set and drives the per-frame update cycle.
///
/// Must be driven synchronously from the frame loop: track state is not
/// safe to share across concurrent frame updates.
pub struct TrackManager {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
    frame_count: u64,
}

impl TrackManager {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 0,
            frame_count: 0,
        }
    }

    /// Run one frame: predict every track, associate detections, update
    /// matched tracks, age unmatched ones, spawn tracks for unmatched
    /// detections. Returns a snapshot of every live track in id order.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<TrackSnapshot> {
        self.frame_count += 1;

        // 1. Predict.
        for track in &mut self.tracks {
            track.estimator.predict();
        }

        // 2. Match predicted boxes to detections.
        let predicted: Vec<BoundingBox> = self.tracks.iter().map(|t| t.predicted_bbox()).collect();
        let det_boxes: Vec<BoundingBox> = detections.iter().map(|d| d.bbox).collect();

        let assignment = match assign(&predicted, &det_boxes, self.config.iou_threshold) {
            Ok(a) => a,
            Err(err) => {
                // Degrade to "all unmatched" rather than dropping the frame.
                tracing::warn!(frame = self.frame_count, error = %err, "assignment failed");
                Assignment {
                    matches: Vec::new(),
                    unmatched_tracks: (0..self.tracks.len()).collect(),
                    unmatched_detections: (0..detections.len()).collect(),
                }
            }
        };

        // 3. Update matched tracks.
        for &(track_idx, det_idx) in &assignment.matches {
            let track = &mut self.tracks[track_idx];
            let detection = &detections[det_idx];
            Self::apply_match(track, detection, &self.config);
        }

        // 4. Age unmatched tracks; removal happens below in one pass.
        for &track_idx in &assignment.unmatched_tracks {
            let track = &mut self.tracks[track_idx];
            track.time_since_update += 1;
            if track.time_since_update > self.config.max_age {
                track.state = TrackState::Removed;
            } else {
                track.state = TrackState::Lost;
                // Coast on the prediction so geometry keeps being reported.
                track.bbox = track.predicted_bbox();
            }
        }

        let before = self.tracks.len();
        self.tracks.retain(|t| t.state != TrackState::Removed);
        let removed = before - self.tracks.len();
        if removed > 0 {
            tracing::debug!(frame = self.frame_count, removed, "evicted stale tracks");
        }

        // 5. Spawn tentative tracks from unmatched detections.
        for &det_idx in &assignment.unmatched_detections {
            self.spawn(&detections[det_idx]);
        }

        self.snapshot()
    }

    fn apply_match(track: &mut Track, detection: &Detection, config: &TrackerConfig) {
        let (cx, cy) = detection.bbox.center();
        track.estimator.update(cx, cy);

        track.bbox = detection.bbox;
        track.confidence = detection.confidence;
        track.age += 1;
        track.time_since_update = 0;
        track.last_seen = Instant::now();
        track.history.push(detection.bbox);

        if let Some(embedding) = &detection.embedding {
            track.embedding = Some(embedding.clone());
        }

        let score = config.spoof_weights.combine(&detection.spoof);
        track.anti_spoof_score = Some(score);
        match track.gate.observe(score) {
            LivenessVerdict::Failed => {
                if !track.liveness_failed {
                    tracing::info!(id = %track.id, score, "track failed liveness gate");
                }
                track.liveness_failed = true;
            }
            LivenessVerdict::Pass => {
                track.liveness_failed = false;
            }
            LivenessVerdict::Failing => {}
        }

        track.state = if track.age >= config.min_hits && !track.liveness_failed {
            TrackState::Confirmed
        } else {
            TrackState::Tentative
        };
    }

    fn spawn(&mut self, detection: &Detection) {
        let id = TrackId(self.next_id);
        self.next_id += 1;

        let (cx, cy) = detection.bbox.center();
        let mut history = BoxHistory::new(self.config.history_capacity);
        history.push(detection.bbox);

        let mut gate = LivenessGate::new(self.config.spoof_threshold, self.config.max_spoof_failures);
        let score = self.config.spoof_weights.combine(&detection.spoof);
        gate.observe(score);

        self.tracks.push(Track {
            id,
            bbox: detection.bbox,
            confidence: detection.confidence,
            state: TrackState::Tentative,
            age: 1,
            time_since_update: 0,
            last_seen: Instant::now(),
            anti_spoof_score: Some(score),
            liveness_failed: false,
            identity: None,
            embedding: detection.embedding.clone(),
            estimator: MotionEstimator::new(cx, cy, self.config.motion_noise),
            gate,
            history,
        });

        tracing::debug!(id = %id, "spawned tentative track");
    }

    /// Current live tracks in id order.
    pub fn snapshot(&self) -> Vec<TrackSnapshot> {
        self.tracks
            .iter()
            .map(|t| TrackSnapshot {
                id: t.id,
                bbox: t.bbox,
                confidence: t.confidence,
                state: t.state,
                age: t.age,
                time_since_update: t.time_since_update,
                velocity: t.velocity(),
                anti_spoof_score: t.anti_spoof_score,
                liveness_failed: t.liveness_failed,
                identity: t.identity.clone(),
            })
            .collect()
    }

    /// Confirmed, liveness-passing tracks that still need identity
    /// resolution, with the embedding to resolve with.
    pub fn resolution_candidates(&self) -> Vec<(TrackId, Embedding)> {
        self.tracks
            .iter()
            .filter(|t| t.eligible_for_resolution())
            .filter_map(|t| t.embedding.clone().map(|e| (t.id, e)))
            .collect()
    }

    /// Cache a resolved identity on a track. Returns false for a dead id.
    pub fn set_identity(&mut self, id: TrackId, identity: ResolvedIdentity) -> bool {
        match self.tracks.iter_mut().find(|t| t.id == id) {
            Some(track) => {
                track.identity = Some(identity);
                true
            }
            None => false,
        }
    }

    /// Drop a cached identity so the track is re-queried next frame.
    pub fn invalidate_identity(&mut self, id: TrackId) {
        if let Some(track) = self.tracks.iter_mut().find(|t| t.id == id) {
            track.identity = None;
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SpoofSignals;

    fn det(x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection::new(BoundingBox::new(x, y, w, h), 0.9)
    }

    fn manager() -> TrackManager {
        TrackManager::new(TrackerConfig::default())
    }

    #[test]
    fn test_detection_spawns_tentative_track() {
        let mut mgr = manager();
        let snap = mgr.update(&[det(10.0, 10.0, 50.0, 50.0)]);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].state, TrackState::Tentative);
        assert_eq!(snap[0].age, 1);
    }

    #[test]
    fn test_track_confirmed_after_min_hits() {
        let mut mgr = manager();
        let d = [det(10.0, 10.0, 50.0, 50.0)];
        mgr.update(&d);
        mgr.update(&d);
        let snap = mgr.update(&d);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].state, TrackState::Confirmed);
        assert_eq!(snap[0].age, 3);
    }

    #[test]
    fn test_matched_track_keeps_id_and_ages() {
        // A detection shifted by one pixel overlaps well past the gate;
        // same id, age 2.
        let mut mgr = manager();
        let snap0 = mgr.update(&[det(10.0, 10.0, 50.0, 50.0)]);
        let id = snap0[0].id;

        let snap1 = mgr.update(&[det(11.0, 11.0, 50.0, 50.0)]);
        assert_eq!(snap1.len(), 1);
        assert_eq!(snap1[0].id, id);
        assert_eq!(snap1[0].age, 2);
        assert_eq!(snap1[0].time_since_update, 0);
    }

    #[test]
    fn test_continuously_matched_track_never_removed() {
        let mut mgr = manager();
        let d = [det(100.0, 100.0, 40.0, 40.0)];
        let id = mgr.update(&d)[0].id;
        for _ in 0..100 {
            let snap = mgr.update(&d);
            assert_eq!(snap.len(), 1);
            assert_eq!(snap[0].id, id);
        }
    }

    #[test]
    fn test_unmatched_track_removed_after_max_age() {
        let config = TrackerConfig {
            max_age: 3,
            ..TrackerConfig::default()
        };
        let mut mgr = TrackManager::new(config);
        mgr.update(&[det(10.0, 10.0, 50.0, 50.0)]);
        assert_eq!(mgr.len(), 1);

        // max_age frames of absence leave the track alive as Lost...
        for _ in 0..3 {
            mgr.update(&[]);
        }
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.snapshot()[0].state, TrackState::Lost);

        // ...one more evicts it and it is absent from the snapshot.
        let snap = mgr.update(&[]);
        assert!(snap.is_empty());
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_far_detection_spawns_second_track() {
        let mut mgr = manager();
        mgr.update(&[det(0.0, 0.0, 30.0, 30.0)]);
        let snap = mgr.update(&[det(0.0, 0.0, 30.0, 30.0), det(500.0, 500.0, 30.0, 30.0)]);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].age, 2);
        assert_eq!(snap[1].age, 1);
    }

    #[test]
    fn test_spoof_failure_blocks_resolution_but_keeps_geometry() {
        let config = TrackerConfig {
            min_hits: 1,
            max_spoof_failures: 2,
            ..TrackerConfig::default()
        };
        let mut mgr = TrackManager::new(config);

        let spoofed = Detection::new(BoundingBox::new(10.0, 10.0, 50.0, 50.0), 0.9)
            .with_embedding(Embedding::new(vec![1.0, 0.0]))
            .with_spoof(SpoofSignals {
                texture: Some(0.1),
                depth: Some(0.1),
                blink: Some(0.1),
            });

        // First frames are merely "failing"; candidates still blocked only
        // once the streak exceeds the limit.
        mgr.update(std::slice::from_ref(&spoofed));
        mgr.update(std::slice::from_ref(&spoofed));
        let snap = mgr.update(std::slice::from_ref(&spoofed));
        assert!(snap[0].liveness_failed);
        assert!(mgr.resolution_candidates().is_empty());
        // Geometry is still reported.
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].bbox, BoundingBox::new(10.0, 10.0, 50.0, 50.0));
    }

    #[test]
    fn test_resolution_candidates_and_identity_cache() {
        let config = TrackerConfig {
            min_hits: 1,
            ..TrackerConfig::default()
        };
        let mut mgr = TrackManager::new(config);

        let d = Detection::new(BoundingBox::new(10.0, 10.0, 50.0, 50.0), 0.9)
            .with_embedding(Embedding::new(vec![1.0, 0.0]));
        mgr.update(std::slice::from_ref(&d));

        let candidates = mgr.resolution_candidates();
        assert_eq!(candidates.len(), 1);
        let (id, _) = candidates[0].clone();

        assert!(mgr.set_identity(
            id,
            ResolvedIdentity {
                face_id: "f-1".into(),
                person_id: "alice".into(),
                confidence: 0.97,
            }
        ));
        // Resolved tracks are not re-queried.
        assert!(mgr.resolution_candidates().is_empty());

        mgr.invalidate_identity(id);
        assert_eq!(mgr.resolution_candidates().len(), 1);
    }

    #[test]
    fn test_deterministic_assignment_order() {
        // Two identical runs must associate identically.
        let run = || {
            let mut mgr = manager();
            mgr.update(&[det(0.0, 0.0, 30.0, 30.0), det(100.0, 0.0, 30.0, 30.0)]);
            let snap = mgr.update(&[det(101.0, 1.0, 30.0, 30.0), det(1.0, 1.0, 30.0, 30.0)]);
            snap.iter().map(|t| (t.id.0, t.bbox.x)).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_lost_track_coasts_on_prediction() {
        let mut mgr = manager();
        // Establish rightward motion.
        for i in 0..5 {
            mgr.update(&[det(10.0 + 5.0 * i as f32, 10.0, 50.0, 50.0)]);
        }
        let last_x = mgr.snapshot()[0].bbox.x;
        let snap = mgr.update(&[]);
        assert_eq!(snap[0].state, TrackState::Lost);
        assert!(snap[0].bbox.x > last_x, "lost track should coast forward");
    }
}

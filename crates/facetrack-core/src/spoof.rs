//! Anti-spoof scoring and the per-track liveness gate.
//!
//! Sub-scores (texture, depth, blink/motion) are produced by external
//! models; this module only combines them. A missing sub-score contributes
//! a neutral 1.0 so that a model that never ran does not penalize the track.

use serde::{Deserialize, Serialize};

use crate::types::SpoofSignals;

/// Weights for combining anti-spoof sub-scores. Tunable parameters, not a
/// fixed contract; defaults follow the deployed configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpoofWeights {
    pub texture: f32,
    pub depth: f32,
    pub blink: f32,
}

impl Default for SpoofWeights {
    fn default() -> Self {
        Self {
            texture: 0.4,
            depth: 0.4,
            blink: 0.2,
        }
    }
}

impl SpoofWeights {
    /// Weighted combination of the available sub-scores into one liveness
    /// score in [0, 1].
    pub fn combine(&self, signals: &SpoofSignals) -> f32 {
        let texture = signals.texture.unwrap_or(1.0);
        let depth = signals.depth.unwrap_or(1.0);
        let blink = signals.blink.unwrap_or(1.0);

        let total = self.texture + self.depth + self.blink;
        if total <= 0.0 {
            return 1.0;
        }

        let score = (texture * self.texture + depth * self.depth + blink * self.blink) / total;
        score.clamp(0.0, 1.0)
    }
}

/// Verdict of the liveness gate after observing one frame's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// Score at or above threshold; failure streak reset.
    Pass,
    /// Below threshold but within the allowed streak.
    Failing,
    /// Below threshold for more than the allowed consecutive frames; the
    /// track should be withheld from identity resolution.
    Failed,
}

/// Tracks consecutive sub-threshold frames for one track. The track is not
/// removed on failure, only marked invalid, to avoid flapping.
#[derive(Debug, Clone)]
pub struct LivenessGate {
    threshold: f32,
    max_consecutive_failures: u32,
    consecutive_failures: u32,
}

impl LivenessGate {
    pub fn new(threshold: f32, max_consecutive_failures: u32) -> Self {
        Self {
            threshold,
            max_consecutive_failures,
            consecutive_failures: 0,
        }
    }

    pub fn observe(&mut self, score: f32) -> LivenessVerdict {
        if score >= self.threshold {
            self.consecutive_failures = 0;
            return LivenessVerdict::Pass;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures > self.max_consecutive_failures {
            LivenessVerdict::Failed
        } else {
            LivenessVerdict::Failing
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

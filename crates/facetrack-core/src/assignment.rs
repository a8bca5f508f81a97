//! IoU-gated bipartite assignment of predicted track boxes to detections.
//!
//! Costs are negated IoU so that the Jonker-Volgenant solver (minimizing
//! total cost, O(n³)) maximizes total overlap. Pairs under the IoU gate are
//! rejected after solving and reported as unmatched.

use lapjv::{lapjv, Matrix};
use thiserror::Error;

use crate::geometry::iou;
use crate::types::BoundingBox;

/// Padding cost for the square matrix the solver requires. Any real pair has
/// cost in [-1, 0], so padding is never preferred over a genuine overlap.
const PAD_COST: f32 = 0.0;

#[derive(Error, Debug)]
pub enum AssignmentError {
    #[error("non-finite {side} box at index {index}")]
    NonFinite { side: &'static str, index: usize },
    #[error("assignment solver failed: {0}")]
    Solver(String),
}

fn check_finite(boxes: &[BoundingBox], side: &'static str) -> Result<(), AssignmentError> {
    for (index, b) in boxes.iter().enumerate() {
        let finite =
            b.x.is_finite() && b.y.is_finite() && b.width.is_finite() && b.height.is_finite();
        if !finite {
            return Err(AssignmentError::NonFinite { side, index });
        }
    }
    Ok(())
}

/// Outcome of one association round.
#[derive(Debug, Clone, Default)]
pub struct Assignment {
    /// Matched (track index, detection index) pairs, sorted by track index
    /// then detection index.
    pub matches: Vec<(usize, usize)>,
    pub unmatched_tracks: Vec<usize>,
    pub unmatched_detections: Vec<usize>,
}

/// Solve the one-to-one pairing between predicted track boxes and new
/// detections, keeping only pairs with `IoU >= iou_threshold`.
///
/// Empty inputs short-circuit: no tracks leaves every detection unmatched
/// and vice versa.
pub fn assign(
    track_boxes: &[BoundingBox],
    detection_boxes: &[BoundingBox],
    iou_threshold: f32,
) -> Result<Assignment, AssignmentError> {
    check_finite(track_boxes, "track")?;
    check_finite(detection_boxes, "detection")?;

    let n = track_boxes.len();
    let m = detection_boxes.len();

    if n == 0 || m == 0 {
        return Ok(Assignment {
            matches: Vec::new(),
            unmatched_tracks: (0..n).collect(),
            unmatched_detections: (0..m).collect(),
        });
    }

    // Square matrix: rows are tracks, columns are detections, padded with a
    // neutral cost so the solver accepts rectangular problems.
    let dims = n.max(m);
    let costs = Matrix::from_shape_fn((dims, dims), |(row, col)| {
        if row < n && col < m {
            -iou(&track_boxes[row], &detection_boxes[col])
        } else {
            PAD_COST
        }
    });

    let (row_assignment, _) = lapjv(&costs).map_err(|e| AssignmentError::Solver(format!("{e:?}")))?;

    let mut matches = Vec::new();
    let mut matched_dets = vec![false; m];

    for (track_idx, &det_idx) in row_assignment.iter().enumerate().take(n) {
        if det_idx >= m {
            continue; // assigned to a padding column
        }
        if iou(&track_boxes[track_idx], &detection_boxes[det_idx]) < iou_threshold {
            continue; // gate: overlap too weak to be the same face
        }
        matches.push((track_idx, det_idx));
        matched_dets[det_idx] = true;
    }

    // Row order already yields lowest-track-index-first; sort keeps the
    // tie-break contract explicit.
    matches.sort_unstable();

    let matched_tracks: Vec<bool> = {
        let mut v = vec![false; n];
        for &(t, _) in &matches {
            v[t] = true;
        }
        v
    };

    Ok(Assignment {
        unmatched_tracks: (0..n).filter(|&i| !matched_tracks[i]).collect(),
        unmatched_detections: (0..m).filter(|&j| !matched_dets[j]).collect(),
        matches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn bx(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox::new(x, y, w, h)
    }

    #[test]
    fn test_empty_tracks_all_detections_unmatched() {
        let dets = vec![bx(0.0, 0.0, 10.0, 10.0), bx(20.0, 20.0, 10.0, 10.0)];
        let a = assign(&[], &dets, 0.3).unwrap();
        assert!(a.matches.is_empty());
        assert!(a.unmatched_tracks.is_empty());
        assert_eq!(a.unmatched_detections, vec![0, 1]);
    }

    #[test]
    fn test_empty_detections_all_tracks_unmatched() {
        let tracks = vec![bx(0.0, 0.0, 10.0, 10.0)];
        let a = assign(&tracks, &[], 0.3).unwrap();
        assert!(a.matches.is_empty());
        assert_eq!(a.unmatched_tracks, vec![0]);
        assert!(a.unmatched_detections.is_empty());
    }

    #[test]
    fn test_direct_overlap_matches() {
        let tracks = vec![bx(0.0, 0.0, 50.0, 50.0), bx(100.0, 100.0, 50.0, 50.0)];
        let dets = vec![bx(101.0, 101.0, 50.0, 50.0), bx(1.0, 1.0, 50.0, 50.0)];
        let a = assign(&tracks, &dets, 0.3).unwrap();
        assert_eq!(a.matches, vec![(0, 1), (1, 0)]);
        assert!(a.unmatched_tracks.is_empty());
        assert!(a.unmatched_detections.is_empty());
    }

    #[test]
    fn test_iou_gate_rejects_weak_pairs() {
        // Overlap exists but IoU is far below the gate.
        let tracks = vec![bx(0.0, 0.0, 100.0, 100.0)];
        let dets = vec![bx(95.0, 95.0, 100.0, 100.0)];
        let a = assign(&tracks, &dets, 0.3).unwrap();
        assert!(a.matches.is_empty());
        assert_eq!(a.unmatched_tracks, vec![0]);
        assert_eq!(a.unmatched_detections, vec![0]);
    }

    #[test]
    fn test_more_detections_than_tracks() {
        let tracks = vec![bx(0.0, 0.0, 50.0, 50.0)];
        let dets = vec![
            bx(200.0, 200.0, 50.0, 50.0),
            bx(2.0, 2.0, 50.0, 50.0),
            bx(400.0, 0.0, 50.0, 50.0),
        ];
        let a = assign(&tracks, &dets, 0.3).unwrap();
        assert_eq!(a.matches, vec![(0, 1)]);
        assert_eq!(a.unmatched_detections, vec![0, 2]);
    }

    #[test]
    fn test_assignment_is_one_to_one() {
        // Two tracks both overlap the same detection; only one may take it.
        let tracks = vec![bx(0.0, 0.0, 50.0, 50.0), bx(5.0, 5.0, 50.0, 50.0)];
        let dets = vec![bx(2.0, 2.0, 50.0, 50.0)];
        let a = assign(&tracks, &dets, 0.3).unwrap();
        assert_eq!(a.matches.len(), 1);
        assert_eq!(a.unmatched_tracks.len(), 1);
    }

    /// Brute-force optimum over all one-to-one pairings of an n×m IoU matrix
    /// (no gate): maximum total IoU achievable.
    fn brute_force_best(tracks: &[BoundingBox], dets: &[BoundingBox]) -> f32 {
        fn rec(
            tracks: &[BoundingBox],
            dets: &[BoundingBox],
            track_idx: usize,
            used: &mut Vec<bool>,
        ) -> f32 {
            if track_idx == tracks.len() {
                return 0.0;
            }
            // Option: leave this track unmatched.
            let mut best = rec(tracks, dets, track_idx + 1, used);
            for j in 0..dets.len() {
                if !used[j] {
                    used[j] = true;
                    let total =
                        iou(&tracks[track_idx], &dets[j]) + rec(tracks, dets, track_idx + 1, used);
                    used[j] = false;
                    best = best.max(total);
                }
            }
            best
        }
        rec(tracks, dets, 0, &mut vec![false; dets.len()])
    }

    #[test]
    fn test_solver_matches_brute_force_on_small_random_problems() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let n = rng.gen_range(1..=5);
            let m = rng.gen_range(1..=5);
            let gen_box = |rng: &mut StdRng| {
                bx(
                    rng.gen_range(0.0..100.0),
                    rng.gen_range(0.0..100.0),
                    rng.gen_range(10.0..60.0),
                    rng.gen_range(10.0..60.0),
                )
            };
            let tracks: Vec<_> = (0..n).map(|_| gen_box(&mut rng)).collect();
            let dets: Vec<_> = (0..m).map(|_| gen_box(&mut rng)).collect();

            // Gate 0.0 keeps every solver pair, making totals comparable.
            let a = assign(&tracks, &dets, 0.0).unwrap();

            // Valid one-to-one pairing.
            let mut seen_t = vec![false; n];
            let mut seen_d = vec![false; m];
            for &(t, d) in &a.matches {
                assert!(!seen_t[t] && !seen_d[d], "index reused");
                seen_t[t] = true;
                seen_d[d] = true;
            }

            let total: f32 = a
                .matches
                .iter()
                .map(|&(t, d)| iou(&tracks[t], &dets[d]))
                .sum();
            let best = brute_force_best(&tracks, &dets);
            assert!(
                total >= best - 1e-4,
                "solver total {total} below brute-force optimum {best}"
            );
        }
    }

    #[test]
    fn test_non_finite_box_rejected() {
        let tracks = vec![bx(f32::NAN, 0.0, 10.0, 10.0)];
        let dets = vec![bx(0.0, 0.0, 10.0, 10.0)];
        let result = assign(&tracks, &dets, 0.3);
        assert!(matches!(result, Err(AssignmentError::NonFinite { .. })));
    }
}

//! facetrack-core — multi-face tracking engine.
//!
//! Associates per-frame face detections into temporal tracks using a
//! constant-velocity Kalman filter, IoU-gated Jonker-Volgenant assignment
//! and an anti-spoof liveness gate. Identity resolution against the gallery
//! lives in `facetrack-index`; this crate is purely synchronous and does no
//! I/O.

pub mod assignment;
pub mod geometry;
pub mod kalman;
pub mod spoof;
pub mod track;
pub mod tracker;
pub mod types;

pub use track::{ResolvedIdentity, Track, TrackId, TrackState};
pub use tracker::{TrackManager, TrackSnapshot, TrackerConfig};
pub use types::{BoundingBox, Detection, Embedding, SpoofSignals};

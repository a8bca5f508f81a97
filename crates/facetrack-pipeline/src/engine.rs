//! Frame-loop engine: tracking, identity resolution and maintenance.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use facetrack_core::{Detection, ResolvedIdentity, TrackManager, TrackSnapshot};
use facetrack_index::{FaceMatcher, MatcherError};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("matcher error: {0}")]
    Matcher(#[from] MatcherError),
}

/// Owns the track manager and shares the matcher.
///
/// `update_tracks` must be called from a single frame loop; the matcher may
/// additionally be queried concurrently from other callers (registration
/// flows, one-off lookups) via `matcher()`.
pub struct Engine {
    tracker: TrackManager,
    matcher: Arc<FaceMatcher>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Option<JoinHandle<()>>,
    sweep_interval: Duration,
}

impl Engine {
    pub fn new(config: &Config) -> Result<Self, EngineError> {
        let matcher = Arc::new(FaceMatcher::open(config.matcher_config())?);
        let tracker = TrackManager::new(config.tracker_config());
        let (shutdown_tx, _) = watch::channel(false);
        info!(
            backend = ?config.backend,
            dim = config.dim,
            data_dir = ?config.data_dir,
            "engine initialized"
        );
        Ok(Self {
            tracker,
            matcher,
            shutdown_tx,
            sweeper: None,
            sweep_interval: Duration::from_secs(config.cache_sweep_secs.max(1)),
        })
    }

    pub fn matcher(&self) -> Arc<FaceMatcher> {
        Arc::clone(&self.matcher)
    }

    /// Run one frame cycle: update the track set against this frame's
    /// detections, then resolve identities for confirmed, live tracks that
    /// do not have one yet. Returns the post-resolution snapshot.
    ///
    /// A resolution failure for one track never aborts the others; the
    /// track simply stays unresolved and is retried next frame.
    pub fn update_tracks(&mut self, detections: &[Detection]) -> Vec<TrackSnapshot> {
        let _ = self.tracker.update(detections);

        for (track_id, embedding) in self.tracker.resolution_candidates() {
            let hits = self.matcher.find(&embedding.values, 1);
            let Some(best) = hits.first() else {
                continue;
            };
            debug!(
                track = %track_id,
                person_id = %best.person_id,
                confidence = best.confidence,
                "track identity resolved"
            );
            self.tracker.set_identity(
                track_id,
                ResolvedIdentity {
                    face_id: best.encoding_id.clone(),
                    person_id: best.person_id.clone(),
                    confidence: best.confidence,
                },
            );
        }

        self.tracker.snapshot()
    }

    /// Spawn the periodic cache sweep task. Must be called from within a
    /// tokio runtime. Idempotent.
    pub fn start_maintenance(&mut self) {
        if self.sweeper.is_some() {
            return;
        }
        let matcher = Arc::clone(&self.matcher);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = self.sweep_interval;
        self.sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = matcher.sweep_cache();
                        if removed > 0 {
                            debug!(removed, "cache sweep");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("cache sweep task exiting");
        }));
    }

    /// Stop background tasks, flush a final checkpoint and join the
    /// checkpoint writer.
    pub async fn shutdown(&mut self) {
        if self.shutdown_tx.send(true).is_err() && self.sweeper.is_some() {
            warn!("sweep task already detached");
        }
        if let Some(handle) = self.sweeper.take() {
            let _ = handle.await;
        }
        self.matcher.shutdown();
        info!("engine shut down");
    }
}

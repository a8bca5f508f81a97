use std::path::PathBuf;
use std::time::Duration;

use facetrack_core::TrackerConfig;
use facetrack_index::backend::{BackendConfig, BackendKind};
use facetrack_index::MatcherConfig;

/// Pipeline configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Persistence directory; `None` keeps the gallery memory-only.
    pub data_dir: Option<PathBuf>,
    /// Similarity backend strategy.
    pub backend: BackendKind,
    /// Embedding dimensionality.
    pub dim: usize,
    /// Minimum confidence for a match to be reported.
    pub min_confidence: f32,
    /// Weight match confidence by stored capture quality.
    pub quality_weighting: bool,
    /// Gallery size cap.
    pub max_entries: usize,
    /// Checkpoint after this many inserts.
    pub checkpoint_interval: u64,
    /// Result cache TTL in seconds.
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    /// Interval between background cache sweeps, in seconds.
    pub cache_sweep_secs: u64,
    /// Frames a track may coast unmatched before removal.
    pub max_age: u32,
    /// Observations before a track is confirmed.
    pub min_hits: u32,
    /// IoU gate for track/detection association.
    pub iou_threshold: f32,
    /// Liveness threshold below which a frame counts as a spoof failure.
    pub spoof_threshold: f32,
    /// Consecutive spoof failures tolerated before a track is invalidated.
    pub max_spoof_failures: u32,
}

impl Config {
    /// Load configuration from `FACETRACK_*` environment variables with
    /// defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("FACETRACK_DATA_DIR")
            .map(PathBuf::from)
            .ok()
            .or_else(|| {
                let home = std::env::var("HOME").ok()?;
                Some(PathBuf::from(home).join(".local/share/facetrack"))
            });

        let backend = std::env::var("FACETRACK_BACKEND")
            .ok()
            .and_then(|v| parse_backend(&v))
            .unwrap_or(BackendKind::Flat);

        Self {
            data_dir,
            backend,
            dim: env_usize("FACETRACK_EMBEDDING_DIM", 512),
            min_confidence: env_f32("FACETRACK_MIN_CONFIDENCE", 0.6),
            quality_weighting: std::env::var("FACETRACK_QUALITY_WEIGHTING")
                .map(|v| v != "0")
                .unwrap_or(false),
            max_entries: env_usize("FACETRACK_MAX_ENTRIES", 10_000),
            checkpoint_interval: env_u64("FACETRACK_CHECKPOINT_INTERVAL", 32),
            cache_ttl_secs: env_u64("FACETRACK_CACHE_TTL_SECS", 30),
            cache_max_entries: env_usize("FACETRACK_CACHE_MAX_ENTRIES", 256),
            cache_sweep_secs: env_u64("FACETRACK_CACHE_SWEEP_SECS", 10),
            max_age: env_u32("FACETRACK_MAX_AGE", 30),
            min_hits: env_u32("FACETRACK_MIN_HITS", 3),
            iou_threshold: env_f32("FACETRACK_IOU_THRESHOLD", 0.3),
            spoof_threshold: env_f32("FACETRACK_SPOOF_THRESHOLD", 0.8),
            max_spoof_failures: env_u32("FACETRACK_MAX_SPOOF_FAILURES", 5),
        }
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            dim: self.dim,
            backend: BackendConfig {
                kind: self.backend,
                ..BackendConfig::default()
            },
            min_confidence: self.min_confidence,
            quality_weighting: self.quality_weighting,
            max_entries: self.max_entries,
            checkpoint_interval: self.checkpoint_interval,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            cache_max_entries: self.cache_max_entries,
            data_dir: self.data_dir.clone(),
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            max_age: self.max_age,
            min_hits: self.min_hits,
            iou_threshold: self.iou_threshold,
            spoof_threshold: self.spoof_threshold,
            max_spoof_failures: self.max_spoof_failures,
            ..TrackerConfig::default()
        }
    }
}

fn parse_backend(value: &str) -> Option<BackendKind> {
    match value.to_ascii_lowercase().as_str() {
        "flat" => Some(BackendKind::Flat),
        "ivf" => Some(BackendKind::Ivf),
        "hnsw" => Some(BackendKind::Hnsw),
        _ => None,
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend() {
        assert_eq!(parse_backend("flat"), Some(BackendKind::Flat));
        assert_eq!(parse_backend("HNSW"), Some(BackendKind::Hnsw));
        assert_eq!(parse_backend("ivf"), Some(BackendKind::Ivf));
        assert_eq!(parse_backend("faiss"), None);
    }

    #[test]
    fn test_config_mapping() {
        let mut config = Config::from_env();
        config.backend = BackendKind::Hnsw;
        config.dim = 128;
        config.max_age = 12;

        let matcher = config.matcher_config();
        assert_eq!(matcher.backend.kind, BackendKind::Hnsw);
        assert_eq!(matcher.dim, 128);

        let tracker = config.tracker_config();
        assert_eq!(tracker.max_age, 12);
    }
}

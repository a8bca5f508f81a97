use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key that every gallery entry must carry: the stable identity
/// used for de-duplicating results across multiple embeddings of one person.
pub const PERSON_ID_KEY: &str = "person_id";

/// One stored gallery embedding with its identity metadata.
///
/// The embedding itself lives in the matcher's parallel matrix, L2-normalized
/// at insertion so inner product equals cosine similarity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Unique encoding id, stable across sessions.
    pub face_id: String,
    pub person_id: String,
    /// Capture quality in [0, 1], used for optional quality weighting.
    pub quality_score: f32,
    pub metadata: HashMap<String, String>,
    pub added_at: DateTime<Utc>,
}

/// Ranked result of a gallery query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub person_id: String,
    /// Confidence in [0, 1], derived from the backend distance.
    pub confidence: f32,
    /// The matched `face_id`.
    pub encoding_id: String,
    pub quality_score: f32,
    pub metadata: HashMap<String, String>,
    /// Query latency.
    pub match_time: Duration,
    /// Raw backend distance (inner-product similarity in [-1, 1]).
    pub match_distance: Option<f32>,
}

//! Pluggable nearest-neighbor backends over the embedding matrix.
//!
//! Backends differ only in recall/latency; ordering rules and the
//! distance→confidence mapping are part of the trait contract, so callers
//! are unaffected by the strategy chosen at construction.

mod flat;
mod hnsw;
mod ivf;

use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

pub use flat::FlatBackend;
pub use hnsw::{HnswBackend, HnswParams};
pub use ivf::{IvfBackend, IvfParams};

use crate::error::MatcherError;
use crate::store::StoreError;

/// Closed set of backend strategies, selected once at construction. A
/// running index never swaps strategy except via a full rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Exact brute-force inner product, O(N) per query, always correct.
    Flat,
    /// Inverted-file index: approximate once trained, exact before.
    Ivf,
    /// Hierarchical small-world graph, approximate.
    Hnsw,
}

impl BackendKind {
    /// Stable on-disk tag for the index blob header.
    pub fn tag(&self) -> u8 {
        match self {
            BackendKind::Flat => 0,
            BackendKind::Ivf => 1,
            BackendKind::Hnsw => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(BackendKind::Flat),
            1 => Some(BackendKind::Ivf),
            2 => Some(BackendKind::Hnsw),
            _ => None,
        }
    }
}

/// Backend selection plus per-strategy tuning parameters.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub ivf: IvfParams,
    pub hnsw: HnswParams,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Flat,
            ivf: IvfParams::default(),
            hnsw: HnswParams::default(),
        }
    }
}

/// One nearest-neighbor hit: ordinal into the parallel arrays plus the raw
/// backend distance (inner-product similarity, higher is closer).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub ordinal: usize,
    pub distance: f32,
}

/// Nearest-neighbor index over unit-normalized embeddings.
///
/// Vectors are identified by insertion ordinal; `rebuild` renumbers them to
/// match the matrix passed in. Search results are sorted descending by
/// distance with ordinal as the tie-break, deterministic for a fixed
/// snapshot and query.
pub trait SimilarityBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one unit-normalized vector; its ordinal is the current `len`.
    fn add(&mut self, vector: ArrayView1<'_, f32>) -> Result<(), MatcherError>;

    /// Top-`k` neighbors of a unit-normalized query.
    fn search(&self, query: ArrayView1<'_, f32>, k: usize) -> Vec<Neighbor>;

    /// Drop all state and re-index the given matrix (row ordinal = id).
    fn rebuild(&mut self, vectors: ArrayView2<'_, f32>) -> Result<(), MatcherError>;

    /// Serialize backend-specific state (graph/cluster structure). Vectors
    /// themselves are persisted separately and passed back on `load_blob`.
    fn to_blob(&self) -> Vec<u8>;

    /// Restore from a blob produced by `to_blob`, with the matching vectors.
    fn load_blob(
        &mut self,
        blob: &[u8],
        vectors: ArrayView2<'_, f32>,
    ) -> Result<(), StoreError>;

    /// Map a raw backend distance to a confidence in [0, 1]. A property of
    /// the backend metric: the inner-product backends here use `(d + 1) / 2`.
    fn confidence(&self, distance: f32) -> f32 {
        ((distance + 1.0) / 2.0).clamp(0.0, 1.0)
    }
}

/// Construct the backend named by the config for `dim`-dimensional vectors.
pub fn create_backend(config: &BackendConfig, dim: usize) -> Box<dyn SimilarityBackend> {
    match config.kind {
        BackendKind::Flat => Box::new(FlatBackend::new(dim)),
        BackendKind::Ivf => Box::new(IvfBackend::new(dim, config.ivf)),
        BackendKind::Hnsw => Box::new(HnswBackend::new(dim, config.hnsw)),
    }
}

/// Sort neighbors by descending distance, ordinal ascending on ties, and
/// truncate to `k`. Shared by every backend so ordering semantics cannot
/// drift between strategies.
pub(crate) fn finalize_neighbors(mut neighbors: Vec<Neighbor>, k: usize) -> Vec<Neighbor> {
    neighbors.sort_by(|a, b| {
        b.distance
            .partial_cmp(&a.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.ordinal.cmp(&b.ordinal))
    });
    neighbors.truncate(k);
    neighbors
}

//! Hierarchical navigable small-world graph backend.
//!
//! Layered proximity graph with geometric level sampling and best-first
//! search, tuned by `ef_search`. The RNG is seeded so that re-indexing the
//! same vectors yields the same graph.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::ivf::BlobReader;
use super::{finalize_neighbors, BackendKind, Neighbor, SimilarityBackend};
use crate::error::MatcherError;
use crate::store::StoreError;

const RNG_SEED: u64 = 0x5eed_face;

#[derive(Debug, Clone, Copy)]
pub struct HnswParams {
    /// Max connections per node above layer 0 (layer 0 allows 2·m).
    pub m: usize,
    /// Beam width while building.
    pub ef_construction: usize,
    /// Beam width while querying.
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 100,
            ef_search: 64,
        }
    }
}

/// Graph node: adjacency per layer, vector lives in the parallel matrix.
#[derive(Debug, Clone)]
struct Node {
    neighbors: Vec<Vec<u32>>,
}

impl Node {
    fn level(&self) -> usize {
        self.neighbors.len() - 1
    }
}

/// Search candidate ordered by similarity, ordinal breaking ties so heap
/// traversal stays deterministic.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    ordinal: u32,
    sim: f32,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sim
            .partial_cmp(&other.sim)
            .unwrap_or(Ordering::Equal)
            .then(other.ordinal.cmp(&self.ordinal))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct HnswBackend {
    dim: usize,
    params: HnswParams,
    level_mult: f32,
    vectors: Array2<f32>,
    nodes: Vec<Node>,
    entry: Option<u32>,
    rng: StdRng,
}

impl HnswBackend {
    pub fn new(dim: usize, params: HnswParams) -> Self {
        let level_mult = 1.0 / (params.m.max(2) as f32).ln();
        Self {
            dim,
            params,
            level_mult,
            vectors: Array2::zeros((0, dim)),
            nodes: Vec::new(),
            entry: None,
            rng: StdRng::seed_from_u64(RNG_SEED),
        }
    }

    fn sim(&self, ordinal: u32, query: ArrayView1<'_, f32>) -> f32 {
        self.vectors.row(ordinal as usize).dot(&query)
    }

    fn random_level(&mut self) -> usize {
        let r: f32 = self.rng.gen_range(f32::EPSILON..1.0);
        (-r.ln() * self.level_mult) as usize
    }

    fn max_level(&self) -> usize {
        self.entry
            .map(|e| self.nodes[e as usize].level())
            .unwrap_or(0)
    }

    /// Best-first expansion within one layer, returning up to `ef`
    /// candidates sorted descending by similarity.
    fn search_layer(
        &self,
        query: ArrayView1<'_, f32>,
        entry: u32,
        ef: usize,
        layer: usize,
    ) -> Vec<Candidate> {
        let start = Candidate {
            ordinal: entry,
            sim: self.sim(entry, query),
        };

        let mut visited: HashSet<u32> = HashSet::from([entry]);
        let mut frontier = BinaryHeap::from([start]);
        // Results as a min-heap so the worst kept candidate is on top.
        let mut results: BinaryHeap<std::cmp::Reverse<Candidate>> =
            BinaryHeap::from([std::cmp::Reverse(start)]);

        while let Some(current) = frontier.pop() {
            let worst = results.peek().map(|r| r.0.sim).unwrap_or(f32::NEG_INFINITY);
            if results.len() >= ef && current.sim < worst {
                break;
            }

            for &next in &self.nodes[current.ordinal as usize].neighbors[layer] {
                if !visited.insert(next) {
                    continue;
                }
                let candidate = Candidate {
                    ordinal: next,
                    sim: self.sim(next, query),
                };
                let worst = results.peek().map(|r| r.0.sim).unwrap_or(f32::NEG_INFINITY);
                if results.len() < ef || candidate.sim > worst {
                    frontier.push(candidate);
                    results.push(std::cmp::Reverse(candidate));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Candidate> = results.into_iter().map(|r| r.0).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    /// Greedy single-step descent used on the upper layers.
    fn greedy_entry(&self, query: ArrayView1<'_, f32>, mut entry: u32, layer: usize) -> u32 {
        loop {
            let mut best = entry;
            let mut best_sim = self.sim(entry, query);
            for &next in &self.nodes[entry as usize].neighbors[layer] {
                let s = self.sim(next, query);
                if s > best_sim || (s == best_sim && next < best) {
                    best = next;
                    best_sim = s;
                }
            }
            if best == entry {
                return entry;
            }
            entry = best;
        }
    }

    fn max_degree(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    /// Keep a node's neighbor list within the degree bound, preferring the
    /// most similar neighbors.
    fn prune(&mut self, ordinal: u32, layer: usize) {
        let limit = self.max_degree(layer);
        if self.nodes[ordinal as usize].neighbors[layer].len() <= limit {
            return;
        }
        let anchor = self.vectors.row(ordinal as usize).to_owned();
        let mut scored: Vec<Candidate> = self.nodes[ordinal as usize].neighbors[layer]
            .iter()
            .map(|&n| Candidate {
                ordinal: n,
                sim: self.sim(n, anchor.view()),
            })
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.truncate(limit);
        self.nodes[ordinal as usize].neighbors[layer] =
            scored.into_iter().map(|c| c.ordinal).collect();
    }

    fn insert(&mut self, ordinal: u32) {
        let level = self.random_level();
        let node = Node {
            neighbors: vec![Vec::new(); level + 1],
        };

        let Some(mut entry) = self.entry else {
            self.nodes.push(node);
            self.entry = Some(ordinal);
            return;
        };

        let top = self.max_level();
        self.nodes.push(node);
        let query = self.vectors.row(ordinal as usize).to_owned();

        // Descend through layers above the new node's level.
        for layer in ((level + 1)..=top).rev() {
            entry = self.greedy_entry(query.view(), entry, layer);
        }

        // Connect within each shared layer.
        for layer in (0..=level.min(top)).rev() {
            let found = self.search_layer(query.view(), entry, self.params.ef_construction, layer);
            entry = found[0].ordinal;

            let chosen: Vec<u32> = found
                .iter()
                .take(self.max_degree(layer))
                .map(|c| c.ordinal)
                .collect();
            for &n in &chosen {
                self.nodes[ordinal as usize].neighbors[layer].push(n);
                self.nodes[n as usize].neighbors[layer].push(ordinal);
                self.prune(n, layer);
            }
        }

        if level > top {
            self.entry = Some(ordinal);
        }
    }
}

impl SimilarityBackend for HnswBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Hnsw
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn add(&mut self, vector: ArrayView1<'_, f32>) -> Result<(), MatcherError> {
        self.vectors
            .push_row(vector)
            .map_err(|e| MatcherError::Capacity(format!("hnsw append: {e}")))?;
        let ordinal = (self.vectors.nrows() - 1) as u32;
        self.insert(ordinal);
        Ok(())
    }

    fn search(&self, query: ArrayView1<'_, f32>, k: usize) -> Vec<Neighbor> {
        let Some(mut entry) = self.entry else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        for layer in (1..=self.max_level()).rev() {
            entry = self.greedy_entry(query, entry, layer);
        }

        let ef = self.params.ef_search.max(k);
        let found = self.search_layer(query, entry, ef, 0);
        let neighbors = found
            .into_iter()
            .map(|c| Neighbor {
                ordinal: c.ordinal as usize,
                distance: c.sim,
            })
            .collect();
        finalize_neighbors(neighbors, k)
    }

    fn rebuild(&mut self, vectors: ArrayView2<'_, f32>) -> Result<(), MatcherError> {
        self.vectors = vectors.to_owned();
        self.nodes.clear();
        self.entry = None;
        self.rng = StdRng::seed_from_u64(RNG_SEED);
        for ordinal in 0..self.vectors.nrows() {
            self.insert(ordinal as u32);
        }
        Ok(())
    }

    fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.entry.map(|e| e + 1).unwrap_or(0).to_le_bytes());
        for node in &self.nodes {
            out.extend_from_slice(&(node.neighbors.len() as u32).to_le_bytes());
            for layer in &node.neighbors {
                out.extend_from_slice(&(layer.len() as u32).to_le_bytes());
                for &n in layer {
                    out.extend_from_slice(&n.to_le_bytes());
                }
            }
        }
        out
    }

    fn load_blob(
        &mut self,
        blob: &[u8],
        vectors: ArrayView2<'_, f32>,
    ) -> Result<(), StoreError> {
        let mut reader = BlobReader::new(blob);
        let count = reader.u32()? as usize;
        if count != vectors.nrows() {
            return Err(StoreError::Inconsistent(format!(
                "hnsw blob has {count} nodes, embeddings file has {}",
                vectors.nrows()
            )));
        }

        let entry_raw = reader.u32()?;
        let entry = if entry_raw == 0 {
            None
        } else {
            Some(entry_raw - 1)
        };

        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            let layers = reader.u32()? as usize;
            if layers == 0 {
                return Err(StoreError::Format("hnsw node without layers".into()));
            }
            let mut neighbors = Vec::with_capacity(layers);
            for _ in 0..layers {
                let len = reader.u32()? as usize;
                let mut layer = Vec::with_capacity(len);
                for _ in 0..len {
                    let n = reader.u32()?;
                    if n as usize >= count {
                        return Err(StoreError::Inconsistent(format!(
                            "hnsw edge to {n} beyond {count} nodes"
                        )));
                    }
                    layer.push(n);
                }
                neighbors.push(layer);
            }
            nodes.push(Node { neighbors });
        }

        if let Some(e) = entry {
            if e as usize >= count {
                return Err(StoreError::Inconsistent(format!(
                    "hnsw entry point {e} beyond {count} nodes"
                )));
            }
        }

        self.vectors = vectors.to_owned();
        self.nodes = nodes;
        self.entry = entry;
        Ok(())
    }
}

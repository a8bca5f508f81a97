//! Inverted-file backend: spherical k-means coarse quantizer plus per-list
//! candidate scan.
//!
//! Until `train_threshold` vectors are present the index answers queries
//! with an exact scan; training runs exactly once, after which new vectors
//! are routed to their nearest list and queries probe the `nprobe` closest
//! lists.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use super::{finalize_neighbors, BackendKind, Neighbor, SimilarityBackend};
use crate::error::MatcherError;
use crate::store::StoreError;

const KMEANS_ITERS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct IvfParams {
    /// Number of clusters (inverted lists).
    pub nlist: usize,
    /// Lists probed per query.
    pub nprobe: usize,
    /// Vector count at which the quantizer is trained.
    pub train_threshold: usize,
}

impl Default for IvfParams {
    fn default() -> Self {
        Self {
            nlist: 16,
            nprobe: 4,
            train_threshold: 64,
        }
    }
}

pub struct IvfBackend {
    dim: usize,
    params: IvfParams,
    vectors: Array2<f32>,
    centroids: Option<Array2<f32>>,
    lists: Vec<Vec<u32>>,
}

impl IvfBackend {
    pub fn new(dim: usize, params: IvfParams) -> Self {
        Self {
            dim,
            params,
            vectors: Array2::zeros((0, dim)),
            centroids: None,
            lists: Vec::new(),
        }
    }

    pub fn is_trained(&self) -> bool {
        self.centroids.is_some()
    }

    fn nearest_centroid(centroids: &Array2<f32>, vector: ArrayView1<'_, f32>) -> usize {
        let scores = centroids.dot(&vector);
        let mut best = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (i, &s) in scores.iter().enumerate() {
            if s > best_score {
                best_score = s;
                best = i;
            }
        }
        best
    }

    /// Spherical k-means with deterministic evenly-spaced seeding.
    fn train(&mut self) {
        let n = self.vectors.nrows();
        let nlist = self.params.nlist.min(n).max(1);

        let mut centroids = Array2::zeros((nlist, self.dim));
        for (i, mut row) in centroids.axis_iter_mut(Axis(0)).enumerate() {
            row.assign(&self.vectors.row(i * n / nlist));
        }

        let mut assignments = vec![0usize; n];
        for _ in 0..KMEANS_ITERS {
            for (v, slot) in assignments.iter_mut().enumerate() {
                *slot = Self::nearest_centroid(&centroids, self.vectors.row(v));
            }

            let mut sums = Array2::<f32>::zeros((nlist, self.dim));
            let mut counts = vec![0usize; nlist];
            for (v, &c) in assignments.iter().enumerate() {
                let mut row = sums.row_mut(c);
                row += &self.vectors.row(v);
                counts[c] += 1;
            }

            for (c, count) in counts.iter().enumerate() {
                if *count == 0 {
                    continue; // empty cluster keeps its previous centroid
                }
                let mut row = sums.row_mut(c);
                let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    row /= norm;
                }
                centroids.row_mut(c).assign(&row);
            }
        }

        let mut lists = vec![Vec::new(); nlist];
        for (v, &c) in assignments.iter().enumerate() {
            lists[c].push(v as u32);
        }

        tracing::info!(vectors = n, nlist, "ivf quantizer trained");
        self.centroids = Some(centroids);
        self.lists = lists;
    }

    fn score_candidates(
        &self,
        query: ArrayView1<'_, f32>,
        candidates: impl Iterator<Item = usize>,
        k: usize,
    ) -> Vec<Neighbor> {
        let neighbors = candidates
            .map(|ordinal| Neighbor {
                ordinal,
                distance: self.vectors.row(ordinal).dot(&query),
            })
            .collect();
        finalize_neighbors(neighbors, k)
    }
}

impl SimilarityBackend for IvfBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ivf
    }

    fn len(&self) -> usize {
        self.vectors.nrows()
    }

    fn add(&mut self, vector: ArrayView1<'_, f32>) -> Result<(), MatcherError> {
        self.vectors
            .push_row(vector)
            .map_err(|e| MatcherError::Capacity(format!("ivf append: {e}")))?;

        let ordinal = (self.vectors.nrows() - 1) as u32;
        if let Some(centroids) = &self.centroids {
            let list = Self::nearest_centroid(centroids, self.vectors.row(ordinal as usize));
            self.lists[list].push(ordinal);
        } else if self.vectors.nrows() >= self.params.train_threshold {
            self.train();
        }
        Ok(())
    }

    fn search(&self, query: ArrayView1<'_, f32>, k: usize) -> Vec<Neighbor> {
        if self.vectors.nrows() == 0 || k == 0 {
            return Vec::new();
        }

        let Some(centroids) = &self.centroids else {
            // Untrained: exact scan, identical semantics to the flat backend.
            return self.score_candidates(query, 0..self.vectors.nrows(), k);
        };

        let centroid_scores: Array1<f32> = centroids.dot(&query);
        let mut order: Vec<usize> = (0..centroids.nrows()).collect();
        order.sort_by(|&a, &b| {
            centroid_scores[b]
                .partial_cmp(&centroid_scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });

        let nprobe = self.params.nprobe.min(order.len());
        let candidates = order[..nprobe]
            .iter()
            .flat_map(|&c| self.lists[c].iter().map(|&v| v as usize))
            .collect::<Vec<_>>();
        self.score_candidates(query, candidates.into_iter(), k)
    }

    fn rebuild(&mut self, vectors: ArrayView2<'_, f32>) -> Result<(), MatcherError> {
        self.vectors = vectors.to_owned();
        self.centroids = None;
        self.lists.clear();
        if self.vectors.nrows() >= self.params.train_threshold {
            self.train();
        }
        Ok(())
    }

    fn to_blob(&self) -> Vec<u8> {
        let Some(centroids) = &self.centroids else {
            return Vec::new();
        };

        let mut out = Vec::new();
        out.extend_from_slice(&(centroids.nrows() as u32).to_le_bytes());
        out.extend_from_slice(&(self.dim as u32).to_le_bytes());
        for &v in centroids.iter() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for list in &self.lists {
            out.extend_from_slice(&(list.len() as u32).to_le_bytes());
            for &ordinal in list {
                out.extend_from_slice(&ordinal.to_le_bytes());
            }
        }
        out
    }

    fn load_blob(
        &mut self,
        blob: &[u8],
        vectors: ArrayView2<'_, f32>,
    ) -> Result<(), StoreError> {
        self.vectors = vectors.to_owned();
        self.centroids = None;
        self.lists.clear();

        if blob.is_empty() {
            // Persisted untrained; retrain now if the gallery since crossed
            // the threshold.
            if self.vectors.nrows() >= self.params.train_threshold {
                self.train();
            }
            return Ok(());
        }

        let mut reader = BlobReader::new(blob);
        let nlist = reader.u32()? as usize;
        let dim = reader.u32()? as usize;
        if dim != self.dim {
            return Err(StoreError::Inconsistent(format!(
                "ivf blob dim {dim} does not match configured dim {}",
                self.dim
            )));
        }

        let mut centroids = Array2::zeros((nlist, dim));
        for mut row in centroids.axis_iter_mut(Axis(0)) {
            for slot in row.iter_mut() {
                *slot = reader.f32()?;
            }
        }

        let n = self.vectors.nrows();
        let mut lists = Vec::with_capacity(nlist);
        let mut total = 0usize;
        for _ in 0..nlist {
            let len = reader.u32()? as usize;
            let mut list = Vec::with_capacity(len);
            for _ in 0..len {
                let ordinal = reader.u32()?;
                if ordinal as usize >= n {
                    return Err(StoreError::Inconsistent(format!(
                        "ivf blob references ordinal {ordinal} beyond {n} vectors"
                    )));
                }
                list.push(ordinal);
            }
            total += list.len();
            lists.push(list);
        }
        if total != n {
            return Err(StoreError::Inconsistent(format!(
                "ivf blob assigns {total} vectors, embeddings file has {n}"
            )));
        }

        self.centroids = Some(centroids);
        self.lists = lists;
        Ok(())
    }
}

/// Cursor over a little-endian blob.
pub(crate) struct BlobReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], StoreError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(StoreError::Format("truncated blob".into()));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u32(&mut self) -> Result<u32, StoreError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f32(&mut self) -> Result<f32, StoreError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_unit(rng: &mut StdRng, dim: usize) -> Vec<f32> {
        let mut v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut v {
            *x /= norm;
        }
        v
    }

    #[test]
    fn test_untrained_matches_exact_scan() {
        let params = IvfParams {
            train_threshold: 1000,
            ..IvfParams::default()
        };
        let mut backend = IvfBackend::new(2, params);
        backend.add(array![1.0f32, 0.0].view()).unwrap();
        backend.add(array![0.0f32, 1.0].view()).unwrap();
        assert!(!backend.is_trained());

        let hits = backend.search(array![0.0f32, 1.0].view(), 1);
        assert_eq!(hits[0].ordinal, 1);
    }

    #[test]
    fn test_trains_at_threshold_and_keeps_recall_on_clusters() {
        let params = IvfParams {
            nlist: 4,
            nprobe: 2,
            train_threshold: 40,
        };
        let mut backend = IvfBackend::new(4, params);

        // Four tight clusters around the axes.
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..60 {
            let axis = i % 4;
            let mut v = vec![0.0f32; 4];
            v[axis] = 1.0;
            for x in &mut v {
                *x += rng.gen_range(-0.05..0.05);
            }
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            for x in &mut v {
                *x /= norm;
            }
            backend.add(ArrayView1::from(v.as_slice())).unwrap();
        }
        assert!(backend.is_trained());

        // Query near axis 2 must find an axis-2 vector (ordinals ≡ 2 mod 4).
        let hits = backend.search(array![0.0f32, 0.0, 1.0, 0.0].view(), 1);
        assert_eq!(hits[0].ordinal % 4, 2);
        assert!(hits[0].distance > 0.9);
    }

    #[test]
    fn test_blob_roundtrip() {
        let params = IvfParams {
            nlist: 4,
            nprobe: 4,
            train_threshold: 16,
        };
        let mut rng = StdRng::seed_from_u64(11);
        let mut backend = IvfBackend::new(8, params);
        let mut rows = Vec::new();
        for _ in 0..32 {
            let v = random_unit(&mut rng, 8);
            backend.add(ArrayView1::from(v.as_slice())).unwrap();
            rows.extend_from_slice(&v);
        }
        let vectors = Array2::from_shape_vec((32, 8), rows).unwrap();

        let blob = backend.to_blob();
        assert!(!blob.is_empty());

        let mut restored = IvfBackend::new(8, params);
        restored.load_blob(&blob, vectors.view()).unwrap();
        assert!(restored.is_trained());

        let query = random_unit(&mut rng, 8);
        let q = ArrayView1::from(query.as_slice());
        assert_eq!(backend.search(q, 5), restored.search(q, 5));
    }

    #[test]
    fn test_corrupt_blob_rejected() {
        let mut backend = IvfBackend::new(4, IvfParams::default());
        let vectors = Array2::<f32>::zeros((0, 4));
        let result = backend.load_blob(&[1, 2, 3], vectors.view());
        assert!(result.is_err());
    }
}

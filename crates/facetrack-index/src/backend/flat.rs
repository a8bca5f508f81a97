//! Exact brute-force backend: full inner-product scan per query.

use ndarray::{Array2, ArrayView1, ArrayView2};

use super::{finalize_neighbors, BackendKind, Neighbor, SimilarityBackend};
use crate::error::MatcherError;
use crate::store::StoreError;

/// Always-correct reference backend. O(N·dim) per query, which is fine for
/// galleries up to a few tens of thousands of identities.
pub struct FlatBackend {
    dim: usize,
    vectors: Array2<f32>,
}

impl FlatBackend {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: Array2::zeros((0, dim)),
        }
    }
}

impl SimilarityBackend for FlatBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Flat
    }

    fn len(&self) -> usize {
        self.vectors.nrows()
    }

    fn add(&mut self, vector: ArrayView1<'_, f32>) -> Result<(), MatcherError> {
        self.vectors
            .push_row(vector)
            .map_err(|e| MatcherError::Capacity(format!("flat append: {e}")))?;
        Ok(())
    }

    fn search(&self, query: ArrayView1<'_, f32>, k: usize) -> Vec<Neighbor> {
        if self.vectors.nrows() == 0 || k == 0 {
            return Vec::new();
        }
        let scores = self.vectors.dot(&query);
        let neighbors = scores
            .iter()
            .enumerate()
            .map(|(ordinal, &distance)| Neighbor { ordinal, distance })
            .collect();
        finalize_neighbors(neighbors, k)
    }

    fn rebuild(&mut self, vectors: ArrayView2<'_, f32>) -> Result<(), MatcherError> {
        self.vectors = vectors.to_owned();
        Ok(())
    }

    fn to_blob(&self) -> Vec<u8> {
        // The flat scan has no structure beyond the vectors themselves,
        // which are persisted in the embeddings file.
        Vec::new()
    }

    fn load_blob(
        &mut self,
        _blob: &[u8],
        vectors: ArrayView2<'_, f32>,
    ) -> Result<(), StoreError> {
        if vectors.ncols() != self.dim && vectors.nrows() > 0 {
            return Err(StoreError::Inconsistent(format!(
                "flat backend expects dim {}, embeddings have {}",
                self.dim,
                vectors.ncols()
            )));
        }
        self.vectors = vectors.to_owned();
        Ok(())
    }
}

// src/core/index/search.rs
use ndarray::{Array1, Array2};

use crate::core::features::keypoint::DESCRIPTOR_DIM;

/// Exact nearest-neighbor search over the employee embedding matrix.
/// This is the accelerator seam: an approximate backend can replace the
/// brute-force scan without touching callers, which only see row indices
/// and L2 distances.
#[derive(Debug, Clone)]
pub struct VectorSearch {
    vectors: Array2<f32>,
}

impl VectorSearch {
    pub fn new() -> Self {
        Self {
            vectors: Array2::zeros((0, DESCRIPTOR_DIM)),
        }
    }

    pub fn from_rows(rows: &[Array1<f32>]) -> Self {
        let mut vectors = Array2::zeros((rows.len(), DESCRIPTOR_DIM));
        for (i, row) in rows.iter().enumerate() {
            vectors.row_mut(i).assign(row);
        }
        Self { vectors }
    }

    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when an approximate accelerator backs the search.
    pub fn accelerated(&self) -> bool {
        false
    }

    /// Top-k row indices by ascending L2 distance to the query.
    pub fn top_k(&self, query: &Array1<f32>, k: usize) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = (0..self.vectors.nrows())
            .map(|i| {
                let row = self.vectors.row(i);
                let mut dist = 0.0f32;
                for (a, b) in row.iter().zip(query.iter()) {
                    let d = a - b;
                    dist += d * d;
                }
                (i, dist.sqrt())
            })
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }
}

impl Default for VectorSearch {
    fn default() -> Self {
        Self::new()
    }
}

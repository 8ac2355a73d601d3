// src/core/index/employee.rs
use ndarray::{Array1, Array2};

use crate::core::features::keypoint::{FeatureSet, DESCRIPTOR_DIM};

/// One enrolled employee: 1-4 loaded feature sets plus the mean-pooled,
/// unit-norm embedding over every descriptor of every set. The embedding
/// exists to shortlist candidates; accept decisions never rest on it.
#[derive(Debug, Clone)]
pub struct EmployeeRecord {
    pub employee_id: i64,
    pub feature_sets: Vec<FeatureSet>,
    pub embedding: Array1<f32>,
}

impl EmployeeRecord {
    pub fn template_count(&self) -> usize {
        self.feature_sets.len()
    }
}

/// Column-wise mean over the stacked descriptor matrices, L2-normalized.
/// `None` when there are no descriptors or the mean degenerates to zero.
pub fn mean_embedding(descriptor_sets: &[&Array2<f32>]) -> Option<Array1<f32>> {
    let total_rows: usize = descriptor_sets.iter().map(|d| d.nrows()).sum();
    if total_rows == 0 {
        return None;
    }

    let mut sum = Array1::<f32>::zeros(DESCRIPTOR_DIM);
    for set in descriptor_sets {
        if set.ncols() != DESCRIPTOR_DIM {
            return None;
        }
        for row in set.rows() {
            sum += &row;
        }
    }
    let mut mean = sum / total_rows as f32;
    let norm = mean.dot(&mean).sqrt();
    if !norm.is_finite() || norm < f32::EPSILON {
        return None;
    }
    mean /= norm;
    Some(mean)
}

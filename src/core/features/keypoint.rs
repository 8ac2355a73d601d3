// src/core/features/keypoint.rs
use ndarray::Array2;
use serde::{Deserialize, Serialize};

pub const DESCRIPTOR_DIM: usize = 128;

/// Minimum usable keypoint count for a feature set.
pub const MIN_FEATURES: usize = 10;

/// A salient 2D location with the full attribute set required to
/// round-trip through template serialization without information loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub size: f32,
    pub angle: f32,
    pub response: f32,
    pub octave: i32,
    pub class_id: i32,
}

/// Which enhancement pipeline produced the features behind a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancementMethod {
    Professional,
    Basic,
    Unknown,
}

impl EnhancementMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnhancementMethod::Professional => "professional",
            EnhancementMethod::Basic => "basic",
            EnhancementMethod::Unknown => "unknown",
        }
    }
}

/// Extracted (or template-loaded) features for one fingerprint sample.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    /// N x 128 descriptor matrix.
    pub descriptors: Array2<f32>,
    pub keypoint_count: usize,
    pub quality_ok: bool,
    pub quality_warn: bool,
    /// True when loaded from a stored template rather than freshly extracted.
    pub is_precomputed: bool,
    /// (height, width) of the region of interest the features came from.
    pub roi_shape: (u32, u32),
    pub method: EnhancementMethod,
}

impl FeatureSet {
    pub fn assemble(
        keypoints: Vec<Keypoint>,
        descriptors: Array2<f32>,
        method: EnhancementMethod,
        roi_shape: (u32, u32),
        is_precomputed: bool,
        quality_ok_at: u32,
        quality_warn_at: u32,
    ) -> Self {
        let keypoint_count = keypoints.len();
        Self {
            keypoints,
            descriptors,
            keypoint_count,
            quality_ok: keypoint_count >= quality_ok_at as usize,
            quality_warn: keypoint_count >= quality_warn_at as usize,
            is_precomputed,
            roi_shape,
            method,
        }
    }

    /// A set is usable iff it has enough keypoints and a well-formed
    /// descriptor matrix.
    pub fn is_usable(&self) -> bool {
        self.keypoint_count >= MIN_FEATURES
            && self.descriptors.nrows() >= MIN_FEATURES
            && self.descriptors.ncols() == DESCRIPTOR_DIM
    }
}

// src/api/types.rs
use serde::{Deserialize, Serialize};

use crate::core::matcher::MatchVerdict;

#[derive(Debug, Deserialize)]
pub struct ExtractTemplateRequest {
    pub image_b64: String,
}

#[derive(Debug, Deserialize)]
pub struct TestTemplateRequest {
    pub image_b64: String,
}

#[derive(Debug, Deserialize)]
pub struct MatchImageRequest {
    pub image_1_b64: String,
    pub image_2_b64: String,
    pub threshold_override: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct MatchTemplatesRequest {
    pub probe_image_b64: String,
    pub templates_b64: Vec<String>,
    pub threshold_override: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct IdentifyRequest {
    pub probe_image_b64: String,
    pub max_candidates: Option<usize>,
    pub threshold_override: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SiftParamsView {
    pub nfeatures: usize,
    pub contrast_threshold: f32,
    pub edge_threshold: f32,
    pub sigma: f32,
}

/// Effective matching parameters, exposed for runtime inspection.
#[derive(Debug, Serialize)]
pub struct ParamsResponse {
    pub fp_ratio: f32,
    pub fp_min_base: u32,
    pub fp_min_percent: f64,
    pub fp_conf_min: f64,
    pub fp_conf_high: f64,
    pub fp_min_keypoints: u32,
    pub fp_min_keypoints_warn: u32,
    pub fp_high_conf_kp: u32,
    pub fp_margin_base: u32,
    pub fp_margin_percent: f64,
    pub fp_abs_min_score: u32,
    pub fp_single_template_margin_min: u32,
    pub fp_single_template_margin_ratio: f64,
    pub fp_abs_min_precomputed: u32,
    pub fp_precomputed_slack: u32,
    pub fp_precomputed_margin: u32,
    pub fp_max_workers: usize,
    pub fp_top_k: usize,
    pub fp_force_basic: bool,
    pub threshold_for_1000_kp: u32,
    pub enhancer_available: bool,
    pub sift_params: SiftParamsView,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub enhancer_available: bool,
    pub params: ParamsResponse,
}

#[derive(Debug, Serialize)]
pub struct ExtractTemplateResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_json: Option<String>,
    pub keypoints_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roi_shape: Option<(u32, u32)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhancement_method: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TestTemplateResponse {
    pub is_precomputed: bool,
    pub deserialized: bool,
    pub keypoints_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Codec-level failure detail when deserialization fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct MatchImageResponse {
    pub success: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<MatchVerdict>,
}

#[derive(Debug, Serialize)]
pub struct SyncEmployeeResponse {
    pub success: bool,
    pub total_employees: usize,
}

#[derive(Debug, Serialize)]
pub struct ReloadIndexResponse {
    pub status: &'static str,
    pub employee_count: usize,
    pub faiss_available: bool,
}

/// Body-level failures mirror the upstream service contract: a single
/// `detail` string.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub detail: String,
}

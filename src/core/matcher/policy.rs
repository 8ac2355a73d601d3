// src/core/matcher/policy.rs
//! Converts a raw descriptor score into an accept/reject decision with a
//! structured reason. Strict mode (1:N identification) applies every gate
//! at full strength; non-strict mode (verification against a stored
//! template) relaxes the floors for precomputed templates.

use serde::Serialize;

use crate::core::features::keypoint::{FeatureSet, MIN_FEATURES};
use crate::core::matcher::score::ratio_test_score;
use crate::utils::config::MatchingConfig;

pub const REASON_MATCH: &str = "match";

#[derive(Debug, Clone, Serialize)]
pub struct MatchVerdict {
    pub accepted: bool,
    pub score: u32,
    pub threshold: u32,
    pub required_score: u32,
    pub confidence: f64,
    pub required_confidence: f64,
    pub probe_keypoints: usize,
    pub template_keypoints: usize,
    pub quality_ok: bool,
    pub quality_warn: bool,
    pub is_precomputed: bool,
    pub reason: String,
}

impl MatchVerdict {
    fn rejection(reason: &str, probe: &FeatureSet, template: &FeatureSet) -> Self {
        Self {
            accepted: false,
            score: 0,
            threshold: 0,
            required_score: 0,
            confidence: 0.0,
            required_confidence: 0.0,
            probe_keypoints: probe.keypoint_count,
            template_keypoints: template.keypoint_count,
            quality_ok: probe.quality_ok,
            quality_warn: probe.quality_warn,
            is_precomputed: template.is_precomputed,
            reason: reason.to_string(),
        }
    }
}

pub struct Matcher {
    config: MatchingConfig,
}

impl Matcher {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Base acceptance threshold for a pair with `min_kp` usable keypoints.
    pub fn threshold_for(&self, min_kp: u32) -> u32 {
        let scaled = (min_kp as f64 * self.config.fp_min_percent).floor() as u32;
        self.config.fp_min_base.max(scaled)
    }

    /// Extra matches demanded on top of the threshold.
    pub fn margin_for(&self, threshold: u32) -> u32 {
        let scaled = (threshold as f64 * self.config.fp_margin_percent).round() as u32;
        self.config.fp_margin_base.max(scaled)
    }

    pub fn compare(
        &self,
        probe: &FeatureSet,
        template: &FeatureSet,
        threshold_override: Option<u32>,
        strict: bool,
    ) -> MatchVerdict {
        // Structural gates: without descriptors there is nothing to score.
        if probe.descriptors.nrows() == 0 {
            return MatchVerdict::rejection("missing_descriptors", probe, template);
        }
        if template.descriptors.nrows() == 0 {
            return MatchVerdict::rejection("missing_descriptors", probe, template);
        }
        if probe.descriptors.nrows() < MIN_FEATURES || template.descriptors.nrows() < MIN_FEATURES
        {
            return MatchVerdict::rejection("insufficient_descriptors", probe, template);
        }
        if !probe.quality_warn {
            return MatchVerdict::rejection("probe_low_quality", probe, template);
        }
        if !template.quality_warn {
            return MatchVerdict::rejection("template_low_quality", probe, template);
        }

        let score = ratio_test_score(
            &probe.descriptors,
            &template.descriptors,
            self.config.fp_ratio,
        );

        let min_kp = probe.keypoint_count.min(template.keypoint_count) as u32;
        let threshold = threshold_override.unwrap_or_else(|| self.threshold_for(min_kp));
        let margin = self.margin_for(threshold);
        let required_score = threshold + margin;
        let confidence = (score as f64 / threshold.max(1) as f64 * 100.0).min(100.0);
        let required_confidence = if min_kp >= self.config.fp_high_conf_kp {
            self.config.fp_conf_high
        } else {
            self.config.fp_conf_min
        };

        let lenient = !strict && template.is_precomputed;
        let reason = if lenient {
            let abs_floor = self
                .config
                .fp_abs_min_precomputed
                .max((self.config.fp_abs_min_score as f64 * 0.85).floor() as u32);
            let lenient_threshold = threshold.saturating_sub(self.config.fp_precomputed_slack);
            if score < abs_floor {
                Some("score_below_abs_min")
            } else if score < lenient_threshold {
                Some("score_below_threshold")
            } else if score < lenient_threshold + self.config.fp_precomputed_margin {
                Some("insufficient_margin")
            } else if confidence < required_confidence {
                Some("confidence_low")
            } else {
                None
            }
        } else {
            if score < self.config.fp_abs_min_score {
                Some("score_below_abs_min")
            } else if score < threshold {
                Some("score_below_threshold")
            } else if score < required_score {
                Some("insufficient_margin")
            } else if confidence < required_confidence {
                Some("confidence_low")
            } else {
                None
            }
        };

        MatchVerdict {
            accepted: reason.is_none(),
            score,
            threshold,
            required_score,
            confidence,
            required_confidence,
            probe_keypoints: probe.keypoint_count,
            template_keypoints: template.keypoint_count,
            quality_ok: probe.quality_ok,
            quality_warn: probe.quality_warn,
            is_precomputed: template.is_precomputed,
            reason: reason.unwrap_or(REASON_MATCH).to_string(),
        }
    }
}

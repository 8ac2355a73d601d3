// src/core/identify.rs
//! 1:N identification: embedding shortlist, strict per-template matching
//! over every shortlisted employee, then layered anti-false-positive
//! gates. The embedding only filters; every accept decision comes from
//! descriptor-level matching.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use uuid::Uuid;

use crate::core::index::mean_embedding;
use crate::core::matcher::MatchVerdict;
use crate::core::MatchEngine;
use crate::utils::error::{EngineError, Result};

pub const REASON_MATCH_FOUND: &str = "match_found";

/// Fraction of the winning score that sibling templates must reach for
/// the multi-template consistency gate.
const CONSISTENCY_FRACTION: f64 = 0.6;
const CONSISTENCY_MIN_SUPPORTING: usize = 2;

#[derive(Debug, Clone, Serialize)]
pub struct CandidateReport {
    pub employee_id: i64,
    pub best_score: u32,
    pub best_confidence: f64,
    pub embedding_distance: f32,
    pub accepted: bool,
    pub templates_evaluated: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentificationOutcome {
    pub matched: bool,
    pub employee_id: Option<i64>,
    pub best_score: u32,
    pub best_confidence: f64,
    pub decision_reason: String,
    pub candidates: Vec<CandidateReport>,
    pub probe_keypoints: usize,
    pub elapsed_ms: u128,
}

impl IdentificationOutcome {
    fn rejected(reason: &str, probe_keypoints: usize, started: Instant) -> Self {
        Self {
            matched: false,
            employee_id: None,
            best_score: 0,
            best_confidence: 0.0,
            decision_reason: reason.to_string(),
            candidates: Vec::new(),
            probe_keypoints,
            elapsed_ms: started.elapsed().as_millis(),
        }
    }
}

struct CandidateEvaluation {
    position: usize,
    employee_id: i64,
    embedding_distance: f32,
    template_count: usize,
    verdicts: Vec<MatchVerdict>,
}

impl CandidateEvaluation {
    fn best(&self) -> Option<&MatchVerdict> {
        self.verdicts.iter().max_by(|a, b| {
            (a.score, a.accepted)
                .cmp(&(b.score, b.accepted))
        })
    }

    fn best_score(&self) -> u32 {
        self.best().map(|v| v.score).unwrap_or(0)
    }
}

impl MatchEngine {
    /// Identify the employee behind a probe image, if any.
    pub async fn identify(
        self: &Arc<Self>,
        probe_b64: &str,
        max_candidates: Option<usize>,
        threshold_override: Option<u32>,
    ) -> Result<IdentificationOutcome> {
        if !self.index.is_ready() {
            return Err(EngineError::IndexNotReady);
        }
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let snapshot = self.index.snapshot();

        if snapshot.is_empty() {
            return Ok(IdentificationOutcome::rejected(
                "no_candidates_found",
                0,
                started,
            ));
        }

        // Identification always forces the professional enhancement path:
        // enrolled templates were produced with it, and mixing pipelines
        // collapses scores.
        let engine = Arc::clone(self);
        let probe_input = probe_b64.to_string();
        let probe = tokio::task::spawn_blocking(move || {
            engine.pipeline().extract_image(&probe_input, true)
        })
        .await
        .unwrap_or(Err("decode_failed"));

        let probe = match probe {
            Ok(p) => Arc::new(p),
            Err(reason) => {
                self.request_log
                    .append(&format!("[IDENTIFY {}] probe rejected: {}", request_id, reason));
                return Ok(IdentificationOutcome::rejected(reason, 0, started));
            }
        };

        if !probe.quality_warn {
            self.request_log.append(&format!(
                "[IDENTIFY {}] probe below quality floor ({} keypoints)",
                request_id, probe.keypoint_count
            ));
            return Ok(IdentificationOutcome::rejected(
                "probe_low_quality",
                probe.keypoint_count,
                started,
            ));
        }

        let embedding = match mean_embedding(&[&probe.descriptors]) {
            Some(e) => e,
            None => {
                return Ok(IdentificationOutcome::rejected(
                    "missing_descriptors",
                    probe.keypoint_count,
                    started,
                ));
            }
        };

        let top_k = max_candidates.unwrap_or(self.config.service.fp_top_k).max(1);
        let shortlist = snapshot.top_k(&embedding, top_k);
        if shortlist.is_empty() {
            return Ok(IdentificationOutcome::rejected(
                "no_candidates_found",
                probe.keypoint_count,
                started,
            ));
        }

        // Every template of every shortlisted employee, strict mode, on
        // the worker pool.
        let mut tasks: FuturesUnordered<
            tokio::task::JoinHandle<Option<(usize, usize, MatchVerdict)>>,
        > = FuturesUnordered::new();
        for (list_pos, (record_pos, _)) in shortlist.iter().enumerate() {
            let record_pos = *record_pos;
            let template_count = snapshot
                .record(record_pos)
                .map(|r| r.template_count())
                .unwrap_or(0);
            for template_idx in 0..template_count {
                let engine = Arc::clone(self);
                let probe = Arc::clone(&probe);
                let snapshot = Arc::clone(&snapshot);
                tasks.push(tokio::spawn(async move {
                    let permit = engine.workers().clone().acquire_owned().await.ok()?;
                    let verdict = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        let record = snapshot.record(record_pos)?;
                        let template = record.feature_sets.get(template_idx)?;
                        Some(engine.matcher().compare(
                            &probe,
                            template,
                            threshold_override,
                            true,
                        ))
                    })
                    .await
                    .ok()??;
                    Some((list_pos, template_idx, verdict))
                }));
            }
        }

        let mut evaluations: Vec<CandidateEvaluation> = shortlist
            .iter()
            .enumerate()
            .map(|(list_pos, (record_pos, dist))| {
                let record = snapshot.record(*record_pos);
                CandidateEvaluation {
                    position: list_pos,
                    employee_id: record.map(|r| r.employee_id).unwrap_or(-1),
                    embedding_distance: *dist,
                    template_count: record.map(|r| r.template_count()).unwrap_or(0),
                    verdicts: Vec::new(),
                }
            })
            .collect();

        while let Some(joined) = tasks.next().await {
            if let Ok(Some((list_pos, _, verdict))) = joined {
                evaluations[list_pos].verdicts.push(verdict);
            }
        }

        let outcome = self.decide_identification(&evaluations, snapshot.len(), &probe, started);
        self.request_log.append(&format!(
            "[IDENTIFY {}] candidates={} matched={} employee={:?} score={} reason={}",
            request_id,
            outcome.candidates.len(),
            outcome.matched,
            outcome.employee_id,
            outcome.best_score,
            outcome.decision_reason
        ));
        Ok(outcome)
    }

    fn decide_identification(
        &self,
        evaluations: &[CandidateEvaluation],
        population: usize,
        probe: &crate::core::features::keypoint::FeatureSet,
        started: Instant,
    ) -> IdentificationOutcome {
        let mut candidates: Vec<CandidateReport> = evaluations
            .iter()
            .map(|e| CandidateReport {
                employee_id: e.employee_id,
                best_score: e.best_score(),
                best_confidence: e.best().map(|v| v.confidence).unwrap_or(0.0),
                embedding_distance: e.embedding_distance,
                accepted: e.best().map(|v| v.accepted).unwrap_or(false),
                templates_evaluated: e.verdicts.len(),
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.best_score
                .cmp(&a.best_score)
                .then(a.employee_id.cmp(&b.employee_id))
        });

        let winner = evaluations
            .iter()
            .filter(|e| !e.verdicts.is_empty())
            .max_by(|a, b| {
                (a.best_score(), std::cmp::Reverse(a.position))
                    .cmp(&(b.best_score(), std::cmp::Reverse(b.position)))
            });
        let winner_best = match winner.and_then(|w| w.best().map(|v| (w, v))) {
            Some(pair) => pair,
            None => {
                let mut out = IdentificationOutcome::rejected(
                    "no_valid_results",
                    probe.keypoint_count,
                    started,
                );
                out.candidates = candidates;
                return out;
            }
        };
        let (winner, winner_best) = winner_best;
        let best_score = winner_best.score;
        let abs_floor = self.config.matching.fp_abs_min_score.max(45);

        let mut outcome = IdentificationOutcome {
            matched: false,
            employee_id: Some(winner.employee_id),
            best_score,
            best_confidence: winner_best.confidence,
            decision_reason: String::new(),
            candidates,
            probe_keypoints: probe.keypoint_count,
            elapsed_ms: 0,
        };

        if !winner_best.accepted {
            outcome.employee_id = None;
            outcome.decision_reason = if best_score < abs_floor {
                format!("score_too_low_{}_{}", best_score, abs_floor)
            } else {
                winner_best.reason.clone()
            };
            outcome.elapsed_ms = started.elapsed().as_millis();
            return outcome;
        }

        // Margin of victory against every other shortlisted employee.
        // Flat priors in small populations demand wider separation.
        let second_best = evaluations
            .iter()
            .filter(|e| e.position != winner.position)
            .map(|e| e.best_score())
            .max()
            .unwrap_or(0);
        let min_margin = if population <= 4 {
            10
        } else if population <= 10 {
            12
        } else {
            15
        };
        let margin = best_score.saturating_sub(second_best);
        if margin < min_margin {
            outcome.employee_id = None;
            outcome.decision_reason = format!("ambiguous_match_margin_{}_{}", margin, min_margin);
            outcome.elapsed_ms = started.elapsed().as_millis();
            return outcome;
        }

        if best_score < abs_floor {
            outcome.employee_id = None;
            outcome.decision_reason = format!("score_too_low_{}_{}", best_score, abs_floor);
            outcome.elapsed_ms = started.elapsed().as_millis();
            return outcome;
        }

        // With three or more stored samples, one lone template agreeing is
        // suspicious no matter how strongly it agrees.
        if winner.template_count >= 3 {
            let supporting = winner
                .verdicts
                .iter()
                .filter(|v| v.score as f64 >= CONSISTENCY_FRACTION * best_score as f64)
                .count();
            if supporting < CONSISTENCY_MIN_SUPPORTING {
                outcome.employee_id = None;
                outcome.decision_reason = format!(
                    "inconsistent_templates_{}/{}",
                    supporting, winner.template_count
                );
                outcome.elapsed_ms = started.elapsed().as_millis();
                return outcome;
            }
        }

        outcome.matched = true;
        outcome.decision_reason = REASON_MATCH_FOUND.to_string();
        outcome.elapsed_ms = started.elapsed().as_millis();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::keypoint::{
        EnhancementMethod, FeatureSet, Keypoint, DESCRIPTOR_DIM,
    };
    use crate::utils::config::Config;
    use crate::utils::logging::RequestLog;
    use ndarray::Array2;

    fn engine() -> Arc<MatchEngine> {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(RequestLog::open(dir.path().join("logs.txt")));
        Arc::new(MatchEngine::new(Arc::new(Config::default()), log))
    }

    fn probe_set() -> FeatureSet {
        let keypoints = vec![
            Keypoint {
                x: 1.0,
                y: 1.0,
                size: 2.0,
                angle: 0.0,
                response: 0.4,
                octave: 0,
                class_id: -1
            };
            300
        ];
        FeatureSet::assemble(
            keypoints,
            Array2::zeros((300, DESCRIPTOR_DIM)),
            EnhancementMethod::Professional,
            (200, 200),
            false,
            200,
            160,
        )
    }

    fn verdict(score: u32, accepted: bool) -> MatchVerdict {
        MatchVerdict {
            accepted,
            score,
            threshold: 45,
            required_score: 50,
            confidence: (score as f64 / 45.0 * 100.0).min(100.0),
            required_confidence: 65.0,
            probe_keypoints: 300,
            template_keypoints: 300,
            quality_ok: true,
            quality_warn: true,
            is_precomputed: true,
            reason: if accepted {
                "match".into()
            } else {
                "score_below_threshold".into()
            },
        }
    }

    fn evaluation(
        position: usize,
        employee_id: i64,
        scores: &[(u32, bool)],
        template_count: usize,
    ) -> CandidateEvaluation {
        CandidateEvaluation {
            position,
            employee_id,
            embedding_distance: 0.1 * (position as f32 + 1.0),
            template_count,
            verdicts: scores.iter().map(|(s, a)| verdict(*s, *a)).collect(),
        }
    }

    #[test]
    fn clear_winner_is_matched() {
        let e = engine();
        let evals = vec![
            evaluation(0, 1, &[(95, true), (80, true), (70, true), (64, true)], 4),
            evaluation(1, 2, &[(20, false)], 1),
            evaluation(2, 3, &[(15, false)], 1),
        ];
        let out = e.decide_identification(&evals, 3, &probe_set(), Instant::now());
        assert!(out.matched);
        assert_eq!(out.employee_id, Some(1));
        assert_eq!(out.decision_reason, "match_found");
        assert_eq!(out.best_score, 95);
    }

    #[test]
    fn identical_scores_are_ambiguous() {
        let e = engine();
        let evals = vec![
            evaluation(0, 1, &[(80, true)], 1),
            evaluation(1, 2, &[(80, true)], 1),
            evaluation(2, 3, &[(80, true)], 1),
        ];
        let out = e.decide_identification(&evals, 3, &probe_set(), Instant::now());
        assert!(!out.matched);
        assert!(
            out.decision_reason.starts_with("ambiguous_match_margin_"),
            "got {}",
            out.decision_reason
        );
        assert_eq!(out.decision_reason, "ambiguous_match_margin_0_10");
    }

    #[test]
    fn margin_requirement_grows_with_population() {
        let e = engine();
        let evals = vec![
            evaluation(0, 1, &[(80, true)], 1),
            evaluation(1, 2, &[(69, false)], 1),
        ];
        // Margin 11 passes at population <= 4, fails at <= 10.
        let small = e.decide_identification(&evals, 4, &probe_set(), Instant::now());
        assert!(small.matched);
        let medium = e.decide_identification(&evals, 8, &probe_set(), Instant::now());
        assert!(!medium.matched);
        assert_eq!(medium.decision_reason, "ambiguous_match_margin_11_12");
        let large = e.decide_identification(&evals, 50, &probe_set(), Instant::now());
        assert_eq!(large.decision_reason, "ambiguous_match_margin_11_15");
    }

    #[test]
    fn low_winner_score_is_reported_as_too_low() {
        let e = engine();
        let evals = vec![
            evaluation(0, 1, &[(30, false)], 1),
            evaluation(1, 2, &[(10, false)], 1),
        ];
        let out = e.decide_identification(&evals, 2, &probe_set(), Instant::now());
        assert!(!out.matched);
        assert_eq!(out.decision_reason, "score_too_low_30_45");
        assert!(out.employee_id.is_none());
    }

    #[test]
    fn inconsistent_templates_are_rejected() {
        let e = engine();
        // Four templates, only the first agrees with the probe.
        let evals = vec![
            evaluation(0, 1, &[(90, true), (20, false), (18, false), (11, false)], 4),
            evaluation(1, 2, &[(12, false)], 1),
        ];
        let out = e.decide_identification(&evals, 2, &probe_set(), Instant::now());
        assert!(!out.matched);
        assert_eq!(out.decision_reason, "inconsistent_templates_1/4");
    }

    #[test]
    fn no_verdicts_at_all_is_no_valid_results() {
        let e = engine();
        let evals = vec![evaluation(0, 1, &[], 1)];
        let out = e.decide_identification(&evals, 1, &probe_set(), Instant::now());
        assert!(!out.matched);
        assert_eq!(out.decision_reason, "no_valid_results");
    }

    #[test]
    fn candidates_are_reported_in_score_order() {
        let e = engine();
        let evals = vec![
            evaluation(0, 5, &[(40, false)], 1),
            evaluation(1, 9, &[(75, true)], 1),
            evaluation(2, 2, &[(55, false)], 1),
        ];
        let out = e.decide_identification(&evals, 3, &probe_set(), Instant::now());
        let ids: Vec<i64> = out.candidates.iter().map(|c| c.employee_id).collect();
        assert_eq!(ids, vec![9, 2, 5]);
    }
}

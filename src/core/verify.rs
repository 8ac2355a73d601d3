// src/core/verify.rs
//! Multi-template verification: "does this probe belong to this employee,
//! given their stored templates?" Per-template matching runs on the
//! blocking worker pool in true parallel; results are gathered as they
//! complete and reassembled into input order. With three or more
//! templates a very confident early result cancels the stragglers; with
//! exactly two both results are required for the secondary-support check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use uuid::Uuid;

use crate::core::matcher::{MatchVerdict, REASON_MATCH};
use crate::core::MatchEngine;

/// Score tiers for the secondary-support gates.
const VERY_STRONG_SCORE: u32 = 70;
const MODERATE_SCORE: u32 = 60;
const SECONDARY_FLOOR: u32 = 45;
const SECONDARY_STRONG_FRACTION: f64 = 0.85;
const SECONDARY_MODERATE_FRACTION: f64 = 0.80;
const SECONDARY_PRECOMPUTED_SLACK: u32 = 2;
/// Primary margin over required score when the best template was freshly
/// extracted rather than precomputed.
const PRIMARY_MARGIN_FRESH: u32 = 5;
/// Extra confidence above the high bar that triggers early exit.
const EARLY_EXIT_CONF_BONUS: f64 = 15.0;

#[derive(Debug, Clone, Serialize)]
pub struct TemplateResult {
    pub index: usize,
    pub evaluated: bool,
    pub reason: String,
    pub verdict: Option<MatchVerdict>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationTimings {
    pub extract_ms: u128,
    pub match_ms: u128,
    pub total_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationOutcome {
    pub matched: bool,
    pub decision_reason: String,
    pub best_index: Option<usize>,
    pub best: Option<MatchVerdict>,
    pub results: Vec<TemplateResult>,
    pub templates_evaluated: usize,
    pub timings: VerificationTimings,
}

enum WorkerOutcome {
    Verdict(Box<MatchVerdict>),
    Failed(&'static str),
    Cancelled,
}

impl MatchEngine {
    pub async fn verify_templates(
        self: &Arc<Self>,
        probe_b64: &str,
        templates: &[String],
        threshold_override: Option<u32>,
    ) -> VerificationOutcome {
        let request_id = Uuid::new_v4();
        let started = Instant::now();

        // Fresh probe extraction honors the global enhancement flag here;
        // only identification forces the professional path.
        let engine = Arc::clone(self);
        let probe_input = probe_b64.to_string();
        let probe = tokio::task::spawn_blocking(move || {
            engine.pipeline().extract_image(&probe_input, false)
        })
        .await
        .unwrap_or(Err("decode_failed"));
        let extract_ms = started.elapsed().as_millis();

        let probe = match probe {
            Ok(p) => Arc::new(p),
            Err(reason) => {
                self.request_log.append(&format!(
                    "[VERIFY {}] probe rejected: {}",
                    request_id, reason
                ));
                return Self::unevaluated_outcome(reason, templates, extract_ms, started);
            }
        };

        let eligible: Vec<(usize, String)> = templates
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.trim().is_empty())
            .map(|(i, t)| (i, t.clone()))
            .collect();
        let eligible_total = eligible.len();
        // The early-exit shortcut must never starve the secondary-support
        // check, so it only arms with three or more templates in play.
        let early_exit_armed = eligible_total >= 3;
        let early_exit_conf = self.config.matching.fp_conf_high + EARLY_EXIT_CONF_BONUS;

        let cancel = Arc::new(AtomicBool::new(false));
        let match_started = Instant::now();
        let mut tasks: FuturesUnordered<tokio::task::JoinHandle<(usize, WorkerOutcome)>> =
            FuturesUnordered::new();

        for (index, template) in eligible {
            let engine = Arc::clone(self);
            let probe = Arc::clone(&probe);
            let cancel = Arc::clone(&cancel);
            tasks.push(tokio::spawn(async move {
                let permit = match engine.workers().clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return (index, WorkerOutcome::Cancelled),
                };
                // Cooperative cancellation: checked before work starts,
                // never mid-matching.
                if cancel.load(Ordering::Acquire) {
                    return (index, WorkerOutcome::Cancelled);
                }
                let outcome = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    match engine.pipeline().load_sample(&template, false) {
                        Ok(set) => WorkerOutcome::Verdict(Box::new(engine.matcher().compare(
                            &probe,
                            &set,
                            threshold_override,
                            false,
                        ))),
                        Err(reason) => WorkerOutcome::Failed(reason),
                    }
                })
                .await
                .unwrap_or(WorkerOutcome::Cancelled);
                (index, outcome)
            }));
        }

        let mut slots: Vec<Option<WorkerOutcome>> = Vec::new();
        slots.resize_with(templates.len(), || None);
        while let Some(joined) = tasks.next().await {
            if let Ok((index, outcome)) = joined {
                if early_exit_armed && !cancel.load(Ordering::Acquire) {
                    if let WorkerOutcome::Verdict(v) = &outcome {
                        if v.accepted && v.confidence >= early_exit_conf {
                            cancel.store(true, Ordering::Release);
                        }
                    }
                }
                slots[index] = Some(outcome);
            }
        }
        let match_ms = match_started.elapsed().as_millis();

        // Reassemble into input order.
        let mut results: Vec<TemplateResult> = Vec::with_capacity(templates.len());
        for (index, slot) in slots.into_iter().enumerate() {
            let result = match slot {
                Some(WorkerOutcome::Verdict(v)) => TemplateResult {
                    index,
                    evaluated: true,
                    reason: v.reason.clone(),
                    verdict: Some(*v),
                },
                Some(WorkerOutcome::Failed(reason)) => TemplateResult {
                    index,
                    evaluated: false,
                    reason: reason.to_string(),
                    verdict: None,
                },
                Some(WorkerOutcome::Cancelled) => TemplateResult {
                    index,
                    evaluated: false,
                    reason: "cancelled_early_exit".to_string(),
                    verdict: None,
                },
                None => TemplateResult {
                    index,
                    evaluated: false,
                    reason: "empty_template".to_string(),
                    verdict: None,
                },
            };
            results.push(result);
        }

        let templates_evaluated = results.iter().filter(|r| r.verdict.is_some()).count();
        let (matched, decision_reason, best_index, best) =
            self.decide(&results, eligible_total, templates_evaluated);

        self.request_log.append(&format!(
            "[VERIFY {}] templates={} evaluated={} matched={} reason={}",
            request_id,
            templates.len(),
            templates_evaluated,
            matched,
            decision_reason
        ));

        VerificationOutcome {
            matched,
            decision_reason,
            best_index,
            best,
            results,
            templates_evaluated,
            timings: VerificationTimings {
                extract_ms,
                match_ms,
                total_ms: started.elapsed().as_millis(),
            },
        }
    }

    fn unevaluated_outcome(
        reason: &str,
        templates: &[String],
        extract_ms: u128,
        started: Instant,
    ) -> VerificationOutcome {
        VerificationOutcome {
            matched: false,
            decision_reason: reason.to_string(),
            best_index: None,
            best: None,
            results: templates
                .iter()
                .enumerate()
                .map(|(index, _)| TemplateResult {
                    index,
                    evaluated: false,
                    reason: reason.to_string(),
                    verdict: None,
                })
                .collect(),
            templates_evaluated: 0,
            timings: VerificationTimings {
                extract_ms,
                match_ms: 0,
                total_ms: started.elapsed().as_millis(),
            },
        }
    }

    /// Applies the corroboration rules over the per-template verdicts.
    fn decide(
        &self,
        results: &[TemplateResult],
        available: usize,
        evaluated: usize,
    ) -> (bool, String, Option<usize>, Option<MatchVerdict>) {
        let evaluated_results: Vec<(usize, &MatchVerdict)> = results
            .iter()
            .filter_map(|r| r.verdict.as_ref().map(|v| (r.index, v)))
            .collect();

        if evaluated == 0 {
            return (false, "no_templates_evaluados".to_string(), None, None);
        }

        // Accepted beats unaccepted; ties break on score, then input order.
        let Some((best_index, best)) = evaluated_results
            .iter()
            .max_by(|a, b| {
                (a.1.accepted, a.1.score, std::cmp::Reverse(a.0))
                    .cmp(&(b.1.accepted, b.1.score, std::cmp::Reverse(b.0)))
            })
            .map(|(i, v)| (*i, (*v).clone()))
        else {
            return (false, "no_templates_evaluados".to_string(), None, None);
        };

        if !best.accepted {
            return (
                false,
                best.reason.clone(),
                Some(best_index),
                Some(best),
            );
        }

        if available >= 2 {
            // Two-or-more verification must actually verify twice.
            let required_margin = if best.is_precomputed {
                self.config.matching.fp_precomputed_margin
            } else {
                PRIMARY_MARGIN_FRESH
            };
            if best.score < best.required_score + required_margin {
                return (
                    false,
                    "insufficient_margin".to_string(),
                    Some(best_index),
                    Some(best),
                );
            }

            let secondary = evaluated_results
                .iter()
                .filter(|(i, _)| *i != best_index)
                .max_by_key(|(i, v)| (v.score, std::cmp::Reverse(*i)));
            let (_, secondary) = match secondary {
                Some(pair) => pair,
                None => {
                    return (
                        false,
                        "secondary_template_required".to_string(),
                        Some(best_index),
                        Some(best),
                    );
                }
            };

            if !self.secondary_supports(&best, secondary) {
                return (
                    false,
                    "secondary_template_disagrees".to_string(),
                    Some(best_index),
                    Some(best),
                );
            }
        } else {
            // A single stored sample has to clear a wider margin.
            let required = best.required_score;
            let extra = self.config.matching.fp_single_template_margin_min.max(
                (required as f64 * self.config.matching.fp_single_template_margin_ratio).round()
                    as u32,
            );
            if best.score < required + extra {
                return (
                    false,
                    "single_template_margin".to_string(),
                    Some(best_index),
                    Some(best),
                );
            }
        }

        (true, REASON_MATCH.to_string(), Some(best_index), Some(best))
    }

    /// Tiered secondary gates: the stronger the primary, the more slack
    /// the corroborating template gets.
    fn secondary_supports(&self, best: &MatchVerdict, secondary: &MatchVerdict) -> bool {
        let score = secondary.score;
        let threshold = secondary.threshold as f64;
        if best.score >= VERY_STRONG_SCORE {
            score >= SECONDARY_FLOOR && score as f64 >= SECONDARY_STRONG_FRACTION * threshold
        } else if best.score >= MODERATE_SCORE {
            let floor = if secondary.is_precomputed {
                SECONDARY_FLOOR - SECONDARY_PRECOMPUTED_SLACK
            } else {
                SECONDARY_FLOOR
            };
            score >= floor && score as f64 >= SECONDARY_MODERATE_FRACTION * threshold
        } else {
            secondary.accepted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::Config;
    use crate::utils::logging::RequestLog;

    fn engine() -> Arc<MatchEngine> {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(RequestLog::open(dir.path().join("logs.txt")));
        Arc::new(MatchEngine::new(Arc::new(Config::default()), log))
    }

    fn verdict(score: u32, accepted: bool, precomputed: bool) -> MatchVerdict {
        MatchVerdict {
            accepted,
            score,
            threshold: 45,
            required_score: 50,
            confidence: (score as f64 / 45.0 * 100.0).min(100.0),
            required_confidence: 65.0,
            probe_keypoints: 400,
            template_keypoints: 400,
            quality_ok: true,
            quality_warn: true,
            is_precomputed: precomputed,
            reason: if accepted {
                "match".to_string()
            } else {
                "score_below_threshold".to_string()
            },
        }
    }

    fn result(index: usize, verdict: Option<MatchVerdict>, reason: &str) -> TemplateResult {
        TemplateResult {
            index,
            evaluated: verdict.is_some(),
            reason: verdict
                .as_ref()
                .map(|v| v.reason.clone())
                .unwrap_or_else(|| reason.to_string()),
            verdict,
        }
    }

    #[test]
    fn strong_primary_with_weak_secondary_disagrees() {
        let e = engine();
        let results = vec![
            result(0, Some(verdict(90, true, true)), ""),
            result(1, Some(verdict(12, false, true)), ""),
        ];
        let (matched, reason, best_index, _) = e.decide(&results, 2, 2);
        assert!(!matched);
        assert_eq!(reason, "secondary_template_disagrees");
        assert_eq!(best_index, Some(0));
    }

    #[test]
    fn strong_primary_with_supporting_secondary_matches() {
        let e = engine();
        let results = vec![
            result(0, Some(verdict(90, true, true)), ""),
            result(1, Some(verdict(47, false, true)), ""),
        ];
        let (matched, reason, _, _) = e.decide(&results, 2, 2);
        assert!(matched, "reason {}", reason);
        assert_eq!(reason, "match");
    }

    #[test]
    fn moderate_primary_gets_precomputed_slack() {
        let e = engine();
        // Secondary at 43 passes only because the template is precomputed.
        let results = vec![
            result(0, Some(verdict(64, true, true)), ""),
            result(1, Some(verdict(43, false, true)), ""),
        ];
        let (matched, reason, _, _) = e.decide(&results, 2, 2);
        assert!(matched, "reason {}", reason);

        let fresh = vec![
            result(0, Some(verdict(64, true, false)), ""),
            result(1, Some(verdict(43, false, false)), ""),
        ];
        let (matched, reason, _, _) = e.decide(&fresh, 2, 2);
        assert!(!matched);
        assert_eq!(reason, "secondary_template_disagrees");
    }

    #[test]
    fn weak_primary_requires_accepted_secondary() {
        let e = engine();
        let results = vec![
            result(0, Some(verdict(56, true, true)), ""),
            result(1, Some(verdict(48, false, true)), ""),
        ];
        let (matched, reason, _, _) = e.decide(&results, 2, 2);
        assert!(!matched);
        assert_eq!(reason, "secondary_template_disagrees");

        let supported = vec![
            result(0, Some(verdict(56, true, true)), ""),
            result(1, Some(verdict(55, true, true)), ""),
        ];
        let (matched, _, _, _) = e.decide(&supported, 2, 2);
        assert!(matched);
    }

    #[test]
    fn cancelled_secondary_is_required_not_forgiven() {
        let e = engine();
        let results = vec![
            result(0, Some(verdict(95, true, true)), ""),
            result(1, None, "cancelled_early_exit"),
        ];
        let (matched, reason, _, _) = e.decide(&results, 2, 1);
        assert!(!matched);
        assert_eq!(reason, "secondary_template_required");
    }

    #[test]
    fn nothing_evaluated_has_its_own_reason() {
        let e = engine();
        let results = vec![
            result(0, None, "precomputed_load_failed"),
            result(1, None, "empty_template"),
        ];
        let (matched, reason, best, _) = e.decide(&results, 2, 0);
        assert!(!matched);
        assert_eq!(reason, "no_templates_evaluados");
        assert!(best.is_none());
    }

    #[test]
    fn single_template_demands_wider_margin() {
        let e = engine();
        // required 50, extra max(5, round(5.0)) = 5 -> needs 55.
        let short = vec![result(0, Some(verdict(53, true, true)), "")];
        let (matched, reason, _, _) = e.decide(&short, 1, 1);
        assert!(!matched);
        assert_eq!(reason, "single_template_margin");

        let wide = vec![result(0, Some(verdict(60, true, true)), "")];
        let (matched, _, _, _) = e.decide(&wide, 1, 1);
        assert!(matched);
    }

    #[test]
    fn unaccepted_best_propagates_its_reason() {
        let e = engine();
        let results = vec![
            result(0, Some(verdict(20, false, true)), ""),
            result(1, Some(verdict(31, false, true)), ""),
        ];
        let (matched, reason, best_index, _) = e.decide(&results, 2, 2);
        assert!(!matched);
        assert_eq!(reason, "score_below_threshold");
        assert_eq!(best_index, Some(1));
    }
}

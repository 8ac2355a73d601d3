// src/core/mod.rs
pub mod features;
pub mod identify;
pub mod image;
pub mod index;
pub mod matcher;
pub mod template;
pub mod verify;

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::info;

use crate::core::features::keypoint::{FeatureSet, MIN_FEATURES};
use crate::core::features::FeatureDetector;
use crate::core::image::ImageConditioner;
use crate::core::index::builder::{build_records, IndexBuildStats};
use crate::core::index::{EmployeeIndex, SharedIndex};
use crate::core::matcher::{MatchVerdict, Matcher};
use crate::core::template::{decode_template, is_precomputed_template, TemplateError};
use crate::storage::EmployeeStore;
use crate::utils::config::Config;
use crate::utils::error::{EngineError, Result};
use crate::utils::logging::RequestLog;

/// Conditioner + detector + quality thresholds bundled together. The
/// detector instance inside is built once and shared; probes and stored
/// templates must be produced with identical parameters.
pub struct ExtractionPipeline {
    conditioner: ImageConditioner,
    detector: Arc<FeatureDetector>,
    quality_ok_at: u32,
    quality_warn_at: u32,
}

impl ExtractionPipeline {
    pub fn new(config: &Config) -> Self {
        Self {
            conditioner: ImageConditioner::new(config.service.force_basic()),
            detector: Arc::new(FeatureDetector::new(&config.detector)),
            quality_ok_at: config.matching.fp_min_keypoints,
            quality_warn_at: config.matching.fp_min_keypoints_warn,
        }
    }

    /// Condition a raw base64 image and extract fresh features.
    pub fn extract_image(
        &self,
        image_b64: &str,
        force_professional: bool,
    ) -> std::result::Result<FeatureSet, &'static str> {
        let conditioned = self
            .conditioner
            .condition(image_b64, force_professional)
            .map_err(|e| e.reason())?;
        let (keypoints, descriptors) = self.detector.detect_and_compute(&conditioned.roi);
        if descriptors.nrows() == 0 {
            return Err("missing_descriptors");
        }
        if keypoints.len() < MIN_FEATURES {
            return Err("insufficient_features");
        }
        let (width, height) = conditioned.roi.dimensions();
        Ok(FeatureSet::assemble(
            keypoints,
            descriptors,
            conditioned.method,
            (height, width),
            false,
            self.quality_ok_at,
            self.quality_warn_at,
        ))
    }

    /// Deserialize a stored template.
    pub fn load_template(
        &self,
        template_b64: &str,
    ) -> std::result::Result<FeatureSet, TemplateError> {
        decode_template(template_b64, self.quality_ok_at, self.quality_warn_at)
    }

    /// Template-or-image dispatch on the magic prefix, the shape every
    /// sample slot and verification input goes through.
    pub fn load_sample(
        &self,
        data: &str,
        force_professional: bool,
    ) -> std::result::Result<FeatureSet, &'static str> {
        if is_precomputed_template(data) {
            self.load_template(data)
                .map_err(|_| "precomputed_load_failed")
        } else {
            self.extract_image(data, force_professional)
        }
    }

    pub fn detector(&self) -> &Arc<FeatureDetector> {
        &self.detector
    }
}

/// The matching engine: owns the extraction pipeline, the scoring
/// matcher, the employee index handle, and the worker pool that bounds
/// CPU-parallel template evaluation.
pub struct MatchEngine {
    pub config: Arc<Config>,
    pipeline: ExtractionPipeline,
    matcher: Arc<Matcher>,
    workers: Arc<Semaphore>,
    pub index: SharedIndex,
    pub request_log: Arc<RequestLog>,
    /// Serializes rebuild/sync so concurrent mutations cannot lose an
    /// append during the read-copy-update swap.
    index_write: tokio::sync::Mutex<()>,
}

impl MatchEngine {
    pub fn new(config: Arc<Config>, request_log: Arc<RequestLog>) -> Self {
        let pipeline = ExtractionPipeline::new(&config);
        let matcher = Arc::new(Matcher::new(config.matching.clone()));
        let workers = Arc::new(Semaphore::new(config.service.fp_max_workers.max(1)));
        Self {
            config,
            pipeline,
            matcher,
            workers,
            index: SharedIndex::new(),
            request_log,
            index_write: tokio::sync::Mutex::new(()),
        }
    }

    pub fn pipeline(&self) -> &ExtractionPipeline {
        &self.pipeline
    }

    pub fn matcher(&self) -> &Arc<Matcher> {
        &self.matcher
    }

    pub fn workers(&self) -> &Arc<Semaphore> {
        &self.workers
    }

    /// The ridge enhancer is compiled in; the flag exists for parity with
    /// deployments where the professional path is an optional dependency.
    pub fn enhancer_available(&self) -> bool {
        true
    }

    /// 1:1 image-to-image comparison. Both sides are freshly extracted,
    /// honoring the global enhancement flag, so neither gets template
    /// leniency.
    pub fn match_images(
        &self,
        probe_b64: &str,
        candidate_b64: &str,
        threshold_override: Option<u32>,
    ) -> std::result::Result<MatchVerdict, &'static str> {
        let probe = self.pipeline.extract_image(probe_b64, false)?;
        let candidate = self.pipeline.extract_image(candidate_b64, false)?;
        Ok(self
            .matcher
            .compare(&probe, &candidate, threshold_override, false))
    }

    /// Full index rebuild from the store. On store failure the previous
    /// index stays in place.
    pub async fn rebuild_index(
        self: &Arc<Self>,
        store: &dyn EmployeeStore,
    ) -> Result<IndexBuildStats> {
        let _guard = self.index_write.lock().await;
        let rows = store.fetch_active_employees().await?;

        let engine = Arc::clone(self);
        let (records, stats) = tokio::task::spawn_blocking(move || {
            build_records(&rows, &engine.pipeline)
        })
        .await
        .map_err(|e| EngineError::Index(e.to_string()))?;

        info!(
            employees = stats.employees_loaded,
            templates = stats.templates_loaded,
            with_four = stats.with_four_templates,
            with_fewer = stats.with_fewer_templates,
            corrupted_templates = stats.corrupted_templates,
            corrupted_images = stats.corrupted_images,
            skipped = stats.skipped_invalid,
            "employee index built"
        );
        self.request_log.append(&format!(
            "[INDEX] rebuilt: {} employees, {} templates ({} corrupted templates, {} corrupted images, {} skipped)",
            stats.employees_loaded,
            stats.templates_loaded,
            stats.corrupted_templates,
            stats.corrupted_images,
            stats.skipped_invalid
        ));

        self.index.install(EmployeeIndex::from_records(records));
        Ok(stats)
    }

    /// Incremental add of a single employee. Rejects duplicates and rows
    /// without one usable sample.
    pub async fn sync_employee(
        self: &Arc<Self>,
        store: &dyn EmployeeStore,
        employee_id: i64,
    ) -> Result<usize> {
        if !self.index.is_ready() {
            return Err(EngineError::IndexNotReady);
        }

        let _guard = self.index_write.lock().await;
        if self.index.snapshot().contains(employee_id) {
            return Err(EngineError::Conflict(format!(
                "employee {} already indexed",
                employee_id
            )));
        }

        let row = store
            .fetch_employee(employee_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("employee {} not found", employee_id)))?;

        let engine = Arc::clone(self);
        let record = tokio::task::spawn_blocking(move || {
            let mut stats = crate::core::index::builder::IndexBuildStats::default();
            crate::core::index::builder::load_employee_record(&row, &engine.pipeline, &mut stats)
        })
        .await
        .map_err(|e| EngineError::Index(e.to_string()))?
        .ok_or_else(|| {
            EngineError::Template(format!("employee {} has no valid template", employee_id))
        })?;

        let next = self.index.snapshot().with_appended(record);
        let total = next.len();
        self.index.install(next);

        info!(employee_id, total, "employee appended to index");
        self.request_log
            .append(&format!("[SYNC] employee {} indexed ({} total)", employee_id, total));
        Ok(total)
    }
}

// tests/common/mod.rs
//! Shared fixtures: deterministic synthetic fingerprint images, an
//! in-memory employee store, and engine construction helpers.
#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::GrayImage;
use tempfile::TempDir;

use ridgeline::core::MatchEngine;
use ridgeline::storage::{EmployeeRow, EmployeeStore};
use ridgeline::utils::config::Config;
use ridgeline::utils::error::Result;
use ridgeline::utils::logging::RequestLog;

/// Integration config: identical gate logic, but quality floors sized for
/// synthetic imagery instead of live scanner captures.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.matching.fp_min_keypoints = 120;
    config.matching.fp_min_keypoints_warn = 80;
    config
}

pub fn engine_with(config: Config) -> (Arc<MatchEngine>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(RequestLog::open(dir.path().join("logs.txt")));
    (Arc::new(MatchEngine::new(Arc::new(config), log)), dir)
}

/// Curved-ridge pattern with per-seed geometry and speckle, textured
/// enough to produce a dense keypoint population.
pub fn ridge_image(seed: u32, size: u32) -> GrayImage {
    let mut state = seed.wrapping_mul(0x9e37_79b9).wrapping_add(0x85eb_ca6b);
    let cx = 0.5 + 0.08 * ((seed % 7) as f32 - 3.0) / 3.0;
    let cy = 0.5 + 0.08 * ((seed % 5) as f32 - 2.0) / 2.0;
    let whorl = 0.6 + 0.1 * (seed % 11) as f32;

    GrayImage::from_fn(size, size, |x, y| {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let noise = (state >> 24) as f32 / 255.0;

        let fx = x as f32 / size as f32 - cx;
        let fy = y as f32 / size as f32 - cy;
        let r = (fx * fx + fy * fy).sqrt();
        let theta = fy.atan2(fx);
        // Ridge frequency near the classic 8px period, bent per seed.
        let phase = r * size as f32 * 0.75 + whorl * theta * 3.0
            + 1.7 * ((seed as f32 * 0.37).sin() + (theta * 5.0 + seed as f32).sin() * 0.4);
        let ridge = (phase * 2.0 * std::f32::consts::PI / 9.0).sin() * 0.5 + 0.5;
        let v = (0.15 + 0.62 * ridge + 0.23 * noise) * 255.0;
        image::Luma([v.clamp(0.0, 255.0) as u8])
    })
}

pub fn png_b64(img: &GrayImage) -> String {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    STANDARD.encode(bytes)
}

pub fn ridge_png_b64(seed: u32, size: u32) -> String {
    png_b64(&ridge_image(seed, size))
}

/// A small, near-featureless capture: decodes fine but cannot reach the
/// quality floor.
pub fn sparse_png_b64() -> String {
    let img = GrayImage::from_fn(96, 96, |x, y| {
        let blob = ((x as i32 - 48).pow(2) + (y as i32 - 48).pow(2)) < 100;
        image::Luma([if blob { 60 } else { 200 }])
    });
    png_b64(&img)
}

/// Extract with the professional path and serialize, the way enrollment
/// produces stored templates.
pub fn template_from(engine: &MatchEngine, image_b64: &str) -> String {
    let set = engine
        .pipeline()
        .extract_image(image_b64, true)
        .expect("extraction should succeed for synthetic ridge images");
    ridgeline::core::template::encode_template(
        &set.keypoints,
        &set.descriptors,
        set.method,
        set.roi_shape,
    )
    .unwrap()
}

pub fn row_with_templates(employee_id: i64, templates: &[String]) -> EmployeeRow {
    let mut row = EmployeeRow {
        employee_id,
        ..Default::default()
    };
    for (i, t) in templates.iter().take(4).enumerate() {
        row.templates[i] = Some(t.clone());
    }
    row
}

/// In-memory stand-in for the relational store.
pub struct MemoryStore {
    pub rows: Vec<EmployeeRow>,
}

impl MemoryStore {
    pub fn new(rows: Vec<EmployeeRow>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl EmployeeStore for MemoryStore {
    async fn fetch_active_employees(&self) -> Result<Vec<EmployeeRow>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.has_any_sample())
            .cloned()
            .collect())
    }

    async fn fetch_employee(&self, employee_id: i64) -> Result<Option<EmployeeRow>> {
        Ok(self
            .rows
            .iter()
            .find(|r| r.employee_id == employee_id)
            .cloned())
    }
}

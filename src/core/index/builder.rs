// src/core/index/builder.rs
//! Builds employee records from store rows. Per slot the serialized
//! template column wins; a raw image column is decoded and extracted
//! in memory as fallback (the derived template is never persisted).

use ndarray::Array2;
use tracing::{debug, warn};

use crate::core::index::employee::{mean_embedding, EmployeeRecord};
use crate::core::ExtractionPipeline;
use crate::storage::employee::{EmployeeRow, TEMPLATE_SLOTS};

#[derive(Debug, Clone, Default)]
pub struct IndexBuildStats {
    pub employees_loaded: usize,
    pub templates_loaded: usize,
    pub with_four_templates: usize,
    pub with_fewer_templates: usize,
    pub corrupted_templates: usize,
    pub corrupted_images: usize,
    pub skipped_invalid: usize,
}

pub fn build_records(
    rows: &[EmployeeRow],
    pipeline: &ExtractionPipeline,
) -> (Vec<EmployeeRecord>, IndexBuildStats) {
    let mut stats = IndexBuildStats::default();
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(record) = load_employee_record(row, pipeline, &mut stats) {
            records.push(record);
        }
    }
    (records, stats)
}

/// Loads every usable sample of one employee and derives the embedding.
/// Returns `None` (and counts it) when nothing usable survives; such an
/// employee never enters the index.
pub fn load_employee_record(
    row: &EmployeeRow,
    pipeline: &ExtractionPipeline,
    stats: &mut IndexBuildStats,
) -> Option<EmployeeRecord> {
    let mut sets = Vec::new();

    for slot in 0..TEMPLATE_SLOTS {
        if let Some(template) = &row.templates[slot] {
            match pipeline.load_template(template) {
                Ok(set) if set.is_usable() => {
                    sets.push(set);
                    continue;
                }
                _ => {
                    stats.corrupted_templates += 1;
                    debug!(
                        employee_id = row.employee_id,
                        slot = slot + 1,
                        "template slot failed to load, trying image slot"
                    );
                }
            }
        }
        if let Some(image) = &row.images[slot] {
            // Enrollment images get the professional path so their features
            // stay comparable with stored templates.
            match pipeline.extract_image(image, true) {
                Ok(set) if set.is_usable() => sets.push(set),
                _ => stats.corrupted_images += 1,
            }
        }
    }

    if sets.is_empty() {
        stats.skipped_invalid += 1;
        warn!(
            employee_id = row.employee_id,
            "no usable fingerprint samples, employee skipped"
        );
        return None;
    }

    let descriptor_sets: Vec<&Array2<f32>> = sets.iter().map(|s| &s.descriptors).collect();
    let embedding = match mean_embedding(&descriptor_sets) {
        Some(e) => e,
        None => {
            stats.skipped_invalid += 1;
            warn!(
                employee_id = row.employee_id,
                "degenerate descriptors, employee skipped"
            );
            return None;
        }
    };

    stats.employees_loaded += 1;
    stats.templates_loaded += sets.len();
    if sets.len() == TEMPLATE_SLOTS {
        stats.with_four_templates += 1;
    } else {
        stats.with_fewer_templates += 1;
    }

    Some(EmployeeRecord {
        employee_id: row.employee_id,
        feature_sets: sets,
        embedding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::keypoint::{EnhancementMethod, Keypoint, DESCRIPTOR_DIM};
    use crate::core::template::encode_template;
    use crate::utils::config::Config;
    use ndarray::Array2;

    fn pipeline() -> ExtractionPipeline {
        ExtractionPipeline::new(&Config::default())
    }

    fn template_b64(seed: usize) -> String {
        let keypoints: Vec<Keypoint> = (0..16)
            .map(|i| Keypoint {
                x: (i + seed) as f32,
                y: i as f32,
                size: 2.0,
                angle: 45.0,
                response: 0.2,
                octave: 0,
                class_id: -1,
            })
            .collect();
        let descriptors = Array2::from_shape_fn((16, DESCRIPTOR_DIM), |(i, j)| {
            ((i * 37 + j * 11 + seed * 101) % 200) as f32
        });
        encode_template(
            &keypoints,
            &descriptors,
            EnhancementMethod::Professional,
            (120, 120),
        )
        .unwrap()
    }

    #[test]
    fn template_slots_load_and_count() {
        let mut row = EmployeeRow {
            employee_id: 11,
            ..Default::default()
        };
        row.templates[0] = Some(template_b64(1));
        row.templates[1] = Some(template_b64(2));

        let mut stats = IndexBuildStats::default();
        let record = load_employee_record(&row, &pipeline(), &mut stats).unwrap();
        assert_eq!(record.employee_id, 11);
        assert_eq!(record.template_count(), 2);
        assert_eq!(stats.employees_loaded, 1);
        assert_eq!(stats.templates_loaded, 2);
        assert_eq!(stats.with_fewer_templates, 1);
        assert_eq!(stats.corrupted_templates, 0);
    }

    #[test_log::test]
    fn corrupt_slots_are_counted_not_fatal() {
        let mut row = EmployeeRow {
            employee_id: 12,
            ..Default::default()
        };
        row.templates[0] = Some(template_b64(1));
        row.templates[1] = Some("H4sI-definitely-not-a-template".repeat(8));
        row.images[2] = Some("@@broken@@".to_string());

        let mut stats = IndexBuildStats::default();
        let record = load_employee_record(&row, &pipeline(), &mut stats).unwrap();
        assert_eq!(record.template_count(), 1);
        assert_eq!(stats.corrupted_templates, 1);
        assert_eq!(stats.corrupted_images, 1);
    }

    #[test]
    fn employee_with_nothing_usable_is_skipped() {
        let mut row = EmployeeRow {
            employee_id: 13,
            ..Default::default()
        };
        row.templates[3] = Some("H4sIbroken".repeat(20));

        let mut stats = IndexBuildStats::default();
        assert!(load_employee_record(&row, &pipeline(), &mut stats).is_none());
        assert_eq!(stats.skipped_invalid, 1);
        assert_eq!(stats.employees_loaded, 0);
    }

    #[test]
    fn build_records_aggregates_across_employees() {
        let mut a = EmployeeRow {
            employee_id: 1,
            ..Default::default()
        };
        a.templates[0] = Some(template_b64(1));
        a.templates[1] = Some(template_b64(2));
        a.templates[2] = Some(template_b64(3));
        a.templates[3] = Some(template_b64(4));
        let mut b = EmployeeRow {
            employee_id: 2,
            ..Default::default()
        };
        b.templates[0] = Some(template_b64(9));
        let empty = EmployeeRow {
            employee_id: 3,
            ..Default::default()
        };

        let (records, stats) = build_records(&[a, b, empty], &pipeline());
        assert_eq!(records.len(), 2);
        assert_eq!(stats.employees_loaded, 2);
        assert_eq!(stats.with_four_templates, 1);
        assert_eq!(stats.with_fewer_templates, 1);
        assert_eq!(stats.templates_loaded, 5);
        assert_eq!(stats.skipped_invalid, 1);
    }
}

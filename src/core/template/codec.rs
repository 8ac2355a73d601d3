// src/core/template/codec.rs
//! Durable template wire format: JSON, gzip-compressed, base64-encoded.
//! The base64 form of any gzip stream begins with `H4sI`, which doubles
//! as the classifier separating stored templates from raw image uploads.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::core::features::keypoint::{
    EnhancementMethod, FeatureSet, Keypoint, DESCRIPTOR_DIM,
};

/// Base64 rendering of the gzip magic bytes (0x1f 0x8b 0x08).
pub const TEMPLATE_MAGIC: &str = "H4sI";
/// Anything shorter cannot be a real template.
pub const TEMPLATE_MIN_LEN: usize = 100;
/// Legacy blobs this long get a tolerant decode even without the magic.
pub const LEGACY_DECODE_LEN: usize = 10_000;

/// Decode failures, each with its own reason string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateError {
    Base64,
    Gzip,
    Json,
    MissingFields,
    BadKeypoints,
    BadDescriptorShape,
}

impl TemplateError {
    pub fn reason(&self) -> &'static str {
        match self {
            TemplateError::Base64 => "template_base64_invalid",
            TemplateError::Gzip => "template_gzip_invalid",
            TemplateError::Json => "template_json_invalid",
            TemplateError::MissingFields => "template_fields_missing",
            TemplateError::BadKeypoints => "template_keypoints_invalid",
            TemplateError::BadDescriptorShape => "template_descriptor_shape",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TemplatePayload {
    #[serde(default)]
    method: Option<String>,
    keypoints_count: usize,
    roi_shape: (u32, u32),
    /// Per keypoint: [x, y, size, angle, response, octave, class_id].
    keypoints: Vec<[f64; 7]>,
    descriptors: Vec<Vec<f32>>,
}

/// True iff the payload looks like an encoded template rather than a raw
/// base64 image. Never probes the content.
pub fn is_precomputed_template(data: &str) -> bool {
    let trimmed = data.trim_start();
    trimmed.len() >= TEMPLATE_MIN_LEN && trimmed.starts_with(TEMPLATE_MAGIC)
}

/// Serialize a feature set into the durable base64 form.
pub fn encode_template(
    keypoints: &[Keypoint],
    descriptors: &Array2<f32>,
    method: EnhancementMethod,
    roi_shape: (u32, u32),
) -> Result<String, TemplateError> {
    let payload = TemplatePayload {
        method: Some(method.as_str().to_string()),
        keypoints_count: keypoints.len(),
        roi_shape,
        keypoints: keypoints
            .iter()
            .map(|kp| {
                [
                    kp.x as f64,
                    kp.y as f64,
                    kp.size as f64,
                    kp.angle as f64,
                    kp.response as f64,
                    kp.octave as f64,
                    kp.class_id as f64,
                ]
            })
            .collect(),
        descriptors: descriptors.rows().into_iter().map(|r| r.to_vec()).collect(),
    };

    let json = serde_json::to_vec(&payload).map_err(|_| TemplateError::Json)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).map_err(|_| TemplateError::Gzip)?;
    let compressed = encoder.finish().map_err(|_| TemplateError::Gzip)?;
    Ok(STANDARD.encode(compressed))
}

/// Deserialize a stored template back into a feature set. Quality flags
/// are recomputed against the supplied thresholds; `is_precomputed` is
/// always set.
pub fn decode_template(
    data: &str,
    quality_ok_at: u32,
    quality_warn_at: u32,
) -> Result<FeatureSet, TemplateError> {
    let trimmed = data.trim();
    if !is_precomputed_template(trimmed) && trimmed.len() <= LEGACY_DECODE_LEN {
        return Err(TemplateError::Base64);
    }

    let bytes = STANDARD
        .decode(trimmed.as_bytes())
        .map_err(|_| TemplateError::Base64)?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|_| TemplateError::Gzip)?;
    let payload: TemplatePayload =
        serde_json::from_slice(&json).map_err(|e| classify_json_error(&e))?;

    if payload.descriptors.is_empty() {
        return Err(TemplateError::MissingFields);
    }
    let rows = payload.descriptors.len();
    if payload.keypoints.len() != rows {
        return Err(TemplateError::BadKeypoints);
    }
    let mut descriptors = Array2::<f32>::zeros((rows, DESCRIPTOR_DIM));
    for (i, row) in payload.descriptors.iter().enumerate() {
        if row.len() != DESCRIPTOR_DIM {
            return Err(TemplateError::BadDescriptorShape);
        }
        for (j, v) in row.iter().enumerate() {
            descriptors[(i, j)] = *v;
        }
    }

    let keypoints: Vec<Keypoint> = payload
        .keypoints
        .iter()
        .map(|k| Keypoint {
            x: k[0] as f32,
            y: k[1] as f32,
            size: k[2] as f32,
            angle: k[3] as f32,
            response: k[4] as f32,
            octave: k[5] as i32,
            class_id: k[6] as i32,
        })
        .collect();

    let method = match payload.method.as_deref() {
        Some("professional") => EnhancementMethod::Professional,
        Some("basic") => EnhancementMethod::Basic,
        // Older enrollments predate the tag.
        _ => EnhancementMethod::Unknown,
    };

    Ok(FeatureSet::assemble(
        keypoints,
        descriptors,
        method,
        payload.roi_shape,
        true,
        quality_ok_at,
        quality_warn_at,
    ))
}

fn classify_json_error(err: &serde_json::Error) -> TemplateError {
    if err.is_data() {
        TemplateError::MissingFields
    } else {
        TemplateError::Json
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn sample_set(n: usize) -> (Vec<Keypoint>, Array2<f32>) {
        let keypoints: Vec<Keypoint> = (0..n)
            .map(|i| Keypoint {
                x: i as f32 * 1.5 + 0.25,
                y: i as f32 * 0.75,
                size: 3.2,
                angle: (i % 360) as f32 + 0.125,
                response: 0.031_25 * (i + 1) as f32,
                octave: (i % 4) as i32,
                class_id: -1,
            })
            .collect();
        let descriptors = Array2::from_shape_fn((n, DESCRIPTOR_DIM), |(i, j)| {
            ((i * 31 + j * 7) % 256) as f32
        });
        (keypoints, descriptors)
    }

    #[test]
    fn round_trip_is_lossless() {
        let (kps, desc) = sample_set(24);
        let encoded = encode_template(
            &kps,
            &desc,
            EnhancementMethod::Professional,
            (240, 180),
        )
        .unwrap();
        let decoded = decode_template(&encoded, 200, 160).unwrap();
        assert_eq!(decoded.keypoints, kps);
        assert_eq!(decoded.descriptors, desc);
        assert_eq!(decoded.keypoint_count, 24);
        assert_eq!(decoded.roi_shape, (240, 180));
        assert_eq!(decoded.method, EnhancementMethod::Professional);
        assert!(decoded.is_precomputed);
    }

    #[test]
    fn encoded_templates_carry_the_magic_prefix() {
        let (kps, desc) = sample_set(12);
        let encoded =
            encode_template(&kps, &desc, EnhancementMethod::Basic, (64, 64)).unwrap();
        assert!(encoded.starts_with(TEMPLATE_MAGIC));
        assert!(is_precomputed_template(&encoded));
    }

    #[test]
    fn raw_png_is_not_a_template() {
        // PNG base64 always opens with iVBOR.
        let fake_png = format!("iVBOR{}", "A".repeat(400));
        assert!(!is_precomputed_template(&fake_png));
        assert!(decode_template(&fake_png, 200, 160).is_err());
    }

    #[test]
    fn short_strings_are_never_templates() {
        assert!(!is_precomputed_template("H4sIAAAA"));
        assert!(!is_precomputed_template(""));
    }

    #[test]
    fn missing_method_tag_decodes_as_unknown() {
        let (kps, desc) = sample_set(10);
        let encoded =
            encode_template(&kps, &desc, EnhancementMethod::Professional, (32, 32)).unwrap();
        // Re-encode the payload without its method tag, as legacy blobs.
        let bytes = STANDARD.decode(encoded.as_bytes()).unwrap();
        let mut json = Vec::new();
        GzDecoder::new(bytes.as_slice())
            .read_to_end(&mut json)
            .unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        value.as_object_mut().unwrap().remove("method");
        let stripped = serde_json::to_vec(&value).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&stripped).unwrap();
        let reencoded = STANDARD.encode(encoder.finish().unwrap());

        let decoded = decode_template(&reencoded, 200, 160).unwrap();
        assert_eq!(decoded.method, EnhancementMethod::Unknown);
    }

    #[test]
    fn corrupted_payload_maps_to_distinct_errors() {
        let (kps, desc) = sample_set(10);
        let encoded =
            encode_template(&kps, &desc, EnhancementMethod::Professional, (32, 32)).unwrap();

        // Valid gzip magic but broken stream.
        let mut broken = encoded.clone();
        broken.replace_range(20..24, "AAAA");
        let err = decode_template(&broken, 200, 160).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::Gzip | TemplateError::Base64 | TemplateError::Json
        ));

        // Wrong descriptor width.
        let mut json_payload = serde_json::json!({
            "method": "professional",
            "keypoints_count": 1,
            "roi_shape": [32, 32],
            "keypoints": [[1.0, 2.0, 3.0, 4.0, 5.0, 0.0, -1.0]],
            "descriptors": [[1.0, 2.0, 3.0]],
        });
        let raw = serde_json::to_vec(&json_payload).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let narrow = STANDARD.encode(encoder.finish().unwrap());
        // Pad the JSON so the encoded form clears the length floor.
        if narrow.len() < TEMPLATE_MIN_LEN {
            json_payload["padding"] = serde_json::json!("x".repeat(512));
            let raw = serde_json::to_vec(&json_payload).unwrap();
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw).unwrap();
            let narrow = STANDARD.encode(encoder.finish().unwrap());
            assert_eq!(
                decode_template(&narrow, 200, 160).unwrap_err(),
                TemplateError::BadDescriptorShape
            );
        } else {
            assert_eq!(
                decode_template(&narrow, 200, 160).unwrap_err(),
                TemplateError::BadDescriptorShape
            );
        }
    }
}

pub mod decode;
pub mod enhance;
pub mod roi;

use image::GrayImage;

use crate::core::features::keypoint::EnhancementMethod;

/// Conditioning failures, one reason code each. These never cross the
/// request boundary as errors; the orchestrators fold them into results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionError {
    DecodeFailed,
    EnhancementFailed,
}

impl ConditionError {
    pub fn reason(&self) -> &'static str {
        match self {
            ConditionError::DecodeFailed => "decode_failed",
            ConditionError::EnhancementFailed => "enhancement_failed",
        }
    }
}

/// The cleaned grayscale region of interest handed to the feature
/// extractor, tagged with the pipeline that produced it.
#[derive(Debug, Clone)]
pub struct ConditionedImage {
    pub roi: GrayImage,
    pub method: EnhancementMethod,
}

/// Decodes a base64 image and runs the fingerprint enhancement pipeline.
pub struct ImageConditioner {
    force_basic: bool,
}

impl ImageConditioner {
    pub fn new(force_basic: bool) -> Self {
        Self { force_basic }
    }

    /// Full conditioning pipeline. `force_professional` overrides the
    /// global basic-path flag; identification relies on this so probes are
    /// conditioned the same way enrolled templates were.
    pub fn condition(
        &self,
        image_b64: &str,
        force_professional: bool,
    ) -> Result<ConditionedImage, ConditionError> {
        let gray = decode::decode_base64_image(image_b64)?;
        let use_basic = self.force_basic && !force_professional;

        let (enhanced, method) = if use_basic {
            (enhance::enhance_basic(&gray)?, EnhancementMethod::Basic)
        } else {
            match enhance::enhance_professional(&gray) {
                Ok(img) => (img, EnhancementMethod::Professional),
                // Gabor stage degenerated; the basic path is the fallback.
                Err(_) => (enhance::enhance_basic(&gray)?, EnhancementMethod::Basic),
            }
        };

        let cleaned = enhance::morphological_cleanup(&enhanced);
        let roi = roi::extract_roi(&cleaned);
        Ok(ConditionedImage { roi, method })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use std::io::Cursor;

    fn ridge_png_b64(width: u32, height: u32) -> String {
        let img = GrayImage::from_fn(width, height, |x, y| {
            let v = (((x as f32 * 0.35) + (y as f32 * 0.1)).sin() * 0.5 + 0.5) * 255.0;
            image::Luma([v as u8])
        });
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn professional_pipeline_produces_roi() {
        let conditioner = ImageConditioner::new(false);
        let out = conditioner.condition(&ridge_png_b64(200, 200), false).unwrap();
        assert_eq!(out.method, EnhancementMethod::Professional);
        assert!(out.roi.width() > 0 && out.roi.height() > 0);
    }

    #[test]
    fn force_basic_is_overridden_by_force_professional() {
        let conditioner = ImageConditioner::new(true);
        let b64 = ridge_png_b64(160, 160);
        let basic = conditioner.condition(&b64, false).unwrap();
        assert_eq!(basic.method, EnhancementMethod::Basic);
        let forced = conditioner.condition(&b64, true).unwrap();
        assert_eq!(forced.method, EnhancementMethod::Professional);
    }

    #[test]
    fn invalid_base64_reports_decode_failed() {
        let conditioner = ImageConditioner::new(false);
        let err = conditioner.condition("@@not-base64@@", false).unwrap_err();
        assert_eq!(err.reason(), "decode_failed");
    }
}

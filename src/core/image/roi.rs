// src/core/image/roi.rs
//! Region-of-interest extraction: isolate the finger area from the
//! enhanced frame and crop it with padding. Falls back to the full image
//! when segmentation finds nothing credible.

use image::imageops::crop_imm;
use image::GrayImage;
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::contrast::{equalize_histogram, otsu_level, threshold, ThresholdType};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{close, open};

/// Area below this fraction of the frame is treated as segmentation noise.
const MIN_AREA_FRACTION: f64 = 0.02;
/// Degenerate rectangle guard, in pixels.
const MIN_SIDE: u32 = 40;
/// Padding added around the detected rectangle, per side.
const PAD_FRACTION: f32 = 0.08;

pub fn extract_roi(enhanced: &GrayImage) -> GrayImage {
    let (width, height) = enhanced.dimensions();
    if width < MIN_SIDE || height < MIN_SIDE {
        return enhanced.clone();
    }

    let equalized = equalize_histogram(enhanced);
    let blurred = gaussian_blur_f32(&equalized, 1.1);
    let level = otsu_level(&blurred);
    let mask = threshold(&blurred, level, ThresholdType::BinaryInverted);
    let mask = open(&close(&mask, Norm::L1, 1), Norm::L1, 1);

    let contours = find_contours::<i32>(&mask);
    let largest = contours
        .iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .map(|c| (contour_area(c), c))
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let (area, contour) = match largest {
        Some(pair) => pair,
        None => return enhanced.clone(),
    };

    let frame_area = width as f64 * height as f64;
    let (x0, y0, x1, y1) = bounding_box(contour);
    let rect_w = (x1 - x0).max(0) as u32;
    let rect_h = (y1 - y0).max(0) as u32;

    if area < frame_area * MIN_AREA_FRACTION || rect_w < MIN_SIDE || rect_h < MIN_SIDE {
        return enhanced.clone();
    }

    let pad_x = (rect_w as f32 * PAD_FRACTION) as i32;
    let pad_y = (rect_h as f32 * PAD_FRACTION) as i32;
    let cx0 = (x0 - pad_x).max(0) as u32;
    let cy0 = (y0 - pad_y).max(0) as u32;
    let cx1 = ((x1 + pad_x) as u32).min(width);
    let cy1 = ((y1 + pad_y) as u32).min(height);

    crop_imm(enhanced, cx0, cy0, cx1 - cx0, cy1 - cy0).to_image()
}

fn bounding_box(contour: &Contour<i32>) -> (i32, i32, i32, i32) {
    let mut x0 = i32::MAX;
    let mut y0 = i32::MAX;
    let mut x1 = i32::MIN;
    let mut y1 = i32::MIN;
    for p in &contour.points {
        x0 = x0.min(p.x);
        y0 = y0.min(p.y);
        x1 = x1.max(p.x);
        y1 = y1.max(p.y);
    }
    (x0, y0, x1, y1)
}

/// Shoelace area over the contour polygon.
fn contour_area(contour: &Contour<i32>) -> f64 {
    let pts = &contour.points;
    if pts.len() < 3 {
        return 0.0;
    }
    let mut acc = 0i64;
    for i in 0..pts.len() {
        let a = &pts[i];
        let b = &pts[(i + 1) % pts.len()];
        acc += a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64;
    }
    (acc.abs() as f64) * 0.5
}

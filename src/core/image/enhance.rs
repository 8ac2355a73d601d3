// src/core/image/enhance.rs
//! Ridge enhancement. The professional path runs a Gabor filter bank
//! tuned to fingerprint ridge frequency; the basic path is a plain
//! normalize/blur/equalize/adaptive-threshold chain used as fallback.

use image::GrayImage;
use imageproc::contrast::equalize_histogram;
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{close, open};
use ndarray::Array2;

use super::ConditionError;

/// Gabor bank geometry: ridge wavelength in pixels and kernel radius.
const GABOR_WAVELENGTH: f32 = 8.0;
const GABOR_SIGMA: f32 = 4.0;
const GABOR_GAMMA: f32 = 0.5;
const GABOR_RADIUS: i32 = 5;
const GABOR_ORIENTATIONS: usize = 8;

/// Gabor-filter ridge enhancement. Convolves with a bank of oriented
/// kernels and keeps the strongest response per pixel, then stretches the
/// dynamic range to [0, 255]. Fails when the response is flat (blank or
/// constant input).
pub fn enhance_professional(img: &GrayImage) -> Result<GrayImage, ConditionError> {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(ConditionError::EnhancementFailed);
    }
    let src = to_f32(img);
    let mut best = Array2::<f32>::from_elem((height as usize, width as usize), f32::MIN);

    for o in 0..GABOR_ORIENTATIONS {
        let theta = o as f32 * std::f32::consts::PI / GABOR_ORIENTATIONS as f32;
        let kernel = gabor_kernel(theta);
        let response = convolve(&src, &kernel, GABOR_RADIUS);
        for (b, r) in best.iter_mut().zip(response.iter()) {
            if *r > *b {
                *b = *r;
            }
        }
    }

    let min = best.iter().cloned().fold(f32::MAX, f32::min);
    let max = best.iter().cloned().fold(f32::MIN, f32::max);
    if !(max - min).is_finite() || (max - min) < 1e-6 {
        return Err(ConditionError::EnhancementFailed);
    }
    let scale = 255.0 / (max - min);
    let mut out = GrayImage::new(width, height);
    for (x, y, p) in out.enumerate_pixels_mut() {
        let v = (best[(y as usize, x as usize)] - min) * scale;
        *p = image::Luma([v.clamp(0.0, 255.0) as u8]);
    }
    Ok(out)
}

/// Fallback chain: min-max normalize, blur, equalize, adaptive Gaussian
/// threshold (block 11, C = 2).
pub fn enhance_basic(img: &GrayImage) -> Result<GrayImage, ConditionError> {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(ConditionError::EnhancementFailed);
    }
    let normalized = normalize(img).ok_or(ConditionError::EnhancementFailed)?;
    let blurred = gaussian_blur_f32(&normalized, 1.0);
    let equalized = equalize_histogram(&blurred);
    Ok(adaptive_gaussian_threshold(&equalized, 2.0))
}

/// Closing then opening with a 3x3 structuring element: closes ridge gaps,
/// then suppresses speckle.
pub fn morphological_cleanup(img: &GrayImage) -> GrayImage {
    open(&close(img, Norm::L1, 1), Norm::L1, 1)
}

fn to_f32(img: &GrayImage) -> Array2<f32> {
    let (width, height) = img.dimensions();
    let mut out = Array2::<f32>::zeros((height as usize, width as usize));
    for (x, y, p) in img.enumerate_pixels() {
        out[(y as usize, x as usize)] = p.0[0] as f32 / 255.0;
    }
    out
}

fn gabor_kernel(theta: f32) -> Vec<f32> {
    let size = (2 * GABOR_RADIUS + 1) as usize;
    let mut kernel = Vec::with_capacity(size * size);
    let (sin_t, cos_t) = theta.sin_cos();
    let sigma2 = GABOR_SIGMA * GABOR_SIGMA;
    let gamma2 = GABOR_GAMMA * GABOR_GAMMA;
    let freq = 2.0 * std::f32::consts::PI / GABOR_WAVELENGTH;
    let mut sum = 0.0f32;
    for y in -GABOR_RADIUS..=GABOR_RADIUS {
        for x in -GABOR_RADIUS..=GABOR_RADIUS {
            let xr = x as f32 * cos_t + y as f32 * sin_t;
            let yr = -(x as f32) * sin_t + y as f32 * cos_t;
            let envelope = (-(xr * xr + gamma2 * yr * yr) / (2.0 * sigma2)).exp();
            let v = envelope * (freq * xr).cos();
            sum += v;
            kernel.push(v);
        }
    }
    // Zero-mean so flat regions produce no response.
    let mean = sum / (size * size) as f32;
    for v in kernel.iter_mut() {
        *v -= mean;
    }
    kernel
}

fn convolve(src: &Array2<f32>, kernel: &[f32], radius: i32) -> Array2<f32> {
    let (rows, cols) = src.dim();
    let width = (2 * radius + 1) as usize;
    let mut out = Array2::<f32>::zeros((rows, cols));
    for r in 0..rows {
        for c in 0..cols {
            let mut acc = 0.0f32;
            for ky in -radius..=radius {
                let rr = (r as i32 + ky).clamp(0, rows as i32 - 1) as usize;
                for kx in -radius..=radius {
                    let cc = (c as i32 + kx).clamp(0, cols as i32 - 1) as usize;
                    let k = kernel[(ky + radius) as usize * width + (kx + radius) as usize];
                    acc += src[(rr, cc)] * k;
                }
            }
            out[(r, c)] = acc;
        }
    }
    out
}

fn normalize(img: &GrayImage) -> Option<GrayImage> {
    let min = img.pixels().map(|p| p.0[0]).min()?;
    let max = img.pixels().map(|p| p.0[0]).max()?;
    if max == min {
        return None;
    }
    let scale = 255.0 / (max - min) as f32;
    let mut out = img.clone();
    for p in out.pixels_mut() {
        p.0[0] = ((p.0[0] - min) as f32 * scale).clamp(0.0, 255.0) as u8;
    }
    Some(out)
}

/// Gaussian-weighted adaptive threshold: a pixel is foreground when it
/// exceeds its local Gaussian mean minus `c`. Block 11 maps to sigma 2.0.
fn adaptive_gaussian_threshold(img: &GrayImage, c: f32) -> GrayImage {
    let local_mean = gaussian_blur_f32(img, 2.0);
    let mut out = GrayImage::new(img.width(), img.height());
    for (x, y, p) in out.enumerate_pixels_mut() {
        let v = img.get_pixel(x, y).0[0] as f32;
        let m = local_mean.get_pixel(x, y).0[0] as f32;
        *p = image::Luma([if v > m - c { 255 } else { 0 }]);
    }
    out
}

// src/core/features/detector.rs
//! Scale-invariant local feature detector: Gaussian/DoG pyramid, extrema
//! refinement, orientation assignment and 4x4x8 gradient descriptors.
//! One instance is built at startup and shared immutably across requests;
//! detection parameters must be identical for probes and stored templates.

use image::GrayImage;
use ndarray::Array2;

use crate::core::features::keypoint::{Keypoint, DESCRIPTOR_DIM};
use crate::utils::config::DetectorConfig;

const OCTAVE_LAYERS: usize = 3;
const IMG_BORDER: i32 = 5;
const MAX_INTERP_STEPS: usize = 5;
const ORI_HIST_BINS: usize = 36;
const ORI_SIGMA_FACTOR: f32 = 1.5;
const ORI_PEAK_RATIO: f32 = 0.8;
const DESCR_WIDTH: usize = 4;
const DESCR_BINS: usize = 8;
const DESCR_SCALE_FACTOR: f32 = 3.0;
const DESCR_MAG_THRESHOLD: f32 = 0.2;
const DESCR_INT_FACTOR: f32 = 512.0;
/// Assumed blur of the raw input image.
const INIT_SIGMA: f32 = 0.5;

pub struct FeatureDetector {
    nfeatures: usize,
    contrast_threshold: f32,
    edge_threshold: f32,
    sigma: f32,
}

/// Octave-local anchor for a detected keypoint, kept alongside the public
/// keypoint so the descriptor pass can revisit the right pyramid image.
struct Anchor {
    octave: usize,
    layer: usize,
    r: f32,
    c: f32,
    scl_octv: f32,
}

impl FeatureDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            nfeatures: config.fp_sift_features,
            contrast_threshold: config.fp_sift_contrast,
            edge_threshold: config.fp_sift_edge,
            sigma: config.fp_sift_sigma,
        }
    }

    /// Detect keypoints and compute their descriptors over a conditioned
    /// grayscale region of interest. Returns the keypoints (strongest
    /// `nfeatures` by response) and the matching N x 128 matrix.
    pub fn detect_and_compute(&self, image: &GrayImage) -> (Vec<Keypoint>, Array2<f32>) {
        let (width, height) = image.dimensions();
        let min_dim = width.min(height);
        if min_dim < (2 * IMG_BORDER + 2) as u32 {
            return (Vec::new(), Array2::zeros((0, DESCRIPTOR_DIM)));
        }

        let base = self.base_image(image);
        let n_octaves = (((min_dim as f32).log2() as i32) - 2).max(1) as usize;
        let gauss = self.build_gaussian_pyramid(base, n_octaves);
        let dog = build_dog_pyramid(&gauss);

        let (all_keypoints, all_anchors) = self.find_extrema(&gauss, &dog);

        // Keep the strongest responses; ties keep their scan order so the
        // cap stays deterministic.
        let mut order: Vec<usize> = (0..all_keypoints.len()).collect();
        order.sort_by(|&a, &b| {
            all_keypoints[b]
                .response
                .partial_cmp(&all_keypoints[a].response)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        if order.len() > self.nfeatures {
            order.truncate(self.nfeatures);
        }
        let keypoints: Vec<Keypoint> = order.iter().map(|&i| all_keypoints[i].clone()).collect();
        let anchors: Vec<Anchor> = order
            .iter()
            .map(|&i| Anchor {
                octave: all_anchors[i].octave,
                layer: all_anchors[i].layer,
                r: all_anchors[i].r,
                c: all_anchors[i].c,
                scl_octv: all_anchors[i].scl_octv,
            })
            .collect();

        let mut descriptors = Array2::<f32>::zeros((keypoints.len(), DESCRIPTOR_DIM));
        for (row, (kp, anchor)) in keypoints.iter().zip(anchors.iter()).enumerate() {
            let img = &gauss[anchor.octave][anchor.layer];
            let desc = compute_descriptor(img, anchor.r, anchor.c, kp.angle, anchor.scl_octv);
            for (col, v) in desc.iter().enumerate() {
                descriptors[(row, col)] = *v;
            }
        }

        (keypoints, descriptors)
    }

    fn base_image(&self, image: &GrayImage) -> Array2<f32> {
        let (width, height) = image.dimensions();
        let mut out = Array2::<f32>::zeros((height as usize, width as usize));
        for (x, y, p) in image.enumerate_pixels() {
            out[(y as usize, x as usize)] = p.0[0] as f32 / 255.0;
        }
        let sigma_diff = (self.sigma * self.sigma - INIT_SIGMA * INIT_SIGMA)
            .max(0.01)
            .sqrt();
        gaussian_blur(&out, sigma_diff)
    }

    fn build_gaussian_pyramid(&self, base: Array2<f32>, n_octaves: usize) -> Vec<Vec<Array2<f32>>> {
        let per_octave = OCTAVE_LAYERS + 3;
        // Incremental blur amounts between successive layers.
        let k = 2f32.powf(1.0 / OCTAVE_LAYERS as f32);
        let mut sig = vec![0.0f32; per_octave];
        sig[0] = self.sigma;
        for (i, s) in sig.iter_mut().enumerate().skip(1) {
            let sig_prev = self.sigma * k.powi(i as i32 - 1);
            let sig_total = sig_prev * k;
            *s = (sig_total * sig_total - sig_prev * sig_prev).sqrt();
        }

        let mut pyramid: Vec<Vec<Array2<f32>>> = Vec::with_capacity(n_octaves);
        for octave in 0..n_octaves {
            let mut layers: Vec<Array2<f32>> = Vec::with_capacity(per_octave);
            let first = if octave == 0 {
                base.clone()
            } else {
                // Next octave starts from the layer with twice the base sigma.
                downsample(&pyramid[octave - 1][OCTAVE_LAYERS])
            };
            layers.push(first);
            for i in 1..per_octave {
                let blurred = gaussian_blur(&layers[i - 1], sig[i]);
                layers.push(blurred);
            }
            pyramid.push(layers);
        }
        pyramid
    }

    fn find_extrema(
        &self,
        gauss: &[Vec<Array2<f32>>],
        dog: &[Vec<Array2<f32>>],
    ) -> (Vec<Keypoint>, Vec<Anchor>) {
        let prelim_threshold = 0.5 * self.contrast_threshold / OCTAVE_LAYERS as f32;
        let mut keypoints = Vec::new();
        let mut anchors = Vec::new();

        for (octave, dog_octave) in dog.iter().enumerate() {
            for layer in 1..=OCTAVE_LAYERS {
                let img = &dog_octave[layer];
                let (rows, cols) = img.dim();
                if rows <= 2 * IMG_BORDER as usize || cols <= 2 * IMG_BORDER as usize {
                    continue;
                }
                for r in IMG_BORDER as usize..rows - IMG_BORDER as usize {
                    for c in IMG_BORDER as usize..cols - IMG_BORDER as usize {
                        let v = img[(r, c)];
                        if v.abs() <= prelim_threshold {
                            continue;
                        }
                        if !is_local_extremum(dog_octave, layer, r, c, v) {
                            continue;
                        }
                        if let Some(refined) =
                            self.refine_extremum(dog_octave, layer, r, c)
                        {
                            let (layer_f, r_f, c_f, xi, contrast) = refined;
                            let scl_octv =
                                self.sigma * 2f32.powf((layer_f as f32 + xi) / OCTAVE_LAYERS as f32);
                            let scale = (1u32 << octave) as f32;
                            let kp_base = Keypoint {
                                x: c_f * scale,
                                y: r_f * scale,
                                size: scl_octv * scale * 2.0,
                                angle: 0.0,
                                response: contrast.abs(),
                                octave: octave as i32,
                                class_id: -1,
                            };

                            let ori_img = &gauss[octave][layer_f];
                            let radius = (3.0 * ORI_SIGMA_FACTOR * scl_octv).round() as i32;
                            let hist = orientation_histogram(
                                ori_img,
                                r_f.round() as i32,
                                c_f.round() as i32,
                                radius,
                                ORI_SIGMA_FACTOR * scl_octv,
                            );
                            let max_val = hist.iter().cloned().fold(f32::MIN, f32::max);
                            let mag_threshold = max_val * ORI_PEAK_RATIO;
                            for bin in 0..ORI_HIST_BINS {
                                let left = (bin + ORI_HIST_BINS - 1) % ORI_HIST_BINS;
                                let right = (bin + 1) % ORI_HIST_BINS;
                                if hist[bin] > hist[left]
                                    && hist[bin] > hist[right]
                                    && hist[bin] >= mag_threshold
                                {
                                    let interp = 0.5 * (hist[left] - hist[right])
                                        / (hist[left] - 2.0 * hist[bin] + hist[right]);
                                    let b = bin as f32 + interp;
                                    let b = if b < 0.0 {
                                        b + ORI_HIST_BINS as f32
                                    } else if b >= ORI_HIST_BINS as f32 {
                                        b - ORI_HIST_BINS as f32
                                    } else {
                                        b
                                    };
                                    let mut angle =
                                        360.0 - b * (360.0 / ORI_HIST_BINS as f32);
                                    if (angle - 360.0).abs() < f32::EPSILON {
                                        angle = 0.0;
                                    }
                                    let mut kp = kp_base.clone();
                                    kp.angle = angle;
                                    keypoints.push(kp);
                                    anchors.push(Anchor {
                                        octave,
                                        layer: layer_f,
                                        r: r_f,
                                        c: c_f,
                                        scl_octv,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
        (keypoints, anchors)
    }

    /// Sub-pixel/scale refinement via a quadratic fit; rejects low-contrast
    /// and edge-like responses. Returns (layer, row, col, layer offset,
    /// contrast) in octave coordinates.
    fn refine_extremum(
        &self,
        dog_octave: &[Array2<f32>],
        layer: usize,
        r: usize,
        c: usize,
    ) -> Option<(usize, f32, f32, f32, f32)> {
        let mut layer = layer as i32;
        let mut r = r as i32;
        let mut c = c as i32;

        for step in 0..=MAX_INTERP_STEPS {
            if step == MAX_INTERP_STEPS {
                return None;
            }
            let img = &dog_octave[layer as usize];
            let prev = &dog_octave[layer as usize - 1];
            let next = &dog_octave[layer as usize + 1];
            let (rows, cols) = img.dim();
            let (ru, cu) = (r as usize, c as usize);

            let v = img[(ru, cu)];
            let dx = (img[(ru, cu + 1)] - img[(ru, cu - 1)]) * 0.5;
            let dy = (img[(ru + 1, cu)] - img[(ru - 1, cu)]) * 0.5;
            let ds = (next[(ru, cu)] - prev[(ru, cu)]) * 0.5;

            let dxx = img[(ru, cu + 1)] + img[(ru, cu - 1)] - 2.0 * v;
            let dyy = img[(ru + 1, cu)] + img[(ru - 1, cu)] - 2.0 * v;
            let dss = next[(ru, cu)] + prev[(ru, cu)] - 2.0 * v;
            let dxy = (img[(ru + 1, cu + 1)] - img[(ru + 1, cu - 1)]
                - img[(ru - 1, cu + 1)]
                + img[(ru - 1, cu - 1)])
                * 0.25;
            let dxs = (next[(ru, cu + 1)] - next[(ru, cu - 1)] - prev[(ru, cu + 1)]
                + prev[(ru, cu - 1)])
                * 0.25;
            let dys = (next[(ru + 1, cu)] - next[(ru - 1, cu)] - prev[(ru + 1, cu)]
                + prev[(ru - 1, cu)])
                * 0.25;

            let h = [[dxx, dxy, dxs], [dxy, dyy, dys], [dxs, dys, dss]];
            let g = [dx, dy, ds];
            let solution = solve3(h, g)?;
            let offset = [-solution[0], -solution[1], -solution[2]];

            if offset[0].abs() < 0.5 && offset[1].abs() < 0.5 && offset[2].abs() < 0.5 {
                let contrast = v + 0.5 * (dx * offset[0] + dy * offset[1] + ds * offset[2]);
                if contrast.abs() * (OCTAVE_LAYERS as f32) < self.contrast_threshold {
                    return None;
                }
                let tr = dxx + dyy;
                let det = dxx * dyy - dxy * dxy;
                let e = self.edge_threshold;
                if det <= 0.0 || tr * tr * e >= (e + 1.0) * (e + 1.0) * det {
                    return None;
                }
                return Some((
                    layer as usize,
                    r as f32 + offset[1],
                    c as f32 + offset[0],
                    offset[2],
                    contrast,
                ));
            }

            c += offset[0].round() as i32;
            r += offset[1].round() as i32;
            layer += offset[2].round() as i32;

            if layer < 1
                || layer > OCTAVE_LAYERS as i32
                || r < IMG_BORDER
                || r >= rows as i32 - IMG_BORDER
                || c < IMG_BORDER
                || c >= cols as i32 - IMG_BORDER
            {
                return None;
            }
        }
        None
    }
}

fn build_dog_pyramid(gauss: &[Vec<Array2<f32>>]) -> Vec<Vec<Array2<f32>>> {
    gauss
        .iter()
        .map(|octave| {
            octave
                .windows(2)
                .map(|pair| &pair[1] - &pair[0])
                .collect()
        })
        .collect()
}

fn is_local_extremum(
    dog_octave: &[Array2<f32>],
    layer: usize,
    r: usize,
    c: usize,
    v: f32,
) -> bool {
    let positive = v > 0.0;
    for img in &dog_octave[layer - 1..=layer + 1] {
        for dr in -1i32..=1 {
            for dc in -1i32..=1 {
                let n = img[((r as i32 + dr) as usize, (c as i32 + dc) as usize)];
                if positive {
                    if v < n {
                        return false;
                    }
                } else if v > n {
                    return false;
                }
            }
        }
    }
    true
}

fn solve3(h: [[f32; 3]; 3], g: [f32; 3]) -> Option<[f32; 3]> {
    let det = h[0][0] * (h[1][1] * h[2][2] - h[1][2] * h[2][1])
        - h[0][1] * (h[1][0] * h[2][2] - h[1][2] * h[2][0])
        + h[0][2] * (h[1][0] * h[2][1] - h[1][1] * h[2][0]);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv = 1.0 / det;
    let mut x = [0.0f32; 3];
    for i in 0..3 {
        let mut m = h;
        for row in 0..3 {
            m[row][i] = g[row];
        }
        x[i] = inv
            * (m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
                - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
                + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]));
    }
    Some(x)
}

fn orientation_histogram(
    img: &Array2<f32>,
    r: i32,
    c: i32,
    radius: i32,
    sigma: f32,
) -> [f32; ORI_HIST_BINS] {
    let (rows, cols) = img.dim();
    let expf_scale = -1.0 / (2.0 * sigma * sigma);
    let mut raw = [0.0f32; ORI_HIST_BINS];

    for i in -radius..=radius {
        let y = r + i;
        if y <= 0 || y as usize >= rows - 1 {
            continue;
        }
        for j in -radius..=radius {
            let x = c + j;
            if x <= 0 || x as usize >= cols - 1 {
                continue;
            }
            let (yu, xu) = (y as usize, x as usize);
            let dx = img[(yu, xu + 1)] - img[(yu, xu - 1)];
            let dy = img[(yu - 1, xu)] - img[(yu + 1, xu)];
            let mag = (dx * dx + dy * dy).sqrt();
            let weight = ((i * i + j * j) as f32 * expf_scale).exp();
            let mut ori = dy.atan2(dx).to_degrees();
            if ori < 0.0 {
                ori += 360.0;
            }
            let bin = ((ori * ORI_HIST_BINS as f32 / 360.0).round() as i32)
                .rem_euclid(ORI_HIST_BINS as i32) as usize;
            raw[bin] += mag * weight;
        }
    }

    // Circular smoothing, same taps as the classical implementation.
    let mut hist = [0.0f32; ORI_HIST_BINS];
    for i in 0..ORI_HIST_BINS {
        let m2 = raw[(i + ORI_HIST_BINS - 2) % ORI_HIST_BINS];
        let m1 = raw[(i + ORI_HIST_BINS - 1) % ORI_HIST_BINS];
        let p1 = raw[(i + 1) % ORI_HIST_BINS];
        let p2 = raw[(i + 2) % ORI_HIST_BINS];
        hist[i] = (m2 + p2) * (1.0 / 16.0) + (m1 + p1) * (4.0 / 16.0) + raw[i] * (6.0 / 16.0);
    }
    hist
}

fn compute_descriptor(
    img: &Array2<f32>,
    r: f32,
    c: f32,
    angle_deg: f32,
    scl: f32,
) -> [f32; DESCRIPTOR_DIM] {
    let (rows, cols) = img.dim();
    let d = DESCR_WIDTH;
    let n = DESCR_BINS;

    let pt_r = r.round() as i32;
    let pt_c = c.round() as i32;
    let angle = 360.0 - angle_deg;
    let cos_t = angle.to_radians().cos();
    let sin_t = angle.to_radians().sin();
    let bins_per_rad = n as f32 / 360.0;
    let exp_scale = -1.0 / (d as f32 * d as f32 * 0.5);
    let hist_width = DESCR_SCALE_FACTOR * scl;
    let radius = (hist_width * std::f32::consts::SQRT_2 * (d as f32 + 1.0) * 0.5).round() as i32;
    // Clamp against pathological scales on tiny images.
    let radius = radius.min(((rows * rows + cols * cols) as f32).sqrt() as i32);
    let cos_t = cos_t / hist_width;
    let sin_t = sin_t / hist_width;

    let hist_len = (d + 2) * (d + 2) * (n + 2);
    let mut hist = vec![0.0f32; hist_len];

    for i in -radius..=radius {
        for j in -radius..=radius {
            let c_rot = j as f32 * cos_t - i as f32 * sin_t;
            let r_rot = j as f32 * sin_t + i as f32 * cos_t;
            let rbin = r_rot + d as f32 / 2.0 - 0.5;
            let cbin = c_rot + d as f32 / 2.0 - 0.5;
            let rr = pt_r + i;
            let cc = pt_c + j;

            if rbin > -1.0
                && rbin < d as f32
                && cbin > -1.0
                && cbin < d as f32
                && rr > 0
                && (rr as usize) < rows - 1
                && cc > 0
                && (cc as usize) < cols - 1
            {
                let (ru, cu) = (rr as usize, cc as usize);
                let dx = img[(ru, cu + 1)] - img[(ru, cu - 1)];
                let dy = img[(ru - 1, cu)] - img[(ru + 1, cu)];
                let mut grad_ori = dy.atan2(dx).to_degrees();
                if grad_ori < 0.0 {
                    grad_ori += 360.0;
                }
                let obin = (grad_ori - angle_deg) * bins_per_rad;
                let mag = (dx * dx + dy * dy).sqrt()
                    * ((c_rot * c_rot + r_rot * r_rot) * exp_scale).exp();

                let r0 = rbin.floor();
                let c0 = cbin.floor();
                let o0 = obin.floor();
                let d_r = rbin - r0;
                let d_c = cbin - c0;
                let d_o = obin - o0;
                let o0 = {
                    let mut o = o0 as i32 % n as i32;
                    if o < 0 {
                        o += n as i32;
                    }
                    o as usize
                };
                let (r0, c0) = (r0 as i32, c0 as i32);

                // Trilinear interpolation into the (d+2)^2 x (n+2) working
                // grid; the +1 offsets leave room for spill rows/cols.
                let v_r1 = mag * d_r;
                let v_r0 = mag - v_r1;
                let v_rc11 = v_r1 * d_c;
                let v_rc10 = v_r1 - v_rc11;
                let v_rc01 = v_r0 * d_c;
                let v_rc00 = v_r0 - v_rc01;
                let v_rco111 = v_rc11 * d_o;
                let v_rco110 = v_rc11 - v_rco111;
                let v_rco101 = v_rc10 * d_o;
                let v_rco100 = v_rc10 - v_rco101;
                let v_rco011 = v_rc01 * d_o;
                let v_rco010 = v_rc01 - v_rco011;
                let v_rco001 = v_rc00 * d_o;
                let v_rco000 = v_rc00 - v_rco001;

                let idx = ((r0 + 1) as usize * (d + 2) + (c0 + 1) as usize) * (n + 2) + o0;
                hist[idx] += v_rco000;
                hist[idx + 1] += v_rco001;
                hist[idx + (n + 2)] += v_rco010;
                hist[idx + (n + 3)] += v_rco011;
                hist[idx + (d + 2) * (n + 2)] += v_rco100;
                hist[idx + (d + 2) * (n + 2) + 1] += v_rco101;
                hist[idx + (d + 3) * (n + 2)] += v_rco110;
                hist[idx + (d + 3) * (n + 2) + 1] += v_rco111;
            }
        }
    }

    // Fold the circular orientation spill and copy the interior cells out.
    let mut dst = [0.0f32; DESCRIPTOR_DIM];
    for i in 0..d {
        for j in 0..d {
            let idx = ((i + 1) * (d + 2) + (j + 1)) * (n + 2);
            hist[idx] += hist[idx + n];
            hist[idx + 1] += hist[idx + n + 1];
            for k in 0..n {
                dst[(i * d + j) * n + k] = hist[idx + k];
            }
        }
    }

    let mut nrm2: f32 = dst.iter().map(|v| v * v).sum();
    let threshold = nrm2.sqrt() * DESCR_MAG_THRESHOLD;
    for v in dst.iter_mut() {
        if *v > threshold {
            *v = threshold;
        }
    }
    nrm2 = dst.iter().map(|v| v * v).sum();
    let factor = DESCR_INT_FACTOR / nrm2.sqrt().max(f32::EPSILON);
    for v in dst.iter_mut() {
        *v = (*v * factor).round().clamp(0.0, 255.0);
    }
    dst
}

fn gaussian_blur(src: &Array2<f32>, sigma: f32) -> Array2<f32> {
    let radius = (sigma * 4.0).ceil().max(1.0) as i32;
    let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
    let denom = -1.0 / (2.0 * sigma * sigma);
    for i in -radius..=radius {
        kernel.push(((i * i) as f32 * denom).exp());
    }
    let sum: f32 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= sum;
    }

    let (rows, cols) = src.dim();
    let clamp_r = |v: i32| v.clamp(0, rows as i32 - 1) as usize;
    let clamp_c = |v: i32| v.clamp(0, cols as i32 - 1) as usize;

    // Horizontal pass.
    let mut tmp = Array2::<f32>::zeros((rows, cols));
    for r in 0..rows {
        for c in 0..cols {
            let mut acc = 0.0;
            for (ki, k) in kernel.iter().enumerate() {
                let cc = clamp_c(c as i32 + ki as i32 - radius);
                acc += src[(r, cc)] * k;
            }
            tmp[(r, c)] = acc;
        }
    }
    // Vertical pass.
    let mut out = Array2::<f32>::zeros((rows, cols));
    for r in 0..rows {
        for c in 0..cols {
            let mut acc = 0.0;
            for (ki, k) in kernel.iter().enumerate() {
                let rr = clamp_r(r as i32 + ki as i32 - radius);
                acc += tmp[(rr, c)] * k;
            }
            out[(r, c)] = acc;
        }
    }
    out
}

fn downsample(src: &Array2<f32>) -> Array2<f32> {
    let (rows, cols) = src.dim();
    let (nr, nc) = ((rows / 2).max(1), (cols / 2).max(1));
    let mut out = Array2::<f32>::zeros((nr, nc));
    for r in 0..nr {
        for c in 0..nc {
            out[(r, c)] = src[(r * 2, c * 2)];
        }
    }
    out
}

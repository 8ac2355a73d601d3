// src/core/matcher/score.rs
use ndarray::Array2;
use rayon::prelude::*;

/// Nearest-neighbor descriptor scoring with Lowe's ratio test: for every
/// probe descriptor, find its two closest template descriptors under L2
/// and keep the match iff `d1 < ratio * d2`. Ties fail the strict
/// inequality and are discarded. The score is the survivor count.
///
/// Distances are compared squared; the ratio carries over as `ratio^2`.
pub fn ratio_test_score(probe: &Array2<f32>, template: &Array2<f32>, ratio: f32) -> u32 {
    if template.nrows() < 2 || probe.nrows() == 0 {
        return 0;
    }
    let ratio_sq = ratio * ratio;

    (0..probe.nrows())
        .into_par_iter()
        .filter(|&i| {
            let p = probe.row(i);
            let mut best = f32::MAX;
            let mut second = f32::MAX;
            for j in 0..template.nrows() {
                let t = template.row(j);
                let mut dist = 0.0f32;
                for (a, b) in p.iter().zip(t.iter()) {
                    let d = a - b;
                    dist += d * d;
                }
                if dist < best {
                    second = best;
                    best = dist;
                } else if dist < second {
                    second = dist;
                }
            }
            best < ratio_sq * second
        })
        .count() as u32
}

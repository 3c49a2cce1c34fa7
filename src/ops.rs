//! Core numeric kernels for Gemma inference.

use rayon::prelude::*;

/// sqrt(2 / pi), the tanh-GELU input scale.
const GELU_SQRT_2_OVER_PI: f32 = 0.797_884_6;
/// Cubic correction term of the tanh-GELU approximation.
const GELU_CUBIC: f32 = 0.044_715;

/// Dot product with a fixed left-to-right reduction order.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        acc += x * y;
    }
    acc
}

/// Matrix-vector multiplication: xout = x @ w.T (w is row-major [out, in]).
///
/// Output rows are computed in parallel; each row's reduction is sequential,
/// so results do not depend on the thread count.
#[inline]
pub fn matmul(xout: &mut [f32], x: &[f32], w: &[f32]) {
    let in_dim = x.len();
    xout.par_iter_mut().enumerate().for_each(|(i, out)| {
        let off = i * in_dim;
        *out = dot(&w[off..off + in_dim], x);
    });
}

/// `xout = x @ (w * scale[:, None]).T` for row-major int8 `w`.
///
/// Each weight row is dequantized inside its own reduction, so the result
/// matches `matmul` over the dequantized matrix without materializing it.
#[inline]
pub fn matmul_q8(xout: &mut [f32], x: &[f32], w: &[i8], scale: &[f32]) {
    let in_dim = x.len();
    xout.par_iter_mut()
        .zip(scale.par_iter())
        .enumerate()
        .for_each(|(i, (out, &s))| {
            let off = i * in_dim;
            let mut acc = 0.0f32;
            for (&q, &xi) in w[off..off + in_dim].iter().zip(x) {
                acc += (q as f32 * s) * xi;
            }
            *out = acc;
        });
}

/// Element-wise accumulation: a += b.
#[inline]
pub fn accum(a: &mut [f32], b: &[f32]) {
    for (ai, bi) in a.iter_mut().zip(b.iter()) {
        *ai += *bi;
    }
}

/// Softmax in-place.
#[inline]
pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let max_val = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for xi in x.iter_mut() {
        *xi = (*xi - max_val).exp();
        sum += *xi;
    }
    for xi in x.iter_mut() {
        *xi /= sum;
    }
}

/// Tanh-approximate GELU, in-place.
#[inline]
pub fn gelu_tanh(x: &mut [f32]) {
    for v in x.iter_mut() {
        let u = *v;
        let inner = GELU_SQRT_2_OVER_PI * (u + GELU_CUBIC * u * u * u);
        *v = 0.5 * u * (1.0 + inner.tanh());
    }
}

/// Gated product: gate = gelu_tanh(gate) * up.
#[inline]
pub fn gelu_gate(gate: &mut [f32], up: &[f32]) {
    gelu_tanh(gate);
    for (g, u) in gate.iter_mut().zip(up.iter()) {
        *g *= u;
    }
}

/// Returns the index of the maximum element; the first one wins on ties.
#[inline]
pub fn argmax(x: &[f32]) -> usize {
    let mut max_idx = 0;
    let mut max_val = f32::NEG_INFINITY;
    for (i, &v) in x.iter().enumerate() {
        if v > max_val {
            max_val = v;
            max_idx = i;
        }
    }
    max_idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_is_x_times_w_transposed() {
        // w = [[1, 2], [3, 4], [5, 6]], x = [1, -1]
        let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut out = [0.0; 3];
        matmul(&mut out, &[1.0, -1.0], &w);
        assert_eq!(out, [-1.0, -1.0, -1.0]);
    }

    #[test]
    fn softmax_sums_to_one_and_ignores_sentinel() {
        let mut x = [1.0, 2.0, -2.381_976_3e38];
        softmax(&mut x);
        assert!((x[0] + x[1] - 1.0).abs() < 1e-6);
        assert_eq!(x[2], 0.0);
    }

    #[test]
    fn gelu_tanh_matches_reference_points() {
        let mut x = [0.0f32, 1.0, -1.0, 3.0];
        gelu_tanh(&mut x);
        assert_eq!(x[0], 0.0);
        assert!((x[1] - 0.841_192).abs() < 1e-5);
        assert!((x[2] + 0.158_808).abs() < 1e-5);
        assert!((x[3] - 2.996_363_7).abs() < 1e-5);
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        assert_eq!(argmax(&[0.5, 2.0, 2.0, -1.0]), 1);
        assert_eq!(argmax(&[3.0]), 0);
    }
}

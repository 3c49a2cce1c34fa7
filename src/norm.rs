//! RMS normalization.

use crate::error::{GemmaError, Result};
use crate::tensor::Tensor;

/// RMSNorm epsilon used by Gemma checkpoints.
pub const RMS_EPS: f32 = 1e-6;

/// Variance-only normalization with a learned scale and no bias.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Vec<f32>,
    eps: f32,
    /// Scale by `1 + weight` instead of `weight`.
    add_unit_offset: bool,
}

impl RmsNorm {
    /// Gemma's unit-offset variant.
    pub fn new(weight: Vec<f32>, eps: f32) -> Self {
        RmsNorm {
            weight,
            eps,
            add_unit_offset: true,
        }
    }

    /// Plain `norm(x) * weight` variant.
    pub fn without_unit_offset(weight: Vec<f32>, eps: f32) -> Self {
        RmsNorm {
            weight,
            eps,
            add_unit_offset: false,
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.weight.len()
    }

    /// Normalize every last-axis row of `x`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if x.last_dim() != self.dim() {
            return Err(GemmaError::Shape(format!(
                "rms_norm of width {} applied to {:?}",
                self.dim(),
                x.shape()
            )));
        }
        let mut out = Tensor::zeros(x.shape());
        let width = self.dim();
        for (dst, src) in out.data_mut().chunks_exact_mut(width).zip(x.rows()) {
            self.normalize_row(dst, src);
        }
        Ok(out)
    }

    #[inline]
    fn normalize_row(&self, dest: &mut [f32], src: &[f32]) {
        let ss: f32 = src.iter().map(|v| v * v).sum();
        let inv = 1.0 / (ss / src.len() as f32 + self.eps).sqrt();
        for ((d, &s), &w) in dest.iter_mut().zip(src).zip(&self.weight) {
            let scale = if self.add_unit_offset { 1.0 + w } else { w };
            *d = (s * inv) * scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_weight_with_unit_offset_is_pure_normalization() {
        let norm = RmsNorm::new(vec![0.0; 4], RMS_EPS);
        let x = Tensor::from_vec(&[1, 4], vec![2.0, -2.0, 2.0, -2.0]).unwrap();
        let y = norm.forward(&x).unwrap();
        for (got, want) in y.data().iter().zip([1.0, -1.0, 1.0, -1.0]) {
            assert!((got - want).abs() < 1e-5);
        }
    }

    #[test]
    fn plain_variant_scales_by_weight() {
        let norm = RmsNorm::without_unit_offset(vec![0.5, 2.0], RMS_EPS);
        let x = Tensor::from_vec(&[2], vec![3.0, 3.0]).unwrap();
        let y = norm.forward(&x).unwrap();
        assert!((y.data()[0] - 0.5).abs() < 1e-5);
        assert!((y.data()[1] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_width_mismatch() {
        let norm = RmsNorm::new(vec![0.0; 3], RMS_EPS);
        let x = Tensor::zeros(&[2, 4]);
        assert!(matches!(norm.forward(&x), Err(GemmaError::Shape(_))));
    }

    proptest! {
        #[test]
        fn normalized_rows_have_unit_mean_square(
            values in prop::collection::vec(-50.0f32..50.0, 8),
        ) {
            let ms: f32 = values.iter().map(|v| v * v).sum::<f32>() / 8.0;
            prop_assume!(ms > 1e-2);
            let norm = RmsNorm::new(vec![0.0; 8], RMS_EPS);
            let x = Tensor::from_vec(&[1, 8], values).unwrap();
            let y = norm.forward(&x).unwrap();
            let out_ms: f32 = y.data().iter().map(|v| v * v).sum::<f32>() / 8.0;
            prop_assert!((out_ms - 1.0).abs() < 1e-3);
        }
    }
}

//! Linear projections and the tied token embedding.
//!
//! The dense/quantized choice is made once when a projection is built. A
//! quantized projection keeps its int8 weights and per-output-channel
//! scales as loaded and dequantizes one row at a time inside the matmul.

use crate::error::{GemmaError, Result};
use crate::ops::{accum, matmul, matmul_q8};
use crate::tensor::Tensor;

/// `[*, in_features] -> [*, out_features]` via `x @ W.T`.
#[derive(Debug, Clone)]
pub enum Linear {
    Dense {
        /// Row-major `[out_features, in_features]`
        weight: Vec<f32>,
        in_features: usize,
        out_features: usize,
    },
    Quantized {
        /// Row-major `[out_features, in_features]`
        weight: Vec<i8>,
        /// One scale per output channel
        scale: Vec<f32>,
        in_features: usize,
        out_features: usize,
    },
}

impl Linear {
    pub fn dense(weight: Vec<f32>, in_features: usize, out_features: usize) -> Result<Self> {
        check_len("dense weight", weight.len(), in_features * out_features)?;
        Ok(Linear::Dense {
            weight,
            in_features,
            out_features,
        })
    }

    pub fn quantized(
        weight: Vec<i8>,
        scale: Vec<f32>,
        in_features: usize,
        out_features: usize,
    ) -> Result<Self> {
        check_len("quantized weight", weight.len(), in_features * out_features)?;
        check_len("weight scale", scale.len(), out_features)?;
        Ok(Linear::Quantized {
            weight,
            scale,
            in_features,
            out_features,
        })
    }

    #[inline]
    pub fn in_features(&self) -> usize {
        match self {
            Linear::Dense { in_features, .. } | Linear::Quantized { in_features, .. } => {
                *in_features
            }
        }
    }

    #[inline]
    pub fn out_features(&self) -> usize {
        match self {
            Linear::Dense { out_features, .. } | Linear::Quantized { out_features, .. } => {
                *out_features
            }
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Linear::Quantized { .. })
    }

    /// Dequantize a single weight row: `weight[row] * scale[row]`.
    pub fn row(&self, row: usize) -> Vec<f32> {
        match self {
            Linear::Dense {
                weight,
                in_features,
                ..
            } => weight[row * in_features..(row + 1) * in_features].to_vec(),
            Linear::Quantized {
                weight,
                scale,
                in_features,
                ..
            } => weight[row * in_features..(row + 1) * in_features]
                .iter()
                .map(|&q| q as f32 * scale[row])
                .collect(),
        }
    }

    /// Apply the projection to every last-axis row of `x`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let in_features = self.in_features();
        let out_features = self.out_features();
        if x.last_dim() != in_features {
            return Err(GemmaError::Shape(format!(
                "linear [{in_features} -> {out_features}] applied to {:?}",
                x.shape()
            )));
        }

        let mut shape = x.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = out_features;
        }
        let mut out = Tensor::zeros(&shape);
        for (dst, src) in out.data_mut().chunks_exact_mut(out_features).zip(x.rows()) {
            match self {
                Linear::Dense { weight, .. } => matmul(dst, src, weight),
                Linear::Quantized { weight, scale, .. } => matmul_q8(dst, src, weight, scale),
            }
        }
        Ok(out)
    }
}

fn check_len(what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(GemmaError::InvalidModel(format!(
            "{what} has {got} elements, expected {expected}"
        )));
    }
    Ok(())
}

/// Token embedding shared with the output head.
#[derive(Debug, Clone)]
pub struct Embedding {
    /// `[vocab_size, hidden_size]`, viewed as a hidden -> vocab projection
    table: Linear,
    /// Optional per-vocab logit bias
    bias: Option<Vec<f32>>,
}

impl Embedding {
    pub fn new(table: Linear) -> Self {
        Embedding { table, bias: None }
    }

    pub fn with_bias(mut self, bias: Vec<f32>) -> Result<Self> {
        check_len("embedding bias", bias.len(), self.vocab_size())?;
        self.bias = Some(bias);
        Ok(self)
    }

    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.table.out_features()
    }

    #[inline]
    pub fn hidden_size(&self) -> usize {
        self.table.in_features()
    }

    /// Look up `ids` (`[batch][seq]`) as `[batch, seq, hidden]`, scaled by
    /// `sqrt(hidden_size)`.
    pub fn embed(&self, ids: &[Vec<u32>]) -> Result<Tensor> {
        let batch = ids.len();
        let seq = ids.first().map_or(0, Vec::len);
        let hidden = self.hidden_size();
        let normalizer = (hidden as f32).sqrt();

        let mut data = Vec::with_capacity(batch * seq * hidden);
        for row in ids {
            if row.len() != seq {
                return Err(GemmaError::Shape(format!(
                    "ragged input ids: expected {seq} per sequence, got {}",
                    row.len()
                )));
            }
            for &id in row {
                let id = id as usize;
                if id >= self.vocab_size() {
                    return Err(GemmaError::InvalidRequest(format!(
                        "token id {id} outside vocabulary of {}",
                        self.vocab_size()
                    )));
                }
                data.extend(self.table.row(id).into_iter().map(|v| v * normalizer));
            }
        }
        Tensor::from_vec(&[batch, seq, hidden], data)
    }

    /// `hidden @ table.T (+ bias)` for `[batch, hidden]` input.
    pub fn logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let mut logits = self.table.forward(hidden)?;
        if let Some(bias) = &self.bias {
            for row in logits.data_mut().chunks_exact_mut(bias.len()) {
                accum(row, bias);
            }
        }
        Ok(logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `W = weight * scale[:, None]`.
    fn dequantize(weight: &[i8], scale: &[f32], in_features: usize) -> Vec<f32> {
        weight
            .chunks_exact(in_features)
            .zip(scale)
            .flat_map(|(row, &s)| row.iter().map(move |&q| q as f32 * s))
            .collect()
    }

    #[test]
    fn dense_forward_projects_each_row() {
        // W = [[1, 0], [0, 1], [1, 1]]
        let linear = Linear::dense(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], 2, 3).unwrap();
        let x = Tensor::from_vec(&[2, 1, 2], vec![1.0, 2.0, -1.0, 4.0]).unwrap();
        let y = linear.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 1, 3]);
        assert_eq!(y.data(), &[1.0, 2.0, 3.0, -1.0, 4.0, 3.0]);
    }

    #[test]
    fn quantized_matches_dense_with_dequantized_weight() {
        let q = vec![1i8, -2, 3, 4, -5, 6];
        let scale = vec![0.5, 0.25];
        let quant = Linear::quantized(q.clone(), scale.clone(), 3, 2).unwrap();
        let dense = Linear::dense(dequantize(&q, &scale, 3), 3, 2).unwrap();
        let x = Tensor::from_vec(&[1, 3], vec![0.3, -1.2, 2.0]).unwrap();
        assert_eq!(quant.forward(&x).unwrap(), dense.forward(&x).unwrap());
        assert_eq!(quant.row(1), vec![1.0, -1.25, 1.5]);
    }

    #[test]
    fn quantized_forward_matches_dense_across_rows() {
        // 5 outputs, 7 inputs, three input rows
        let q: Vec<i8> = (0..35).map(|i| ((i * 37) % 255 - 127) as i8).collect();
        let scale: Vec<f32> = (0..5).map(|r| 0.01 + r as f32 * 0.003).collect();
        let quant = Linear::quantized(q.clone(), scale.clone(), 7, 5).unwrap();
        let dense = Linear::dense(dequantize(&q, &scale, 7), 7, 5).unwrap();
        let x = Tensor::from_vec(&[3, 7], (0..21).map(|i| (i as f32 * 0.7).cos()).collect())
            .unwrap();
        let y = quant.forward(&x).unwrap();
        assert_eq!(y.shape(), &[3, 5]);
        assert_eq!(y, dense.forward(&x).unwrap());
    }

    #[test]
    fn construction_rejects_bad_shapes() {
        assert!(Linear::dense(vec![0.0; 5], 2, 3).is_err());
        assert!(Linear::quantized(vec![0; 6], vec![1.0; 3], 3, 2).is_err());
    }

    #[test]
    fn forward_rejects_wrong_input_width() {
        let linear = Linear::dense(vec![0.0; 6], 3, 2).unwrap();
        assert!(linear.forward(&Tensor::zeros(&[1, 2])).is_err());
    }

    #[test]
    fn embedding_scales_rows_and_ties_logits() {
        // vocab 3, hidden 4
        let table = Linear::dense((0..12).map(|v| v as f32).collect(), 4, 3).unwrap();
        let emb = Embedding::new(table);
        let h = emb.embed(&[vec![2, 0]]).unwrap();
        assert_eq!(h.shape(), &[1, 2, 4]);
        assert_eq!(&h.data()[..4], &[16.0, 18.0, 20.0, 22.0]);

        let hidden = Tensor::from_vec(&[1, 4], vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        let emb = emb.with_bias(vec![0.5, 0.5, 0.5]).unwrap();
        assert_eq!(emb.logits(&hidden).unwrap().data(), &[0.5, 4.5, 8.5]);
    }

    #[test]
    fn embedding_rejects_out_of_vocab_ids() {
        let emb = Embedding::new(Linear::dense(vec![0.0; 8], 4, 2).unwrap());
        assert!(matches!(
            emb.embed(&[vec![2]]),
            Err(GemmaError::InvalidRequest(_))
        ));
    }
}

//! Grouped-query self-attention with rotary embedding and a KV cache.

use crate::error::{GemmaError, Result};
use crate::kv_cache::LayerCache;
use crate::linear::Linear;
use crate::ops::{dot, softmax};
use crate::rope::{RotarySlice, apply_rotary};
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Self-attention for one layer, aligned with GemmaAttention.forward.
#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scaling: f32,
}

impl Attention {
    pub fn new(
        q_proj: Linear,
        k_proj: Linear,
        v_proj: Linear,
        o_proj: Linear,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> Result<Self> {
        if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
            return Err(GemmaError::Config(format!(
                "num_heads ({num_heads}) must be a multiple of num_kv_heads ({num_kv_heads})"
            )));
        }
        let hidden = q_proj.in_features();
        let expect = [
            ("q_proj", &q_proj, hidden, num_heads * head_dim),
            ("k_proj", &k_proj, hidden, num_kv_heads * head_dim),
            ("v_proj", &v_proj, hidden, num_kv_heads * head_dim),
            ("o_proj", &o_proj, num_heads * head_dim, hidden),
        ];
        for (name, proj, in_f, out_f) in expect {
            if proj.in_features() != in_f || proj.out_features() != out_f {
                return Err(GemmaError::InvalidModel(format!(
                    "{name} is [{} -> {}], expected [{in_f} -> {out_f}]",
                    proj.in_features(),
                    proj.out_features()
                )));
            }
        }

        Ok(Attention {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            num_kv_heads,
            head_dim,
            scaling: (head_dim as f32).powf(-0.5),
        })
    }

    #[inline]
    pub fn num_queries_per_kv(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Attend `hidden` (`[batch, seq, hidden]`) over the full cache.
    ///
    /// `write_positions` are the absolute positions of the `seq` inputs and
    /// `mask` is the `[seq, cache_len]` causal slice for them.
    pub fn forward(
        &self,
        hidden: &Tensor,
        rotary: &RotarySlice,
        write_positions: &[usize],
        cache: &mut LayerCache,
        mask: &Tensor,
    ) -> Result<Tensor> {
        hidden.expect_rank(3, "attention input")?;
        let (batch, seq) = (hidden.dim(0), hidden.dim(1));
        let (n_heads, n_kv, hd) = (self.num_heads, self.num_kv_heads, self.head_dim);
        if write_positions.len() != seq {
            return Err(GemmaError::Shape(format!(
                "{} write positions for {seq} inputs",
                write_positions.len()
            )));
        }
        if cache.batch() != batch || cache.num_kv_heads() != n_kv || cache.head_dim() != hd {
            return Err(GemmaError::Shape(format!(
                "cache [{}, _, {}, {}] does not match batch {batch}, {n_kv} kv heads of {hd}",
                cache.batch(),
                cache.num_kv_heads(),
                cache.head_dim()
            )));
        }
        let max_len = cache.max_len();
        if mask.shape() != [seq, max_len] {
            return Err(GemmaError::Shape(format!(
                "mask {:?}, expected [{seq}, {max_len}]",
                mask.shape()
            )));
        }

        // QKV projections
        let mut xq = self.q_proj.forward(hidden)?.reshape(&[batch, seq, n_heads, hd])?;
        let mut xk = self.k_proj.forward(hidden)?.reshape(&[batch, seq, n_kv, hd])?;
        let xv = self.v_proj.forward(hidden)?.reshape(&[batch, seq, n_kv, hd])?;

        // Apply RoPE
        apply_rotary(&mut xq, rotary)?;
        apply_rotary(&mut xk, rotary)?;

        // Cache K and V, then read back the whole buffer
        cache.write(write_positions, &xk, &xv)?;
        let keys = cache.keys().data();
        let values = cache.values().data();
        let group = self.num_queries_per_kv();
        let kv_row = n_kv * hd;
        let q_data = xq.data();
        let mask_data = mask.data();

        let mut merged = Tensor::zeros(&[batch, seq, n_heads * hd]);
        for b in 0..batch {
            let head_outputs: Vec<Vec<f32>> = (0..n_heads)
                .into_par_iter()
                .map(|h| {
                    let kv_h = h / group;
                    let mut out = vec![0.0f32; seq * hd];
                    let mut att = vec![0.0f32; max_len];
                    for t in 0..seq {
                        let q_off = ((b * seq + t) * n_heads + h) * hd;
                        let q = &q_data[q_off..q_off + hd];
                        let mask_row = &mask_data[t * max_len..(t + 1) * max_len];

                        for (l, score) in att.iter_mut().enumerate() {
                            let k_off = (b * max_len + l) * kv_row + kv_h * hd;
                            *score = dot(q, &keys[k_off..k_off + hd]) * self.scaling + mask_row[l];
                        }
                        softmax(&mut att);

                        let o = &mut out[t * hd..(t + 1) * hd];
                        for (l, &a) in att.iter().enumerate() {
                            let v_off = (b * max_len + l) * kv_row + kv_h * hd;
                            for (oi, vi) in o.iter_mut().zip(&values[v_off..v_off + hd]) {
                                *oi += a * vi;
                            }
                        }
                    }
                    out
                })
                .collect();

            // Merge heads back to [seq, n_heads * hd]
            let width = n_heads * hd;
            let dst = &mut merged.data_mut()[b * seq * width..(b + 1) * seq * width];
            for (h, out) in head_outputs.iter().enumerate() {
                for t in 0..seq {
                    let off = t * width + h * hd;
                    dst[off..off + hd].copy_from_slice(&out[t * hd..(t + 1) * hd]);
                }
            }
        }

        // Output projection
        self.o_proj.forward(&merged)
    }
}

//! Decoder layer: pre-norm attention and MLP with residuals.

use crate::attention::Attention;
use crate::error::Result;
use crate::kv_cache::LayerCache;
use crate::mlp::Mlp;
use crate::norm::RmsNorm;
use crate::rope::RotarySlice;
use crate::tensor::Tensor;

#[derive(Debug, Clone)]
pub struct DecoderLayer {
    pub self_attn: Attention,
    pub mlp: Mlp,
    pub input_layernorm: RmsNorm,
    pub post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    /// `h += attn(norm(h))`, then `h += mlp(norm(h))`.
    pub fn forward(
        &self,
        hidden: &Tensor,
        rotary: &RotarySlice,
        write_positions: &[usize],
        cache: &mut LayerCache,
        mask: &Tensor,
    ) -> Result<Tensor> {
        let normed = self.input_layernorm.forward(hidden)?;
        let attn = self
            .self_attn
            .forward(&normed, rotary, write_positions, cache, mask)?;
        let hidden = hidden.add(&attn)?;

        let normed = self.post_attention_layernorm.forward(&hidden)?;
        let ffn = self.mlp.forward(&normed)?;
        hidden.add(&ffn)
    }
}

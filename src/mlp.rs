//! Gated feed-forward block.

use crate::error::{GemmaError, Result};
use crate::linear::Linear;
use crate::ops::gelu_gate;
use crate::tensor::Tensor;

/// FFN for one layer, aligned with GemmaMLP.forward:
/// `down_proj(gelu_tanh(gate_proj(x)) * up_proj(x))`.
#[derive(Debug, Clone)]
pub struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    pub fn new(gate_proj: Linear, up_proj: Linear, down_proj: Linear) -> Result<Self> {
        let hidden = gate_proj.in_features();
        let inter = gate_proj.out_features();
        let ok = up_proj.in_features() == hidden
            && up_proj.out_features() == inter
            && down_proj.in_features() == inter
            && down_proj.out_features() == hidden;
        if !ok {
            return Err(GemmaError::InvalidModel(format!(
                "mlp projections do not chain: gate [{hidden} -> {inter}], up [{} -> {}], down [{} -> {}]",
                up_proj.in_features(),
                up_proj.out_features(),
                down_proj.in_features(),
                down_proj.out_features()
            )));
        }
        Ok(Mlp {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut gate = self.gate_proj.forward(x)?;
        let up = self.up_proj.forward(x)?;
        gelu_gate(gate.data_mut(), up.data());
        self.down_proj.forward(&gate)
    }
}

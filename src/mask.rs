//! Additive causal attention mask.

use crate::error::Result;
use crate::tensor::Tensor;

/// Value added to scores of disallowed (future) key positions.
pub const MASK_SENTINEL: f32 = -2.381_976_3e38;

/// `[len, len]` mask: 0 where `key <= query`, [`MASK_SENTINEL`] above the diagonal.
#[derive(Debug, Clone)]
pub struct CausalMask {
    mask: Tensor,
}

impl CausalMask {
    pub fn new(len: usize) -> Self {
        let mut mask = Tensor::zeros(&[len, len]);
        for (q, row) in mask.data_mut().chunks_exact_mut(len.max(1)).enumerate() {
            for v in row.iter_mut().skip(q + 1) {
                *v = MASK_SENTINEL;
            }
        }
        CausalMask { mask }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mask.dim(0)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mask rows for the active query positions: `[positions.len(), len]`.
    pub fn rows(&self, query_positions: &[usize]) -> Result<Tensor> {
        self.mask.select_rows(query_positions)
    }
}

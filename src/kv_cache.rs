//! Per-layer key/value cache for incremental decoding.

use crate::error::{GemmaError, Result};
use crate::tensor::Tensor;

/// Key and value buffers for one decoder layer, each
/// `[batch, max_len, num_kv_heads, head_dim]`, zero-initialised.
#[derive(Debug, Clone)]
pub struct LayerCache {
    keys: Tensor,
    values: Tensor,
}

impl LayerCache {
    pub fn new(batch: usize, max_len: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        let shape = [batch, max_len, num_kv_heads, head_dim];
        LayerCache {
            keys: Tensor::zeros(&shape),
            values: Tensor::zeros(&shape),
        }
    }

    #[inline]
    pub fn batch(&self) -> usize {
        self.keys.dim(0)
    }

    #[inline]
    pub fn max_len(&self) -> usize {
        self.keys.dim(1)
    }

    #[inline]
    pub fn num_kv_heads(&self) -> usize {
        self.keys.dim(2)
    }

    #[inline]
    pub fn head_dim(&self) -> usize {
        self.keys.dim(3)
    }

    #[inline]
    pub fn keys(&self) -> &Tensor {
        &self.keys
    }

    #[inline]
    pub fn values(&self) -> &Tensor {
        &self.values
    }

    /// `cache[:, positions[s], :, :] = new[:, s, :, :]` for keys and values.
    ///
    /// `keys` and `values` are `[batch, positions.len(), num_kv_heads, head_dim]`.
    pub fn write(&mut self, positions: &[usize], keys: &Tensor, values: &Tensor) -> Result<()> {
        let expected = [
            self.batch(),
            positions.len(),
            self.num_kv_heads(),
            self.head_dim(),
        ];
        for (what, t) in [("keys", keys), ("values", values)] {
            if t.shape() != expected {
                return Err(GemmaError::Shape(format!(
                    "cache write of {what} {:?}, expected {:?}",
                    t.shape(),
                    expected
                )));
            }
        }
        let max_len = self.max_len();
        if let Some(&position) = positions.iter().find(|&&p| p >= max_len) {
            return Err(GemmaError::CachePosition { position, max_len });
        }

        let row = self.num_kv_heads() * self.head_dim();
        let seq = positions.len();
        for b in 0..self.batch() {
            for (s, &pos) in positions.iter().enumerate() {
                let src = (b * seq + s) * row;
                let dst = (b * max_len + pos) * row;
                self.keys.data_mut()[dst..dst + row]
                    .copy_from_slice(&keys.data()[src..src + row]);
                self.values.data_mut()[dst..dst + row]
                    .copy_from_slice(&values.data()[src..src + row]);
            }
        }
        Ok(())
    }
}

/// One [`LayerCache`] per decoder layer, owned by a single generation run.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<LayerCache>,
}

impl KvCache {
    pub fn new(
        num_layers: usize,
        batch: usize,
        max_len: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> Self {
        let layers = (0..num_layers)
            .map(|_| LayerCache::new(batch, max_len, num_kv_heads, head_dim))
            .collect();
        KvCache { layers }
    }

    #[inline]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, idx: usize) -> Option<&LayerCache> {
        self.layers.get(idx)
    }

    pub fn layers_mut(&mut self) -> std::slice::IterMut<'_, LayerCache> {
        self.layers.iter_mut()
    }

    /// Bytes held by keys and values across all layers.
    pub fn size_bytes(&self) -> usize {
        self.layers
            .iter()
            .map(|l| (l.keys.len() + l.values.len()) * std::mem::size_of::<f32>())
            .sum()
    }
}

//! Minimal owned f32 tensor with an explicit shape.
//!
//! Storage is row-major. Every operation checks shapes up front and never
//! broadcasts implicitly; callers reshape explicitly when they need a
//! different view.

use crate::error::{GemmaError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Zero-filled tensor of the given shape.
    pub fn zeros(shape: &[usize]) -> Self {
        Tensor {
            shape: shape.to_vec(),
            data: vec![0.0; shape.iter().product()],
        }
    }

    /// Wrap `data`, checking that it fills `shape` exactly.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(GemmaError::Shape(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Tensor {
            shape: shape.to_vec(),
            data,
        })
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Size of axis `axis`; panics on an out-of-range axis like slice indexing.
    #[inline]
    pub fn dim(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    #[inline]
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Reinterpret the buffer with a new shape of equal element count.
    pub fn reshape(self, shape: &[usize]) -> Result<Self> {
        Tensor::from_vec(shape, self.data)
    }

    /// Fail unless the tensor has exactly `rank` axes.
    pub fn expect_rank(&self, rank: usize, what: &str) -> Result<()> {
        if self.rank() != rank {
            return Err(GemmaError::Shape(format!(
                "{what} must have rank {rank}, got shape {:?}",
                self.shape
            )));
        }
        Ok(())
    }

    /// Iterate over last-axis rows.
    pub fn rows(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.last_dim().max(1))
    }

    /// Elementwise sum of two tensors with identical shapes.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        if self.shape != other.shape {
            return Err(GemmaError::Shape(format!(
                "cannot add {:?} and {:?}",
                self.shape, other.shape
            )));
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Ok(Tensor {
            shape: self.shape.clone(),
            data,
        })
    }

    /// Gather rows of a 2-D tensor in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Result<Tensor> {
        self.expect_rank(2, "select_rows input")?;
        let (n_rows, width) = (self.shape[0], self.shape[1]);
        let mut data = Vec::with_capacity(indices.len() * width);
        for &row in indices {
            if row >= n_rows {
                return Err(GemmaError::Shape(format!(
                    "row {row} out of range for {n_rows} rows"
                )));
            }
            data.extend_from_slice(&self.data[row * width..(row + 1) * width]);
        }
        Tensor::from_vec(&[indices.len(), width], data)
    }
}

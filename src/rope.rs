//! Rotary position embedding tables.
//!
//! The table stores `[position, half_dim, {cos, sin}]` and is built once per
//! model. Decode steps look up a single arbitrary position, so slicing takes
//! an ordered list of positions rather than a range.
//!
//! Layout contract for [`apply_rotary`]: within each head the first half of
//! the channels is the real part and the second half the imaginary part.
//! After rotation, output channel `2i` holds the rotated real part of pair
//! `i` and channel `2i + 1` the rotated imaginary part.

use crate::error::{GemmaError, Result};
use crate::tensor::Tensor;

/// Precomputed rotation angles for every position below `max_positions`.
#[derive(Debug, Clone)]
pub struct RotaryTable {
    half_dim: usize,
    max_positions: usize,
    /// Flattened `[max_positions, half_dim, 2]`, cos then sin.
    angles: Vec<f32>,
}

/// Rotation values for an ordered list of positions.
#[derive(Debug, Clone, PartialEq)]
pub struct RotarySlice {
    half_dim: usize,
    /// Flattened `[positions, half_dim, 2]`.
    angles: Vec<f32>,
}

impl RotaryTable {
    /// Build `cos/sin(p / theta^(2i/d))` for `p < max_positions`, `i < d/2`.
    pub fn new(head_dim: usize, max_positions: usize, theta: f32) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(GemmaError::Config(format!(
                "rotary head_dim must be even and non-zero, got {head_dim}"
            )));
        }
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf((2 * i) as f32 / head_dim as f32))
            .collect();

        let mut angles = Vec::with_capacity(max_positions * half_dim * 2);
        for pos in 0..max_positions {
            let pos = pos as f32;
            for &freq in &inv_freq {
                let (sin, cos) = (pos * freq).sin_cos();
                angles.push(cos);
                angles.push(sin);
            }
        }

        Ok(RotaryTable {
            half_dim,
            max_positions,
            angles,
        })
    }

    #[inline]
    pub fn half_dim(&self) -> usize {
        self.half_dim
    }

    #[inline]
    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// `(cos, sin)` for one position and frequency index, `None` when
    /// either is out of range.
    #[inline]
    pub fn get(&self, position: usize, i: usize) -> Option<(f32, f32)> {
        if position >= self.max_positions || i >= self.half_dim {
            return None;
        }
        let off = (position * self.half_dim + i) * 2;
        Some((self.angles[off], self.angles[off + 1]))
    }

    /// Gather the rows for `positions`, in order.
    pub fn select(&self, positions: &[usize]) -> Result<RotarySlice> {
        let row = self.half_dim * 2;
        let mut angles = Vec::with_capacity(positions.len() * row);
        for &pos in positions {
            if pos >= self.max_positions {
                return Err(GemmaError::ContextOverflow {
                    required: pos + 1,
                    max: self.max_positions,
                });
            }
            angles.extend_from_slice(&self.angles[pos * row..(pos + 1) * row]);
        }
        Ok(RotarySlice {
            half_dim: self.half_dim,
            angles,
        })
    }
}

impl RotarySlice {
    /// Number of positions in the slice.
    #[inline]
    pub fn len(&self) -> usize {
        self.angles.len() / (self.half_dim * 2)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.angles.is_empty()
    }

    #[inline]
    pub fn half_dim(&self) -> usize {
        self.half_dim
    }

    /// The `[half_dim, 2]` row for the `s`-th selected position.
    #[inline]
    fn row(&self, s: usize) -> &[f32] {
        let width = self.half_dim * 2;
        &self.angles[s * width..(s + 1) * width]
    }
}

/// Rotate `x` of shape `[batch, seq, heads, head_dim]` in place.
pub fn apply_rotary(x: &mut Tensor, angles: &RotarySlice) -> Result<()> {
    x.expect_rank(4, "rotary input")?;
    let (batch, seq, heads, head_dim) = (x.dim(0), x.dim(1), x.dim(2), x.dim(3));
    let half = angles.half_dim();
    if head_dim != half * 2 || seq != angles.len() {
        return Err(GemmaError::Shape(format!(
            "rotary slice [{}, {}] does not fit input {:?}",
            angles.len(),
            half * 2,
            x.shape()
        )));
    }

    let mut rotated = vec![0.0f32; head_dim];
    let data = x.data_mut();
    for b in 0..batch {
        for s in 0..seq {
            let row = angles.row(s);
            for h in 0..heads {
                let off = ((b * seq + s) * heads + h) * head_dim;
                let head = &mut data[off..off + head_dim];
                for i in 0..half {
                    let (cos, sin) = (row[2 * i], row[2 * i + 1]);
                    let real = head[i];
                    let imag = head[half + i];
                    rotated[2 * i] = real * cos - imag * sin;
                    rotated[2 * i + 1] = imag * cos + real * sin;
                }
                head.copy_from_slice(&rotated);
            }
        }
    }
    Ok(())
}

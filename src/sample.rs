//! Token sampling: greedy, or temperature with combined top-p/top-k.

use crate::error::{GemmaError, Result};
use crate::linear::Embedding;
use crate::ops::{argmax, softmax};
use crate::tensor::Tensor;
use rand::Rng;

/// Per-sequence sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    /// `None` selects greedy argmax decoding.
    pub temperature: Option<f32>,
    pub top_p: f32,
    pub top_k: usize,
}

impl SamplingParams {
    /// A temperature of zero is treated as greedy decoding.
    pub fn new(temperature: Option<f32>, top_p: f32, top_k: usize) -> Self {
        SamplingParams {
            temperature: temperature.filter(|&t| t != 0.0),
            top_p,
            top_k,
        }
    }

    pub fn greedy() -> Self {
        SamplingParams::new(None, 1.0, 1)
    }

    #[inline]
    pub fn is_greedy(&self) -> bool {
        self.temperature.is_none()
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        SamplingParams::new(Some(0.95), 1.0, 100)
    }
}

/// Used for sorting probabilities in top-p/top-k sampling.
#[derive(Debug, Clone, Copy)]
pub struct ProbIndex {
    pub prob: f32,
    pub index: usize,
}

/// Turns the final hidden states into next-token ids.
#[derive(Debug, Clone)]
pub struct Sampler {
    vocab_size: usize,
}

impl Sampler {
    pub fn new(vocab_size: usize) -> Self {
        Sampler { vocab_size }
    }

    /// Sample one token per sequence.
    ///
    /// `hidden` is `[batch, seq, hidden]`; `output_positions[b]` picks the
    /// position of sequence `b` whose logits are sampled.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        embedding: &Embedding,
        hidden: &Tensor,
        output_positions: &[usize],
        params: &[SamplingParams],
        rng: &mut R,
    ) -> Result<Vec<u32>> {
        hidden.expect_rank(3, "sampler input")?;
        let batch = hidden.dim(0);
        if output_positions.len() != batch || params.len() != batch {
            return Err(GemmaError::Shape(format!(
                "batch of {batch} with {} output positions and {} sampling params",
                output_positions.len(),
                params.len()
            )));
        }
        if embedding.vocab_size() != self.vocab_size {
            return Err(GemmaError::Shape(format!(
                "embedding vocabulary {} differs from sampler vocabulary {}",
                embedding.vocab_size(),
                self.vocab_size
            )));
        }

        let last = select_positions(hidden, output_positions)?;
        let mut logits = embedding.logits(&last)?;
        logits
            .data_mut()
            .chunks_exact_mut(self.vocab_size)
            .zip(params)
            .enumerate()
            .map(|(b, (row, p))| sample_row(row, p, b, rng))
            .collect()
    }
}

/// Gather `hidden[b, output_positions[b], :]` into `[batch, hidden]`.
pub fn select_positions(hidden: &Tensor, output_positions: &[usize]) -> Result<Tensor> {
    hidden.expect_rank(3, "sampler input")?;
    let (seq, width) = (hidden.dim(1), hidden.dim(2));
    let mut data = Vec::with_capacity(output_positions.len() * width);
    for (b, &pos) in output_positions.iter().enumerate() {
        if pos >= seq {
            return Err(GemmaError::Shape(format!(
                "output position {pos} outside {seq} computed positions"
            )));
        }
        let off = (b * seq + pos) * width;
        data.extend_from_slice(&hidden.data()[off..off + width]);
    }
    Tensor::from_vec(&[output_positions.len(), width], data)
}

/// Sample a token from one row of logits; `logits` is used as scratch.
///
/// - `temperature == None`: greedy (argmax), no filtering
/// - otherwise: temperature, softmax, then top-p and top-k over the
///   descending order, renormalize and draw
pub fn sample_row<R: Rng + ?Sized>(
    logits: &mut [f32],
    params: &SamplingParams,
    sequence: usize,
    rng: &mut R,
) -> Result<u32> {
    let Some(temp) = params.temperature else {
        return Ok(argmax(logits) as u32);
    };

    for l in logits.iter_mut() {
        *l /= temp;
    }
    softmax(logits);

    // Sort descending by probability, keeping the permutation
    let mut sorted: Vec<ProbIndex> = logits
        .iter()
        .enumerate()
        .map(|(i, &p)| ProbIndex { prob: p, index: i })
        .collect();
    sorted.sort_by(|a, b| {
        b.prob
            .partial_cmp(&a.prob)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    filter_top_p_top_k(&mut sorted, params.top_p, params.top_k);

    let total: f32 = sorted.iter().map(|pi| pi.prob).sum();
    if !(total > 0.0 && total.is_finite()) {
        return Err(GemmaError::EmptyCandidateSet { sequence });
    }

    // Draw from the renormalized distribution
    let r: f32 = rng.random();
    let mut cdf = 0.0f32;
    let mut last_kept = None;
    for pi in sorted.iter().filter(|pi| pi.prob > 0.0) {
        cdf += pi.prob / total;
        if r < cdf {
            return Ok(pi.index as u32);
        }
        last_kept = Some(pi.index);
    }

    // Rounding left the cdf just short of 1
    last_kept
        .map(|i| i as u32)
        .ok_or(GemmaError::EmptyCandidateSet { sequence })
}

/// Zero every candidate outside top-p or top-k. `sorted` must be descending.
///
/// A candidate survives top-p when the mass ranked strictly above it does
/// not exceed `top_p`, and survives top-k when its rank is below `top_k`.
pub fn filter_top_p_top_k(sorted: &mut [ProbIndex], top_p: f32, top_k: usize) {
    let mut cum_prob = 0.0f32;
    for (rank, pi) in sorted.iter_mut().enumerate() {
        cum_prob += pi.prob;
        let mass_before = cum_prob - pi.prob;
        if mass_before > top_p || rank >= top_k {
            pi.prob = 0.0;
        }
    }
}

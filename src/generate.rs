//! Autoregressive generation: one prefill pass, then single-token decode steps.
//!
//! Prompts in a batch are right-padded to the longest one. Prefill covers
//! positions up to the shortest prompt; afterwards every step forwards one
//! token per sequence. While a sequence is still inside its own prompt the
//! known prompt token is kept and the sampled one discarded.

use crate::error::{GemmaError, Result};
use crate::mask::CausalMask;
use crate::model::GemmaForCausalLM;
use crate::sample::SamplingParams;
use crate::tokenizer::Tokenizer;
use rand::Rng;
use tracing::debug;

/// One prompt with its sampling parameters.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: Vec<u32>,
    pub sampling: SamplingParams,
}

impl GenerationRequest {
    pub fn new(prompt: Vec<u32>, sampling: SamplingParams) -> Self {
        GenerationRequest { prompt, sampling }
    }
}

/// Token buffer and bookkeeping for one sequence in the batch.
#[derive(Debug, Clone)]
pub struct SequenceState {
    /// `max_seq_len` ids, prompt first, pad-filled until written
    pub token_ids: Vec<u32>,
    /// `true` at positions holding an original prompt token
    pub is_prompt: Vec<bool>,
    pub prompt_len: usize,
    pub sampling: SamplingParams,
    /// Set once EOS is written after the prompt or the output budget is spent
    pub finished: bool,
}

impl SequenceState {
    fn new(request: &GenerationRequest, max_seq_len: usize, pad_id: u32) -> Self {
        let prompt_len = request.prompt.len();
        let mut token_ids = vec![pad_id; max_seq_len];
        token_ids[..prompt_len].copy_from_slice(&request.prompt);
        let is_prompt = (0..max_seq_len).map(|p| p < prompt_len).collect();
        SequenceState {
            token_ids,
            is_prompt,
            prompt_len,
            sampling: request.sampling,
            finished: false,
        }
    }

    /// Generated ids after the prompt, cut at (and excluding) the first EOS.
    pub fn output(&self, output_len: usize, eos_id: u32) -> Vec<u32> {
        let end = (self.prompt_len + output_len).min(self.token_ids.len());
        let generated = &self.token_ids[self.prompt_len..end];
        let cut = generated
            .iter()
            .position(|&t| t == eos_id)
            .unwrap_or(generated.len());
        generated[..cut].to_vec()
    }
}

/// Generate up to `output_len` ids for each request.
pub fn generate_tokens<R: Rng + ?Sized>(
    model: &GemmaForCausalLM,
    requests: &[GenerationRequest],
    output_len: usize,
    pad_id: u32,
    eos_id: u32,
    rng: &mut R,
) -> Result<Vec<Vec<u32>>> {
    if requests.is_empty() {
        return Err(GemmaError::InvalidRequest("empty batch".into()));
    }
    if let Some(i) = requests.iter().position(|r| r.prompt.is_empty()) {
        return Err(GemmaError::InvalidRequest(format!("prompt {i} is empty")));
    }

    let batch = requests.len();
    let min_prompt_len = requests.iter().map(|r| r.prompt.len()).min().unwrap_or(0);
    let max_prompt_len = requests.iter().map(|r| r.prompt.len()).max().unwrap_or(0);
    let max_seq_len = max_prompt_len + output_len;
    let max_context = model.config().max_position_embeddings;
    if max_seq_len > max_context {
        return Err(GemmaError::ContextOverflow {
            required: max_seq_len,
            max: max_context,
        });
    }

    let mut caches = model.new_cache(batch, max_seq_len);
    let mask = CausalMask::new(max_seq_len);
    let mut states: Vec<SequenceState> = requests
        .iter()
        .map(|r| SequenceState::new(r, max_seq_len, pad_id))
        .collect();
    let sampling: Vec<SamplingParams> = states.iter().map(|s| s.sampling).collect();

    // Prefill: positions [0, min_prompt_len) in one call
    let mut input_ids: Vec<Vec<u32>> = states
        .iter()
        .map(|s| s.token_ids[..min_prompt_len].to_vec())
        .collect();
    let mut input_positions: Vec<usize> = (0..min_prompt_len).collect();
    let mut output_position = min_prompt_len - 1;
    debug!(
        batch,
        min_prompt_len, max_prompt_len, max_seq_len, "prefill"
    );

    for output_index in min_prompt_len..max_seq_len {
        let step_mask = mask.rows(&input_positions)?;
        let next = model.forward(
            &input_ids,
            &input_positions,
            &mut caches,
            &step_mask,
            &vec![output_position; batch],
            &sampling,
            rng,
        )?;

        for (state, &sampled) in states.iter_mut().zip(&next) {
            let token = if state.is_prompt[output_index] {
                state.token_ids[output_index]
            } else {
                sampled
            };
            state.token_ids[output_index] = token;
            if output_index >= state.prompt_len
                && (token == eos_id || output_index + 1 >= state.prompt_len + output_len)
            {
                state.finished = true;
            }
        }

        if states.iter().all(|s| s.finished) {
            debug!(steps = output_index + 1 - min_prompt_len, "all sequences finished");
            break;
        }

        // Decode: one position per step
        input_ids = states
            .iter()
            .map(|s| vec![s.token_ids[output_index]])
            .collect();
        input_positions = vec![output_index];
        output_position = 0;
    }

    Ok(states.iter().map(|s| s.output(output_len, eos_id)).collect())
}

/// Text-level entry point: encode, generate, decode.
pub fn generate<T: Tokenizer + ?Sized, R: Rng + ?Sized>(
    model: &GemmaForCausalLM,
    tokenizer: &T,
    prompts: &[&str],
    output_len: usize,
    sampling: SamplingParams,
    rng: &mut R,
) -> Result<Vec<String>> {
    let requests = prompts
        .iter()
        .map(|p| Ok(GenerationRequest::new(tokenizer.encode(p)?, sampling)))
        .collect::<Result<Vec<_>>>()?;
    let outputs = generate_tokens(
        model,
        &requests,
        output_len,
        tokenizer.pad_id(),
        tokenizer.eos_id(),
        rng,
    )?;
    outputs.iter().map(|ids| tokenizer.decode(ids)).collect()
}

/// Single-prompt convenience over [`generate`].
pub fn generate_one<T: Tokenizer + ?Sized, R: Rng + ?Sized>(
    model: &GemmaForCausalLM,
    tokenizer: &T,
    prompt: &str,
    output_len: usize,
    sampling: SamplingParams,
    rng: &mut R,
) -> Result<String> {
    let mut out = generate(model, tokenizer, &[prompt], output_len, sampling, rng)?;
    out.pop()
        .ok_or_else(|| GemmaError::InvalidRequest("no output for prompt".into()))
}

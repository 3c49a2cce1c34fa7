//! Gemma model forward pass.

use crate::attention::Attention;
use crate::config::GemmaConfig;
use crate::error::{GemmaError, Result};
use crate::kv_cache::KvCache;
use crate::layer::DecoderLayer;
use crate::linear::Embedding;
use crate::mlp::Mlp;
use crate::norm::RmsNorm;
use crate::rope::{RotarySlice, RotaryTable};
use crate::sample::{Sampler, SamplingParams};
use crate::tensor::Tensor;
use crate::weights::{WeightMap, WeightSource, names};
use rand::Rng;
use std::path::Path;
use tracing::{debug, info};

/// The decoder stack: N layers followed by a final RMSNorm.
#[derive(Debug, Clone)]
pub struct GemmaModel {
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
}

impl GemmaModel {
    pub fn new(layers: Vec<DecoderLayer>, norm: RmsNorm) -> Self {
        GemmaModel { layers, norm }
    }

    #[inline]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Run every layer in order, each against its own cache entry.
    pub fn forward(
        &self,
        hidden: Tensor,
        rotary: &RotarySlice,
        write_positions: &[usize],
        caches: &mut KvCache,
        mask: &Tensor,
    ) -> Result<Tensor> {
        if caches.num_layers() != self.layers.len() {
            return Err(GemmaError::Shape(format!(
                "{} caches for {} layers",
                caches.num_layers(),
                self.layers.len()
            )));
        }
        let mut hidden = hidden;
        for (layer, cache) in self.layers.iter().zip(caches.layers_mut()) {
            hidden = layer.forward(&hidden, rotary, write_positions, cache, mask)?;
        }
        self.norm.forward(&hidden)
    }
}

/// Embedding, decoder stack, and sampler with a tied output head.
#[derive(Debug, Clone)]
pub struct GemmaForCausalLM {
    config: GemmaConfig,
    embedder: Embedding,
    model: GemmaModel,
    sampler: Sampler,
    rotary: RotaryTable,
}

impl GemmaForCausalLM {
    /// Assemble a model from weights named by the Gemma scheme.
    pub fn new<S: WeightSource + ?Sized>(config: GemmaConfig, weights: &S) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        let quant = config.quant;
        let eps = config.rms_norm_eps;

        let embed_table =
            weights.linear(names::EMBED_TOKENS, hidden, config.vocab_size, quant)?;
        let embedder = Embedding::new(embed_table);

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let proj = |suffix: &str, in_f: usize, out_f: usize| {
                weights.linear(&names::layer(i, suffix), in_f, out_f, quant)
            };
            let self_attn = Attention::new(
                proj("self_attn.q_proj", hidden, config.q_size())?,
                proj("self_attn.k_proj", hidden, config.kv_size())?,
                proj("self_attn.v_proj", hidden, config.kv_size())?,
                proj("self_attn.o_proj", config.q_size(), hidden)?,
                config.num_attention_heads,
                config.num_key_value_heads,
                config.head_dim,
            )?;
            let mlp = Mlp::new(
                proj("mlp.gate_proj", hidden, inter)?,
                proj("mlp.up_proj", hidden, inter)?,
                proj("mlp.down_proj", inter, hidden)?,
            )?;
            layers.push(DecoderLayer {
                self_attn,
                mlp,
                input_layernorm: weights.rms_norm(
                    &names::layer(i, "input_layernorm.weight"),
                    hidden,
                    eps,
                )?,
                post_attention_layernorm: weights.rms_norm(
                    &names::layer(i, "post_attention_layernorm.weight"),
                    hidden,
                    eps,
                )?,
            });
        }
        let norm = weights.rms_norm(names::FINAL_NORM, hidden, eps)?;

        // Rotary table spans twice the context length
        let rotary = RotaryTable::new(
            config.head_dim,
            config.max_position_embeddings * 2,
            config.rope_theta,
        )?;
        debug!(
            layers = layers.len(),
            quant,
            rotary_positions = rotary.max_positions(),
            "assembled model"
        );

        Ok(GemmaForCausalLM {
            sampler: Sampler::new(config.vocab_size),
            embedder,
            model: GemmaModel::new(layers, norm),
            rotary,
            config,
        })
    }

    /// Load config JSON and a safetensors checkpoint (one file or a
    /// directory of shards) from disk.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        config_path: P,
        checkpoint_path: Q,
    ) -> Result<Self> {
        let config = GemmaConfig::from_file(config_path)?;
        let weights = WeightMap::load(checkpoint_path)?;
        info!(
            layers = config.num_hidden_layers,
            hidden = config.hidden_size,
            heads = config.num_attention_heads,
            kv_heads = config.num_key_value_heads,
            vocab = config.vocab_size,
            "loaded checkpoint"
        );
        Self::new(config, &weights)
    }

    #[inline]
    pub fn config(&self) -> &GemmaConfig {
        &self.config
    }

    #[inline]
    pub fn rotary(&self) -> &RotaryTable {
        &self.rotary
    }

    /// Fresh zeroed caches for `batch` sequences of up to `max_len` positions.
    pub fn new_cache(&self, batch: usize, max_len: usize) -> KvCache {
        KvCache::new(
            self.config.num_hidden_layers,
            batch,
            max_len,
            self.config.num_key_value_heads,
            self.config.head_dim,
        )
    }

    /// Final hidden states `[batch, seq, hidden]` for `input_ids` at `input_positions`.
    pub fn hidden_states(
        &self,
        input_ids: &[Vec<u32>],
        input_positions: &[usize],
        caches: &mut KvCache,
        mask: &Tensor,
    ) -> Result<Tensor> {
        let rotary = self.rotary.select(input_positions)?;
        let hidden = self.embedder.embed(input_ids)?;
        self.model
            .forward(hidden, &rotary, input_positions, caches, mask)
    }

    /// One step: forward `input_ids` and sample a token per sequence from
    /// the hidden state at `output_positions`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward<R: Rng + ?Sized>(
        &self,
        input_ids: &[Vec<u32>],
        input_positions: &[usize],
        caches: &mut KvCache,
        mask: &Tensor,
        output_positions: &[usize],
        sampling: &[SamplingParams],
        rng: &mut R,
    ) -> Result<Vec<u32>> {
        let hidden = self.hidden_states(input_ids, input_positions, caches, mask)?;
        self.sampler
            .forward(&self.embedder, &hidden, output_positions, sampling, rng)
    }
}

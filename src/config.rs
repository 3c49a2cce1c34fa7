//! Gemma model configuration.

use crate::error::{GemmaError, Result};
use crate::norm::RMS_EPS;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_rms_norm_eps() -> f32 {
    RMS_EPS
}

fn default_rope_theta() -> f32 {
    10_000.0
}

/// Transformer hyperparameters, aligned with GemmaConfig in the PyTorch Gemma release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GemmaConfig {
    /// Vocabulary size (rows of the tied embedding)
    pub vocab_size: usize,
    /// Maximum context length
    pub max_position_embeddings: usize,
    /// Number of decoder layers
    pub num_hidden_layers: usize,
    /// Number of query attention heads
    pub num_attention_heads: usize,
    /// Number of key/value heads for GQA
    pub num_key_value_heads: usize,
    /// Transformer embedding dimension
    pub hidden_size: usize,
    /// MLP intermediate dimension
    pub intermediate_size: usize,
    /// Per-head dimension
    pub head_dim: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    /// Projections stored as int8 weights plus per-output-channel scales
    #[serde(default)]
    pub quant: bool,
}

impl GemmaConfig {
    pub fn gemma_2b() -> Self {
        GemmaConfig {
            vocab_size: 256_000,
            max_position_embeddings: 8192,
            num_hidden_layers: 18,
            num_attention_heads: 8,
            num_key_value_heads: 1,
            hidden_size: 2048,
            intermediate_size: 16_384,
            head_dim: 256,
            rms_norm_eps: default_rms_norm_eps(),
            rope_theta: default_rope_theta(),
            quant: false,
        }
    }

    pub fn gemma_7b() -> Self {
        GemmaConfig {
            vocab_size: 256_000,
            max_position_embeddings: 8192,
            num_hidden_layers: 28,
            num_attention_heads: 16,
            num_key_value_heads: 16,
            hidden_size: 3072,
            intermediate_size: 24_576,
            head_dim: 256,
            rms_norm_eps: default_rms_norm_eps(),
            rope_theta: default_rope_theta(),
            quant: false,
        }
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: GemmaConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Reject configurations the forward pass cannot run.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("max_position_embeddings", self.max_position_embeddings),
            ("num_hidden_layers", self.num_hidden_layers),
            ("num_attention_heads", self.num_attention_heads),
            ("num_key_value_heads", self.num_key_value_heads),
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("head_dim", self.head_dim),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(GemmaError::Config(format!("{name} must be greater than zero")));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(GemmaError::Config(format!(
                "num_attention_heads ({}) must be divisible by num_key_value_heads ({})",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(GemmaError::Config(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(GemmaError::Config(format!(
                "head_dim must be even, got {}",
                self.head_dim
            )));
        }
        if !(self.rope_theta.is_finite() && self.rope_theta > 0.0) {
            return Err(GemmaError::Config(format!(
                "rope_theta must be finite and positive, got {}",
                self.rope_theta
            )));
        }
        Ok(())
    }

    /// Width of the query projection output.
    #[inline]
    pub fn q_size(&self) -> usize {
        self.num_attention_heads * self.head_dim
    }

    /// Width of the key (or value) projection output.
    #[inline]
    pub fn kv_size(&self) -> usize {
        self.num_key_value_heads * self.head_dim
    }

    /// Query heads sharing one key/value head.
    #[inline]
    pub fn num_queries_per_kv(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }
}

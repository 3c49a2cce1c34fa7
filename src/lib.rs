//! Gemma inference library in Rust
//!
//! A decoder-only Gemma implementation: rotary attention with grouped
//! key/value heads, a gated-GELU MLP, unit-offset RMSNorm, optional int8
//! weights, and batched prefill/decode generation with a key/value cache.

pub mod attention;
pub mod config;
pub mod error;
pub mod generate;
pub mod kv_cache;
pub mod layer;
pub mod linear;
pub mod mask;
pub mod mlp;
pub mod model;
pub mod norm;
pub mod ops;
pub mod rope;
pub mod sample;
pub mod tensor;
pub mod tokenizer;
pub mod weights;

pub use config::GemmaConfig;
pub use error::{GemmaError, Result};
pub use generate::{GenerationRequest, generate, generate_one, generate_tokens};
pub use kv_cache::{KvCache, LayerCache};
pub use linear::{Embedding, Linear};
pub use mask::CausalMask;
pub use model::{GemmaForCausalLM, GemmaModel};
pub use rope::RotaryTable;
pub use sample::{Sampler, SamplingParams};
pub use tensor::Tensor;
pub use tokenizer::{SpecialTokens, Tokenizer, VocabTokenizer};
pub use weights::{RawTensor, WeightMap, WeightSource};

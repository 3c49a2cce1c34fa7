#![allow(dead_code)]

use gemma_rs::weights::names;
use gemma_rs::{GemmaConfig, GemmaForCausalLM, RawTensor, SpecialTokens, VocabTokenizer, WeightMap};

pub fn toy_config(quant: bool) -> GemmaConfig {
    GemmaConfig {
        vocab_size: 16,
        max_position_embeddings: 32,
        num_hidden_layers: 3,
        num_attention_heads: 2,
        num_key_value_heads: 1,
        hidden_size: 8,
        intermediate_size: 12,
        head_dim: 4,
        rms_norm_eps: 1e-6,
        rope_theta: 10_000.0,
        quant,
    }
}

/// Deterministic pseudo-random values in [-0.4, 0.4].
fn values(seed: usize, n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| ((seed * 7919 + i * 31 + 1) as f32 * 1.13).sin() * 0.4)
        .collect()
}

fn insert_linear(map: &mut WeightMap, seed: usize, prefix: &str, in_f: usize, out_f: usize, quant: bool) {
    let w = values(seed, in_f * out_f);
    if quant {
        let q = w.iter().map(|v| (v * 254.0).round() as i8).collect();
        map.insert(names::weight(prefix), RawTensor::i8(&[out_f, in_f], q));
        map.insert(names::scaler(prefix), RawTensor::f32(&[out_f], vec![1.0 / 254.0; out_f]));
    } else {
        map.insert(names::weight(prefix), RawTensor::f32(&[out_f, in_f], w));
    }
}

/// A complete weight set for `config` under the Gemma naming scheme.
pub fn toy_weights(config: &GemmaConfig) -> WeightMap {
    let (h, inter, quant) = (config.hidden_size, config.intermediate_size, config.quant);
    let mut map = WeightMap::new();
    insert_linear(&mut map, 1, names::EMBED_TOKENS, h, config.vocab_size, quant);
    for i in 0..config.num_hidden_layers {
        let seed = 10 * (i + 1);
        let projections = [
            ("self_attn.q_proj", h, config.q_size()),
            ("self_attn.k_proj", h, config.kv_size()),
            ("self_attn.v_proj", h, config.kv_size()),
            ("self_attn.o_proj", config.q_size(), h),
            ("mlp.gate_proj", h, inter),
            ("mlp.up_proj", h, inter),
            ("mlp.down_proj", inter, h),
        ];
        for (j, (suffix, in_f, out_f)) in projections.into_iter().enumerate() {
            insert_linear(&mut map, seed + j, &names::layer(i, suffix), in_f, out_f, quant);
        }
        for (j, norm) in ["input_layernorm.weight", "post_attention_layernorm.weight"]
            .into_iter()
            .enumerate()
        {
            map.insert(names::layer(i, norm), RawTensor::f32(&[h], values(seed + 7 + j, h)));
        }
    }
    map.insert(names::FINAL_NORM, RawTensor::f32(&[h], values(99, h)));
    map
}

pub fn toy_model(quant: bool) -> GemmaForCausalLM {
    let config = toy_config(quant);
    let weights = toy_weights(&config);
    GemmaForCausalLM::new(config, &weights).unwrap()
}

/// Sixteen pieces: control tokens, then single letters and a space piece.
pub fn toy_tokenizer() -> VocabTokenizer {
    let pieces = [
        "<pad>", "<eos>", "<bos>", "<unk>", "a", "b", "c", "d", "e", "f", "g", "h", "i", "j",
        "\u{2581}", "\u{2581}a",
    ];
    VocabTokenizer::new(
        pieces.iter().map(|s| s.to_string()).collect(),
        vec![0.0; pieces.len()],
        SpecialTokens::default(),
    )
    .unwrap()
}

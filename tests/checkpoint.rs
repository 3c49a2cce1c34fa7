mod common;

use common::{toy_config, toy_model, toy_weights};
use gemma_rs::{
    GemmaError, GemmaForCausalLM, GenerationRequest, RawTensor, SamplingParams, WeightMap, generate_tokens,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fs;
use std::path::PathBuf;

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gemma-rs-{tag}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn greedy_run(model: &GemmaForCausalLM) -> Vec<Vec<u32>> {
    let request = GenerationRequest::new(vec![2, 6, 8], SamplingParams::greedy());
    let mut rng = StdRng::seed_from_u64(0);
    generate_tokens(model, std::slice::from_ref(&request), 5, 0, 1, &mut rng).unwrap()
}

#[test]
fn model_loads_from_saved_config_and_checkpoint() {
    let dir = scratch_dir("checkpoint");
    let config_path = dir.join("config.json");
    let checkpoint_path = dir.join("model.safetensors");

    let config = toy_config(false);
    fs::write(&config_path, serde_json::to_string(&config).unwrap()).unwrap();
    let weights = toy_weights(&config);
    weights.save(&checkpoint_path).unwrap();

    let reloaded = WeightMap::load(&checkpoint_path).unwrap();
    assert_eq!(reloaded.len(), weights.len());

    let loaded = GemmaForCausalLM::load(&config_path, &checkpoint_path).unwrap();
    assert_eq!(greedy_run(&loaded), greedy_run(&toy_model(false)));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn sharded_quantized_checkpoint_loads_from_directory() {
    let dir = scratch_dir("shards");
    let config_path = dir.join("config.json");
    let shard_dir = dir.join("weights");
    fs::create_dir_all(&shard_dir).unwrap();

    let config = toy_config(true);
    fs::write(&config_path, serde_json::to_string(&config).unwrap()).unwrap();
    let weights = toy_weights(&config);

    // Layer tensors in one shard, everything else in the other
    let mut layers = WeightMap::new();
    let mut rest = WeightMap::new();
    for (name, tensor) in weights.iter() {
        if name.starts_with("model.layers.") {
            layers.insert(name, tensor.clone());
        } else {
            rest.insert(name, tensor.clone());
        }
    }
    layers
        .save(shard_dir.join("model-00001-of-00002.safetensors"))
        .unwrap();
    rest.save(shard_dir.join("model-00002-of-00002.safetensors"))
        .unwrap();
    fs::write(shard_dir.join("README.md"), "not a shard").unwrap();

    let merged = WeightMap::load(&shard_dir).unwrap();
    assert_eq!(merged.len(), weights.len());

    let loaded = GemmaForCausalLM::load(&config_path, &shard_dir).unwrap();
    assert_eq!(greedy_run(&loaded), greedy_run(&toy_model(true)));

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn directory_without_shards_is_rejected() {
    let dir = scratch_dir("empty");
    assert!(matches!(
        WeightMap::load(&dir),
        Err(GemmaError::InvalidModel(_))
    ));
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn missing_tensor_is_reported() {
    let config = toy_config(false);
    let mut weights = WeightMap::new();
    weights.insert("model.norm.weight", RawTensor::f32(&[8], vec![1.0; 8]));
    let err = GemmaForCausalLM::new(config, &weights).unwrap_err();
    assert!(err.to_string().contains("model.embed_tokens.weight"));
}

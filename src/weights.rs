//! Model weights and the safetensors checkpoints they are loaded from.
//!
//! Tensors are addressed by the Gemma naming scheme
//! (`model.layers.{i}.self_attn.q_proj.weight`, ...). Quantized
//! projections carry an int8 `weight` and an f32 `weight_scaler` with one
//! entry per output channel.
//!
//! Checkpoints are one or more safetensors shards. Float tensors (f32, f16,
//! bf16) are widened to f32 on load; int8 tensors are kept as int8.

use crate::error::{GemmaError, Result};
use crate::linear::Linear;
use crate::norm::RmsNorm;
use half::{bf16, f16};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const SAFETENSORS_EXT: &str = "safetensors";

/// Weight names shared with the external weight producer.
pub mod names {
    pub const EMBED_TOKENS: &str = "model.embed_tokens";
    pub const FINAL_NORM: &str = "model.norm.weight";

    /// `model.layers.{layer}.{suffix}`
    pub fn layer(layer: usize, suffix: &str) -> String {
        format!("model.layers.{layer}.{suffix}")
    }

    pub fn weight(prefix: &str) -> String {
        format!("{prefix}.weight")
    }

    pub fn scaler(prefix: &str) -> String {
        format!("{prefix}.weight_scaler")
    }
}

/// Raw tensor payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I8(Vec<i8>),
}

/// A named tensor as supplied by a weight source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl RawTensor {
    pub fn f32(shape: &[usize], data: Vec<f32>) -> Self {
        RawTensor {
            shape: shape.to_vec(),
            data: TensorData::F32(data),
        }
    }

    pub fn i8(shape: &[usize], data: Vec<i8>) -> Self {
        RawTensor {
            shape: shape.to_vec(),
            data: TensorData::I8(data),
        }
    }
}

/// Anything that can hand out tensors by name.
pub trait WeightSource {
    fn tensor(&self, name: &str) -> Option<&RawTensor>;

    /// Fetch an f32 tensor and check its shape.
    fn f32_tensor(&self, name: &str, shape: &[usize]) -> Result<Vec<f32>> {
        let t = self.checked(name, shape)?;
        match &t.data {
            TensorData::F32(v) => Ok(v.clone()),
            TensorData::I8(_) => Err(GemmaError::InvalidModel(format!(
                "{name}: expected f32 data, found i8"
            ))),
        }
    }

    /// Fetch an i8 tensor and check its shape.
    fn i8_tensor(&self, name: &str, shape: &[usize]) -> Result<Vec<i8>> {
        let t = self.checked(name, shape)?;
        match &t.data {
            TensorData::I8(v) => Ok(v.clone()),
            TensorData::F32(_) => Err(GemmaError::InvalidModel(format!(
                "{name}: expected i8 data, found f32"
            ))),
        }
    }

    fn checked(&self, name: &str, shape: &[usize]) -> Result<&RawTensor> {
        let t = self
            .tensor(name)
            .ok_or_else(|| GemmaError::InvalidModel(format!("missing tensor {name}")))?;
        if t.shape != shape {
            return Err(GemmaError::InvalidModel(format!(
                "{name}: shape {:?}, expected {:?}",
                t.shape, shape
            )));
        }
        Ok(t)
    }

    /// Build the projection stored under `prefix` as `[out, in]`.
    fn linear(
        &self,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        quant: bool,
    ) -> Result<Linear> {
        let shape = [out_features, in_features];
        let weight_name = names::weight(prefix);
        if quant {
            let weight = self.i8_tensor(&weight_name, &shape)?;
            let scale = self.f32_tensor(&names::scaler(prefix), &[out_features])?;
            Linear::quantized(weight, scale, in_features, out_features)
        } else {
            let weight = self.f32_tensor(&weight_name, &shape)?;
            Linear::dense(weight, in_features, out_features)
        }
    }

    /// Build a unit-offset RMSNorm from `name`.
    fn rms_norm(&self, name: &str, dim: usize, eps: f32) -> Result<RmsNorm> {
        Ok(RmsNorm::new(self.f32_tensor(name, &[dim])?, eps))
    }
}

/// In-memory weight source.
#[derive(Debug, Clone, Default)]
pub struct WeightMap {
    tensors: HashMap<String, RawTensor>,
}

impl WeightMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: RawTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawTensor)> {
        self.tensors.iter().map(|(name, t)| (name.as_str(), t))
    }

    /// Load a checkpoint: a single safetensors file, or a directory whose
    /// `*.safetensors` shards are merged in name order.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Self::load_shards(&[path]);
        }
        let mut shards: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(path)? {
            let shard = entry?.path();
            if shard.extension().is_some_and(|e| e == SAFETENSORS_EXT) {
                shards.push(shard);
            }
        }
        shards.sort();
        if shards.is_empty() {
            return Err(GemmaError::InvalidModel(format!(
                "no .{SAFETENSORS_EXT} files in {}",
                path.display()
            )));
        }
        Self::load_shards(&shards)
    }

    /// Merge the given shards; a tensor name may appear in only one shard.
    pub fn load_shards<P: AsRef<Path>>(shards: &[P]) -> Result<Self> {
        let mut map = WeightMap::new();
        for shard in shards {
            let shard = shard.as_ref();
            let bytes = fs::read(shard)?;
            map.extend_from_safetensors(&bytes)?;
            debug!(shard = %shard.display(), tensors = map.len(), "read shard");
        }
        Ok(map)
    }

    /// Parse one serialized safetensors buffer.
    pub fn from_safetensors(bytes: &[u8]) -> Result<Self> {
        let mut map = WeightMap::new();
        map.extend_from_safetensors(bytes)?;
        Ok(map)
    }

    /// Add every tensor of a safetensors buffer, converting floats to f32.
    pub fn extend_from_safetensors(&mut self, bytes: &[u8]) -> Result<()> {
        let st = SafeTensors::deserialize(bytes)?;
        for (name, view) in st.tensors() {
            if self.tensors.contains_key(&name) {
                return Err(GemmaError::InvalidModel(format!(
                    "{name} appears in more than one shard"
                )));
            }
            let tensor = convert_view(&name, &view)?;
            self.tensors.insert(name, tensor);
        }
        Ok(())
    }

    /// Serialize as a single safetensors buffer: f32 as F32, int8 as I8.
    pub fn to_safetensors(&self) -> Result<Vec<u8>> {
        let sorted: BTreeMap<&String, &RawTensor> = self.tensors.iter().collect();
        let mut storage: Vec<(&str, Dtype, &[usize], Vec<u8>)> = Vec::with_capacity(sorted.len());
        for (name, t) in sorted {
            let (dtype, bytes): (Dtype, Vec<u8>) = match &t.data {
                TensorData::F32(v) => (Dtype::F32, v.iter().flat_map(|x| x.to_le_bytes()).collect()),
                TensorData::I8(v) => (Dtype::I8, v.iter().map(|&x| x as u8).collect()),
            };
            storage.push((name.as_str(), dtype, t.shape.as_slice(), bytes));
        }
        let mut views: Vec<(&str, TensorView<'_>)> = Vec::with_capacity(storage.len());
        for (name, dtype, shape, bytes) in &storage {
            views.push((*name, TensorView::new(*dtype, shape.to_vec(), bytes)?));
        }
        Ok(safetensors::serialize(views, None)?)
    }

    /// Write a single-file safetensors checkpoint.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_safetensors()?)?;
        Ok(())
    }
}

/// Element count of `shape`, failing instead of overflowing.
fn checked_numel(name: &str, shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| GemmaError::InvalidModel(format!("{name}: shape {shape:?} overflows")))
}

fn convert_view(name: &str, view: &TensorView<'_>) -> Result<RawTensor> {
    let shape = view.shape().to_vec();
    let numel = checked_numel(name, &shape)?;
    let bytes = view.data();
    let expect_width = |width: usize| -> Result<()> {
        if numel.checked_mul(width) != Some(bytes.len()) {
            return Err(GemmaError::InvalidModel(format!(
                "{name}: {} bytes for shape {shape:?}",
                bytes.len()
            )));
        }
        Ok(())
    };

    let data = match view.dtype() {
        Dtype::F32 => {
            expect_width(4)?;
            TensorData::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )
        }
        Dtype::F16 => {
            expect_width(2)?;
            TensorData::F32(
                bytes
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
            )
        }
        Dtype::BF16 => {
            expect_width(2)?;
            TensorData::F32(
                bytes
                    .chunks_exact(2)
                    .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
            )
        }
        Dtype::I8 => {
            expect_width(1)?;
            TensorData::I8(bytes.iter().map(|&b| b as i8).collect())
        }
        other => {
            return Err(GemmaError::InvalidModel(format!(
                "{name}: unsupported dtype {other:?}"
            )));
        }
    };
    Ok(RawTensor { shape, data })
}

impl WeightSource for WeightMap {
    fn tensor(&self, name: &str) -> Option<&RawTensor> {
        self.tensors.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> WeightMap {
        let mut map = WeightMap::new();
        map.insert("a.weight", RawTensor::f32(&[2, 2], vec![1.0, -2.5, 3.25, 0.0]));
        map.insert("a.weight_scaler", RawTensor::f32(&[2], vec![0.5, 2.0]));
        map.insert("b.weight", RawTensor::i8(&[3], vec![-128, 0, 127]));
        map
    }

    #[test]
    fn safetensors_round_trip_preserves_dtypes() {
        let map = sample_map();
        let bytes = map.to_safetensors().unwrap();
        let back = WeightMap::from_safetensors(&bytes).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back.tensor("a.weight"), map.tensor("a.weight"));
        assert_eq!(back.tensor("a.weight_scaler"), map.tensor("a.weight_scaler"));
        assert_eq!(back.tensor("b.weight"), map.tensor("b.weight"));
    }

    #[test]
    fn half_precision_tensors_widen_to_f32() {
        let bf: Vec<u8> = [1.5f32, -2.0, 0.375]
            .iter()
            .flat_map(|&x| bf16::from_f32(x).to_le_bytes())
            .collect();
        let hf: Vec<u8> = [0.25f32, 3.0]
            .iter()
            .flat_map(|&x| f16::from_f32(x).to_le_bytes())
            .collect();
        let views = vec![
            ("n.weight", TensorView::new(Dtype::BF16, vec![3], &bf).unwrap()),
            ("m.weight", TensorView::new(Dtype::F16, vec![2, 1], &hf).unwrap()),
        ];
        let bytes = safetensors::serialize(views, None).unwrap();

        let map = WeightMap::from_safetensors(&bytes).unwrap();
        assert_eq!(map.f32_tensor("n.weight", &[3]).unwrap(), vec![1.5, -2.0, 0.375]);
        assert_eq!(map.f32_tensor("m.weight", &[2, 1]).unwrap(), vec![0.25, 3.0]);
    }

    #[test]
    fn unsupported_dtype_is_rejected() {
        let raw = [0u8; 8];
        let views = vec![("x", TensorView::new(Dtype::I64, vec![1], &raw).unwrap())];
        let bytes = safetensors::serialize(views, None).unwrap();
        assert!(matches!(
            WeightMap::from_safetensors(&bytes),
            Err(GemmaError::InvalidModel(_))
        ));
    }

    #[test]
    fn shards_merge_and_reject_duplicate_names() {
        let mut first = WeightMap::new();
        first.insert("a.weight", RawTensor::f32(&[1], vec![1.0]));
        let mut second = WeightMap::new();
        second.insert("b.weight", RawTensor::i8(&[2], vec![3, -3]));

        let mut merged = WeightMap::from_safetensors(&first.to_safetensors().unwrap()).unwrap();
        merged
            .extend_from_safetensors(&second.to_safetensors().unwrap())
            .unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.i8_tensor("b.weight", &[2]).unwrap(), vec![3, -3]);

        let again = merged.extend_from_safetensors(&first.to_safetensors().unwrap());
        assert!(matches!(again, Err(GemmaError::InvalidModel(_))));
    }

    #[test]
    fn overflowing_header_shape_is_an_error() {
        let header = r#"{"w":{"dtype":"F32","shape":[18446744073709551615,4],"data_offsets":[0,16]}}"#;
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        assert!(WeightMap::from_safetensors(&bytes).is_err());
    }

    #[test]
    fn element_count_overflow_is_reported() {
        assert!(matches!(
            checked_numel("w", &[usize::MAX, 4]),
            Err(GemmaError::InvalidModel(_))
        ));
        assert_eq!(checked_numel("w", &[3, 4]).unwrap(), 12);
        assert_eq!(checked_numel("w", &[]).unwrap(), 1);
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(WeightMap::from_safetensors(&[0u8; 12]).is_err());
    }

    #[test]
    fn linear_follows_quantization_flag() {
        let mut map = WeightMap::new();
        map.insert("p.weight", RawTensor::i8(&[2, 3], vec![1, 2, 3, 4, 5, 6]));
        map.insert("p.weight_scaler", RawTensor::f32(&[2], vec![1.0, 0.5]));
        let linear = map.linear("p", 3, 2, true).unwrap();
        assert!(linear.is_quantized());
        assert_eq!(linear.row(1), vec![2.0, 2.5, 3.0]);

        // Dense load of an i8 tensor is a dtype error
        assert!(map.linear("p", 3, 2, false).is_err());
    }

    #[test]
    fn shape_mismatch_and_missing_names_are_fatal() {
        let mut map = WeightMap::new();
        map.insert("n.weight", RawTensor::f32(&[4], vec![0.0; 4]));
        assert!(map.rms_norm("n.weight", 3, 1e-6).is_err());
        assert!(map.rms_norm("missing.weight", 4, 1e-6).is_err());
        assert_eq!(map.rms_norm("n.weight", 4, 1e-6).unwrap().dim(), 4);
    }
}

//! Error types for Gemma inference.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GemmaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("Invalid model file: {0}")]
    InvalidModel(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Cache write position {position} outside [0, {max_len})")]
    CachePosition { position: usize, max_len: usize },

    #[error("Sequence length {required} exceeds maximum context length {max}")]
    ContextOverflow { required: usize, max: usize },

    #[error("Top-p/top-k filtering removed every candidate for sequence {sequence}")]
    EmptyCandidateSet { sequence: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
}

pub type Result<T> = std::result::Result<T, GemmaError>;

//! Error types for Qwen inference.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QwenError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid model file: {0}")]
    InvalidModel(String),

    /// Wrong rank, shape or index on a public entry point.
    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Model directory not found: {}", .0.display())]
    ModelDirNotFound(PathBuf),
}

pub type Result<T> = std::result::Result<T, QwenError>;

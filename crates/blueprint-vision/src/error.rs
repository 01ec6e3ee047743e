//! Error types for the detection pipeline

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Inference call failed: {0}")]
    Inference(String),

    #[error("Inference call timed out: {0}")]
    Timeout(String),

    #[error("Malformed response: {0}")]
    Parse(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<image::ImageError> for VisionError {
    fn from(err: image::ImageError) -> Self {
        Self::Image(err.to_string())
    }
}

impl From<base64::DecodeError> for VisionError {
    fn from(err: base64::DecodeError) -> Self {
        Self::InvalidInput(format!("base64 payload: {err}"))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, VisionError>;

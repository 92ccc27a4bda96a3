use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the food recognition pipelines and service.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("TensorFlow error: {0}")]
    Tensorflow(#[from] tensorflow::Status),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The trained model could not be found where it was expected.
    #[error("Model file '{}' not found.", .0.display())]
    ModelNotFound(PathBuf),

    #[error("Invalid model artifact: {0}")]
    InvalidArtifact(String),

    #[error("Dataset error: {0}")]
    Dataset(String),
}

pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("failed to fetch {url}: {reason}")]
    FetchFailure { url: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("enhancement failed: {0}")]
    Enhance(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

//! Error types for chart_texcache.

use thiserror::Error;

use crate::format::ColorScheme;

/// Error types for texture cache operations.
#[derive(Error, Debug)]
pub enum TexCacheError {
    #[error("Tile out of bounds: x={x}, y={y} (chart is {width}x{height})")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    },

    #[error("Invalid mip level {level} (max {max})")]
    InvalidLevel { level: u32, max: u32 },

    #[error("Cache file format error: {0}")]
    Format(String),

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Color scheme {requested:?} is not loaded (current {current:?})")]
    SchemeMismatch {
        requested: ColorScheme,
        current: ColorScheme,
    },

    #[error("Job aborted")]
    Aborted,

    #[error("Texture upload failed: {0}")]
    Upload(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Result type alias for texture cache operations.
pub type TexResult<T> = Result<T, TexCacheError>;

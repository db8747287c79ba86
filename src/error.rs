use std::path::PathBuf;

use thiserror::Error;

use crate::handle::EngineState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load native engine: {0}")]
    Load(#[from] libloading::Error),

    #[error("engine initialization failed ({code}): {message}")]
    Init { code: i32, message: String },

    #[error("engine is already initialized")]
    AlreadyInitialized,

    #[error("engine is not ready (state: {0:?})")]
    NotReady(EngineState),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("querying the last engine error failed with code {0}")]
    ErrorQuery(i32),

    #[error("image file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("path cannot be passed to the engine: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("failed to allocate {bytes} bytes for results")]
    Allocation { bytes: usize },

    #[error(
        "invalid pixel buffer: {width}x{height}, stride {stride}, {channel_count} channel(s), {len} bytes"
    )]
    PixelBuffer {
        width: u32,
        height: u32,
        stride: u32,
        channel_count: u32,
        len: usize,
    },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("download failed: {0}")]
    Download(String),

    #[error("invalid contour parameters: {0}")]
    Config(#[from] serde_json::Error),

    #[error("screen capture is not available in this build")]
    CaptureUnavailable,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

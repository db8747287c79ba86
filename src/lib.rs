pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod handle;
pub mod last_error;
pub mod marker;
pub mod pixels;
pub mod prune;
pub mod scanner;

#[cfg(test)]
mod testing;

pub use config::ScannerConfig;
pub use engine::{Engine, NativeEngine};
pub use error::{Error, Result};
pub use ffi::{ContourParameters, Point};
pub use handle::{EngineHandle, EngineState, Session};
pub use marker::Marker;
pub use pixels::{Bitmap, PixelBuffer, PixelFormat};
pub use scanner::{report, save_report, Scanner, Source};

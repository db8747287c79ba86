use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::ffi::{ContourParameters, DEFAULT_QUALITY};

#[cfg(test)]
use std::io::Write;

pub const LIBRARY_ENV: &str = "WCD_LIBRARY";

#[derive(Debug, Clone, PartialEq)]
pub struct ScannerConfig {
    pub library: PathBuf,
    /// 0 lets the engine choose, 1-99 recompresses as JPEG first, 100 decodes as is.
    pub quality: u32,
    pub contour: ContourParameters,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            library: default_library(),
            quality: DEFAULT_QUALITY,
            contour: ContourParameters::default(),
        }
    }
}

pub fn default_library() -> PathBuf {
    match env::var_os(LIBRARY_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(platform_library_name()),
    }
}

fn platform_library_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "libwcd0.dll"
    } else if cfg!(target_os = "macos") {
        "libwcd0.dylib"
    } else {
        "libwcd0.so"
    }
}

/// Reads contour parameters from a JSON object. Missing fields keep their
/// defaults.
pub fn load_contour(path: &Path) -> Result<ContourParameters> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

#[test]
fn default_config_test() {
    let config = ScannerConfig::default();

    assert_eq!(config.quality, 100);
    assert_eq!(config.contour, ContourParameters::default());
    assert!(config.library.to_string_lossy().contains("wcd0") || env::var_os(LIBRARY_ENV).is_some());
}

#[test]
fn load_contour_test() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"area_threshold": 500, "canny_high": 150.5}}"#).unwrap();

    let params = load_contour(file.path()).unwrap();

    assert_eq!(params.area_threshold, 500.0);
    assert_eq!(params.binarize_threshold, 225.0);
    assert_eq!(params.canny_low, 50.0);
    assert_eq!(params.canny_high, 150.5);
}

#[test]
fn load_contour_invalid_test() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "not json").unwrap();

    assert!(matches!(
        load_contour(file.path()),
        Err(crate::error::Error::Config(_))
    ));
    assert!(matches!(
        load_contour(Path::new("./no-such-contour.json")),
        Err(crate::error::Error::Io(_))
    ));
}

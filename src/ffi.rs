//! Raw C ABI shared with the native wcd engine.
//!
//! Every struct here is `#[repr(C)]` and mirrors the engine's own layout
//! field for field. Nothing in this module owns memory.

use std::mem::size_of;
use std::os::raw::{c_char, c_int, c_void};

use serde::Deserialize;

/// 72 marker positions times 4 symbol variants per position.
pub const MAX_RESULTS: usize = 288;

pub const DEFAULT_QUALITY: u32 = 100;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// One record written by the engine into a [`crate::buffer::ResultBuffer`].
///
/// `points` and `data` are allocated by the engine. Once a decode call
/// returns a nonzero count they belong to the caller and must each be
/// released exactly once through [`crate::engine::Engine::free`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawScanResult {
    pub data_len: u32,
    pub points_len: u32,
    pub points: *mut Point,
    pub data: *mut u8,
}

impl RawScanResult {
    pub const EMPTY: RawScanResult = RawScanResult {
        data_len: 0,
        points_len: 0,
        points: std::ptr::null_mut(),
        data: std::ptr::null_mut(),
    };
}

pub const RAW_SCAN_RESULT_SIZE: usize = size_of::<RawScanResult>();

/// Tunables for contour pruning.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ContourParameters {
    pub area_threshold: f64,
    pub binarize_threshold: f64,
    pub canny_low: f64,
    pub canny_high: f64,
}

impl Default for ContourParameters {
    fn default() -> Self {
        ContourParameters {
            area_threshold: 1150.0,
            binarize_threshold: 225.0,
            canny_low: 50.0,
            canny_high: 100.0,
        }
    }
}

/// In/out argument of `prune`.
///
/// The first five fields are filled by the caller. The engine fills
/// `result_data` (engine-allocated, owned by the caller afterwards) and
/// `result_data_size`.
#[repr(C)]
#[derive(Debug)]
pub struct ImageInfo {
    pub img_buffer: *mut u8,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub channel_count: u32,
    pub result_data: *mut u8,
    pub result_data_size: u64,
}

pub type InitModelFn = unsafe extern "C" fn() -> c_int;
pub type ReleaseModelFn = unsafe extern "C" fn();
pub type GetLastErrorFn = unsafe extern "C" fn(buf: *mut c_char, len: c_int) -> c_int;
pub type DecodeFn = unsafe extern "C" fn(
    img_path: *const c_char,
    result_buffer: *mut RawScanResult,
    buffer_size: u64,
    quality: u32,
) -> u64;
pub type DecodeBitmapFn = unsafe extern "C" fn(
    img_buffer: *mut u8,
    width: u32,
    height: u32,
    stride: u32,
    channel_count: u32,
    result_buffer: *mut RawScanResult,
    buffer_size: u64,
) -> u64;
pub type PruneFn =
    unsafe extern "C" fn(image_info: *mut ImageInfo, params: *const ContourParameters) -> u64;
pub type FreeBufferFn = unsafe extern "C" fn(ptr: *mut c_void);

#[test]
fn abi_layout_test() {
    use std::mem::align_of;

    assert_eq!(size_of::<Point>(), 8);
    assert_eq!(align_of::<Point>(), 4);

    assert_eq!(RAW_SCAN_RESULT_SIZE, 8 + 2 * size_of::<usize>());
    assert_eq!(size_of::<ContourParameters>(), 32);
}

#[test]
fn contour_parameters_default_test() {
    let params: ContourParameters = serde_json::from_str(r#"{"canny_low": 30}"#).unwrap();

    assert_eq!(
        params,
        ContourParameters {
            canny_low: 30.0,
            ..ContourParameters::default()
        }
    );
    assert_eq!(params.area_threshold, 1150.0);
    assert_eq!(params.binarize_threshold, 225.0);
    assert_eq!(params.canny_high, 100.0);
}

//! Scripted stand-in for the native engine.
//!
//! Payloads are allocated on the Rust heap and tracked in a ledger so tests
//! can assert that every pointer handed over is freed exactly once.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ffi::CStr;
use std::io::Cursor;
use std::mem::{align_of, size_of};
use std::os::raw::{c_char, c_void};
use std::ptr;
use std::slice;

use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use imageproc::contours::find_contours;
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::morphology::dilate;

use crate::engine::Engine;
use crate::ffi::{ContourParameters, ImageInfo, Point, RawScanResult, RAW_SCAN_RESULT_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InitModel,
    ReleaseModel,
    GetLastError {
        len: i32,
    },
    Decode {
        path: Option<String>,
        buffer_size: u64,
        quality: u32,
    },
    DecodeBitmap {
        width: u32,
        height: u32,
        stride: u32,
        channel_count: u32,
        buffer_size: u64,
    },
    Prune {
        width: u32,
        height: u32,
        stride: u32,
        channel_count: u32,
    },
}

#[derive(Debug, Clone)]
pub struct FakeRecord {
    text: Option<String>,
    points: Vec<Point>,
}

impl FakeRecord {
    pub fn new(text: &str, points: &[(i32, i32)]) -> FakeRecord {
        FakeRecord {
            text: Some(text.to_string()),
            points: points.iter().map(|&(x, y)| Point { x, y }).collect(),
        }
    }

    /// A record the engine left zeroed.
    pub fn empty() -> FakeRecord {
        FakeRecord {
            text: None,
            points: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PruneScript {
    /// Replies with `status`, optionally allocating `data`. `size` overrides
    /// the reported result size.
    Reply {
        status: u64,
        data: Option<Vec<u8>>,
        size: Option<u64>,
    },
    /// Crops to the largest contour and replies with a PNG.
    CropContour,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    error: String,
    error_query_result: Option<i32>,
    init_failure: Option<i32>,
    decode_failure: Option<String>,
    records: Vec<FakeRecord>,
    records_written: usize,
    prune: Option<PruneScript>,
    prune_params: Option<ContourParameters>,
    live: HashMap<usize, Layout>,
    freed: HashSet<usize>,
    frees: usize,
    double_frees: usize,
}

impl FakeState {
    fn alloc(&mut self, bytes: &[u8], align: usize) -> *mut c_void {
        if bytes.is_empty() {
            return ptr::null_mut();
        }

        let layout = Layout::from_size_align(bytes.len(), align).unwrap();
        let raw = unsafe { alloc(layout) };
        assert!(!raw.is_null());

        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), raw, bytes.len()) };
        self.live.insert(raw as usize, layout);

        raw as *mut c_void
    }

    fn write_records(&mut self, result_buffer: *mut RawScanResult, buffer_size: u64) -> u64 {
        if let Some(message) = &self.decode_failure {
            self.error = message.clone();
            return 0;
        }

        let capacity = buffer_size as usize / RAW_SCAN_RESULT_SIZE;
        if result_buffer.is_null() || capacity == 0 {
            self.error = "result is null".to_string();
            return 0;
        }

        unsafe { ptr::write_bytes(result_buffer, 0, capacity) };

        let records = self.records.clone();
        self.records_written = records.len().min(capacity);

        for (index, record) in records.iter().take(capacity).enumerate() {
            let mut raw = RawScanResult::EMPTY;

            if let Some(text) = record.text.as_ref().filter(|text| !text.is_empty()) {
                raw.data_len = text.len() as u32;
                raw.data = self.alloc(text.as_bytes(), 1) as *mut u8;
            }

            if !record.points.is_empty() {
                let bytes = unsafe {
                    slice::from_raw_parts(
                        record.points.as_ptr() as *const u8,
                        record.points.len() * size_of::<Point>(),
                    )
                };
                raw.points_len = record.points.len() as u32;
                raw.points = self.alloc(bytes, align_of::<Point>()) as *mut Point;
            }

            unsafe { ptr::write(result_buffer.add(index), raw) };
        }

        records.len() as u64
    }
}

pub struct FakeEngine {
    state: RefCell<FakeState>,
}

impl FakeEngine {
    pub fn new() -> FakeEngine {
        FakeEngine {
            state: RefCell::new(FakeState::default()),
        }
    }

    pub fn set_error(&self, message: &str) {
        self.state.borrow_mut().error = message.to_string();
    }

    pub fn fail_error_query(&self, code: i32) {
        self.state.borrow_mut().error_query_result = Some(code);
    }

    pub fn fail_init(&self, code: i32, message: &str) {
        let mut state = self.state.borrow_mut();
        state.init_failure = Some(code);
        state.error = message.to_string();
    }

    /// Makes every following decode fail with `message` as the last error.
    pub fn fail_decode(&self, message: &str) {
        self.state.borrow_mut().decode_failure = Some(message.to_string());
    }

    pub fn set_records(&self, records: Vec<FakeRecord>) {
        self.state.borrow_mut().records = records;
    }

    pub fn set_prune(&self, script: PruneScript) {
        self.state.borrow_mut().prune = Some(script);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn live_allocations(&self) -> HashSet<usize> {
        self.state.borrow().live.keys().copied().collect()
    }

    pub fn freed(&self) -> HashSet<usize> {
        self.state.borrow().freed.clone()
    }

    pub fn frees(&self) -> usize {
        self.state.borrow().frees
    }

    pub fn double_frees(&self) -> usize {
        self.state.borrow().double_frees
    }

    pub fn records_written(&self) -> usize {
        self.state.borrow().records_written
    }

    pub fn last_prune_params(&self) -> Option<ContourParameters> {
        self.state.borrow().prune_params
    }
}

impl Engine for FakeEngine {
    unsafe fn init_model(&self) -> i32 {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::InitModel);

        match state.init_failure {
            Some(code) => code,
            None => {
                state.error.clear();
                0
            }
        }
    }

    unsafe fn release_model(&self) {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::ReleaseModel);
        state.error.clear();
    }

    unsafe fn get_last_error(&self, buf: *mut c_char, len: i32) -> i32 {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::GetLastError { len });

        if let Some(code) = state.error_query_result {
            return code;
        }

        let size = state.error.len() as i32;
        if size == 0 {
            return 0;
        }
        if buf.is_null() || len == 0 {
            return size;
        }
        if len < size {
            return -1;
        }

        ptr::copy_nonoverlapping(state.error.as_ptr(), buf as *mut u8, size as usize);
        size
    }

    unsafe fn decode(
        &self,
        img_path: *const c_char,
        result_buffer: *mut RawScanResult,
        buffer_size: u64,
        quality: u32,
    ) -> u64 {
        let mut state = self.state.borrow_mut();
        let path = if img_path.is_null() {
            None
        } else {
            Some(CStr::from_ptr(img_path).to_string_lossy().into_owned())
        };
        state.calls.push(Call::Decode {
            path,
            buffer_size,
            quality,
        });
        state.error.clear();

        state.write_records(result_buffer, buffer_size)
    }

    unsafe fn decode_bitmap(
        &self,
        _img_buffer: *mut u8,
        width: u32,
        height: u32,
        stride: u32,
        channel_count: u32,
        result_buffer: *mut RawScanResult,
        buffer_size: u64,
    ) -> u64 {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::DecodeBitmap {
            width,
            height,
            stride,
            channel_count,
            buffer_size,
        });

        state.write_records(result_buffer, buffer_size)
    }

    unsafe fn prune(&self, image_info: *mut ImageInfo, params: *const ContourParameters) -> u64 {
        let mut state = self.state.borrow_mut();
        let info = &mut *image_info;
        let params = *params;

        state.calls.push(Call::Prune {
            width: info.width,
            height: info.height,
            stride: info.stride,
            channel_count: info.channel_count,
        });
        state.prune_params = Some(params);

        match state.prune.clone() {
            None => 0,
            Some(PruneScript::Reply { status, data, size }) => {
                if let Some(data) = data {
                    info.result_data = state.alloc(&data, 1) as *mut u8;
                    info.result_data_size = data.len() as u64;
                }
                if let Some(size) = size {
                    info.result_data_size = size;
                }
                status
            }
            Some(PruneScript::CropContour) => match crop_dominant_contour(info, &params) {
                Some(png) => {
                    info.result_data = state.alloc(&png, 1) as *mut u8;
                    info.result_data_size = png.len() as u64;
                    1
                }
                None => 0,
            },
        }
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        let mut state = self.state.borrow_mut();
        let address = ptr as usize;

        match state.live.remove(&address) {
            Some(layout) => {
                dealloc(ptr as *mut u8, layout);
                state.freed.insert(address);
                state.frees += 1;
            }
            None => state.double_frees += 1,
        }
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        for (address, layout) in self.state.get_mut().live.drain() {
            unsafe { dealloc(address as *mut u8, layout) };
        }
    }
}

unsafe fn crop_dominant_contour(info: &ImageInfo, params: &ContourParameters) -> Option<Vec<u8>> {
    let (width, height) = (info.width, info.height);
    let stride = info.stride as usize;
    let channels = info.channel_count as usize;
    let pixels = slice::from_raw_parts(info.img_buffer as *const u8, stride * height as usize);

    let rgb = |x: u32, y: u32| -> [u8; 3] {
        let offset = y as usize * stride + x as usize * channels;
        if channels >= 3 {
            [pixels[offset + 2], pixels[offset + 1], pixels[offset]]
        } else {
            [pixels[offset]; 3]
        }
    };

    let binary = GrayImage::from_fn(width, height, |x, y| {
        let [r, g, b] = rgb(x, y);
        let luma = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
        if luma < params.binarize_threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    });

    let edges = canny(&binary, params.canny_low as f32, params.canny_high as f32);
    let edges = dilate(&edges, Norm::LInf, 1);

    let (x0, y0, x1, y1) = find_contours::<i32>(&edges)
        .iter()
        .filter_map(|contour| {
            let xs = contour.points.iter().map(|point| point.x);
            let ys = contour.points.iter().map(|point| point.y);
            Some((xs.clone().min()?, ys.clone().min()?, xs.max()?, ys.max()?))
        })
        .filter(|&(x0, y0, x1, y1)| ((x1 - x0 + 1) * (y1 - y0 + 1)) as f64 >= params.area_threshold)
        .max_by_key(|&(x0, y0, x1, y1)| (x1 - x0 + 1) * (y1 - y0 + 1))?;

    let color = RgbImage::from_fn(width, height, |x, y| Rgb(rgb(x, y)));
    let cropped = image::imageops::crop_imm(
        &color,
        x0 as u32,
        y0 as u32,
        (x1 - x0 + 1) as u32,
        (y1 - y0 + 1) as u32,
    )
    .to_image();

    let mut png = Vec::new();
    DynamicImage::ImageRgb8(cropped)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .ok()?;

    Some(png)
}

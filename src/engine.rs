use std::os::raw::{c_char, c_void};
use std::path::Path;

use libloading::Library;
use log::debug;

use crate::error::Result;
use crate::ffi::{
    ContourParameters, DecodeBitmapFn, DecodeFn, FreeBufferFn, GetLastErrorFn, ImageInfo,
    InitModelFn, PruneFn, RawScanResult, ReleaseModelFn,
};

/// The native engine's entry points.
///
/// Implementations forward straight to the engine; the lifecycle rules
/// (initialize before use, release exactly once) are enforced by
/// [`crate::handle::EngineHandle`], not here.
///
/// # Safety
///
/// Every method is a raw foreign call. Pointers must satisfy the contract
/// documented on the corresponding `ffi` function type.
pub trait Engine {
    unsafe fn init_model(&self) -> i32;

    unsafe fn release_model(&self);

    unsafe fn get_last_error(&self, buf: *mut c_char, len: i32) -> i32;

    unsafe fn decode(
        &self,
        img_path: *const c_char,
        result_buffer: *mut RawScanResult,
        buffer_size: u64,
        quality: u32,
    ) -> u64;

    #[allow(clippy::too_many_arguments)]
    unsafe fn decode_bitmap(
        &self,
        img_buffer: *mut u8,
        width: u32,
        height: u32,
        stride: u32,
        channel_count: u32,
        result_buffer: *mut RawScanResult,
        buffer_size: u64,
    ) -> u64;

    unsafe fn prune(&self, image_info: *mut ImageInfo, params: *const ContourParameters) -> u64;

    /// Releases memory the engine allocated and handed over to the caller.
    unsafe fn free(&self, ptr: *mut c_void);
}

impl<E: Engine + ?Sized> Engine for &E {
    unsafe fn init_model(&self) -> i32 {
        (**self).init_model()
    }

    unsafe fn release_model(&self) {
        (**self).release_model()
    }

    unsafe fn get_last_error(&self, buf: *mut c_char, len: i32) -> i32 {
        (**self).get_last_error(buf, len)
    }

    unsafe fn decode(
        &self,
        img_path: *const c_char,
        result_buffer: *mut RawScanResult,
        buffer_size: u64,
        quality: u32,
    ) -> u64 {
        (**self).decode(img_path, result_buffer, buffer_size, quality)
    }

    unsafe fn decode_bitmap(
        &self,
        img_buffer: *mut u8,
        width: u32,
        height: u32,
        stride: u32,
        channel_count: u32,
        result_buffer: *mut RawScanResult,
        buffer_size: u64,
    ) -> u64 {
        (**self).decode_bitmap(
            img_buffer,
            width,
            height,
            stride,
            channel_count,
            result_buffer,
            buffer_size,
        )
    }

    unsafe fn prune(&self, image_info: *mut ImageInfo, params: *const ContourParameters) -> u64 {
        (**self).prune(image_info, params)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        (**self).free(ptr)
    }
}

/// The engine shared library, loaded at runtime.
pub struct NativeEngine {
    init_model: InitModelFn,
    release_model: ReleaseModelFn,
    get_last_error: GetLastErrorFn,
    decode: DecodeFn,
    decode_bitmap: DecodeBitmapFn,
    prune: PruneFn,
    free_buffer: Option<FreeBufferFn>,
    // Keeps the function pointers above valid.
    _library: Library,
}

impl NativeEngine {
    pub fn load(path: &Path) -> Result<NativeEngine> {
        debug!("loading native engine from {}", path.display());

        // SAFETY: the library is trusted to export the wcd C ABI, and the
        // copied function pointers never outlive `_library`.
        unsafe {
            let library = Library::new(path)?;

            let init_model = *library.get::<InitModelFn>(b"init_model\0")?;
            let release_model = *library.get::<ReleaseModelFn>(b"release_model\0")?;
            let get_last_error = *library.get::<GetLastErrorFn>(b"get_last_error\0")?;
            let decode = *library.get::<DecodeFn>(b"decode\0")?;
            let decode_bitmap = *library.get::<DecodeBitmapFn>(b"decode_bitmap\0")?;
            let prune = *library.get::<PruneFn>(b"prune\0")?;
            let free_buffer = library
                .get::<FreeBufferFn>(b"free_buffer\0")
                .ok()
                .map(|symbol| *symbol);

            if free_buffer.is_none() {
                debug!("engine exports no free_buffer, falling back to the C runtime free");
            }

            Ok(NativeEngine {
                init_model,
                release_model,
                get_last_error,
                decode,
                decode_bitmap,
                prune,
                free_buffer,
                _library: library,
            })
        }
    }
}

impl Engine for NativeEngine {
    unsafe fn init_model(&self) -> i32 {
        (self.init_model)()
    }

    unsafe fn release_model(&self) {
        (self.release_model)()
    }

    unsafe fn get_last_error(&self, buf: *mut c_char, len: i32) -> i32 {
        (self.get_last_error)(buf, len)
    }

    unsafe fn decode(
        &self,
        img_path: *const c_char,
        result_buffer: *mut RawScanResult,
        buffer_size: u64,
        quality: u32,
    ) -> u64 {
        (self.decode)(img_path, result_buffer, buffer_size, quality)
    }

    unsafe fn decode_bitmap(
        &self,
        img_buffer: *mut u8,
        width: u32,
        height: u32,
        stride: u32,
        channel_count: u32,
        result_buffer: *mut RawScanResult,
        buffer_size: u64,
    ) -> u64 {
        (self.decode_bitmap)(
            img_buffer,
            width,
            height,
            stride,
            channel_count,
            result_buffer,
            buffer_size,
        )
    }

    unsafe fn prune(&self, image_info: *mut ImageInfo, params: *const ContourParameters) -> u64 {
        (self.prune)(image_info, params)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        match self.free_buffer {
            Some(free_buffer) => free_buffer(ptr),
            None => libc::free(ptr),
        }
    }
}

#[test]
fn load_missing_library_test() {
    let result = NativeEngine::load(Path::new("./no-such-dir/libwcd0-missing.so"));

    assert!(matches!(result, Err(crate::error::Error::Load(_))));
}

use std::convert::TryFrom;
use std::os::raw::c_void;
use std::ptr;
use std::slice;

use log::debug;

use crate::buffer::NativeAlloc;
use crate::engine::Engine;
use crate::ffi::{ContourParameters, ImageInfo};
use crate::pixels::PixelBuffer;

#[cfg(test)]
use crate::testing::{FakeEngine, PruneScript};
#[cfg(test)]
use maplit::hashset;

/// Runs the engine's contour pruning over `pixels`.
///
/// Returns the engine's re-encoded image bytes, or `None` when no contour
/// was found. The engine's result buffer is released before returning.
pub fn prune<E: Engine + ?Sized>(
    engine: &E,
    pixels: &mut PixelBuffer<'_>,
    params: &ContourParameters,
) -> Option<Vec<u8>> {
    let mut info = ImageInfo {
        img_buffer: pixels.as_mut_ptr(),
        width: pixels.width(),
        height: pixels.height(),
        stride: pixels.stride(),
        channel_count: pixels.channel_count(),
        result_data: ptr::null_mut(),
        result_data_size: 0,
    };

    let status = unsafe { engine.prune(&mut info, params) };
    let result = NativeAlloc::new(engine, info.result_data as *mut c_void);

    let size = match usize::try_from(info.result_data_size) {
        Ok(size) if (status as i64) > 0 && size > 0 && !result.is_null() => size,
        _ => {
            debug!(
                "no contour (status {}, size {}, data {:p})",
                status as i64,
                info.result_data_size,
                result.as_ptr()
            );
            return None;
        }
    };

    let bytes = unsafe { slice::from_raw_parts(result.as_ptr() as *const u8, size) };

    Some(bytes.to_vec())
}

#[test]
fn prune_success_test() {
    let engine = FakeEngine::new();
    engine.set_prune(PruneScript::Reply {
        status: 1,
        data: Some(b"encoded".to_vec()),
        size: None,
    });

    let mut pixels = vec![0u8; 12];
    let mut buffer = PixelBuffer::new(&mut pixels, 2, 2, 6, 3).unwrap();

    let result = prune(&engine, &mut buffer, &ContourParameters::default());

    assert_eq!(result, Some(b"encoded".to_vec()));
    assert_eq!(engine.frees(), 1);
    assert_eq!(engine.live_allocations(), hashset!());
    assert_eq!(engine.last_prune_params(), Some(ContourParameters::default()));
}

#[test]
fn prune_zero_size_test() {
    let engine = FakeEngine::new();
    engine.set_prune(PruneScript::Reply {
        status: 1,
        data: Some(b"stale".to_vec()),
        size: Some(0),
    });

    let mut pixels = vec![0u8; 12];
    let mut buffer = PixelBuffer::new(&mut pixels, 2, 2, 6, 3).unwrap();

    assert_eq!(
        prune(&engine, &mut buffer, &ContourParameters::default()),
        None
    );
    assert_eq!(engine.frees(), 1);
    assert_eq!(engine.live_allocations(), hashset!());
}

#[test]
fn prune_failure_status_test() {
    let engine = FakeEngine::new();
    engine.set_prune(PruneScript::Reply {
        status: 0,
        data: None,
        size: Some(42),
    });

    let mut pixels = vec![0u8; 4];
    let mut buffer = PixelBuffer::new(&mut pixels, 2, 2, 2, 1).unwrap();

    assert_eq!(
        prune(&engine, &mut buffer, &ContourParameters::default()),
        None
    );
    assert_eq!(engine.frees(), 0);

    engine.set_prune(PruneScript::Reply {
        status: u64::MAX,
        data: Some(vec![1, 2, 3]),
        size: None,
    });

    assert_eq!(
        prune(&engine, &mut buffer, &ContourParameters::default()),
        None
    );
    assert_eq!(engine.frees(), 1);
    assert_eq!(engine.live_allocations(), hashset!());
}

#[test]
fn prune_empty_reply_test() {
    let engine = FakeEngine::new();
    engine.set_prune(PruneScript::Reply {
        status: 1,
        data: Some(Vec::new()),
        size: None,
    });

    let mut pixels = vec![0u8; 12];
    let mut buffer = PixelBuffer::new(&mut pixels, 2, 2, 6, 3).unwrap();

    assert_eq!(
        prune(&engine, &mut buffer, &ContourParameters::default()),
        None
    );
    assert_eq!(engine.frees(), 0);
    assert_eq!(engine.double_frees(), 0);
}

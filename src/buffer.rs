use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::os::raw::c_void;
use std::ptr::{self, NonNull};
use std::slice;

use log::{trace, warn};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::ffi::{Point, RawScanResult, RAW_SCAN_RESULT_SIZE};
use crate::last_error::last_error;
use crate::marker::{ascii_text, Marker};

#[cfg(test)]
use crate::ffi::MAX_RESULTS;
#[cfg(test)]
use crate::testing::{FakeEngine, FakeRecord};
#[cfg(test)]
use maplit::hashset;

/// Ownership token for one engine-allocated pointer. Dropping it hands the
/// pointer back to the engine's deallocator exactly once.
pub struct NativeAlloc<'e, E: Engine + ?Sized> {
    engine: &'e E,
    ptr: *mut c_void,
}

impl<'e, E: Engine + ?Sized> NativeAlloc<'e, E> {
    pub fn new(engine: &'e E, ptr: *mut c_void) -> Self {
        NativeAlloc { engine, ptr }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn as_ptr(&self) -> *const c_void {
        self.ptr
    }
}

impl<E: Engine + ?Sized> Drop for NativeAlloc<'_, E> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            trace!("freeing native allocation {:p}", self.ptr);
            unsafe { self.engine.free(self.ptr) };
        }
    }
}

/// Caller-owned arena the engine writes result records into. It is
/// allocated once per decode call and never moved or resized while the
/// engine holds its address.
pub struct ResultBuffer {
    records: NonNull<RawScanResult>,
    layout: Layout,
    capacity: usize,
}

impl ResultBuffer {
    pub fn new(capacity: usize) -> Result<ResultBuffer> {
        let layout = Layout::array::<RawScanResult>(capacity).map_err(|_| Error::Allocation {
            bytes: capacity.saturating_mul(RAW_SCAN_RESULT_SIZE),
        })?;
        if layout.size() == 0 {
            return Err(Error::Allocation { bytes: 0 });
        }

        let raw = unsafe { alloc_zeroed(layout) } as *mut RawScanResult;
        let records = NonNull::new(raw).ok_or(Error::Allocation {
            bytes: layout.size(),
        })?;

        Ok(ResultBuffer {
            records,
            layout,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn byte_size(&self) -> u64 {
        self.layout.size() as u64
    }

    pub fn as_mut_ptr(&mut self) -> *mut RawScanResult {
        self.records.as_ptr()
    }

    /// Turns the engine's return value into markers.
    ///
    /// A zero count is disambiguated through the engine's last error: a
    /// message means the call failed, no message means nothing was found.
    pub fn finish<E: Engine + ?Sized>(mut self, engine: &E, count: u64) -> Result<Vec<Marker>> {
        if count == 0 {
            let message = last_error(engine)?;
            if message.is_empty() {
                return Ok(Vec::new());
            }
            return Err(Error::Decode(message));
        }

        Ok(self.take_markers(engine, count))
    }

    /// Copies out the first `count` records and frees their payloads.
    fn take_markers<E: Engine + ?Sized>(&mut self, engine: &E, count: u64) -> Vec<Marker> {
        let count = if count > self.capacity as u64 {
            warn!(
                "engine reported {} results but the buffer holds {}, reading {}",
                count, self.capacity, self.capacity
            );
            self.capacity
        } else {
            count as usize
        };

        (0..count)
            .map(|index| {
                let slot = unsafe { self.records.as_ptr().add(index) };
                let record = unsafe { ptr::replace(slot, RawScanResult::EMPTY) };
                claim(engine, index, record)
            })
            .collect()
    }
}

impl Drop for ResultBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.records.as_ptr() as *mut u8, self.layout) };
    }
}

fn claim<E: Engine + ?Sized>(engine: &E, index: usize, record: RawScanResult) -> Marker {
    let data = NativeAlloc::new(engine, record.data as *mut c_void);
    let points = NativeAlloc::new(engine, record.points as *mut c_void);

    if data.is_null() != (record.data_len == 0) {
        warn!(
            "result {} has data {:p} with length {}",
            index, record.data, record.data_len
        );
    }
    if points.is_null() != (record.points_len == 0) {
        warn!(
            "result {} has points {:p} with length {}",
            index, record.points, record.points_len
        );
    }

    let text = if data.is_null() {
        String::new()
    } else {
        let bytes =
            unsafe { slice::from_raw_parts(data.as_ptr() as *const u8, record.data_len as usize) };
        ascii_text(bytes)
    };

    let points = if points.is_null() {
        Vec::new()
    } else {
        unsafe {
            slice::from_raw_parts(points.as_ptr() as *const Point, record.points_len as usize)
        }
        .to_vec()
    };

    Marker { text, points }
}

#[test]
fn result_buffer_size_test() {
    let buffer = ResultBuffer::new(MAX_RESULTS).unwrap();

    assert_eq!(buffer.capacity(), 288);
    assert_eq!(buffer.byte_size(), (288 * RAW_SCAN_RESULT_SIZE) as u64);
    assert!(ResultBuffer::new(0).is_err());
}

#[test]
fn finish_frees_every_payload_test() {
    let engine = FakeEngine::new();
    engine.set_records(vec![
        FakeRecord::new("ABC123", &[(0, 0), (10, 10)]),
        FakeRecord::new("XYZ", &[(1, 2), (3, 4), (5, 6), (7, 8)]),
    ]);

    let mut buffer = ResultBuffer::new(MAX_RESULTS).unwrap();
    let byte_size = buffer.byte_size();
    let count = unsafe { engine.decode(ptr::null(), buffer.as_mut_ptr(), byte_size, 100) };
    let allocated = engine.live_allocations();

    assert_eq!(count, 2);
    assert_eq!(allocated.len(), 4);

    let markers = buffer.finish(&engine, count).unwrap();

    assert_eq!(
        markers,
        vec![
            Marker {
                text: "ABC123".to_string(),
                points: vec![Point { x: 0, y: 0 }, Point { x: 10, y: 10 }],
            },
            Marker {
                text: "XYZ".to_string(),
                points: vec![
                    Point { x: 1, y: 2 },
                    Point { x: 3, y: 4 },
                    Point { x: 5, y: 6 },
                    Point { x: 7, y: 8 },
                ],
            },
        ]
    );
    assert_eq!(engine.freed(), allocated);
    assert_eq!(engine.live_allocations(), hashset!());
    assert_eq!(engine.double_frees(), 0);
}

#[test]
fn finish_null_payload_test() {
    let engine = FakeEngine::new();
    engine.set_records(vec![FakeRecord::empty(), FakeRecord::new("A", &[])]);

    let mut buffer = ResultBuffer::new(MAX_RESULTS).unwrap();
    let byte_size = buffer.byte_size();
    let count = unsafe { engine.decode(ptr::null(), buffer.as_mut_ptr(), byte_size, 100) };
    let markers = buffer.finish(&engine, count).unwrap();

    assert_eq!(markers.len(), 2);
    assert_eq!(markers[0].text, "");
    assert!(markers[0].points.is_empty());
    assert_eq!(markers[1].text, "A");
    assert_eq!(markers[1].text.len(), 1);
    assert_eq!(engine.frees(), 1);
    assert_eq!(engine.live_allocations(), hashset!());
}

#[test]
fn finish_zero_count_test() {
    let engine = FakeEngine::new();

    let buffer = ResultBuffer::new(MAX_RESULTS).unwrap();
    assert_eq!(buffer.finish(&engine, 0).unwrap(), vec![]);

    engine.set_error("bad image");

    let buffer = ResultBuffer::new(MAX_RESULTS).unwrap();
    match buffer.finish(&engine, 0) {
        Err(Error::Decode(message)) => assert_eq!(message, "bad image"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn finish_clamps_overflowing_count_test() {
    let engine = FakeEngine::new();
    let records = (0..6)
        .map(|i| FakeRecord::new(&format!("M{}", i), &[(i, i)]))
        .collect();
    engine.set_records(records);

    let mut buffer = ResultBuffer::new(4).unwrap();
    let byte_size = buffer.byte_size();
    let count = unsafe { engine.decode(ptr::null(), buffer.as_mut_ptr(), byte_size, 100) };

    assert_eq!(count, 6);
    assert_eq!(engine.records_written(), 4);

    let markers = buffer.finish(&engine, count).unwrap();

    assert_eq!(markers.len(), 4);
    assert_eq!(markers[3].text, "M3");
    assert_eq!(engine.live_allocations(), hashset!());
    assert_eq!(engine.double_frees(), 0);
}

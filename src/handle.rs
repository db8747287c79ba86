use std::ffi::CString;
use std::ops::Deref;
use std::path::Path;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::buffer::ResultBuffer;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::ffi::{ContourParameters, MAX_RESULTS};
use crate::last_error::last_error;
use crate::marker::Marker;
use crate::pixels::PixelBuffer;
use crate::prune;

#[cfg(test)]
use crate::ffi::Point;
#[cfg(test)]
use crate::testing::{Call, FakeEngine, FakeRecord, PruneScript};
#[cfg(test)]
use maplit::hashset;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Calling,
    Released,
}

/// Owns the engine and tracks its lifecycle. Calls are serialized: the
/// state lock is held for the whole duration of each native call.
pub struct EngineHandle<E: Engine> {
    engine: E,
    state: Mutex<EngineState>,
}

impl<E: Engine> EngineHandle<E> {
    pub fn new(engine: E) -> EngineHandle<E> {
        EngineHandle {
            engine,
            state: Mutex::new(EngineState::Uninitialized),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock();

        match *state {
            EngineState::Uninitialized => {}
            EngineState::Ready | EngineState::Calling => return Err(Error::AlreadyInitialized),
            EngineState::Released => return Err(Error::NotReady(EngineState::Released)),
        }

        let code = unsafe { self.engine.init_model() };
        if code != 0 {
            let message = last_error(&self.engine)
                .unwrap_or_else(|err| format!("no diagnostic available ({})", err));
            return Err(Error::Init { code, message });
        }

        info!("engine initialized");
        *state = EngineState::Ready;

        Ok(())
    }

    /// Releases the engine. Only the first release after a successful
    /// initialization reaches the engine; every other call is a no-op.
    pub fn release(&self) {
        let mut state = self.state.lock();

        match *state {
            EngineState::Ready | EngineState::Calling => {
                unsafe { self.engine.release_model() };
                *state = EngineState::Released;
                info!("engine released");
            }
            EngineState::Uninitialized => debug!("release skipped, engine was never initialized"),
            EngineState::Released => debug!("release skipped, engine already released"),
        }
    }

    /// Initializes the engine and returns a guard that releases it on drop.
    pub fn session(&self) -> Result<Session<'_, E>> {
        self.initialize()?;
        Ok(Session { handle: self })
    }

    pub fn decode_file(&self, path: &Path, quality: u32) -> Result<Vec<Marker>> {
        let c_path = path
            .to_str()
            .and_then(|path| CString::new(path).ok())
            .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))?;

        self.call(|engine| {
            let mut buffer = ResultBuffer::new(MAX_RESULTS)?;
            let byte_size = buffer.byte_size();

            debug!("decode {} (quality {})", path.display(), quality);
            let count =
                unsafe { engine.decode(c_path.as_ptr(), buffer.as_mut_ptr(), byte_size, quality) };
            debug!("decode returned {}", count);

            buffer.finish(engine, count)
        })
    }

    pub fn decode_pixels(&self, pixels: &mut PixelBuffer<'_>) -> Result<Vec<Marker>> {
        self.call(|engine| {
            let mut buffer = ResultBuffer::new(MAX_RESULTS)?;
            let byte_size = buffer.byte_size();

            debug!(
                "decode_bitmap {}x{} stride {} channels {}",
                pixels.width(),
                pixels.height(),
                pixels.stride(),
                pixels.channel_count()
            );
            let count = unsafe {
                engine.decode_bitmap(
                    pixels.as_mut_ptr(),
                    pixels.width(),
                    pixels.height(),
                    pixels.stride(),
                    pixels.channel_count(),
                    buffer.as_mut_ptr(),
                    byte_size,
                )
            };
            debug!("decode_bitmap returned {}", count);

            buffer.finish(engine, count)
        })
    }

    pub fn prune(
        &self,
        pixels: &mut PixelBuffer<'_>,
        params: &ContourParameters,
    ) -> Result<Option<Vec<u8>>> {
        self.call(|engine| Ok(prune::prune(engine, pixels, params)))
    }

    fn call<T>(&self, f: impl FnOnce(&E) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        if *state != EngineState::Ready {
            return Err(Error::NotReady(*state));
        }

        *state = EngineState::Calling;
        let result = f(&self.engine);
        *state = EngineState::Ready;

        result
    }
}

impl<E: Engine> Drop for EngineHandle<E> {
    fn drop(&mut self) {
        if self.state() == EngineState::Ready {
            warn!("engine handle dropped without release");
            self.release();
        }
    }
}

/// An initialized engine. Dropping the session releases the engine, on
/// every exit path.
pub struct Session<'h, E: Engine> {
    handle: &'h EngineHandle<E>,
}

impl<E: Engine> Deref for Session<'_, E> {
    type Target = EngineHandle<E>;

    fn deref(&self) -> &EngineHandle<E> {
        self.handle
    }
}

impl<E: Engine> Drop for Session<'_, E> {
    fn drop(&mut self) {
        self.handle.release();
    }
}

#[test]
fn lifecycle_test() {
    let engine = FakeEngine::new();
    let handle = EngineHandle::new(&engine);

    assert_eq!(handle.state(), EngineState::Uninitialized);

    handle.release();
    assert_eq!(handle.state(), EngineState::Uninitialized);

    handle.initialize().unwrap();
    assert_eq!(handle.state(), EngineState::Ready);

    assert!(matches!(handle.initialize(), Err(Error::AlreadyInitialized)));

    handle.release();
    handle.release();
    assert_eq!(handle.state(), EngineState::Released);
    assert!(matches!(
        handle.initialize(),
        Err(Error::NotReady(EngineState::Released))
    ));

    assert_eq!(engine.calls(), vec![Call::InitModel, Call::ReleaseModel]);
}

#[test]
fn init_failure_test() {
    let engine = FakeEngine::new();
    engine.fail_init(-2, "models\\detect.caffemodel: not found");
    let handle = EngineHandle::new(&engine);

    match handle.session() {
        Err(Error::Init { code, message }) => {
            assert_eq!(code, -2);
            assert_eq!(message, "models\\detect.caffemodel: not found");
        }
        _ => panic!("initialization should fail"),
    }

    assert_eq!(handle.state(), EngineState::Uninitialized);
    assert!(!engine.calls().contains(&Call::ReleaseModel));
}

#[test]
fn call_before_initialize_test() {
    let engine = FakeEngine::new();
    let handle = EngineHandle::new(&engine);
    let mut pixels = vec![0u8; 4];
    let mut buffer = PixelBuffer::new(&mut pixels, 2, 2, 2, 1).unwrap();

    assert!(matches!(
        handle.decode_pixels(&mut buffer),
        Err(Error::NotReady(EngineState::Uninitialized))
    ));
    assert!(matches!(
        handle.decode_file(Path::new("a.png"), 100),
        Err(Error::NotReady(EngineState::Uninitialized))
    ));
    assert!(engine.calls().is_empty());
}

#[test]
fn session_releases_on_error_test() {
    let engine = FakeEngine::new();
    engine.fail_decode("img is empty");
    let handle = EngineHandle::new(&engine);

    let result = handle
        .session()
        .and_then(|session| session.decode_file(Path::new("missing.png"), 100));

    assert!(matches!(result, Err(Error::Decode(ref message)) if message == "img is empty"));
    assert_eq!(handle.state(), EngineState::Released);

    let mut pixels = vec![0u8; 4];
    let mut buffer = PixelBuffer::new(&mut pixels, 2, 2, 2, 1).unwrap();
    assert!(matches!(
        handle.decode_pixels(&mut buffer),
        Err(Error::NotReady(EngineState::Released))
    ));
}

#[test]
fn decode_file_test() {
    let engine = FakeEngine::new();
    engine.set_records(vec![FakeRecord::new("ABC123", &[(0, 0), (10, 10)])]);
    let handle = EngineHandle::new(&engine);

    let markers = {
        let session = handle.session().unwrap();
        session.decode_file(Path::new("codes.jpg"), 80).unwrap()
    };

    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].text, "ABC123");
    assert_eq!(markers[0].points[1], Point { x: 10, y: 10 });
    assert_eq!(
        engine.calls(),
        vec![
            Call::InitModel,
            Call::Decode {
                path: Some("codes.jpg".to_string()),
                buffer_size: (MAX_RESULTS * crate::ffi::RAW_SCAN_RESULT_SIZE) as u64,
                quality: 80,
            },
            Call::ReleaseModel,
        ]
    );
    assert_eq!(engine.live_allocations(), hashset!());
}

#[test]
fn decode_file_invalid_path_test() {
    let engine = FakeEngine::new();
    let handle = EngineHandle::new(&engine);
    let session = handle.session().unwrap();

    assert!(matches!(
        session.decode_file(Path::new("bad\0path.png"), 100),
        Err(Error::InvalidPath(_))
    ));
}

#[test]
fn decode_pixels_test() {
    let engine = FakeEngine::new();
    engine.set_records(vec![FakeRecord::new("HELLO", &[(1, 1)])]);
    let handle = EngineHandle::new(&engine);
    let mut pixels = vec![0u8; 24];
    let mut buffer = PixelBuffer::new(&mut pixels, 2, 3, 8, 4).unwrap();

    let session = handle.session().unwrap();
    let markers = session.decode_pixels(&mut buffer).unwrap();

    assert_eq!(markers[0].text, "HELLO");
    assert!(engine.calls().contains(&Call::DecodeBitmap {
        width: 2,
        height: 3,
        stride: 8,
        channel_count: 4,
        buffer_size: (MAX_RESULTS * crate::ffi::RAW_SCAN_RESULT_SIZE) as u64,
    }));
}

#[test]
fn decode_pixels_failure_test() {
    let engine = FakeEngine::new();
    engine.fail_decode("unsupported channel count");
    let handle = EngineHandle::new(&engine);
    let mut pixels = vec![0u8; 24];
    let mut buffer = PixelBuffer::new(&mut pixels, 2, 3, 8, 4).unwrap();

    let session = handle.session().unwrap();

    assert!(matches!(
        session.decode_pixels(&mut buffer),
        Err(Error::Decode(ref message)) if message == "unsupported channel count"
    ));
    assert_eq!(engine.live_allocations(), hashset!());
}

#[test]
fn decode_file_clears_stale_error_test() {
    let engine = FakeEngine::new();
    let handle = EngineHandle::new(&engine);
    let session = handle.session().unwrap();
    engine.set_error("left over from an earlier call");

    let markers = session.decode_file(Path::new("codes.jpg"), 100).unwrap();

    assert!(markers.is_empty());
}

#[test]
fn prune_through_handle_test() {
    let engine = FakeEngine::new();
    engine.set_prune(PruneScript::Reply {
        status: 1,
        data: None,
        size: Some(0),
    });
    let handle = EngineHandle::new(&engine);
    let mut pixels = vec![0u8; 4];
    let mut buffer = PixelBuffer::new(&mut pixels, 2, 2, 2, 1).unwrap();

    let session = handle.session().unwrap();

    assert_eq!(
        session
            .prune(&mut buffer, &ContourParameters::default())
            .unwrap(),
        None
    );
    assert_eq!(session.state(), EngineState::Ready);
}

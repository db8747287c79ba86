use std::os::raw::c_char;
use std::ptr;

use log::trace;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::marker::ascii_text;

#[cfg(test)]
use crate::testing::{Call, FakeEngine};

/// Reads the engine's last error message.
///
/// Always issues two calls: one with a null buffer to learn the length, one
/// with a buffer of that length. An empty string means no error is recorded.
pub fn last_error<E: Engine + ?Sized>(engine: &E) -> Result<String> {
    let len = unsafe { engine.get_last_error(ptr::null_mut(), 0) };
    if len < 0 {
        return Err(Error::ErrorQuery(len));
    }

    let mut buf = vec![0u8; len as usize];
    let written = unsafe { engine.get_last_error(buf.as_mut_ptr() as *mut c_char, len) };
    if written < 0 {
        return Err(Error::ErrorQuery(written));
    }

    buf.truncate(written.min(len) as usize);
    while buf.last() == Some(&0) {
        buf.pop();
    }

    trace!("last engine error: {:?}", String::from_utf8_lossy(&buf));

    Ok(ascii_text(&buf))
}

#[test]
fn last_error_test() {
    let engine = FakeEngine::new();
    engine.set_error("bad image");

    assert_eq!(last_error(&engine).unwrap(), "bad image");
    assert_eq!(
        engine.calls(),
        vec![Call::GetLastError { len: 0 }, Call::GetLastError { len: 9 }]
    );
}

#[test]
fn last_error_empty_test() {
    let engine = FakeEngine::new();

    assert_eq!(last_error(&engine).unwrap(), "");
    assert_eq!(
        engine.calls(),
        vec![Call::GetLastError { len: 0 }, Call::GetLastError { len: 0 }]
    );
}

#[test]
fn last_error_terminator_test() {
    let engine = FakeEngine::new();
    engine.set_error("model not initialized\0");

    assert_eq!(last_error(&engine).unwrap(), "model not initialized");
}

#[test]
fn last_error_query_failure_test() {
    let engine = FakeEngine::new();
    engine.set_error("more data");
    engine.fail_error_query(-1);

    assert!(matches!(last_error(&engine), Err(Error::ErrorQuery(-1))));
}

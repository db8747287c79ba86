use crate::ffi::Point;

/// A located and decoded marker, fully owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub text: String,
    pub points: Vec<Point>,
}

/// Decodes engine text as ASCII. Bytes outside the ASCII range become `?`,
/// so the result always has exactly one char per input byte.
pub fn ascii_text(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&byte| if byte.is_ascii() { byte as char } else { '?' })
        .collect()
}

#[test]
fn ascii_text_test() {
    assert_eq!(ascii_text(b"ABC123"), "ABC123");
    assert_eq!(ascii_text(b""), "");
    assert_eq!(ascii_text(&[0x41, 0xe3, 0x81, 0x42]), "A??B");

    let bytes = [0x68, 0x69, 0xff, 0x00, 0x7f];
    let text = ascii_text(&bytes);

    assert_eq!(text.len(), bytes.len());
    assert_eq!(ascii_text(text.as_bytes()), text);
}

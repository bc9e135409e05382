//! Package encoding/decoding for the framing protocol
//!
//! Wire format:
//! ```text
//! +------------------------------+--------------------------------+
//! |  UTF-8 JSON object (N bytes) |  Delimiter 01 02 03 01 02 03   |
//! +------------------------------+--------------------------------+
//! ```
//!
//! There is no length prefix. The delimiter uses control bytes that JSON
//! text never contains unescaped, so the first occurrence always ends a
//! package.

use super::{FramingError, Package};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;

/// Package delimiter
pub const PACKAGE_DELIMITER: [u8; 6] = [0x01, 0x02, 0x03, 0x01, 0x02, 0x03];

/// Encode a package to its wire form
pub fn encode_package(package: &Package) -> Result<BytesMut, FramingError> {
    let json = serde_json::to_vec(package).map_err(FramingError::Serialization)?;

    let mut buf = BytesMut::with_capacity(json.len() + PACKAGE_DELIMITER.len());
    buf.put_slice(&json);
    buf.put_slice(&PACKAGE_DELIMITER);
    Ok(buf)
}

/// Convert any serializable value into a package.
///
/// Only values that serialize to a JSON object are packages.
pub fn to_package<T: Serialize>(message: &T) -> Result<Package, FramingError> {
    match serde_json::to_value(message).map_err(FramingError::Serialization)? {
        Value::Object(map) => Ok(map),
        other => Err(FramingError::NotAnObject(json_kind(&other))),
    }
}

/// Decode one frame body (without delimiter)
pub fn decode_package(frame: &[u8]) -> Result<Package, FramingError> {
    let text = std::str::from_utf8(frame).map_err(|_| FramingError::InvalidUtf8)?;

    match serde_json::from_str::<Value>(text).map_err(FramingError::Deserialization)? {
        Value::Object(map) => Ok(map),
        other => Err(FramingError::NotAnObject(json_kind(&other))),
    }
}

/// Split the next frame body off the front of `buf`.
///
/// Returns `None` while no delimiter is buffered. The delimiter itself is
/// consumed; the returned body may be empty.
pub fn next_frame(buf: &mut BytesMut) -> Option<Bytes> {
    let position = find_delimiter(buf)?;
    let body = buf.split_to(position).freeze();
    buf.advance(PACKAGE_DELIMITER.len());
    Some(body)
}

/// Split off every complete, non-empty frame body in `buf`, in stream order
pub fn extract_frames(buf: &mut BytesMut) -> Vec<Bytes> {
    let mut frames = Vec::new();
    while let Some(frame) = next_frame(buf) {
        if !frame.is_empty() {
            frames.push(frame);
        }
    }
    frames
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(PACKAGE_DELIMITER.len())
        .position(|window| window == PACKAGE_DELIMITER)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn package(value: Value) -> Package {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test packages are objects"),
        }
    }

    #[test]
    fn test_encode_appends_delimiter() {
        let encoded = encode_package(&package(json!({"cmd": "ping"}))).unwrap();

        assert!(encoded.ends_with(&PACKAGE_DELIMITER));
        assert_eq!(&encoded[..encoded.len() - 6], br#"{"cmd":"ping"}"#);
    }

    #[test]
    fn test_extract_multiple_frames_in_one_burst() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_package(&package(json!({"a": 1}))).unwrap());
        buf.extend_from_slice(&encode_package(&package(json!({"b": 2}))).unwrap());
        buf.extend_from_slice(br#"{"c":"#);

        let frames = extract_frames(&mut buf);

        assert_eq!(frames.len(), 2);
        assert_eq!(decode_package(&frames[0]).unwrap(), package(json!({"a": 1})));
        assert_eq!(decode_package(&frames[1]).unwrap(), package(json!({"b": 2})));
        assert_eq!(&buf[..], br#"{"c":"#);
    }

    #[test]
    fn test_empty_frames_are_skipped() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&PACKAGE_DELIMITER);
        buf.extend_from_slice(&PACKAGE_DELIMITER);
        buf.extend_from_slice(&encode_package(&package(json!({"x": true}))).unwrap());

        let frames = extract_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_delimiter_waits() {
        let mut buf = BytesMut::from(&b"{}\x01\x02\x03"[..]);
        assert!(next_frame(&mut buf).is_none());

        buf.extend_from_slice(&[0x01, 0x02, 0x03]);
        assert_eq!(&next_frame(&mut buf).unwrap()[..], b"{}");
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert!(matches!(
            decode_package(&[0xff, 0xfe]),
            Err(FramingError::InvalidUtf8)
        ));
        assert!(matches!(
            decode_package(b"{not json"),
            Err(FramingError::Deserialization(_))
        ));
        assert!(matches!(
            decode_package(b"[1,2,3]"),
            Err(FramingError::NotAnObject("array"))
        ));
    }

    #[test]
    fn test_to_package_requires_object() {
        assert!(to_package(&json!({"k": "v"})).is_ok());
        assert!(matches!(
            to_package(&"text"),
            Err(FramingError::NotAnObject("string"))
        ));
    }
}

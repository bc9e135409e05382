//! HTTP request mimicry
//!
//! Every payload is sent as the body of a plausible HTTP/1.1 POST:
//!
//! ```text
//! POST /api/v1/sync HTTP/1.1\r\n
//! Host: google.com\r\n
//! User-Agent: Mozilla/5.0 (...)\r\n
//! Content-Type: application/octet-stream\r\n
//! Content-Length: <n>\r\n
//! Connection: keep-alive\r\n
//! \r\n
//! <n payload bytes>
//! ```
//!
//! Reassembly is driven by `Content-Length`, never by the first blank line
//! alone: a request split across reads waits for its whole body, and several
//! requests in one read are split apart exactly.

use super::{ProtectionError, ProtectionModule};
use crate::registry::HTTP_PROTECTION;
use bytes::{Buf, Bytes, BytesMut};

/// End of the header block
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Largest header block searched for a terminator before resynchronising
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Default cap on a single body
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const REQUEST_LINE: &str = "POST /api/v1/sync HTTP/1.1";
const HOST: &str = "google.com";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// HTTP mimicry module
#[derive(Debug, Clone)]
pub struct HttpProtection {
    max_payload: usize,
}

impl HttpProtection {
    pub fn new() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Reject bodies announced larger than `max_payload`
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for HttpProtection {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtectionModule for HttpProtection {
    fn name(&self) -> &'static str {
        HTTP_PROTECTION
    }

    fn protect(&self, payload: &[u8]) -> Bytes {
        let header = format!(
            "{}\r\nHost: {}\r\nUser-Agent: {}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
            REQUEST_LINE,
            HOST,
            USER_AGENT,
            payload.len()
        );

        let mut frame = BytesMut::with_capacity(header.len() + payload.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(payload);
        frame.freeze()
    }

    fn extract(&self, raw: &mut BytesMut) -> Result<Option<Bytes>, ProtectionError> {
        let Some(position) = find(raw, HEADER_TERMINATOR) else {
            if raw.len() > MAX_HEADER_SIZE {
                // Keep a possible partial terminator
                raw.advance(raw.len() - (HEADER_TERMINATOR.len() - 1));
                return Err(ProtectionError::HeaderTooLarge(MAX_HEADER_SIZE));
            }
            return Ok(None);
        };
        let header_len = position + HEADER_TERMINATOR.len();

        let length = match content_length(&raw[..position]) {
            Ok(length) => length,
            Err(e) => {
                raw.advance(header_len);
                return Err(e);
            }
        };
        if length > self.max_payload {
            raw.advance(header_len);
            return Err(ProtectionError::PayloadTooLarge {
                length,
                limit: self.max_payload,
            });
        }

        if raw.len() < header_len + length {
            return Ok(None);
        }
        raw.advance(header_len);
        Ok(Some(raw.split_to(length).freeze()))
    }
}

fn content_length(header: &[u8]) -> Result<usize, ProtectionError> {
    let text = String::from_utf8_lossy(header);

    for line in text.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            return value
                .parse()
                .map_err(|_| ProtectionError::InvalidContentLength(value.to_string()));
        }
    }
    Err(ProtectionError::MissingContentLength)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(module: &HttpProtection, raw: &mut BytesMut) -> Vec<Bytes> {
        let mut payloads = Vec::new();
        while let Ok(Some(payload)) = module.extract(raw) {
            payloads.push(payload);
        }
        payloads
    }

    #[test]
    fn test_protect_header_block() {
        let frame = HttpProtection::new().protect(b"hello");
        let expected = "POST /api/v1/sync HTTP/1.1\r\n\
            Host: google.com\r\n\
            User-Agent: Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36\r\n\
            Content-Type: application/octet-stream\r\n\
            Content-Length: 5\r\n\
            Connection: keep-alive\r\n\
            \r\n\
            hello";
        assert_eq!(&frame[..], expected.as_bytes());
    }

    #[test]
    fn test_reassembly_over_every_chunk_size() {
        let module = HttpProtection::new();
        let payload: Vec<u8> = (0..=255u8).cycle().take(700).collect();
        let frame = module.protect(&payload);

        for chunk_size in 1..=frame.len() {
            let mut raw = BytesMut::new();
            let mut payloads = Vec::new();
            for chunk in frame.chunks(chunk_size) {
                raw.extend_from_slice(chunk);
                payloads.extend(drain_all(&module, &mut raw));
            }
            assert_eq!(payloads.len(), 1, "chunk size {}", chunk_size);
            assert_eq!(&payloads[0][..], &payload[..], "chunk size {}", chunk_size);
            assert!(raw.is_empty());
        }
    }

    #[test]
    fn test_burst_with_trailing_partial_frame() {
        let module = HttpProtection::new();
        let mut raw = BytesMut::new();
        raw.extend_from_slice(&module.protect(b"first"));
        raw.extend_from_slice(&module.protect(b"second\r\n\r\nwith a blank line"));
        let third = module.protect(b"third");
        raw.extend_from_slice(&third[..third.len() - 2]);

        let payloads = drain_all(&module, &mut raw);
        assert_eq!(payloads, vec![
            Bytes::from_static(b"first"),
            Bytes::from_static(b"second\r\n\r\nwith a blank line"),
        ]);

        raw.extend_from_slice(&third[third.len() - 2..]);
        assert_eq!(module.extract(&mut raw).unwrap(), Some(Bytes::from_static(b"third")));
    }

    #[test]
    fn test_missing_content_length_resynchronises() {
        let module = HttpProtection::new();
        let mut raw = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"[..]);
        raw.extend_from_slice(&module.protect(b"after"));

        assert!(matches!(
            module.extract(&mut raw),
            Err(ProtectionError::MissingContentLength)
        ));
        assert_eq!(module.extract(&mut raw).unwrap(), Some(Bytes::from_static(b"after")));
    }

    #[test]
    fn test_content_length_is_case_insensitive_and_validated() {
        let module = HttpProtection::new();

        let mut raw = BytesMut::from(&b"POST / HTTP/1.1\r\ncontent-LENGTH:  3 \r\n\r\nabc"[..]);
        assert_eq!(module.extract(&mut raw).unwrap(), Some(Bytes::from_static(b"abc")));

        let mut raw = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n"[..]);
        assert!(matches!(
            module.extract(&mut raw),
            Err(ProtectionError::InvalidContentLength(_))
        ));
        assert!(raw.is_empty());
    }

    #[test]
    fn test_oversized_input_is_purged() {
        let module = HttpProtection::with_max_payload(4);

        let mut raw = BytesMut::from(&module.protect(b"too long")[..]);
        assert!(matches!(
            module.extract(&mut raw),
            Err(ProtectionError::PayloadTooLarge { length: 8, limit: 4 })
        ));

        let mut raw = BytesMut::from(&vec![b'x'; MAX_HEADER_SIZE + 10][..]);
        assert!(matches!(
            module.extract(&mut raw),
            Err(ProtectionError::HeaderTooLarge(_))
        ));
        assert_eq!(raw.len(), HEADER_TERMINATOR.len() - 1);
    }

    #[test]
    fn test_unprotect_single_frame() {
        let module = HttpProtection::new();
        let frame = module.protect(b"payload");

        assert_eq!(&module.unprotect(&frame).unwrap()[..], b"payload");
        assert!(module.unprotect(&frame[..frame.len() - 1]).is_err());
    }

    #[test]
    fn test_empty_payload() {
        let module = HttpProtection::new();
        let mut raw = BytesMut::from(&module.protect(b"")[..]);
        assert_eq!(module.extract(&mut raw).unwrap(), Some(Bytes::new()));
        assert!(raw.is_empty());
    }
}

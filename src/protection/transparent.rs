//! Identity protection: bytes go on the wire unchanged

use super::{ProtectionError, ProtectionModule};
use crate::registry::TRANSPARENT_PROTECTION;
use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, Copy, Default)]
pub struct TransparentProtection;

impl ProtectionModule for TransparentProtection {
    fn name(&self) -> &'static str {
        TRANSPARENT_PROTECTION
    }

    fn protect(&self, payload: &[u8]) -> Bytes {
        Bytes::copy_from_slice(payload)
    }

    fn extract(&self, raw: &mut BytesMut) -> Result<Option<Bytes>, ProtectionError> {
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(raw.split().freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passes_bytes_through() {
        let module = TransparentProtection;
        let frame = module.protect(b"raw bytes");
        assert_eq!(&frame[..], b"raw bytes");

        let mut raw = BytesMut::from(&frame[..]);
        assert_eq!(module.extract(&mut raw).unwrap(), Some(frame));
        assert_eq!(module.extract(&mut raw).unwrap(), None);
    }
}

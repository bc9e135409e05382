//! AES-256-GCM symmetric module
//!
//! Output layout: `nonce (12) || ciphertext || tag (16)`. A fresh random
//! nonce is drawn for every message.

use super::{CryptographicModel, SecurityError, SecurityFactory, SecurityModule};
use crate::config::{Configurations, Setting, SettingValue, SYMMETRIC_KEY};
use crate::registry::SECURITY_AES;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;

/// Length of the AES-256 key in bytes
pub const AES_KEY_LEN: usize = 32;

/// Length of the authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Shortest input `unsecure` accepts: nonce plus tag
pub const MIN_SECURED_LEN: usize = NONCE_LEN + TAG_LEN;

/// AES-256-GCM module
pub struct AesModule {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesModule {
    /// Create from a 32-byte key
    pub fn new(key: &[u8]) -> Result<Self, SecurityError> {
        if key.len() != AES_KEY_LEN {
            return Err(SecurityError::InvalidKey(format!(
                "AES-256 needs {} key bytes, got {}",
                AES_KEY_LEN,
                key.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| SecurityError::InvalidKey("rejected by AES-256-GCM".into()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Create from a configuration holding [`SYMMETRIC_KEY`]
    pub fn from_configurations(configurations: &Configurations) -> Result<Self, SecurityError> {
        Self::new(configurations.bytes(SYMMETRIC_KEY)?)
    }

    /// One fresh random key
    pub fn generate_configurations() -> Result<Configurations, SecurityError> {
        let mut key = vec![0u8; AES_KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| SecurityError::KeyGeneration("system RNG failure".into()))?;

        let mut configurations = Configurations::new();
        configurations.add_setting(
            Setting::new(SYMMETRIC_KEY, SettingValue::Bytes(key))
                .symbolic_name("Symmetric key")
                .description("Shared secret key for AES-256 encryption")
                .bounds(Some(AES_KEY_LEN as i64), Some(AES_KEY_LEN as i64))
                .private(),
        )?;
        Ok(configurations)
    }

    pub fn factory() -> SecurityFactory {
        SecurityFactory {
            model: CryptographicModel::Symmetric,
            generate: Self::generate_configurations,
            build: build_aes,
        }
    }
}

fn build_aes(configurations: &Configurations) -> Result<Arc<dyn SecurityModule>, SecurityError> {
    Ok(Arc::new(AesModule::from_configurations(configurations)?))
}

impl SecurityModule for AesModule {
    fn name(&self) -> &'static str {
        SECURITY_AES
    }

    fn model(&self) -> CryptographicModel {
        CryptographicModel::Symmetric
    }

    fn secure(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| SecurityError::Encryption("system RNG failure".into()))?;

        let mut sealed = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut sealed)
            .map_err(|_| SecurityError::Encryption("seal failed".into()))?;

        let mut output = Vec::with_capacity(NONCE_LEN + sealed.len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&sealed);
        Ok(output)
    }

    fn unsecure(&self, secured: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if secured.len() < MIN_SECURED_LEN {
            return Err(SecurityError::Truncated(secured.len()));
        }
        let (nonce, sealed) = secured.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| SecurityError::Truncated(secured.len()))?;

        let mut buffer = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| SecurityError::AuthenticationFailed)?;
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> AesModule {
        AesModule::new(&[0x42u8; AES_KEY_LEN]).unwrap()
    }

    #[test]
    fn test_secure_unsecure() {
        let aes = module();
        let secured = aes.secure(b"SECURE_STARK_DATA_001").unwrap();

        assert_eq!(secured.len(), NONCE_LEN + 21 + TAG_LEN);
        assert_eq!(aes.unsecure(&secured).unwrap(), b"SECURE_STARK_DATA_001");
    }

    #[test]
    fn test_fresh_nonce_per_message() {
        let aes = module();
        let first = aes.secure(b"same").unwrap();
        let second = aes.secure(b"same").unwrap();

        assert_ne!(first[..NONCE_LEN], second[..NONCE_LEN]);
        assert_ne!(first, second);
    }

    #[test]
    fn test_every_bit_flip_fails_closed() {
        let aes = module();
        let secured = aes.secure(b"integrity matters").unwrap();

        for bit in 0..secured.len() * 8 {
            let mut tampered = secured.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);
            assert!(
                matches!(aes.unsecure(&tampered), Err(SecurityError::AuthenticationFailed)),
                "bit {} accepted",
                bit
            );
        }
    }

    #[test]
    fn test_undersized_input_rejected() {
        let aes = module();
        assert!(matches!(
            aes.unsecure(&[0u8; MIN_SECURED_LEN - 1]),
            Err(SecurityError::Truncated(27))
        ));
        assert!(matches!(
            aes.unsecure(&[0u8; MIN_SECURED_LEN]),
            Err(SecurityError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let secured = module().secure(b"for someone else").unwrap();
        let other = AesModule::new(&[0x24u8; AES_KEY_LEN]).unwrap();
        assert!(matches!(
            other.unsecure(&secured),
            Err(SecurityError::AuthenticationFailed)
        ));
        assert!(matches!(
            AesModule::new(&[0u8; 16]),
            Err(SecurityError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_generated_configuration() {
        let configurations = AesModule::generate_configurations().unwrap();
        configurations.validate().unwrap();

        let setting = configurations.query_setting(SYMMETRIC_KEY).unwrap();
        assert!(setting.private);
        assert_eq!(setting.as_bytes().map(<[u8]>::len), Some(AES_KEY_LEN));

        let restored = Configurations::from_dict(&configurations.to_dict().unwrap()).unwrap();
        let sender = AesModule::from_configurations(&configurations).unwrap();
        let receiver = AesModule::from_configurations(&restored).unwrap();
        let secured = sender.secure(b"shared").unwrap();
        assert_eq!(receiver.unsecure(&secured).unwrap(), b"shared");
    }
}

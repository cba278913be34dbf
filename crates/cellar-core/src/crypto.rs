//! Cryptographic primitives for `cellar`.
//!
//! Provides AES-256-GCM authenticated encryption with associated data,
//! HKDF-SHA256 key derivation, the HMAC-based root key verification value,
//! and a zeroize-on-drop key newtype.
//!
//! # Security model
//!
//! - Every encryption generates a fresh 96-bit nonce via `OsRng`.
//! - Sealed box format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! - Key types derive `Zeroize` + `ZeroizeOnDrop` and redact themselves in `Debug`.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Nonce length for AES-256-GCM (96 bits).
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// Minimum sealed box length: nonce + tag.
const MIN_CIPHERTEXT_LEN: usize = NONCE_LEN + TAG_LEN;

/// HKDF info for the subkey that produces the unseal verification value.
const VERIFY_INFO: &[u8] = b"cellar-unseal-verify-v1";

/// Fixed message MAC'd by the verification subkey.
const VERIFY_MESSAGE: &[u8] = b"cellar root key check";

/// A 256-bit symmetric key that is zeroized on drop.
///
/// Used for the root key and for every keyring term. The bytes are never
/// exposed in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice, failing unless it is exactly 32 bytes.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// The caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_slice().ct_eq(other.0.as_slice()).into()
    }
}

impl Eq for EncryptionKey {}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypt `plaintext` under `key`, binding `aad` into the tag.
///
/// Returns `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut combined = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

/// Decrypt a sealed box produced by [`encrypt`] with the same `aad`.
///
/// # Errors
///
/// - [`CryptoError::CiphertextTooShort`] if the input cannot hold a nonce and tag.
/// - [`CryptoError::Authentication`] if the tag does not verify.
pub fn decrypt(key: &EncryptionKey, combined: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_CIPHERTEXT_LEN,
            actual: combined.len(),
        });
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Authentication)
}

/// Derive a purpose-bound subkey from `root_key` using HKDF-SHA256.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
pub fn derive_key(
    root_key: &EncryptionKey,
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<EncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, root_key.as_bytes());
    let mut derived = [0u8; 32];
    hk.expand(info, &mut derived)
        .map_err(|e| CryptoError::KeyDerivation {
            context: String::from_utf8_lossy(info).into_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey::from_bytes(derived))
}

/// Compute the verification value for a root key.
///
/// This is an HMAC-SHA256 under an HKDF-derived subkey, so storing it reveals
/// nothing usable about the root key while still letting the unseal path
/// check a reconstruction before touching the keyring.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if the subkey cannot be derived.
pub fn verification_value(root_key: &EncryptionKey) -> Result<[u8; 32], CryptoError> {
    let subkey = derive_key(root_key, None, VERIFY_INFO)?;
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(subkey.as_bytes()).map_err(|e| {
        CryptoError::KeyDerivation {
            context: String::from_utf8_lossy(VERIFY_INFO).into_owned(),
            reason: e.to_string(),
        }
    })?;
    mac.update(VERIFY_MESSAGE);
    let digest = mac.finalize().into_bytes();
    let mut value = [0u8; 32];
    value.copy_from_slice(&digest);
    Ok(value)
}

/// Check a candidate root key against a stored verification value in constant time.
#[must_use]
pub fn verify_root_key(candidate: &EncryptionKey, expected: &[u8]) -> bool {
    match verification_value(candidate) {
        Ok(actual) => actual.as_slice().ct_eq(expected).into(),
        Err(_) => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt(&key, b"secret data", b"core/x").unwrap();
        let decrypted = decrypt(&key, &ciphertext, b"core/x").unwrap();
        assert_eq!(decrypted, b"secret data");
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt(&key, b"", b"").unwrap();
        assert_eq!(ciphertext.len(), NONCE_LEN + TAG_LEN);
        assert!(decrypt(&key, &ciphertext, b"").unwrap().is_empty());
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let ciphertext = encrypt(&EncryptionKey::generate(), b"secret", b"").unwrap();
        let result = decrypt(&EncryptionKey::generate(), &ciphertext, b"");
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[test]
    fn wrong_aad_fails_authentication() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt(&key, b"secret", b"logical/a").unwrap();
        let result = decrypt(&key, &ciphertext, b"logical/b");
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[test]
    fn too_short_is_rejected() {
        let key = EncryptionKey::generate();
        let result = decrypt(&key, &[0u8; 10], b"");
        assert!(matches!(
            result,
            Err(CryptoError::CiphertextTooShort {
                expected: 28,
                actual: 10
            })
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let mut ciphertext = encrypt(&key, b"secret", b"").unwrap();
        if let Some(byte) = ciphertext.get_mut(NONCE_LEN) {
            *byte ^= 0xFF;
        }
        assert!(matches!(
            decrypt(&key, &ciphertext, b""),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let key = EncryptionKey::generate();
        let ct1 = encrypt(&key, b"same", b"").unwrap();
        let ct2 = encrypt(&key, b"same", b"").unwrap();
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn derive_key_is_deterministic_and_context_bound() {
        let root = EncryptionKey::generate();
        let a = derive_key(&root, Some(b"salt"), b"one").unwrap();
        let b = derive_key(&root, Some(b"salt"), b"one").unwrap();
        let c = derive_key(&root, Some(b"salt"), b"two").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn verification_accepts_only_the_original_key() {
        let root = EncryptionKey::generate();
        let value = verification_value(&root).unwrap();
        assert!(verify_root_key(&root, &value));
        assert!(!verify_root_key(&EncryptionKey::generate(), &value));
        assert!(!verify_root_key(&root, &value[..16]));
    }

    #[test]
    fn debug_redacts_bytes() {
        let debug = format!("{:?}", EncryptionKey::generate());
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn from_slice_requires_32_bytes() {
        assert!(EncryptionKey::from_slice(&[0u8; 31]).is_none());
        assert!(EncryptionKey::from_slice(&[7u8; 32]).is_some());
    }
}

//! Block-level encryption and passphrase key derivation.
//!
//! When key material is configured, every block's payload is sealed with
//! AES-256-GCM *after* compression and opened *before* decompression; the
//! GCM tag authenticates each block independently, so a flipped bit or a
//! wrong key fails loudly at that block instead of feeding garbage to the
//! decoders.
//!
//! Sealed payload layout: `[ nonce (12 B) | ciphertext | GCM tag (16 B) ]`.
//! The record header's `c_len` covers the sealed length; `u_len` stays the
//! plaintext length.
//!
//! Key material lives in a wipe-on-drop wrapper. Callers holding a
//! passphrase derive material with Argon2id and an archive-unique salt.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Byte length of the AES-GCM nonce prepended to every sealed payload.
pub const NONCE_LEN: usize = 12;
/// Fixed per-block growth of a sealed payload (nonce + GCM tag).
pub const SEAL_OVERHEAD: usize = NONCE_LEN + 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed — wrong key or corrupted block")]
    DecryptFailed,
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("sealed payload shorter than the {NONCE_LEN}-byte nonce")]
    TooShort,
}

// ── Key material ─────────────────────────────────────────────────────────────

/// 256-bit block-key material, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial(pub [u8; 32]);

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// Derive block-key material from a passphrase with Argon2id.
///
/// `salt` should be unique per archive so reusing a passphrase across
/// archives still yields distinct keys.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> Result<KeyMaterial, CryptoError> {
    let params = Params::new(64 * 1024, 3, 1, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(KeyMaterial(key))
}

// ── Per-block transform ──────────────────────────────────────────────────────

/// Block transform handle. One instance serves every block of an open
/// archive; sealing draws a fresh random nonce per block.
pub struct BlockCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BlockCipher(..)")
    }
}

impl BlockCipher {
    pub fn new(key: &KeyMaterial) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&key.0);
        Self { cipher: Aes256Gcm::new(key) }
    }

    /// Seal one compressed payload: `nonce || ciphertext || tag`.
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plain)
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a payload produced by [`seal`]. The GCM tag covers the whole
    /// ciphertext, so corruption and wrong keys are indistinguishable here.
    ///
    /// [`seal`]: BlockCipher::seal
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::TooShort);
        }
        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &sealed[NONCE_LEN..])
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

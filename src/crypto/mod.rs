//! AES-CBC encryption and PBKDF2-HMAC-SHA256 key derivation for flatfile entries.
//!
//! Key derivation: PBKDF2-HMAC-SHA256(passphrase, salt, iterations) → 16/24/32-byte key
//! Encryption:     AES-CBC with PKCS7 padding, IV prepended to ciphertext
//!
//! Encrypted payload layout: [ IV (16 B) | ciphertext (padded to 16 B blocks) ]
//!
//! The salt and iteration count live in the index file header.  An index with
//! encrypted entries but no header falls back to the fixed compatibility salt
//! [`LEGACY_SALT`] and [`DEFAULT_ITERATIONS`].

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use thiserror::Error;

/// Byte length of the CBC IV prepended to every encrypted payload.
pub const IV_LEN: usize = 16;

/// PBKDF2 iteration count written by the indexer and assumed in legacy mode.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Fixed well-known salt used when the index carries no header (legacy mode).
pub const LEGACY_SALT: &[u8; 16] = b"ffdb-static-salt";

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key length {0} (expected 16, 24 or 32 bytes)")]
    KeyLength(usize),
    /// PKCS7 padding did not verify after decryption — wrong passphrase or
    /// corrupted ciphertext.  The two are indistinguishable by design.
    #[error("Decryption failed — wrong passphrase or corrupted data")]
    InvalidPadding,
    #[error("Encrypted payload too short (minimum {IV_LEN} bytes)")]
    TooShort,
    #[error("Ciphertext length {0} is not a multiple of the AES block size")]
    Misaligned(usize),
}

/// AES key size, chosen at index time and recorded in the index header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySize {
    Bits128,
    Bits192,
    Bits256,
}

impl KeySize {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            128 => Some(KeySize::Bits128),
            192 => Some(KeySize::Bits192),
            256 => Some(KeySize::Bits256),
            _   => None,
        }
    }

    #[inline]
    pub fn bits(self) -> u32 {
        match self {
            KeySize::Bits128 => 128,
            KeySize::Bits192 => 192,
            KeySize::Bits256 => 256,
        }
    }

    #[inline]
    pub fn key_bytes(self) -> usize { self.bits() as usize / 8 }
}

/// Derive an AES key from a passphrase.
///
/// The salt should come from the index header; each index gets a fresh random
/// salt so the same passphrase yields distinct keys across databases.
pub fn derive_key(passphrase: &str, salt: &[u8], iterations: u32, size: KeySize) -> Vec<u8> {
    let mut key = vec![0u8; size.key_bytes()];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(passphrase.as_bytes(), salt, iterations, &mut key);
    key
}

/// Generate a fresh random IV from the OS RNG.
pub fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// Encrypt `plaintext` with AES-CBC-PKCS7 using a random IV.
///
/// Returns `IV (16 B) || ciphertext`.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let iv = random_iv();
    let ciphertext = match key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(key, &iv)
            .map_err(|_| CryptoError::KeyLength(key.len()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => cbc::Encryptor::<Aes192>::new_from_slices(key, &iv)
            .map_err(|_| CryptoError::KeyLength(key.len()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => cbc::Encryptor::<Aes256>::new_from_slices(key, &iv)
            .map_err(|_| CryptoError::KeyLength(key.len()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        n  => return Err(CryptoError::KeyLength(n)),
    };

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an AES-CBC payload produced by [`encrypt`].
///
/// Input must start with the 16-byte IV.  A PKCS7 padding failure maps to
/// [`CryptoError::InvalidPadding`]; the caller decides whether that means a
/// bad passphrase or corruption.
pub fn decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < IV_LEN {
        return Err(CryptoError::TooShort);
    }
    let (iv, ciphertext) = data.split_at(IV_LEN);
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(CryptoError::Misaligned(ciphertext.len()));
    }

    match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::KeyLength(key.len()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::InvalidPadding),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::KeyLength(key.len()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::InvalidPadding),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::KeyLength(key.len()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::InvalidPadding),
        n  => Err(CryptoError::KeyLength(n)),
    }
}

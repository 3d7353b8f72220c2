//! Per-entry codec stack: ZLIB compression composed with AES-CBC encryption.
//!
//! # Framing rules
//! The stack is applied in a fixed order when writing and inverted when
//! reading.  What lives in the flatfile is:
//!
//! ```text
//! codec=none       plaintext
//! codec=zlib       ZLIB(plaintext)
//! codec=aes        IV(16) || AES-CBC-PKCS7(plaintext)
//! codec=aes+zlib   IV(16) || AES-CBC-PKCS7(ZLIB(plaintext))
//! ```
//!
//! There are no magic bytes and no per-entry header; the index's codec
//! declaration governs interpretation, and the index `length` field delimits.
//!
//! # Bad-passphrase detection
//! CBC decryption with a wrong key almost always fails PKCS7 unpadding.  The
//! rare false accept is caught by checking the ZLIB CMF byte (`0x78`) when a
//! decompression step is expected.  Both conditions map to `BadPassphrase`.
//! A ZLIB failure on an *unencrypted* entry is plain corruption instead.

use std::io::Read;

use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use crate::crypto::{self, KeySize};
use crate::error::{FfdbError, Result};

/// Default ZLIB level used when the indexer does not specify one.
pub const DEFAULT_ZLIB_LEVEL: u32 = 6;

/// First byte of every ZLIB stream (CMF: deflate, 32 KiB window).
const ZLIB_CMF: u8 = 0x78;

// ── Codec kind ───────────────────────────────────────────────────────────────

/// Which transforms are present in the stack.  Matches the `codec=` value in
/// the index header verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    #[default]
    None,
    Zlib,
    Aes,
    AesZlib,
}

impl CodecKind {
    /// Parse the `codec=` header value.
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "none"     => Some(CodecKind::None),
            "zlib"     => Some(CodecKind::Zlib),
            "aes"      => Some(CodecKind::Aes),
            "aes+zlib" => Some(CodecKind::AesZlib),
            _          => None,
        }
    }

    /// Header value for this kind (round-trips through [`from_name`]).
    pub fn name(self) -> &'static str {
        match self {
            CodecKind::None    => "none",
            CodecKind::Zlib    => "zlib",
            CodecKind::Aes     => "aes",
            CodecKind::AesZlib => "aes+zlib",
        }
    }

    pub fn from_flags(compress: bool, encrypt: bool) -> Self {
        match (encrypt, compress) {
            (true, true)   => CodecKind::AesZlib,
            (true, false)  => CodecKind::Aes,
            (false, true)  => CodecKind::Zlib,
            (false, false) => CodecKind::None,
        }
    }

    #[inline] pub fn has_zlib(self) -> bool { matches!(self, CodecKind::Zlib | CodecKind::AesZlib) }
    #[inline] pub fn has_aes(self)  -> bool { matches!(self, CodecKind::Aes  | CodecKind::AesZlib) }
}

// ── Codec context ────────────────────────────────────────────────────────────

/// Immutable per-run codec state, threaded through workers.
///
/// Built once from the index header (or indexer flags) plus the passphrase.
/// Never stored as process-global state; `Send + Sync` so a single instance
/// is shared read-only across the worker pool.
#[derive(Debug, Clone)]
pub struct CodecContext {
    pub kind:  CodecKind,
    /// Derived AES key; present iff `kind.has_aes()`.
    key:       Option<Vec<u8>>,
    /// ZLIB level, write path only.
    pub level: u32,
}

impl CodecContext {
    /// Context for plaintext entries (no transforms).
    pub fn plain() -> Self {
        CodecContext { kind: CodecKind::None, key: None, level: DEFAULT_ZLIB_LEVEL }
    }

    /// Build a context from explicit parameters.
    ///
    /// `passphrase` is required iff `kind.has_aes()`; the key is derived here
    /// and the passphrase is not retained.
    pub fn new(
        kind:       CodecKind,
        key_size:   KeySize,
        passphrase: Option<&str>,
        salt:       &[u8],
        iterations: u32,
        level:      u32,
    ) -> Result<Self> {
        let key = if kind.has_aes() {
            let pwd = passphrase.ok_or_else(|| {
                FfdbError::Usage("entries are encrypted; a passphrase is required".into())
            })?;
            Some(crypto::derive_key(pwd, salt, iterations, key_size))
        } else {
            None
        };
        Ok(CodecContext { kind, key, level })
    }

    /// Apply the stack: plaintext → ZLIB → AES → bytes on disk.
    pub fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut payload = if self.kind.has_zlib() {
            compress(plaintext, self.level)?
        } else {
            plaintext.to_vec()
        };
        if self.kind.has_aes() {
            let key = self.key.as_deref().ok_or(FfdbError::BadPassphrase)?;
            payload = crypto::encrypt(key, &payload)
                .map_err(|e| FfdbError::Codec(e.to_string()))?;
        }
        Ok(payload)
    }

    /// Invert the stack: bytes on disk → AES⁻¹ → ZLIB⁻¹ → plaintext.
    pub fn decode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let compressed: Vec<u8>;
        let zlib_input: &[u8] = if self.kind.has_aes() {
            let key = self.key.as_deref().ok_or(FfdbError::BadPassphrase)?;
            compressed = crypto::decrypt(key, payload).map_err(|_| FfdbError::BadPassphrase)?;
            if self.kind.has_zlib() && compressed.first() != Some(&ZLIB_CMF) {
                // Padding verified by chance but the plaintext is not a ZLIB
                // stream — wrong passphrase.
                return Err(FfdbError::BadPassphrase);
            }
            &compressed
        } else {
            payload
        };

        if self.kind.has_zlib() {
            decompress(zlib_input).map_err(|e| {
                if self.kind.has_aes() { FfdbError::BadPassphrase } else { e }
            })
        } else {
            Ok(zlib_input.to_vec())
        }
    }
}

// ── ZLIB helpers ─────────────────────────────────────────────────────────────

/// Raw ZLIB stream at the given level (0–9); no framing beyond the stream.
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibEncoder::new(data, Compression::new(level.min(9)))
        .read_to_end(&mut out)
        .map_err(|e| FfdbError::Codec(format!("zlib compression: {e}")))?;
    Ok(out)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| FfdbError::Codec(format!("zlib decompression: {e}")))?;
    Ok(out)
}

// ── Checksum ─────────────────────────────────────────────────────────────────

/// CRC32 of the decoded plaintext entry — the value recorded in the index.
pub fn crc32(data: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(data);
    h.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DEFAULT_ITERATIONS, LEGACY_SALT};

    fn ctx(kind: CodecKind, pwd: Option<&str>) -> CodecContext {
        CodecContext::new(kind, KeySize::Bits256, pwd, LEGACY_SALT, DEFAULT_ITERATIONS, 6)
            .unwrap()
    }

    #[test]
    fn plain_is_identity() {
        let c = CodecContext::plain();
        assert_eq!(c.encode(b"abc").unwrap(), b"abc");
        assert_eq!(c.decode(b"abc").unwrap(), b"abc");
    }

    #[test]
    fn zlib_round_trip_every_level() {
        let data = b"ID   HBB_HUMAN\nSQ   MVHLTPEEKSAVTALWGKVNVDEVGG\n//\n".repeat(8);
        for level in 0..=9 {
            let c = CodecContext { kind: CodecKind::Zlib, key: None, level };
            assert_eq!(c.decode(&c.encode(&data).unwrap()).unwrap(), data);
        }
    }

    #[test]
    fn aes_round_trip() {
        let c = ctx(CodecKind::Aes, Some("secret"));
        let payload = c.encode(b"entry body\n").unwrap();
        assert_ne!(payload, b"entry body\n");
        assert_eq!(c.decode(&payload).unwrap(), b"entry body\n");
    }

    #[test]
    fn aes_zlib_round_trip() {
        let c = ctx(CodecKind::AesZlib, Some("secret"));
        let data = b"line one\nline two\n-\n";
        assert_eq!(c.decode(&c.encode(data).unwrap()).unwrap(), data);
    }

    #[test]
    fn wrong_passphrase_is_bad_passphrase() {
        let good = ctx(CodecKind::AesZlib, Some("secret"));
        let bad  = ctx(CodecKind::AesZlib, Some("wrong"));
        let payload = good.encode(b"entry body\n").unwrap();
        assert!(matches!(bad.decode(&payload), Err(FfdbError::BadPassphrase)));
    }

    #[test]
    fn truncated_zlib_is_codec_error_not_bad_passphrase() {
        let c = CodecContext { kind: CodecKind::Zlib, key: None, level: 6 };
        let mut payload = c.encode(b"some entry data").unwrap();
        payload.truncate(payload.len() / 2);
        assert!(matches!(c.decode(&payload), Err(FfdbError::Codec(_))));
    }

    #[test]
    fn codec_kind_names_round_trip() {
        for k in [CodecKind::None, CodecKind::Zlib, CodecKind::Aes, CodecKind::AesZlib] {
            assert_eq!(CodecKind::from_name(k.name()), Some(k));
        }
        assert_eq!(CodecKind::from_name("zstd"), None);
    }

    #[test]
    fn crc32_matches_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}

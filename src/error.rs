//! Crate-level error taxonomy.
//!
//! Every failure mode maps onto one of four non-zero process exit codes:
//!
//! | Code | Meaning |
//! |---|---|
//! | 1 | usage error (bad flag combination, malformed arguments) |
//! | 2 | I/O or network failure |
//! | 3 | integrity failure (bad passphrase, checksum mismatch, corrupt entry) |
//! | 4 | partial success (some identifiers missing) |
//!
//! Per-entry errors are collected by workers and surfaced by the driver after
//! all workers drain; structural errors (index load, bad passphrase) terminate
//! immediately so that no partial output file is ever finalized.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FfdbError {
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Network error: {0}")]
    Network(String),

    /// The index file violates the sorted-identifier invariant.
    /// Fatal at load; nothing downstream may trust lookup results otherwise.
    #[error("Unsorted index at line {line}: {prev:?} > {cur:?}")]
    UnsortedIndex { line: usize, prev: String, cur: String },

    #[error("Malformed index record at line {line}: {reason}")]
    MalformedIndex { line: usize, reason: String },

    /// Decryption produced invalid PKCS7 padding, or the decrypted stream is
    /// not a ZLIB stream where the index declares compression.
    #[error("Bad passphrase or corrupted ciphertext")]
    BadPassphrase,

    #[error("Corrupt entry {id:?}: CRC32 mismatch (expected {expected:08x}, got {actual:08x})")]
    CorruptEntry { id: String, expected: u32, actual: u32 },

    #[error("Server refused byte-range request for {url}")]
    RangeUnsupported { url: String },

    /// The index header declares a codec configuration this binary cannot
    /// service.  Fatal at load; there is no fallback.
    #[error("Unsupported codec declaration: {0}")]
    UnsupportedCodec(String),

    #[error("Entry decode error: {0}")]
    Codec(String),

    #[error("{missing} identifier(s) not found in the index")]
    PartialResult { missing: usize },
}

impl FfdbError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            FfdbError::Usage(_)              => 1,
            FfdbError::Io(_)
            | FfdbError::Network(_)
            | FfdbError::RangeUnsupported { .. } => 2,
            FfdbError::UnsortedIndex { .. }
            | FfdbError::MalformedIndex { .. }
            | FfdbError::UnsupportedCodec(_) => 2,
            FfdbError::BadPassphrase
            | FfdbError::CorruptEntry { .. }
            | FfdbError::Codec(_)            => 3,
            FfdbError::PartialResult { .. }  => 4,
        }
    }
}

pub type Result<T> = std::result::Result<T, FfdbError>;

//! # ffdb — single-file flatfile database and document store
//!
//! A *flatfile* is an opaque byte stream of concatenated variable-length
//! entries; a companion text *index* maps identifiers to byte ranges inside
//! it.  The database is static infrastructure — no server, no lock daemon,
//! no journal.
//!
//! Format rules (frozen):
//! - The positional index is the sole authority for entry boundaries; every
//!   `(offset, length)` it names is a valid encoded entry, with no orphan
//!   ranges and no claimed gaps
//! - The index is sorted lexicographically by identifier, ties by ascending
//!   offset; duplicates are legal and preserve flatfile order
//! - Entry payloads are `ZLIB(plaintext)`, `IV || AES-CBC-PKCS7(plaintext)`,
//!   or `IV || AES-CBC-PKCS7(ZLIB(plaintext))`, declared index-wide in the
//!   `#` header — no per-entry magic, no negotiation
//! - Checksums (CRC32 of decoded plaintext) are present on all records or on
//!   none
//! - Existing byte ranges are never rewritten: mutation means appending, or
//!   producing a fresh flatfile/index pair
//! - A whole-file gzip flatfile carries a `.gzi` access-point side index for
//!   random reads; readers accept bgzip-layout and windowed tables

pub mod codec;
pub mod crypto;
pub mod error;
pub mod extract;
pub mod index;
pub mod indexer;
pub mod merge;
pub mod planner;
pub mod remove;
pub mod signal;
pub mod source;

// Flat re-exports for the most common types.
pub use codec::{CodecContext, CodecKind};
pub use crypto::KeySize;
pub use error::{FfdbError, Result};
pub use extract::{ExtractOptions, ExtractReport, Extractor};
pub use index::{EntryLoc, IndexHeader, IndexRecord, IndexStore, Policy};
pub use indexer::{run_indexer, IndexerOptions};
pub use merge::{run_merger, MergeOptions};
pub use planner::{PlanMode, ReadRequest};
pub use remove::{run_remover, RemoveOptions};
pub use source::{open_source, ByteSource, SourceOptions};

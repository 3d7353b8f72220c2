//! Positional index: on-disk sorted text format and the in-memory store.
//!
//! # On-disk format (text, LF-terminated)
//!
//! ```text
//! <identifier>\t<offset>\t<length>[\t<checksum_hex>]
//! ```
//!
//! Sorted lexicographically by identifier; ties ordered by ascending offset.
//! An optional first line starting with `#` carries a key-value header:
//!
//! ```text
//! # codec=aes+zlib aes=256 kdf=pbkdf2-sha256 iter=100000 salt=9f8e... crc=1
//! ```
//!
//! Parsers tolerate an absent header (legacy mode: plaintext entries, or the
//! fixed compatibility KDF parameters when the caller supplies a passphrase).
//! Unknown header keys are ignored; an unknown `codec=` or `kdf=` value is
//! fatal at load — this binary cannot service the database and must not
//! guess.
//!
//! # Invariants enforced at load
//! - identifier ordering is monotonic (ties: ascending offset) — `UnsortedIndex`
//! - checksums are present on all records or on none — `MalformedIndex`

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::codec::CodecKind;
use crate::crypto::{KeySize, DEFAULT_ITERATIONS};
use crate::error::{FfdbError, Result};

/// The only key-derivation function this format defines.
pub const KDF_NAME: &str = "pbkdf2-sha256";

// ── Entry location ───────────────────────────────────────────────────────────

/// Byte range of one encoded entry inside the flatfile, plus the optional
/// CRC32 of its decoded plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLoc {
    pub offset:   u64,
    pub length:   u64,
    pub checksum: Option<u32>,
}

/// One parsed index line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub id:  String,
    pub loc: EntryLoc,
}

impl IndexRecord {
    /// Render as an index line, without the trailing newline.
    pub fn format(&self) -> String {
        match self.loc.checksum {
            Some(c) => format!("{}\t{}\t{}\t{:08x}", self.id, self.loc.offset, self.loc.length, c),
            None    => format!("{}\t{}\t{}", self.id, self.loc.offset, self.loc.length),
        }
    }

    /// Parse one index line.  `line` must not include the newline.
    pub fn parse(line: &str, lineno: usize) -> Result<Self> {
        let mut fields = line.split('\t');
        let id = fields.next().filter(|s| !s.is_empty()).ok_or_else(|| malformed(lineno, "empty identifier"))?;
        let offset = fields
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| malformed(lineno, "bad offset"))?;
        let length = fields
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| malformed(lineno, "bad length"))?;
        let checksum = match fields.next() {
            Some(s) => Some(u32::from_str_radix(s, 16).map_err(|_| malformed(lineno, "bad checksum"))?),
            None    => None,
        };
        if fields.next().is_some() {
            return Err(malformed(lineno, "too many fields"));
        }
        Ok(IndexRecord { id: id.to_owned(), loc: EntryLoc { offset, length, checksum } })
    }
}

fn malformed(line: usize, reason: &str) -> FfdbError {
    FfdbError::MalformedIndex { line, reason: reason.to_owned() }
}

// ── Duplicates policy ────────────────────────────────────────────────────────

/// Resolution policy when an identifier maps to multiple entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    /// First entry in flatfile order (default).
    #[default]
    First,
    /// Last entry in flatfile order.
    Last,
    /// Every entry, in flatfile order.
    All,
}

// ── Index header ─────────────────────────────────────────────────────────────

/// Parsed `#` header line.  Declares the codec stack for every entry in the
/// flatfile; absent header means plaintext unless the legacy KDF fallback is
/// engaged by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    pub codec:      CodecKind,
    pub aes:        Option<KeySize>,
    pub iterations: u32,
    pub salt:       Option<Vec<u8>>,
    pub crc:        bool,
}

impl Default for IndexHeader {
    fn default() -> Self {
        IndexHeader {
            codec:      CodecKind::None,
            aes:        None,
            iterations: DEFAULT_ITERATIONS,
            salt:       None,
            crc:        false,
        }
    }
}

impl IndexHeader {
    /// Parse a header line (must start with `#`).
    ///
    /// Unknown keys are tolerated for forward compatibility; unknown values
    /// for `codec=` and `kdf=` are fatal.
    pub fn parse(line: &str) -> Result<Self> {
        let mut hdr = IndexHeader::default();
        for token in line.trim_start_matches('#').split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some(kv) => kv,
                None     => continue,
            };
            match key {
                "codec" => {
                    hdr.codec = CodecKind::from_name(value)
                        .ok_or_else(|| FfdbError::UnsupportedCodec(format!("codec={value}")))?;
                }
                "aes" => {
                    let bits = value.parse::<u32>().ok().and_then(KeySize::from_bits)
                        .ok_or_else(|| FfdbError::UnsupportedCodec(format!("aes={value}")))?;
                    hdr.aes = Some(bits);
                }
                "kdf" => {
                    if value != KDF_NAME {
                        return Err(FfdbError::UnsupportedCodec(format!("kdf={value}")));
                    }
                }
                "iter" => {
                    hdr.iterations = value.parse().map_err(|_| {
                        FfdbError::UnsupportedCodec(format!("iter={value}"))
                    })?;
                }
                "salt" => {
                    hdr.salt = Some(hex::decode(value).map_err(|_| {
                        FfdbError::UnsupportedCodec(format!("salt={value}"))
                    })?);
                }
                "crc" => hdr.crc = value == "1",
                _ => {} // forward compatibility
            }
        }
        if hdr.codec.has_aes() && hdr.aes.is_none() {
            hdr.aes = Some(KeySize::Bits256);
        }
        Ok(hdr)
    }

    /// Render the header line (no trailing newline), or `None` when the
    /// header would carry no information (legacy-compatible output).
    pub fn format(&self) -> Option<String> {
        if self.codec == CodecKind::None && !self.crc {
            return None;
        }
        let mut line = format!("# codec={}", self.codec.name());
        if self.codec.has_aes() {
            let bits = self.aes.unwrap_or(KeySize::Bits256).bits();
            line.push_str(&format!(" aes={bits} kdf={KDF_NAME} iter={}", self.iterations));
            if let Some(ref salt) = self.salt {
                line.push_str(&format!(" salt={}", hex::encode(salt)));
            }
        }
        if self.crc {
            line.push_str(" crc=1");
        }
        Some(line)
    }
}

// ── In-memory store ──────────────────────────────────────────────────────────

/// Sorted multimap from identifier to entry locations, loaded once and then
/// read-only (shared across extraction workers).
#[derive(Debug, Default)]
pub struct IndexStore {
    pub header: IndexHeader,
    map: BTreeMap<Box<str>, Vec<EntryLoc>>,
    records: usize,
}

impl IndexStore {
    /// Stream-parse an index file, asserting the sorted invariant.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut store = IndexStore::default();
        let mut prev: Option<IndexRecord> = None;
        let mut checksums: Option<bool> = None;

        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let lineno = i + 1;
            if line.is_empty() {
                continue;
            }
            if line.starts_with('#') {
                if lineno == 1 {
                    store.header = IndexHeader::parse(&line)?;
                    continue;
                }
                return Err(malformed(lineno, "header allowed only on line 1"));
            }

            let rec = IndexRecord::parse(&line, lineno)?;

            // Invariant 3: all-or-none checksums.
            let has = rec.loc.checksum.is_some();
            match checksums {
                None => checksums = Some(has),
                Some(expected) if expected != has => {
                    return Err(malformed(lineno, "inconsistent checksum column"));
                }
                _ => {}
            }

            // Invariant 2: sorted by identifier, ties by ascending offset.
            if let Some(ref p) = prev {
                let out_of_order = p.id.as_str() > rec.id.as_str()
                    || (p.id == rec.id && p.loc.offset > rec.loc.offset);
                if out_of_order {
                    return Err(FfdbError::UnsortedIndex {
                        line: lineno,
                        prev: p.id.clone(),
                        cur:  rec.id.clone(),
                    });
                }
            }

            store.push(rec.clone());
            prev = Some(rec);
        }
        Ok(store)
    }

    fn push(&mut self, rec: IndexRecord) {
        self.records += 1;
        self.map.entry(rec.id.into_boxed_str()).or_default().push(rec.loc);
    }

    /// Total number of records (duplicates counted).
    pub fn len(&self) -> usize { self.records }

    pub fn is_empty(&self) -> bool { self.records == 0 }

    /// Number of distinct identifiers.
    pub fn identifiers(&self) -> usize { self.map.len() }

    /// Resolve one identifier under a duplicates policy.
    ///
    /// A miss is not an error: the empty vector is returned and the caller
    /// decides how to surface it.
    pub fn lookup(&self, id: &str, policy: Policy) -> Vec<EntryLoc> {
        match self.map.get(id) {
            None       => Vec::new(),
            Some(locs) => match policy {
                Policy::First => vec![locs[0]],
                Policy::Last  => vec![locs[locs.len() - 1]],
                Policy::All   => locs.clone(),
            },
        }
    }

    /// Vectorised lookup; the result matches input order.
    pub fn lookup_many(&self, ids: &[String], policy: Policy) -> Vec<Vec<EntryLoc>> {
        ids.iter().map(|id| self.lookup(id, policy)).collect()
    }

    /// Iterate all records in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = IndexRecord> + '_ {
        self.map.iter().flat_map(|(id, locs)| {
            locs.iter().map(move |loc| IndexRecord { id: id.to_string(), loc: *loc })
        })
    }
}

// ── File emission ────────────────────────────────────────────────────────────

/// Write a complete index file: optional header plus records, which must
/// already be in sorted order.
pub fn write_index<P, I>(path: P, header: &IndexHeader, records: I) -> Result<()>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = IndexRecord>,
{
    let mut w = BufWriter::new(File::create(path.as_ref())?);
    write_index_to(&mut w, header, records)?;
    w.flush()?;
    Ok(())
}

/// Same as [`write_index`] over an arbitrary writer.
pub fn write_index_to<W, I>(w: &mut W, header: &IndexHeader, records: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = IndexRecord>,
{
    if let Some(line) = header.format() {
        writeln!(w, "{line}")?;
    }
    for rec in records {
        writeln!(w, "{}", rec.format())?;
    }
    Ok(())
}

/// Stream records out of an index file in order, skipping the header.
///
/// Used by the merger and remover, which rewrite large indexes without
/// holding them in memory.
pub struct IndexStream {
    lines:  std::io::Lines<BufReader<File>>,
    pub header: IndexHeader,
    lineno: usize,
    peeked: Option<IndexRecord>,
}

impl IndexStream {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut lines = BufReader::new(File::open(path.as_ref())?).lines();
        let mut header = IndexHeader::default();
        let mut lineno = 0usize;
        let mut peeked = None;

        if let Some(first) = lines.next() {
            let first = first?;
            lineno = 1;
            if first.starts_with('#') {
                header = IndexHeader::parse(&first)?;
            } else if !first.is_empty() {
                peeked = Some(IndexRecord::parse(&first, lineno)?);
            }
        }
        Ok(IndexStream { lines, header, lineno, peeked })
    }

    /// Next record, or `None` at end of file.
    pub fn next_record(&mut self) -> Result<Option<IndexRecord>> {
        if let Some(rec) = self.peeked.take() {
            return Ok(Some(rec));
        }
        for line in self.lines.by_ref() {
            let line = line?;
            self.lineno += 1;
            if line.is_empty() {
                continue;
            }
            return IndexRecord::parse(&line, self.lineno).map(Some);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_tmp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn load_and_lookup_policies() {
        let f = write_tmp("9606\t100\t40\n9606\t300\t40\n9606\t700\t40\nalpha\t0\t12\n");
        let store = IndexStore::load(f.path()).unwrap();
        assert_eq!(store.len(), 4);
        assert_eq!(store.identifiers(), 2);

        let first = store.lookup("9606", Policy::First);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].offset, 100);

        let last = store.lookup("9606", Policy::Last);
        assert_eq!(last[0].offset, 700);

        let all = store.lookup("9606", Policy::All);
        assert_eq!(all.iter().map(|l| l.offset).collect::<Vec<_>>(), vec![100, 300, 700]);

        assert!(store.lookup("missing", Policy::All).is_empty());
    }

    #[test]
    fn unsorted_index_rejected() {
        let f = write_tmp("beta\t0\t10\nalpha\t10\t10\n");
        assert!(matches!(IndexStore::load(f.path()), Err(FfdbError::UnsortedIndex { .. })));
    }

    #[test]
    fn unsorted_duplicate_offsets_rejected() {
        let f = write_tmp("x\t300\t10\nx\t100\t10\n");
        assert!(matches!(IndexStore::load(f.path()), Err(FfdbError::UnsortedIndex { .. })));
    }

    #[test]
    fn mixed_checksum_column_rejected() {
        let f = write_tmp("a\t0\t10\tdeadbeef\nb\t10\t10\n");
        assert!(matches!(IndexStore::load(f.path()), Err(FfdbError::MalformedIndex { .. })));
    }

    #[test]
    fn header_round_trip() {
        let hdr = IndexHeader {
            codec:      CodecKind::AesZlib,
            aes:        Some(KeySize::Bits192),
            iterations: 100_000,
            salt:       Some(vec![0x9f, 0x8e, 0x00, 0x01]),
            crc:        true,
        };
        let line = hdr.format().unwrap();
        let parsed = IndexHeader::parse(&line).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn absent_header_is_legacy_plain() {
        let f = write_tmp("alpha\t0\t12\n");
        let store = IndexStore::load(f.path()).unwrap();
        assert_eq!(store.header.codec, CodecKind::None);
        assert!(!store.header.crc);
    }

    #[test]
    fn unknown_codec_fatal_unknown_keys_tolerated() {
        assert!(matches!(
            IndexHeader::parse("# codec=zstd"),
            Err(FfdbError::UnsupportedCodec(_))
        ));
        assert!(matches!(
            IndexHeader::parse("# kdf=argon2id"),
            Err(FfdbError::UnsupportedCodec(_))
        ));
        let hdr = IndexHeader::parse("# codec=zlib future_key=1").unwrap();
        assert_eq!(hdr.codec, CodecKind::Zlib);
    }

    #[test]
    fn record_parse_and_format() {
        let rec = IndexRecord::parse("id1\t42\t100\t0000beef", 1).unwrap();
        assert_eq!(rec.loc.checksum, Some(0xbeef));
        assert_eq!(rec.format(), "id1\t42\t100\t0000beef");

        let plain = IndexRecord::parse("id1\t42\t100", 1).unwrap();
        assert_eq!(plain.loc.checksum, None);
        assert!(IndexRecord::parse("id1\t42", 1).is_err());
        assert!(IndexRecord::parse("\t1\t2", 1).is_err());
    }

    #[test]
    fn stream_yields_records_in_order() {
        let f = write_tmp("# codec=zlib\na\t0\t5\nb\t5\t5\n");
        let mut s = IndexStream::open(f.path()).unwrap();
        assert_eq!(s.header.codec, CodecKind::Zlib);
        assert_eq!(s.next_record().unwrap().unwrap().id, "a");
        assert_eq!(s.next_record().unwrap().unwrap().id, "b");
        assert!(s.next_record().unwrap().is_none());
    }
}

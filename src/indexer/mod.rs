//! Indexer: scan a flatfile with identifier regexes and an entry terminator,
//! optionally re-emit entries through the codec stack, produce index records.
//!
//! # Entry recognition
//! The scanner is a per-line state machine.  An entry begins at the first
//! line matching any identifier pattern and ends with (and includes) the
//! next line matching the terminator.  Lines between entries that match
//! nothing belong to no entry.  Identifier lines inside an entry add further
//! identifiers; by default only the first match per pattern counts, with
//! `all_matches` every match and every capture contributes.
//!
//! Two pattern kinds:
//! - independent patterns contribute their first capture group (or the whole
//!   match when the pattern has no groups);
//! - joined patterns concatenate all capture groups of a single match,
//!   colon-separated, into one compound identifier.
//!
//! # Parallel scan
//! The file is split into byte blocks; each split point is advanced to the
//! first terminator boundary at or after it, so no entry crosses a block.
//! Workers scan independently and the driver concatenates their output in
//! file order, then sorts (unless `unsorted` leaves that to an external
//! sort).
//!
//! # Codec re-emission
//! With compression or encryption requested, the indexer writes a sibling
//! flatfile (`.enc` when encrypted, `.xz` when compress-only) holding the
//! encoded entries; emitted offsets refer to the new file.  Encoding runs in
//! parallel per entry; offsets are assigned by a sequential stitch so the
//! result is identical to a single-threaded run.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rayon::prelude::*;
use regex::bytes::Regex;

use crate::codec::CodecContext;
use crate::error::{FfdbError, Result};
use crate::index::{self, EntryLoc, IndexHeader, IndexRecord};

#[derive(Debug, Clone)]
pub struct IndexerOptions {
    /// Independent identifier patterns (`-i`).
    pub id_patterns:     Vec<String>,
    /// Joined identifier patterns (`-j`).
    pub joined_patterns: Vec<String>,
    /// Terminator line pattern, e.g. `^//$` or `^-$`.
    pub terminator:      String,
    /// Collect every match and capture instead of the first per pattern (`-a`).
    pub all_matches:     bool,
    /// Record CRC32 of each decoded entry (`-x`).
    pub checksum:        bool,
    pub threads:         usize,
    /// Added to every emitted offset (`--offset`), for later prefixing.
    pub offset_shift:    u64,
    /// Skip the final sort (`-u`); left to an external sort command.
    pub unsorted:        bool,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        IndexerOptions {
            id_patterns:     Vec::new(),
            joined_patterns: Vec::new(),
            terminator:      String::new(),
            all_matches:     false,
            checksum:        false,
            threads:         1,
            offset_shift:    0,
            unsorted:        false,
        }
    }
}

#[derive(Debug)]
pub struct IndexOutcome {
    pub entries: usize,
    pub records: usize,
    /// The flatfile the emitted index refers to: the input, or the sibling
    /// produced by codec re-emission.
    pub flatfile: PathBuf,
}

// ── Patterns ─────────────────────────────────────────────────────────────────

/// All patterns, compiled once and evaluated per line in a fixed order.
/// Stateless across entries.
struct Patterns {
    terminator: Regex,
    ids:        Vec<Regex>,
    joined:     Vec<Regex>,
}

impl Patterns {
    fn compile(opts: &IndexerOptions) -> Result<Self> {
        if opts.id_patterns.is_empty() && opts.joined_patterns.is_empty() {
            return Err(FfdbError::Usage("at least one identifier pattern is required".into()));
        }
        let compile = |p: &String| {
            Regex::new(p).map_err(|e| FfdbError::Usage(format!("bad pattern {p:?}: {e}")))
        };
        Ok(Patterns {
            terminator: compile(&opts.terminator)?,
            ids:        opts.id_patterns.iter().map(compile).collect::<Result<_>>()?,
            joined:     opts.joined_patterns.iter().map(compile).collect::<Result<_>>()?,
        })
    }

    fn is_terminator(&self, line: &[u8]) -> bool {
        self.terminator.is_match(line)
    }

    /// Collect identifiers from one line.
    ///
    /// `seen` tracks which patterns already contributed to the current entry
    /// (first-match-wins unless `all`); index space: independent patterns
    /// first, then joined.
    fn collect(&self, line: &[u8], all: bool, seen: &mut [bool], out: &mut Vec<String>) {
        for (pi, re) in self.ids.iter().enumerate() {
            if seen[pi] && !all {
                continue;
            }
            for caps in re.captures_iter(line) {
                let mut matched = false;
                if caps.len() > 1 {
                    for group in caps.iter().skip(1).flatten() {
                        if !group.as_bytes().is_empty() {
                            out.push(String::from_utf8_lossy(group.as_bytes()).into_owned());
                            matched = true;
                            if !all {
                                break;
                            }
                        }
                    }
                } else if let Some(whole) = caps.get(0) {
                    out.push(String::from_utf8_lossy(whole.as_bytes()).into_owned());
                    matched = true;
                }
                if matched {
                    seen[pi] = true;
                }
                if !all {
                    break;
                }
            }
        }

        let base = self.ids.len();
        for (pi, re) in self.joined.iter().enumerate() {
            if seen[base + pi] && !all {
                continue;
            }
            for caps in re.captures_iter(line) {
                let joined: Vec<String> = caps
                    .iter()
                    .skip(1)
                    .flatten()
                    .map(|g| String::from_utf8_lossy(g.as_bytes()).into_owned())
                    .collect();
                if !joined.is_empty() {
                    out.push(joined.join(":"));
                    seen[base + pi] = true;
                }
                if !all {
                    break;
                }
            }
        }
    }

    fn pattern_count(&self) -> usize {
        self.ids.len() + self.joined.len()
    }
}

// ── Scanner ──────────────────────────────────────────────────────────────────

/// One entry found by a scan worker.
struct RawEntry {
    ids:    Vec<String>,
    offset: u64,
    length: u64,
    /// Entry bytes, captured only when re-encoding or checksumming.
    bytes:  Option<Vec<u8>>,
}

enum State {
    Between,
    InEntry,
}

/// Advance `pos` to the first terminator boundary (offset just past a
/// terminator line) at or after it.  Position 0 is always a boundary.
fn align_to_terminator(path: &Path, pos: u64, patterns: &Patterns) -> Result<u64> {
    if pos == 0 {
        return Ok(0);
    }
    let mut reader = BufReader::new(File::open(path)?);
    reader.seek(SeekFrom::Start(pos))?;

    let mut cursor = pos;
    let mut line = Vec::new();
    // The seek may have landed mid-line; the partial tail is unmatchable, so
    // skip to the next line start first.
    reader.read_until(b'\n', &mut line)?;
    cursor += line.len() as u64;

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            return Ok(cursor); // EOF is a boundary
        }
        cursor += n as u64;
        if patterns.is_terminator(trim_newline(&line)) {
            return Ok(cursor);
        }
    }
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    if end > 0 && line[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && line[end - 1] == b'\r' {
        end -= 1;
    }
    &line[..end]
}

/// Run the state machine over `[start, end)` of the flatfile.
fn scan_region(
    path:          &Path,
    start:         u64,
    end:           u64,
    patterns:      &Patterns,
    all:           bool,
    capture_bytes: bool,
) -> Result<Vec<RawEntry>> {
    let mut reader = BufReader::new(File::open(path)?);
    reader.seek(SeekFrom::Start(start))?;

    let mut entries = Vec::new();
    let mut state = State::Between;
    let mut ids: Vec<String> = Vec::new();
    let mut seen = vec![false; patterns.pattern_count()];
    let mut entry_start = 0u64;
    let mut buffer: Vec<u8> = Vec::new();

    let mut cursor = start;
    let mut line = Vec::new();
    while cursor < end {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        let line_start = cursor;
        cursor += n as u64;

        let content = trim_newline(&line);
        let is_term = patterns.is_terminator(content);

        match state {
            State::Between => {
                if is_term {
                    continue; // stray terminator between entries
                }
                let mut found = Vec::new();
                patterns.collect(content, all, &mut seen, &mut found);
                if found.is_empty() {
                    continue; // junk between entries
                }
                state = State::InEntry;
                entry_start = line_start;
                ids = found;
                if capture_bytes {
                    buffer.extend_from_slice(&line);
                }
            }
            State::InEntry => {
                if capture_bytes {
                    buffer.extend_from_slice(&line);
                }
                if is_term {
                    entries.push(RawEntry {
                        ids:    std::mem::take(&mut ids),
                        offset: entry_start,
                        length: cursor - entry_start,
                        bytes:  capture_bytes.then(|| std::mem::take(&mut buffer)),
                    });
                    buffer.clear();
                    seen.iter_mut().for_each(|s| *s = false);
                    state = State::Between;
                } else {
                    patterns.collect(content, all, &mut seen, &mut ids);
                }
            }
        }
    }

    // An unterminated trailing entry is still indexed, ending at EOF.
    if matches!(state, State::InEntry) && !ids.is_empty() {
        warn!("entry at offset {entry_start} has no terminator; indexed up to EOF");
        entries.push(RawEntry {
            ids,
            offset: entry_start,
            length: cursor - entry_start,
            bytes:  capture_bytes.then_some(buffer),
        });
    }

    Ok(entries)
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// Sibling path for the re-encoded flatfile.
fn encoded_path(input: &Path, ctx: &CodecContext) -> PathBuf {
    let suffix = if ctx.kind.has_aes() { ".enc" } else { ".xz" };
    let mut os = input.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Index `input`, writing the index to `index_out`.
///
/// `header` declares the codec configuration and checksum flag recorded in
/// the index; `ctx` performs the actual re-encoding when active.
pub fn run_indexer(
    input:     &Path,
    index_out: &Path,
    ctx:       &CodecContext,
    header:    &IndexHeader,
    opts:      &IndexerOptions,
) -> Result<IndexOutcome> {
    let patterns = Patterns::compile(opts)?;
    let file_len = std::fs::metadata(input)?.len();
    let codec_active = ctx.kind != crate::codec::CodecKind::None;
    let capture_bytes = codec_active || opts.checksum;

    // Block boundaries aligned to terminators, so no entry crosses a worker.
    let threads = opts.threads.max(1);
    let mut bounds = vec![0u64];
    if threads > 1 && file_len > 0 {
        let step = file_len / threads as u64;
        for k in 1..threads as u64 {
            let aligned = align_to_terminator(input, k * step, &patterns)?;
            if aligned > *bounds.last().expect("bounds never empty") && aligned < file_len {
                bounds.push(aligned);
            }
        }
    }
    bounds.push(file_len);
    debug!("scanning {} block(s)", bounds.len() - 1);

    let regions: Vec<(u64, u64)> = bounds.windows(2).map(|w| (w[0], w[1])).collect();
    let scanned: Result<Vec<Vec<RawEntry>>> = if threads > 1 && regions.len() > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| FfdbError::Io(std::io::Error::other(e)))?;
        pool.install(|| {
            regions
                .par_iter()
                .map(|&(s, e)| scan_region(input, s, e, &patterns, opts.all_matches, capture_bytes))
                .collect()
        })
    } else {
        regions
            .iter()
            .map(|&(s, e)| scan_region(input, s, e, &patterns, opts.all_matches, capture_bytes))
            .collect()
    };
    let mut entries: Vec<RawEntry> = scanned?.into_iter().flatten().collect();
    info!("found {} entries in {}", entries.len(), input.display());

    // Re-emit through the codec stack, or keep the scan offsets.
    let flatfile = if codec_active {
        let out_path = encoded_path(input, ctx);
        let encoded: Result<Vec<Vec<u8>>> = entries
            .par_iter()
            .map(|e| ctx.encode(e.bytes.as_deref().expect("bytes captured when codec active")))
            .collect();
        let encoded = encoded?;

        let mut w = BufWriter::new(File::create(&out_path)?);
        let mut offset = 0u64;
        for (entry, payload) in entries.iter_mut().zip(&encoded) {
            w.write_all(payload)?;
            entry.offset = offset;
            entry.length = payload.len() as u64;
            offset += payload.len() as u64;
        }
        w.flush()?;
        info!("wrote encoded flatfile {}", out_path.display());
        out_path
    } else {
        input.to_owned()
    };

    // Build index records: one per (identifier, entry).
    let mut records: Vec<IndexRecord> = Vec::new();
    for entry in &entries {
        let checksum = opts
            .checksum
            .then(|| crate::codec::crc32(entry.bytes.as_deref().expect("bytes captured for checksum")));
        for id in &entry.ids {
            records.push(IndexRecord {
                id:  id.clone(),
                loc: EntryLoc {
                    offset: entry.offset + opts.offset_shift,
                    length: entry.length,
                    checksum,
                },
            });
        }
    }
    if !opts.unsorted {
        records.sort_by(|a, b| a.id.cmp(&b.id).then(a.loc.offset.cmp(&b.loc.offset)));
    }

    let record_count = records.len();
    index::write_index(index_out, header, records)?;
    info!("wrote {} record(s) to {}", record_count, index_out.display());

    Ok(IndexOutcome {
        entries:  entries.len(),
        records:  record_count,
        flatfile,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecKind;
    use crate::crypto::KeySize;
    use crate::index::IndexStore;

    const FLAT: &[u8] = b"AC alpha\nsome payload\n-\nAC beta\nmore\n-\nAC gamma\nlast\n-\n";

    fn opts(terminator: &str, ids: &[&str]) -> IndexerOptions {
        IndexerOptions {
            id_patterns: ids.iter().map(|s| s.to_string()).collect(),
            terminator:  terminator.to_string(),
            ..Default::default()
        }
    }

    fn write_flat(data: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.dat");
        std::fs::write(&path, data).unwrap();
        (dir, path)
    }

    #[test]
    fn three_entries_tile_the_file() {
        let (dir, flat) = write_flat(FLAT);
        let idx = dir.path().join("db.idx");
        let o = opts("^-$", &[r"^AC (\w+)"]);
        let outcome =
            run_indexer(&flat, &idx, &CodecContext::plain(), &IndexHeader::default(), &o).unwrap();
        assert_eq!(outcome.entries, 3);
        assert_eq!(outcome.records, 3);

        let store = IndexStore::load(&idx).unwrap();
        let alpha = store.lookup("alpha", crate::index::Policy::First)[0];
        assert_eq!(alpha.offset, 0);
        let gamma = store.lookup("gamma", crate::index::Policy::First)[0];
        // Entries tile: gamma ends at EOF.
        assert_eq!(gamma.offset + gamma.length, FLAT.len() as u64);
    }

    #[test]
    fn emitted_index_is_sorted() {
        let data = b"AC zz\n-\nAC aa\n-\nAC mm\n-\n";
        let (dir, flat) = write_flat(data);
        let idx = dir.path().join("db.idx");
        run_indexer(
            &flat,
            &idx,
            &CodecContext::plain(),
            &IndexHeader::default(),
            &opts("^-$", &[r"^AC (\w+)"]),
        )
        .unwrap();
        // load() itself asserts the sorted invariant.
        let store = IndexStore::load(&idx).unwrap();
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn multiple_ids_per_entry_and_first_match_wins() {
        let data = b"AC one\nAC two\nOX 9606\n-\n";
        let (dir, flat) = write_flat(data);
        let idx = dir.path().join("db.idx");

        // Without -a: first AC only; OX pattern contributes independently.
        let o = opts("^-$", &[r"^AC (\w+)", r"^OX (\d+)"]);
        let outcome = run_indexer(
            &flat, &idx, &CodecContext::plain(), &IndexHeader::default(), &o,
        )
        .unwrap();
        assert_eq!(outcome.records, 2); // "one" and "9606"

        // With -a: both AC lines contribute.
        let o_all = IndexerOptions { all_matches: true, ..o };
        let outcome = run_indexer(
            &flat, &idx, &CodecContext::plain(), &IndexHeader::default(), &o_all,
        )
        .unwrap();
        assert_eq!(outcome.records, 3);
    }

    #[test]
    fn joined_pattern_builds_compound_identifier() {
        let data = b"LOC chr7:117559590\n-\n";
        let (dir, flat) = write_flat(data);
        let idx = dir.path().join("db.idx");
        let o = IndexerOptions {
            joined_patterns: vec![r"^LOC (\w+):(\d+)".to_string()],
            terminator:      "^-$".to_string(),
            ..Default::default()
        };
        run_indexer(&flat, &idx, &CodecContext::plain(), &IndexHeader::default(), &o).unwrap();
        let store = IndexStore::load(&idx).unwrap();
        assert_eq!(store.lookup("chr7:117559590", crate::index::Policy::First).len(), 1);
    }

    #[test]
    fn checksums_recorded_when_requested() {
        let (dir, flat) = write_flat(FLAT);
        let idx = dir.path().join("db.idx");
        let o = IndexerOptions { checksum: true, ..opts("^-$", &[r"^AC (\w+)"]) };
        let header = IndexHeader { crc: true, ..Default::default() };
        run_indexer(&flat, &idx, &CodecContext::plain(), &header, &o).unwrap();

        let store = IndexStore::load(&idx).unwrap();
        let loc = store.lookup("alpha", crate::index::Policy::First)[0];
        let expected = crate::codec::crc32(&FLAT[..loc.length as usize]);
        assert_eq!(loc.checksum, Some(expected));
    }

    #[test]
    fn offset_shift_applies_to_every_record() {
        let (dir, flat) = write_flat(FLAT);
        let idx = dir.path().join("db.idx");
        let o = IndexerOptions { offset_shift: 1000, ..opts("^-$", &[r"^AC (\w+)"]) };
        run_indexer(&flat, &idx, &CodecContext::plain(), &IndexHeader::default(), &o).unwrap();
        let store = IndexStore::load(&idx).unwrap();
        assert_eq!(store.lookup("alpha", crate::index::Policy::First)[0].offset, 1000);
    }

    #[test]
    fn parallel_scan_matches_serial() {
        // Enough entries that block alignment actually splits the file.
        let mut data = Vec::new();
        for i in 0..200 {
            data.extend_from_slice(format!("AC id{i:04}\npayload line {i}\n-\n").as_bytes());
        }
        let (dir, flat) = write_flat(&data);

        let serial_idx = dir.path().join("serial.idx");
        let par_idx = dir.path().join("par.idx");
        let base = opts("^-$", &[r"^AC (\w+)"]);
        run_indexer(&flat, &serial_idx, &CodecContext::plain(), &IndexHeader::default(), &base)
            .unwrap();
        run_indexer(
            &flat,
            &par_idx,
            &CodecContext::plain(),
            &IndexHeader::default(),
            &IndexerOptions { threads: 4, ..base },
        )
        .unwrap();
        assert_eq!(
            std::fs::read(&serial_idx).unwrap(),
            std::fs::read(&par_idx).unwrap()
        );
    }

    #[test]
    fn encrypted_reindex_round_trips_through_extraction() {
        let (dir, flat) = write_flat(FLAT);
        let idx = dir.path().join("db.idx");

        let header = IndexHeader {
            codec: CodecKind::AesZlib,
            aes:   Some(KeySize::Bits256),
            salt:  Some(b"0123456789abcdef".to_vec()),
            ..Default::default()
        };
        let ctx = CodecContext::new(
            CodecKind::AesZlib,
            KeySize::Bits256,
            Some("secret"),
            header.salt.as_deref().unwrap(),
            header.iterations,
            6,
        )
        .unwrap();

        let o = opts("^-$", &[r"^AC (\w+)"]);
        let outcome = run_indexer(&flat, &idx, &ctx, &header, &o).unwrap();
        assert!(outcome.flatfile.to_string_lossy().ends_with(".enc"));

        // The encoded file's ranges decode back to the original entries.
        let store = IndexStore::load(&idx).unwrap();
        let encoded = std::fs::read(&outcome.flatfile).unwrap();
        let beta = store.lookup("beta", crate::index::Policy::First)[0];
        let payload = &encoded[beta.offset as usize..(beta.offset + beta.length) as usize];
        assert_eq!(ctx.decode(payload).unwrap(), b"AC beta\nmore\n-\n");
    }
}

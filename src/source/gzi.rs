//! Whole-file gzip random access via a `.gzi` access-point side index.
//!
//! # Side-index contract
//! A `.gzi` is a table of access points `(compressed_offset,
//! decompressed_offset [, window])`.  Two layouts are accepted:
//!
//! - **bgzip layout**: `count (LE u64)` followed by `count` pairs of LE u64
//!   `(compressed_offset, decompressed_offset)`, excluding the implicit
//!   first point at `(0, 0)`.  Every offset is a gzip member boundary.
//! - **extended layout** (gztool-style): `count (LE u64)` followed by
//!   `count` records `{ compressed_offset: u64, decompressed_offset: u64,
//!   window_bits: u32, window_len: u32, window: [u8; window_len] }`.
//!   A non-empty window primes the inflater dictionary; the resume position
//!   must be byte-aligned (`window_bits == 0`) — this build exposes no
//!   bit-level inflate priming and rejects misaligned points.
//!
//! # Read path
//! `read_at(offset, length)` locates the last access point at or before
//! `offset`, range-reads the compressed segment up to the first access point
//! covering `offset + length` (or EOF), inflates from the access point —
//! fresh gzip member or primed raw deflate — then discards the prefix and
//! returns the requested slice.
//!
//! For remote sources the compressed segments can be cached locally,
//! content-addressed by `(url, access-point id, segment size)`, with a
//! single-writer many-reader discipline per key.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::{Compression, Decompress, FlushDecompress};
use log::debug;

use super::ByteSource;
use crate::error::{FfdbError, Result};

/// Decompressed bytes per gzip member produced by [`compress_with_index`].
pub const DEFAULT_SPAN: u64 = 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn gzi_err(msg: impl Into<String>) -> FfdbError {
    FfdbError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into()))
}

// ── Access points ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub compressed_offset:   u64,
    pub decompressed_offset: u64,
    /// Up to 32 KiB of decompressed history preceding the point; empty when
    /// the point is a gzip member boundary or a full-flush reset.
    pub window: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct GzIndex {
    /// Sorted by decompressed offset; always starts with the implicit (0, 0).
    points: Vec<AccessPoint>,
}

impl GzIndex {
    /// Parse a `.gzi` in either accepted layout.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let count = cur
            .read_u64::<LittleEndian>()
            .map_err(|_| gzi_err("gzi: truncated header"))?;

        let mut points = vec![AccessPoint {
            compressed_offset:   0,
            decompressed_offset: 0,
            window:              Vec::new(),
        }];

        if data.len() as u64 == 8 + count.saturating_mul(16) {
            // bgzip layout: bare (compressed, decompressed) pairs.
            for _ in 0..count {
                let comp   = cur.read_u64::<LittleEndian>().map_err(|_| gzi_err("gzi: truncated"))?;
                let decomp = cur.read_u64::<LittleEndian>().map_err(|_| gzi_err("gzi: truncated"))?;
                points.push(AccessPoint {
                    compressed_offset:   comp,
                    decompressed_offset: decomp,
                    window:              Vec::new(),
                });
            }
        } else {
            // Extended layout with window records.
            for _ in 0..count {
                let comp   = cur.read_u64::<LittleEndian>().map_err(|_| gzi_err("gzi: truncated"))?;
                let decomp = cur.read_u64::<LittleEndian>().map_err(|_| gzi_err("gzi: truncated"))?;
                let bits   = cur.read_u32::<LittleEndian>().map_err(|_| gzi_err("gzi: truncated"))?;
                let wlen   = cur.read_u32::<LittleEndian>().map_err(|_| gzi_err("gzi: truncated"))?;
                if bits != 0 {
                    return Err(FfdbError::UnsupportedCodec(format!(
                        "gzi access point at bit offset {bits} — only byte-aligned points are supported"
                    )));
                }
                let mut window = vec![0u8; wlen as usize];
                cur.read_exact(&mut window).map_err(|_| gzi_err("gzi: truncated window"))?;
                points.push(AccessPoint {
                    compressed_offset: comp,
                    decompressed_offset: decomp,
                    window,
                });
            }
            if cur.position() != data.len() as u64 {
                return Err(gzi_err("gzi: trailing bytes after last access point"));
            }
        }

        // Points must be strictly increasing in both offsets (after the
        // implicit origin, which a malformed index may duplicate).
        points.dedup();
        for pair in points.windows(2) {
            if pair[1].decompressed_offset <= pair[0].decompressed_offset
                || pair[1].compressed_offset <= pair[0].compressed_offset
            {
                return Err(gzi_err("gzi: access points not monotonically increasing"));
            }
        }
        Ok(GzIndex { points })
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Index of the last point with `decompressed_offset <= offset`.
    fn seek_point(&self, offset: u64) -> usize {
        self.points.partition_point(|p| p.decompressed_offset <= offset) - 1
    }
}

/// Write a `.gzi` in the bgzip layout.  `points` are the member boundaries
/// after the first, as `(compressed_offset, decompressed_offset)`.
pub fn write_gzi<P: AsRef<Path>>(path: P, points: &[(u64, u64)]) -> Result<()> {
    let mut w = BufWriter::new(File::create(path.as_ref())?);
    w.write_u64::<LittleEndian>(points.len() as u64)?;
    for &(comp, decomp) in points {
        w.write_u64::<LittleEndian>(comp)?;
        w.write_u64::<LittleEndian>(decomp)?;
    }
    w.flush()?;
    Ok(())
}

// ── Compressor with access points ────────────────────────────────────────────

/// Gzip-compress `src` into `dst` as concatenated members of `span`
/// decompressed bytes each, writing the access-point table to `gzi`.
///
/// Member boundaries are natural access points: each starts a fresh deflate
/// stream with an empty window, so the output satisfies the side-index
/// contract while remaining a valid gzip file for ordinary decompressors.
pub fn compress_with_index(src: &Path, dst: &Path, gzi: &Path, span: u64) -> Result<()> {
    let span = span.max(1) as usize;
    let mut reader = BufReader::new(File::open(src)?);
    let mut out = BufWriter::new(File::create(dst)?);

    let mut points: Vec<(u64, u64)> = Vec::new();
    let mut comp_off = 0u64;
    let mut decomp_off = 0u64;
    let mut chunk = vec![0u8; span];

    loop {
        let mut filled = 0usize;
        while filled < span {
            let n = reader.read(&mut chunk[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        if decomp_off > 0 {
            points.push((comp_off, decomp_off));
        }
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&chunk[..filled])?;
        let member = enc.finish()?;
        out.write_all(&member)?;
        comp_off += member.len() as u64;
        decomp_off += filled as u64;
        if filled < span {
            break;
        }
    }
    out.flush()?;
    write_gzi(gzi, &points)
}

// ── Segment cache ────────────────────────────────────────────────────────────

/// Local cache of compressed segments for remote gzip sources.
///
/// Keys are `(url, access-point id, segment size)`; the url is folded into
/// the file-name tag.  Writers take a per-key lock and publish via temp file
/// + rename, so concurrent readers only ever observe complete segments.
pub struct SegmentCache {
    dir:   PathBuf,
    tag:   String,
    locks: Mutex<HashMap<usize, Arc<Mutex<()>>>>,
}

impl SegmentCache {
    pub fn new(url: &str, dir: Option<&Path>) -> Result<Self> {
        let dir = dir
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir)
            .join("ffdb-cache");
        std::fs::create_dir_all(&dir)?;
        let tag = format!("{:08x}", crate::codec::crc32(url.as_bytes()));
        Ok(SegmentCache { dir, tag, locks: Mutex::new(HashMap::new()) })
    }

    fn segment_path(&self, point: usize, size: u64) -> PathBuf {
        self.dir.join(format!("{}-{point}-{size}.seg", self.tag))
    }

    fn read_cached(&self, path: &Path, size: u64) -> Option<Vec<u8>> {
        match std::fs::read(path) {
            Ok(data) if data.len() as u64 == size => Some(data),
            _ => None,
        }
    }

    /// Return the cached segment, fetching and publishing it on a miss.
    pub fn get_or_fetch(
        &self,
        point: usize,
        size:  u64,
        fetch: impl FnOnce() -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let path = self.segment_path(point, size);
        if let Some(data) = self.read_cached(&path, size) {
            return Ok(data);
        }

        let key_lock = {
            let mut locks = self.locks.lock().expect("cache lock poisoned");
            Arc::clone(locks.entry(point).or_default())
        };
        let _guard = key_lock.lock().expect("cache key lock poisoned");

        // Another worker may have published while we waited.
        if let Some(data) = self.read_cached(&path, size) {
            return Ok(data);
        }

        let data = fetch()?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&data)?;
        tmp.persist(&path).map_err(|e| FfdbError::Io(e.error))?;
        debug!("cached gzip segment {} ({size} B)", path.display());
        Ok(data)
    }
}

// ── Inflation helpers ────────────────────────────────────────────────────────

/// Inflate at most `take` decompressed bytes from a segment that begins at
/// an access point: either a gzip member boundary or a byte-aligned raw
/// deflate position with an optional priming window.
fn inflate_prefix(segment: &[u8], window: &[u8], take: usize) -> Result<Vec<u8>> {
    if segment.len() >= 2 && segment[..2] == GZIP_MAGIC {
        let mut dec = MultiGzDecoder::new(segment);
        let mut out = Vec::with_capacity(take.min(1 << 20));
        let mut buf = [0u8; 64 * 1024];
        while out.len() < take {
            let want = (take - out.len()).min(buf.len());
            match dec.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(FfdbError::Codec(format!("gzip segment: {e}"))),
            }
        }
        return Ok(out);
    }

    // Raw deflate resumed mid-stream; prime the 32 KiB history if recorded.
    let mut inflater = Decompress::new(false);
    if !window.is_empty() {
        inflater
            .set_dictionary(window)
            .map_err(|e| FfdbError::Codec(format!("gzi window: {e}")))?;
    }
    let mut out = Vec::with_capacity(take.min(1 << 20));
    let mut buf = [0u8; 32 * 1024];
    loop {
        let consumed = inflater.total_in() as usize;
        let before = inflater.total_out();
        let status = inflater
            .decompress(&segment[consumed..], &mut buf, FlushDecompress::None)
            .map_err(|e| FfdbError::Codec(format!("gzip segment: {e}")))?;
        let produced = (inflater.total_out() - before) as usize;
        out.extend_from_slice(&buf[..produced]);
        if out.len() >= take {
            out.truncate(take);
            return Ok(out);
        }
        let exhausted = inflater.total_in() as usize >= segment.len();
        match status {
            flate2::Status::StreamEnd => return Ok(out),
            _ if produced == 0 && exhausted => return Ok(out),
            _ => {}
        }
    }
}

// ── Source ───────────────────────────────────────────────────────────────────

/// Byte source exposing *decompressed* offsets over a gzip-compressed inner
/// source, using the access-point table for random entry.
pub struct GzipSource {
    inner: Box<dyn ByteSource>,
    index: GzIndex,
    cache: Option<SegmentCache>,
    total: Mutex<Option<u64>>,
}

impl GzipSource {
    pub fn new(inner: Box<dyn ByteSource>, index: GzIndex, cache: Option<SegmentCache>) -> Self {
        GzipSource { inner, index, cache, total: Mutex::new(None) }
    }

    fn fetch_segment(&self, point: usize, comp_start: u64, comp_len: u64) -> Result<Vec<u8>> {
        match &self.cache {
            Some(cache) => cache.get_or_fetch(point, comp_len, || {
                self.inner.read_at(comp_start, comp_len)
            }),
            None => self.inner.read_at(comp_start, comp_len),
        }
    }
}

impl ByteSource for GzipSource {
    fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let i = self.index.seek_point(offset);
        let ap = &self.index.points[i];

        let comp_end = self.index.points[i + 1..]
            .iter()
            .find(|p| p.decompressed_offset >= offset + length)
            .map(|p| p.compressed_offset)
            .map_or_else(|| self.inner.len(), Ok)?;

        let segment = self.fetch_segment(i, ap.compressed_offset, comp_end - ap.compressed_offset)?;
        let skip = (offset - ap.decompressed_offset) as usize;
        let need = skip + length as usize;
        let decoded = inflate_prefix(&segment, &ap.window, need)?;
        if decoded.len() < need {
            return Err(FfdbError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "gzip range [{offset}, +{length}) exceeds decompressed stream ({} of {need} bytes)",
                    decoded.len()
                ),
            )));
        }
        Ok(decoded[skip..need].to_vec())
    }

    fn len(&self) -> Result<u64> {
        let mut cached = self.total.lock().expect("size lock poisoned");
        if let Some(total) = *cached {
            return Ok(total);
        }
        // Inflate the tail segment once to learn the decompressed size.
        let last = self.index.points.last().expect("index always has the origin point");
        let comp_len = self.inner.len()?;
        let point = self.index.points.len() - 1;
        let segment = self.fetch_segment(point, last.compressed_offset, comp_len - last.compressed_offset)?;
        let tail = inflate_prefix(&segment, &last.window, usize::MAX)?;
        let total = last.decompressed_offset + tail.len() as u64;
        *cached = Some(total);
        Ok(total)
    }
}

//! Extractor: identifiers → index lookup → range plan → byte source →
//! codec stack → ordered emission.
//!
//! Output order is the caller's request order; with the `all` duplicates
//! policy, entries within one duplicate group come out in flatfile order.
//! Worker blocks run in parallel, and the driver restores request order when
//! it serialises emission — no two workers touch the output stream.
//!
//! Failure policy, per kind:
//! - unknown identifier: reported, extraction continues, exit 4 at the end;
//! - checksum mismatch under verification: entry skipped and reported,
//!   exit 3 at the end;
//! - byte-source failure after retries: fatal, but sibling entries complete
//!   first;
//! - bad passphrase: fatal immediately after the draining pass.

use std::io::Write;

use log::warn;
use rayon::prelude::*;

use crate::codec::{self, CodecContext};
use crate::error::{FfdbError, Result};
use crate::index::{EntryLoc, IndexStore, Policy};
use crate::planner::{self, PlanEntry, PlanMode};
use crate::source::ByteSource;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub policy:    Policy,
    pub merged:    bool,
    pub threads:   usize,
    pub blocksize: Option<usize>,
    /// Verify recorded CRC32 checksums against decoded plaintext.
    pub verify:    bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            policy:    Policy::First,
            merged:    false,
            threads:   1,
            blocksize: None,
            verify:    false,
        }
    }
}

/// Per-run accounting surfaced to the caller for exit-code selection.
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub extracted: usize,
    pub missing:   Vec<String>,
    pub corrupt:   Vec<String>,
}

impl ExtractReport {
    /// Exit code mandated by the report: 3 for integrity failures, 4 for
    /// misses, 0 otherwise.
    pub fn exit_code(&self) -> i32 {
        if !self.corrupt.is_empty() {
            3
        } else if !self.missing.is_empty() {
            4
        } else {
            0
        }
    }
}

/// One resolved entry awaiting fetch.
struct Pending<'a> {
    id:  &'a str,
    loc: EntryLoc,
}

/// Outcome of one worker block, indexed by position within the block.
struct BlockResult {
    entries: Vec<Option<Vec<u8>>>,
    corrupt: Vec<String>,
    fatal:   Option<FfdbError>,
}

pub struct Extractor<'a> {
    pub index:  &'a IndexStore,
    pub source: &'a dyn ByteSource,
    pub codec:  &'a CodecContext,
}

impl<'a> Extractor<'a> {
    pub fn new(index: &'a IndexStore, source: &'a dyn ByteSource, codec: &'a CodecContext) -> Self {
        Extractor { index, source, codec }
    }

    /// Extract `ids` and write the decoded entries to `out` in request order.
    pub fn extract_to(
        &self,
        ids:  &[String],
        out:  &mut dyn Write,
        opts: &ExtractOptions,
    ) -> Result<ExtractReport> {
        let mut report = ExtractReport::default();

        // Resolve identifiers; duplicates stay in flatfile order within one
        // group because the index preserves offset order per identifier.
        let mut pending: Vec<Pending<'_>> = Vec::new();
        for (id, locs) in ids.iter().zip(self.index.lookup_many(ids, opts.policy)) {
            if locs.is_empty() {
                warn!("identifier not found: {id}");
                report.missing.push(id.clone());
                continue;
            }
            pending.extend(locs.into_iter().map(|loc| Pending { id: id.as_str(), loc }));
        }
        if pending.is_empty() {
            return Ok(report);
        }

        let mode = if opts.merged { PlanMode::merged() } else { PlanMode::PerEntry };
        let blocks = planner::partition(pending.len(), opts.threads.max(1), opts.blocksize);

        let results: Vec<BlockResult> = if opts.threads > 1 && blocks.len() > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(opts.threads)
                .build()
                .map_err(|e| FfdbError::Io(std::io::Error::other(e)))?;
            pool.install(|| {
                blocks
                    .par_iter()
                    .map(|range| self.run_block(&pending[range.clone()], mode, opts.verify))
                    .collect()
            })
        } else {
            blocks
                .iter()
                .map(|range| self.run_block(&pending[range.clone()], mode, opts.verify))
                .collect()
        };

        // All workers have drained; structural errors surface now, before any
        // emission.  Bad passphrase wins over transport failures.
        if results.iter().any(|b| matches!(b.fatal, Some(FfdbError::BadPassphrase))) {
            return Err(FfdbError::BadPassphrase);
        }
        let mut decoded: Vec<Vec<Option<Vec<u8>>>> = Vec::with_capacity(results.len());
        for mut block in results {
            if let Some(e) = block.fatal.take() {
                return Err(e);
            }
            report.corrupt.append(&mut block.corrupt);
            decoded.push(block.entries);
        }

        // Serialise emission in request order.
        for entries in decoded {
            for entry in entries.into_iter().flatten() {
                out.write_all(&entry)?;
                report.extracted += 1;
            }
        }

        Ok(report)
    }

    /// Fetch and decode one block of pending entries.
    fn run_block(&self, block: &[Pending<'_>], mode: PlanMode, verify: bool) -> BlockResult {
        let mut result = BlockResult {
            entries: (0..block.len()).map(|_| None).collect(),
            corrupt: Vec::new(),
            fatal:   None,
        };

        let plan_input: Vec<PlanEntry> = block
            .iter()
            .enumerate()
            .map(|(request, p)| PlanEntry { request, loc: p.loc })
            .collect();

        for request in planner::plan(&plan_input, mode) {
            if crate::signal::interrupted() {
                // Drain: finish nothing new; already-decoded siblings emit.
                if result.fatal.is_none() {
                    result.fatal = Some(FfdbError::Io(std::io::Error::from(
                        std::io::ErrorKind::Interrupted,
                    )));
                }
                break;
            }
            let buf = match self.source.read_at(request.offset, request.length) {
                Ok(buf) => buf,
                Err(e) => {
                    warn!("read [{}, +{}) failed: {e}", request.offset, request.length);
                    if result.fatal.is_none() {
                        result.fatal = Some(e);
                    }
                    continue; // sibling requests still run to completion
                }
            };

            for slice in &request.slices {
                let id = block[slice.request].id;
                let payload = &buf[slice.delta as usize..(slice.delta + slice.length) as usize];
                match self.decode_one(id, payload, slice.checksum, verify) {
                    Ok(entry) => result.entries[slice.request] = Some(entry),
                    Err(e @ FfdbError::BadPassphrase) => {
                        result.fatal = Some(e);
                        return result; // structural — no point decoding more
                    }
                    Err(e) => {
                        warn!("{e}");
                        result.corrupt.push(id.to_owned());
                    }
                }
            }
        }
        result
    }

    fn decode_one(
        &self,
        id:       &str,
        payload:  &[u8],
        checksum: Option<u32>,
        verify:   bool,
    ) -> Result<Vec<u8>> {
        let entry = self.codec.decode(payload).map_err(|e| match e {
            FfdbError::BadPassphrase => FfdbError::BadPassphrase,
            FfdbError::Codec(msg)    => FfdbError::Codec(format!("{id}: {msg}")),
            other                    => other,
        })?;
        if verify {
            if let Some(expected) = checksum {
                let actual = codec::crc32(&entry);
                if actual != expected {
                    return Err(FfdbError::CorruptEntry { id: id.to_owned(), expected, actual });
                }
            }
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexStore;
    use crate::source::local::LocalSource;
    use std::io::Write as _;

    fn fixture() -> (tempfile::NamedTempFile, tempfile::NamedTempFile) {
        // Flatfile of three entries tiling [0, 32).
        let mut flat = tempfile::NamedTempFile::new().unwrap();
        flat.write_all(b"AC alpha\n-\nAC beta\n-\nAC gamma\n-\n").unwrap();
        flat.flush().unwrap();

        let mut idx = tempfile::NamedTempFile::new().unwrap();
        idx.write_all(b"alpha\t0\t11\nbeta\t11\t10\ngamma\t21\t11\n").unwrap();
        idx.flush().unwrap();
        (flat, idx)
    }

    fn extract(ids: &[&str], opts: &ExtractOptions) -> (Vec<u8>, ExtractReport) {
        let (flat, idx) = fixture();
        let index = IndexStore::load(idx.path()).unwrap();
        let source = LocalSource::open(flat.path()).unwrap();
        let codec = CodecContext::plain();
        let ex = Extractor::new(&index, &source, &codec);

        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        let mut out = Vec::new();
        let report = ex.extract_to(&ids, &mut out, opts).unwrap();
        (out, report)
    }

    #[test]
    fn request_order_preserved() {
        let (out, report) = extract(&["gamma", "alpha"], &ExtractOptions::default());
        assert_eq!(out, b"AC gamma\n-\nAC alpha\n-\n");
        assert_eq!(report.extracted, 2);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn missing_identifier_is_nonfatal_exit_4() {
        let (out, report) = extract(&["nope", "beta"], &ExtractOptions::default());
        assert_eq!(out, b"AC beta\n-\n");
        assert_eq!(report.missing, vec!["nope".to_string()]);
        assert_eq!(report.exit_code(), 4);
    }

    #[test]
    fn merged_output_identical_to_per_entry() {
        let per_entry = extract(&["alpha", "beta", "gamma"], &ExtractOptions::default()).0;
        let merged = extract(
            &["alpha", "beta", "gamma"],
            &ExtractOptions { merged: true, ..Default::default() },
        )
        .0;
        assert_eq!(per_entry, merged);
    }

    #[test]
    fn parallel_output_identical_to_serial() {
        let serial = extract(&["gamma", "beta", "alpha"], &ExtractOptions::default()).0;
        let parallel = extract(
            &["gamma", "beta", "alpha"],
            &ExtractOptions { threads: 3, blocksize: Some(1), ..Default::default() },
        )
        .0;
        assert_eq!(serial, parallel);
    }

    #[test]
    fn checksum_mismatch_skips_entry_exit_3() {
        let (flat, _) = fixture();
        let mut idx = tempfile::NamedTempFile::new().unwrap();
        // beta's checksum is wrong; alpha's is right.
        let alpha_crc = codec::crc32(b"AC alpha\n-\n");
        write!(idx, "alpha\t0\t11\t{alpha_crc:08x}\nbeta\t11\t10\tdeadbeef\n").unwrap();
        idx.flush().unwrap();

        let index = IndexStore::load(idx.path()).unwrap();
        let source = LocalSource::open(flat.path()).unwrap();
        let codec_ctx = CodecContext::plain();
        let ex = Extractor::new(&index, &source, &codec_ctx);

        let mut out = Vec::new();
        let opts = ExtractOptions { verify: true, ..Default::default() };
        let report = ex
            .extract_to(&["alpha".into(), "beta".into()], &mut out, &opts)
            .unwrap();
        assert_eq!(out, b"AC alpha\n-\n");
        assert_eq!(report.corrupt, vec!["beta".to_string()]);
        assert_eq!(report.exit_code(), 3);
    }
}

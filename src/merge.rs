//! Merger: append a second indexed flatfile onto a first, rewriting the
//! appended index with offsets shifted by the first file's length.
//!
//! The flatfile append is a raw byte copy — encoded entries are position
//! independent, so every appended range decodes to the same bytes after the
//! shift.  The merged index is produced by a streamed two-way merge of the
//! already-sorted inputs; `small` mode instead loads the new index into the
//! in-memory ordered map, which wins when the new side is tiny and the base
//! is large.
//!
//! Precondition (documented, not enforced): no other writer touches either
//! input for the duration of the run.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;

use crate::error::{FfdbError, Result};
use crate::index::{IndexHeader, IndexRecord, IndexStore, IndexStream};
use crate::source::gzi;

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Write a `.new` sibling instead of appending to the base in place.
    pub create: bool,
    /// Load the new index fully into memory for the merge.
    pub small:  bool,
    /// Gzip the merged flatfile and produce the `.gzi` side index.
    pub gzip:   bool,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub flatfile:  PathBuf,
    pub index:     PathBuf,
    /// Bytes appended (the new flatfile's length).
    pub appended:  u64,
    pub records:   usize,
    /// Set when `gzip` was requested: the compressed flatfile path.
    pub gzip_file: Option<PathBuf>,
}

/// Both indexes must describe the same codec configuration; a merged
/// database with mixed per-entry codecs would be unreadable.
fn check_headers(base: &IndexHeader, new: &IndexHeader) -> Result<()> {
    if base != new {
        return Err(FfdbError::Usage(
            "index headers disagree (codec, key size, salt or checksum flag); \
             re-index one side before merging"
                .into(),
        ));
    }
    Ok(())
}

pub fn run_merger(
    base_flat: &Path,
    base_idx:  &Path,
    new_flat:  &Path,
    new_idx:   &Path,
    out_idx:   &Path,
    opts:      &MergeOptions,
) -> Result<MergeOutcome> {
    let base_len = std::fs::metadata(base_flat)?.len();
    let new_len = std::fs::metadata(new_flat)?.len();

    // 1. Flatfile bytes: copy-then-append under --create, else append in place.
    let target: PathBuf = if opts.create {
        let mut os = base_flat.as_os_str().to_owned();
        os.push(".new");
        let target = PathBuf::from(os);
        std::fs::copy(base_flat, &target)?;
        target
    } else {
        base_flat.to_owned()
    };
    {
        let mut dst = OpenOptions::new().append(true).open(&target)?;
        let mut src = File::open(new_flat)?;
        std::io::copy(&mut src, &mut dst)?;
        dst.flush()?;
    }
    info!("appended {new_len} B of {} onto {}", new_flat.display(), target.display());

    // 2. Merged index, offsets of the new side shifted by the base length.
    let records = if opts.small {
        let new_store = IndexStore::load(new_idx)?;
        let base = IndexStream::open(base_idx)?;
        check_headers(&base.header, &new_store.header)?;
        let shifted: Vec<IndexRecord> = new_store
            .iter()
            .map(|mut rec| {
                rec.loc.offset += base_len;
                rec
            })
            .collect();
        merge_streams(base, shifted.into_iter().map(Ok), out_idx)?
    } else {
        let base = IndexStream::open(base_idx)?;
        let mut new = IndexStream::open(new_idx)?;
        check_headers(&base.header, &new.header)?;
        let shifted = std::iter::from_fn(move || match new.next_record() {
            Ok(Some(mut rec)) => {
                rec.loc.offset += base_len;
                Some(Ok(rec))
            }
            Ok(None) => None,
            Err(e)   => Some(Err(e)),
        });
        merge_streams(base, shifted, out_idx)?
    };
    info!("merged index: {} record(s) → {}", records, out_idx.display());

    // 3. Optional whole-file gzip with access points.
    let gzip_file = if opts.gzip {
        let mut os = target.as_os_str().to_owned();
        os.push(".gz");
        let gz = PathBuf::from(os);
        let mut os = gz.as_os_str().to_owned();
        os.push(".gzi");
        let side = PathBuf::from(os);
        gzi::compress_with_index(&target, &gz, &side, gzi::DEFAULT_SPAN)?;
        info!("compressed {} (+ side index {})", gz.display(), side.display());
        Some(gz)
    } else {
        None
    };

    Ok(MergeOutcome {
        flatfile: target,
        index: out_idx.to_owned(),
        appended: new_len,
        records,
        gzip_file,
    })
}

/// Streamed sorted merge; `new` records arrive already shifted.
fn merge_streams(
    mut base: IndexStream,
    new:      impl Iterator<Item = Result<IndexRecord>>,
    out:      &Path,
) -> Result<usize> {
    let header = base.header.clone();
    let mut w = BufWriter::new(File::create(out)?);
    if let Some(line) = header.format() {
        writeln!(w, "{line}")?;
    }

    let mut count = 0usize;
    let mut emit = |rec: &IndexRecord, w: &mut BufWriter<File>| -> Result<()> {
        writeln!(w, "{}", rec.format())?;
        count += 1;
        Ok(())
    };

    let mut new = new.peekable();
    let mut a = base.next_record()?;
    loop {
        // Base wins ties, which also keeps unshifted offsets first.
        let take_new = match (&a, new.peek()) {
            (None, None)              => break,
            (_, Some(Err(_)))         => {
                return Err(new.next().expect("peeked").expect_err("peeked an error"));
            }
            (Some(_), None)           => false,
            (None, Some(_))           => true,
            (Some(ar), Some(Ok(br))) => {
                (br.id.as_str(), br.loc.offset) < (ar.id.as_str(), ar.loc.offset)
            }
        };
        if take_new {
            let rec = new.next().expect("peeked")?;
            emit(&rec, &mut w)?;
        } else {
            let rec = a.take().expect("branch implies a record");
            emit(&rec, &mut w)?;
            a = base.next_record()?;
        }
    }
    w.flush()?;
    Ok(count)
}

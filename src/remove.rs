//! Remover: produce a new flatfile/index pair containing every entry *not*
//! selected for deletion, preserving order.
//!
//! Deletion is resolved range-wise: the delete list is run through the index
//! under the duplicates policy, and any index record pointing into a deleted
//! range is dropped — including records for other identifiers sharing a
//! multi-identifier entry, whose bytes are gone either way.  Kept records
//! are rewritten with `offset' = offset − delta_at(offset)` against a
//! precomputed delta table; the output pair satisfies the index invariants
//! by construction.
//!
//! Reindexing is block-parallel: index chunks rewrite independently against
//! the shared delta table and the driver writes them back in order.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{info, warn};
use rayon::prelude::*;

use crate::error::{FfdbError, Result};
use crate::index::{IndexRecord, IndexStore, Policy};

#[derive(Debug, Clone)]
pub struct RemoveOptions {
    pub policy:  Policy,
    pub threads: usize,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        RemoveOptions { policy: Policy::First, threads: 1 }
    }
}

#[derive(Debug)]
pub struct RemoveOutcome {
    pub removed_entries: usize,
    pub removed_bytes:   u64,
    pub kept_records:    usize,
    /// Delete-list identifiers absent from the index.
    pub missing:         Vec<String>,
}

impl RemoveOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.missing.is_empty() { 0 } else { 4 }
    }
}

/// Cumulative bytes deleted before a given offset; built from the sorted
/// disjoint range list.
struct DeltaTable {
    /// `(range_start, cumulative_delta_after_range)`
    steps: Vec<(u64, u64)>,
}

impl DeltaTable {
    fn new(ranges: &[(u64, u64)]) -> Self {
        let mut steps = Vec::with_capacity(ranges.len());
        let mut total = 0u64;
        for &(start, len) in ranges {
            total += len;
            steps.push((start, total));
        }
        DeltaTable { steps }
    }

    /// Bytes deleted strictly before `offset`.  Valid only for offsets not
    /// inside a deleted range, which kept records never are.
    fn delta_at(&self, offset: u64) -> u64 {
        let i = self.steps.partition_point(|&(start, _)| start < offset);
        if i == 0 { 0 } else { self.steps[i - 1].1 }
    }
}

pub fn run_remover(
    flat:       &Path,
    idx:        &Path,
    delete_ids: &[String],
    out_flat:   &Path,
    out_idx:    &Path,
    opts:       &RemoveOptions,
) -> Result<RemoveOutcome> {
    let store = IndexStore::load(idx)?;
    let flat_len = std::fs::metadata(flat)?.len();

    // 1. Resolve the delete list to entry ranges under the policy.
    let mut missing = Vec::new();
    let mut ranges: Vec<(u64, u64)> = Vec::new();
    for (id, locs) in delete_ids.iter().zip(store.lookup_many(delete_ids, opts.policy)) {
        if locs.is_empty() {
            warn!("delete identifier not found: {id}");
            missing.push(id.clone());
            continue;
        }
        ranges.extend(locs.into_iter().map(|l| (l.offset, l.length)));
    }

    // 2. Sort and deduplicate; entries are disjoint by invariant, so exact
    //    duplicates (the same entry selected via several identifiers) are
    //    the only overlap possible.
    ranges.sort_unstable();
    ranges.dedup();
    for &(start, len) in &ranges {
        if start + len > flat_len {
            return Err(FfdbError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("deleted range [{start}, +{len}) exceeds flatfile size {flat_len}"),
            )));
        }
    }
    let removed_bytes: u64 = ranges.iter().map(|&(_, l)| l).sum();
    let range_set: HashSet<(u64, u64)> = ranges.iter().copied().collect();

    // 3. Stream-copy the flatfile, skipping deleted ranges.
    copy_without_ranges(flat, out_flat, &ranges)?;
    info!(
        "wrote {} ({} B removed across {} entries)",
        out_flat.display(),
        removed_bytes,
        ranges.len()
    );

    // 4. Rewrite the index with shifted offsets.
    let delta = DeltaTable::new(&ranges);
    let kept: Vec<IndexRecord> = {
        let all: Vec<IndexRecord> = store.iter().collect();
        let rewrite = |rec: &IndexRecord| -> Option<IndexRecord> {
            if range_set.contains(&(rec.loc.offset, rec.loc.length)) {
                return None;
            }
            let mut rec = rec.clone();
            rec.loc.offset -= delta.delta_at(rec.loc.offset);
            Some(rec)
        };
        if opts.threads > 1 {
            let chunk = all.len().div_ceil(opts.threads).max(1);
            all.par_chunks(chunk)
                .map(|records| records.iter().filter_map(rewrite).collect::<Vec<_>>())
                .flatten()
                .collect()
        } else {
            all.iter().filter_map(rewrite).collect()
        }
    };

    let kept_records = kept.len();
    crate::index::write_index(out_idx, &store.header, kept)?;
    info!("wrote {} record(s) to {}", kept_records, out_idx.display());

    Ok(RemoveOutcome {
        removed_entries: ranges.len(),
        removed_bytes,
        kept_records,
        missing,
    })
}

/// Copy `src` to `dst`, skipping the sorted disjoint `ranges`.
fn copy_without_ranges(src: &Path, dst: &Path, ranges: &[(u64, u64)]) -> Result<()> {
    let mut reader = File::open(src)?;
    let total = reader.metadata()?.len();
    let mut writer = BufWriter::new(File::create(dst)?);

    let mut pos = 0u64;
    let mut copy_span = |reader: &mut File, writer: &mut BufWriter<File>, from: u64, to: u64| -> Result<()> {
        if to > from {
            reader.seek(SeekFrom::Start(from))?;
            std::io::copy(&mut reader.take(to - from), writer)?;
        }
        Ok(())
    };

    for &(start, len) in ranges {
        copy_span(&mut reader, &mut writer, pos, start)?;
        pos = start + len;
    }
    copy_span(&mut reader, &mut writer, pos, total)?;
    writer.flush()?;
    Ok(())
}

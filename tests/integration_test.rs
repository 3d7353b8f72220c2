use std::path::{Path, PathBuf};

use ffdb::codec::{CodecContext, CodecKind};
use ffdb::crypto::KeySize;
use ffdb::extract::{ExtractOptions, Extractor};
use ffdb::index::{IndexHeader, IndexStore, Policy};
use ffdb::indexer::{run_indexer, IndexerOptions};
use ffdb::merge::{run_merger, MergeOptions};
use ffdb::remove::{run_remover, RemoveOptions};
use ffdb::source::local::LocalSource;
use ffdb::source::{open_source, SourceOptions};
use ffdb::FfdbError;

const FLAT: &[u8] = b"ID alpha\npayload one\n-\nID beta\npayload two\n-\nID gamma\npayload three\n-\n";

fn indexer_opts() -> IndexerOptions {
    IndexerOptions {
        id_patterns: vec![r"^ID (\w+)".to_string()],
        terminator:  "^-$".to_string(),
        ..Default::default()
    }
}

fn write_flatfile(dir: &Path, data: &[u8]) -> PathBuf {
    let path = dir.join("db.dat");
    std::fs::write(&path, data).unwrap();
    path
}

fn extract_ids(
    flatfile: &Path,
    index:    &Path,
    ctx:      &CodecContext,
    ids:      &[&str],
    opts:     &ExtractOptions,
) -> (Vec<u8>, ffdb::ExtractReport) {
    let store = IndexStore::load(index).unwrap();
    let source = LocalSource::open(flatfile).unwrap();
    let ex = Extractor::new(&store, &source, ctx);
    let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
    let mut out = Vec::new();
    let report = ex.extract_to(&ids, &mut out, opts).unwrap();
    (out, report)
}

/// Rebuild the decode context the way the CLI does: from the written header.
fn context_from_index(index: &Path, passphrase: Option<&str>) -> CodecContext {
    let store = IndexStore::load(index).unwrap();
    let h = &store.header;
    CodecContext::new(
        h.codec,
        h.aes.unwrap_or(KeySize::Bits256),
        passphrase,
        h.salt.as_deref().unwrap_or(b"ffdb-static-salt"),
        h.iterations,
        6,
    )
    .unwrap()
}

// ── S1: plaintext index + point extraction ──────────────────────────────────

#[test]
fn s1_index_then_extract_single_entry() {
    let dir = tempfile::tempdir().unwrap();
    let flat = write_flatfile(dir.path(), FLAT);
    let idx = dir.path().join("db.idx");

    let outcome = run_indexer(
        &flat, &idx, &CodecContext::plain(), &IndexHeader::default(), &indexer_opts(),
    )
    .unwrap();
    assert_eq!(outcome.entries, 3);

    // Entries tile the file: offsets are cumulative lengths.
    let store = IndexStore::load(&idx).unwrap();
    let alpha = store.lookup("alpha", Policy::First)[0];
    let beta = store.lookup("beta", Policy::First)[0];
    assert_eq!(alpha.offset, 0);
    assert_eq!(beta.offset, alpha.length);

    let (out, report) = extract_ids(
        &flat, &idx, &CodecContext::plain(), &["gamma"], &ExtractOptions::default(),
    );
    assert_eq!(out, b"ID gamma\npayload three\n-\n");
    assert_eq!(report.exit_code(), 0);
}

// ── S2: encrypted database, right and wrong passphrase ──────────────────────

#[test]
fn s2_encrypted_round_trip_and_bad_passphrase() {
    let dir = tempfile::tempdir().unwrap();
    let flat = write_flatfile(dir.path(), FLAT);
    let idx = dir.path().join("db.idx");

    let header = IndexHeader {
        codec: CodecKind::AesZlib,
        aes:   Some(KeySize::Bits256),
        salt:  Some(b"integration-salt".to_vec()),
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
    let outcome = run_indexer(&flat, &idx, &ctx, &header, &indexer_opts()).unwrap();
    let enc = outcome.flatfile;
    assert!(enc.to_string_lossy().ends_with(".enc"));
    assert_ne!(std::fs::read(&enc).unwrap(), FLAT);

    // Right passphrase, context rebuilt from the index header alone.
    let good = context_from_index(&idx, Some("secret"));
    let (out, _) = extract_ids(&enc, &idx, &good, &["beta"], &ExtractOptions::default());
    assert_eq!(out, b"ID beta\npayload two\n-\n");

    // Wrong passphrase is a structural failure.
    let bad = context_from_index(&idx, Some("wrong"));
    let store = IndexStore::load(&idx).unwrap();
    let source = LocalSource::open(&enc).unwrap();
    let ex = Extractor::new(&store, &source, &bad);
    let mut sink = Vec::new();
    let err = ex
        .extract_to(&["beta".to_string()], &mut sink, &ExtractOptions::default())
        .unwrap_err();
    assert!(matches!(err, FfdbError::BadPassphrase));
    assert_eq!(err.exit_code(), 3);
}

// ── S3: duplicates policies ─────────────────────────────────────────────────

#[test]
fn s3_duplicate_identifier_policies() {
    let dir = tempfile::tempdir().unwrap();
    // Three versions of taxon 9606, in flatfile order.
    let flat = write_flatfile(
        dir.path(),
        b"OX 9606\nv1\n-\nOX 9606\nv2\n-\nOX 9606\nv3\n-\n",
    );
    let idx = dir.path().join("db.idx");
    let opts = IndexerOptions {
        id_patterns: vec![r"^OX (\d+)".to_string()],
        terminator:  "^-$".to_string(),
        ..Default::default()
    };
    run_indexer(&flat, &idx, &CodecContext::plain(), &IndexHeader::default(), &opts).unwrap();

    let plain = CodecContext::plain();
    let first = extract_ids(&flat, &idx, &plain, &["9606"], &ExtractOptions::default()).0;
    assert_eq!(first, b"OX 9606\nv1\n-\n");

    let last = extract_ids(
        &flat, &idx, &plain, &["9606"],
        &ExtractOptions { policy: Policy::Last, ..Default::default() },
    )
    .0;
    assert_eq!(last, b"OX 9606\nv3\n-\n");

    let all = extract_ids(
        &flat, &idx, &plain, &["9606"],
        &ExtractOptions { policy: Policy::All, ..Default::default() },
    )
    .0;
    assert_eq!(all, b"OX 9606\nv1\n-\nOX 9606\nv2\n-\nOX 9606\nv3\n-\n");
}

// ── S4/P5/P6: coalescing and parallel equivalence ───────────────────────────

fn big_fixture(dir: &Path) -> (PathBuf, PathBuf, Vec<String>) {
    let mut data = Vec::new();
    let mut ids = Vec::new();
    for i in 0..100 {
        data.extend_from_slice(format!("ID rec{i:03}\nbody line for {i}\n-\n").as_bytes());
        ids.push(format!("rec{i:03}"));
    }
    let flat = write_flatfile(dir, &data);
    let idx = dir.join("db.idx");
    run_indexer(&flat, &idx, &CodecContext::plain(), &IndexHeader::default(), &indexer_opts())
        .unwrap();
    // Scattered request order with duplicates of interest removed.
    ids.reverse();
    (flat, idx, ids)
}

#[test]
fn coalescing_and_parallelism_do_not_change_output() {
    let dir = tempfile::tempdir().unwrap();
    let (flat, idx, ids) = big_fixture(dir.path());
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let plain = CodecContext::plain();

    let reference = extract_ids(&flat, &idx, &plain, &id_refs, &ExtractOptions::default()).0;
    assert!(!reference.is_empty());

    for (merged, threads, blocksize) in [
        (true, 1, None),
        (false, 4, None),
        (true, 4, None),
        (true, 3, Some(7)),
        (false, 2, Some(1)),
        (true, 4, Some(0)), // blocking disabled, one shared plan
    ] {
        let out = extract_ids(
            &flat, &idx, &plain, &id_refs,
            &ExtractOptions { merged, threads, blocksize, ..Default::default() },
        )
        .0;
        assert_eq!(out, reference, "merged={merged} threads={threads} blocksize={blocksize:?}");
    }
}

// ── S5 + S6: merge then remove ──────────────────────────────────────────────

#[test]
fn s5_s6_merge_then_remove_preserve_entries() {
    let dir = tempfile::tempdir().unwrap();

    let base_flat = write_flatfile(dir.path(), b"ID x\nbase entry\n-\n");
    let base_idx = dir.path().join("base.idx");
    run_indexer(&base_flat, &base_idx, &CodecContext::plain(), &IndexHeader::default(), &indexer_opts())
        .unwrap();
    let base_len = std::fs::metadata(&base_flat).unwrap().len();

    let new_flat = dir.path().join("new.dat");
    std::fs::write(&new_flat, b"ID y\nnew entry\n-\n").unwrap();
    let new_idx = dir.path().join("new.idx");
    run_indexer(&new_flat, &new_idx, &CodecContext::plain(), &IndexHeader::default(), &indexer_opts())
        .unwrap();

    // S5: merge. y's offset shifts by the base length.
    let merged_idx = dir.path().join("merged.idx");
    let outcome = run_merger(
        &base_flat, &base_idx, &new_flat, &new_idx, &merged_idx,
        &MergeOptions { create: true, ..Default::default() },
    )
    .unwrap();
    let merged_flat = outcome.flatfile.clone();

    let store = IndexStore::load(&merged_idx).unwrap();
    assert_eq!(store.lookup("y", Policy::First)[0].offset, base_len);

    let plain = CodecContext::plain();
    let (x_out, _) = extract_ids(&merged_flat, &merged_idx, &plain, &["x"], &ExtractOptions::default());
    assert_eq!(x_out, b"ID x\nbase entry\n-\n");
    let (y_out, _) = extract_ids(&merged_flat, &merged_idx, &plain, &["y"], &ExtractOptions::default());
    assert_eq!(y_out, b"ID y\nnew entry\n-\n");

    // S6: remove x from the merged pair; y shifts back and still decodes.
    let out_flat = dir.path().join("pruned.dat");
    let out_idx = dir.path().join("pruned.idx");
    let removal = run_remover(
        &merged_flat, &merged_idx, &["x".to_string()], &out_flat, &out_idx,
        &RemoveOptions::default(),
    )
    .unwrap();
    assert_eq!(removal.removed_entries, 1);

    let pruned = IndexStore::load(&out_idx).unwrap();
    assert!(pruned.lookup("x", Policy::All).is_empty());
    assert_eq!(pruned.lookup("y", Policy::First)[0].offset, 0);

    let (y_after, _) = extract_ids(&out_flat, &out_idx, &plain, &["y"], &ExtractOptions::default());
    assert_eq!(y_after, b"ID y\nnew entry\n-\n");
}

// ── Whole-file gzip through the source factory ──────────────────────────────

#[test]
fn gzip_flatfile_extraction_via_factory() {
    let dir = tempfile::tempdir().unwrap();
    let (flat, idx, ids) = big_fixture(dir.path());

    // Compress the flatfile with access points and extract through the
    // gzip-aware source; output must match plain extraction.
    let gz = dir.path().join("db.dat.gz");
    let gzi = dir.path().join("db.dat.gz.gzi");
    ffdb::source::gzi::compress_with_index(&flat, &gz, &gzi, 512).unwrap();

    let src = open_source(gz.to_str().unwrap(), true, &SourceOptions::default()).unwrap();
    let store = IndexStore::load(&idx).unwrap();
    let plain = CodecContext::plain();
    let ex = Extractor::new(&store, src.as_ref(), &plain);

    let some_ids: Vec<String> = ids.iter().take(10).cloned().collect();
    let mut via_gzip = Vec::new();
    ex.extract_to(&some_ids, &mut via_gzip, &ExtractOptions { merged: true, ..Default::default() })
        .unwrap();

    let id_refs: Vec<&str> = some_ids.iter().map(String::as_str).collect();
    let direct = extract_ids(&flat, &idx, &plain, &id_refs, &ExtractOptions::default()).0;
    assert_eq!(via_gzip, direct);
}

// ── Checksum verification end to end ────────────────────────────────────────

#[test]
fn checksums_survive_codec_stack() {
    let dir = tempfile::tempdir().unwrap();
    let flat = write_flatfile(dir.path(), FLAT);
    let idx = dir.path().join("db.idx");

    let header = IndexHeader {
        codec: CodecKind::Zlib,
        crc:   true,
        ..Default::default()
    };
    let ctx = CodecContext::new(CodecKind::Zlib, KeySize::Bits256, None, &[], 1, 9).unwrap();
    let opts = IndexerOptions { checksum: true, ..indexer_opts() };
    let outcome = run_indexer(&flat, &idx, &ctx, &header, &opts).unwrap();

    let (out, report) = extract_ids(
        &outcome.flatfile, &idx, &context_from_index(&idx, None), &["alpha", "gamma"],
        &ExtractOptions { verify: true, ..Default::default() },
    );
    assert_eq!(out, b"ID alpha\npayload one\n-\nID gamma\npayload three\n-\n");
    assert_eq!(report.exit_code(), 0);
}

// ── Sorted-index property over indexer output ───────────────────────────────

#[test]
fn indexer_output_is_always_loadable_sorted() {
    let dir = tempfile::tempdir().unwrap();
    // Identifiers deliberately out of lexicographic order in the file.
    let flat = write_flatfile(
        dir.path(),
        b"ID zeta\n-\nID alpha\n-\nID mid\n-\nID alpha\n-\n",
    );
    let idx = dir.path().join("db.idx");
    run_indexer(&flat, &idx, &CodecContext::plain(), &IndexHeader::default(), &indexer_opts())
        .unwrap();

    // load() asserts sortedness; duplicates keep flatfile order.
    let store = IndexStore::load(&idx).unwrap();
    let alphas = store.lookup("alpha", Policy::All);
    assert_eq!(alphas.len(), 2);
    assert!(alphas[0].offset < alphas[1].offset);
}

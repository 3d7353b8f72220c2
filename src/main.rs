use clap::{Parser, Subcommand};
use ffdb::codec::{CodecContext, CodecKind, DEFAULT_ZLIB_LEVEL};
use ffdb::crypto::{KeySize, DEFAULT_ITERATIONS, LEGACY_SALT};
use ffdb::error::{FfdbError, Result};
use ffdb::extract::{ExtractOptions, Extractor};
use ffdb::index::{IndexHeader, IndexStore, Policy};
use ffdb::indexer::{run_indexer, IndexerOptions};
use ffdb::merge::{run_merger, MergeOptions};
use ffdb::remove::{run_remover, RemoveOptions};
use ffdb::source::{open_source, SourceOptions};
use rand::RngCore;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ffdb", version = "1.0.0", about = "Single-file flatfile database tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a flatfile and produce its positional index
    Index {
        /// Input flatfile
        input: PathBuf,
        /// Output index path (default: <input>.idx)
        #[arg(short, long)]
        outindex: Option<PathBuf>,
        /// Identifier pattern; first capture group is the identifier
        #[arg(short = 'i', long = "id-pattern")]
        id_patterns: Vec<String>,
        /// Joined pattern; all capture groups of one match form one
        /// colon-joined identifier
        #[arg(short = 'j', long = "joined-pattern")]
        joined_patterns: Vec<String>,
        /// Entry terminator line pattern, e.g. '^//$'
        #[arg(short = 'T', long, required = true)]
        terminator: String,
        /// Collect every match and capture, not just the first per pattern
        #[arg(short, long)]
        all_matches: bool,
        /// Record CRC32 checksums of entry plaintext
        #[arg(short = 'x', long)]
        checksum: bool,
        /// Re-emit entries ZLIB-compressed at this level (0-9)
        #[arg(short, long, value_name = "LEVEL")]
        compress: Option<u32>,
        /// Re-emit entries AES-encrypted; key size in bits (128/192/256)
        /// or bytes (16/24/32)
        #[arg(short = 'k', long, value_name = "SIZE")]
        keysize: Option<u32>,
        /// Passphrase (prompted when omitted and encryption is requested)
        #[arg(short, long)]
        passphrase: Option<String>,
        /// Shift all emitted offsets by this many bytes
        #[arg(long, default_value = "0")]
        offset: u64,
        #[arg(short, long, default_value = "1")]
        threads: usize,
        /// Skip the final sort (use an external sort afterwards)
        #[arg(short, long)]
        unsorted: bool,
    },
    /// Extract entries by identifier
    Extract {
        /// Flatfile path or URL (http://, https://, ftp://)
        flatfile: String,
        /// Index file
        index: PathBuf,
        /// Identifiers to extract
        #[arg(short = 's', long = "id")]
        ids: Vec<String>,
        /// File with one identifier per line
        #[arg(short = 'l', long)]
        list: Option<PathBuf>,
        /// Emit every entry of a duplicated identifier (flatfile order)
        #[arg(short, long, conflicts_with = "zfound")]
        duplicates: bool,
        /// Emit the last entry of a duplicated identifier instead of the first
        #[arg(short, long)]
        zfound: bool,
        /// Coalesce adjacent byte ranges into merged reads
        #[arg(short, long)]
        merged: bool,
        #[arg(short, long, default_value = "1")]
        threads: usize,
        /// Identifiers per worker block; 0 disables blocking
        #[arg(short, long)]
        blocksize: Option<usize>,
        /// Verify recorded checksums against decoded entries
        #[arg(short = 'x', long)]
        check: bool,
        #[arg(short, long)]
        passphrase: Option<String>,
        /// Write entries here (atomic rename on full success) instead of stdout
        #[arg(short, long)]
        outfile: Option<PathBuf>,
        /// Flatfile is whole-file gzip/bgzip with a <flatfile>.gzi side index
        #[arg(short, long)]
        gzip: bool,
        /// Cache compressed gzip segments locally (remote sources)
        #[arg(long)]
        keep_cache: bool,
        /// Codec override for legacy indexes without a header
        #[arg(long, value_name = "KIND")]
        codec: Option<String>,
        /// Per-request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
        /// Attempts per remote read
        #[arg(long, default_value = "3")]
        retries: u32,
    },
    /// Append an indexed flatfile onto another, merging the indexes
    Merge {
        base_flatfile: PathBuf,
        base_index:    PathBuf,
        new_flatfile:  PathBuf,
        new_index:     PathBuf,
        /// Output path for the merged index
        #[arg(short, long, required = true)]
        outindex: PathBuf,
        /// Write a .new sibling instead of appending to the base in place
        #[arg(long)]
        create: bool,
        /// Load the new index fully into memory for the merge
        #[arg(long)]
        small: bool,
        /// Gzip the merged flatfile and produce a .gzi side index
        #[arg(long)]
        gzip: bool,
    },
    /// Produce a new flatfile/index pair without the selected entries
    Remove {
        flatfile: PathBuf,
        index:    PathBuf,
        /// Identifiers to delete
        #[arg(short = 's', long = "id")]
        ids: Vec<String>,
        /// File with one identifier per line
        #[arg(short = 'l', long)]
        list: Option<PathBuf>,
        /// Delete every entry of a duplicated identifier
        #[arg(short, long, conflicts_with = "zfound")]
        duplicates: bool,
        /// Delete the last entry of a duplicated identifier instead of the first
        #[arg(short, long)]
        zfound: bool,
        #[arg(short, long, default_value = "1")]
        threads: usize,
        /// Output flatfile
        #[arg(short, long, required = true)]
        outfile: PathBuf,
        /// Output index (default: <outfile>.idx)
        #[arg(long)]
        outindex: Option<PathBuf>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    ffdb::signal::install();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap's own exit code for usage errors is 2; this tool reserves
            // 2 for I/O and uses 1 for usage.
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("ffdb: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {

        // ── Index ────────────────────────────────────────────────────────────
        Commands::Index {
            input, outindex, id_patterns, joined_patterns, terminator, all_matches,
            checksum, compress, keysize, passphrase, offset, threads, unsorted,
        } => {
            let outindex = outindex.unwrap_or_else(|| sibling(&input, ".idx"));
            let kind = CodecKind::from_flags(compress.is_some(), keysize.is_some());
            let key_size = match keysize {
                Some(v) => parse_keysize(v)?,
                None    => KeySize::Bits256,
            };

            let header = IndexHeader {
                codec:      kind,
                aes:        kind.has_aes().then_some(key_size),
                iterations: DEFAULT_ITERATIONS,
                salt:       kind.has_aes().then(random_salt),
                crc:        checksum,
            };
            let pass = if kind.has_aes() { Some(obtain_passphrase(passphrase)?) } else { None };
            let ctx = CodecContext::new(
                kind,
                key_size,
                pass.as_deref(),
                header.salt.as_deref().unwrap_or(&[]),
                header.iterations,
                compress.unwrap_or(DEFAULT_ZLIB_LEVEL),
            )?;

            let opts = IndexerOptions {
                id_patterns,
                joined_patterns,
                terminator,
                all_matches,
                checksum,
                threads,
                offset_shift: offset,
                unsorted,
            };
            let outcome = run_indexer(&input, &outindex, &ctx, &header, &opts)?;
            println!(
                "Indexed {} entries ({} records) → {}",
                outcome.entries,
                outcome.records,
                outindex.display()
            );
            if outcome.flatfile != input {
                println!("Encoded flatfile: {}", outcome.flatfile.display());
            }
            Ok(0)
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract {
            flatfile, index, ids, list, duplicates, zfound, merged, threads, blocksize,
            check, passphrase, outfile, gzip, keep_cache, codec, timeout, retries,
        } => {
            let ids = gather_ids(ids, list)?;
            let store = IndexStore::load(&index)?;
            let ctx = decode_context(&store.header, codec.as_deref(), passphrase)?;

            let src_opts = SourceOptions {
                retries,
                timeout: Duration::from_secs(timeout),
                keep_cache,
                cache_dir: None,
            };
            let source = open_source(&flatfile, gzip, &src_opts)?;

            let opts = ExtractOptions {
                policy:    policy_from_flags(duplicates, zfound),
                merged,
                threads,
                blocksize,
                verify:    check,
            };
            let extractor = Extractor::new(&store, source.as_ref(), &ctx);

            let report = match outfile {
                None => {
                    let stdout = std::io::stdout();
                    let mut out = stdout.lock();
                    let report = extractor.extract_to(&ids, &mut out, &opts)?;
                    out.flush()?;
                    report
                }
                Some(path) => {
                    let dir = path
                        .parent()
                        .filter(|p| !p.as_os_str().is_empty())
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from("."));
                    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
                    let report = extractor.extract_to(&ids, tmp.as_file_mut(), &opts)?;
                    if report.exit_code() == 0 {
                        tmp.persist(&path).map_err(|e| FfdbError::Io(e.error))?;
                    } else {
                        eprintln!("ffdb: incomplete extraction; {} not written", path.display());
                    }
                    report
                }
            };

            for id in &report.missing {
                eprintln!("ffdb: not found: {id}");
            }
            for id in &report.corrupt {
                eprintln!("ffdb: corrupt entry skipped: {id}");
            }
            Ok(report.exit_code())
        }

        // ── Merge ────────────────────────────────────────────────────────────
        Commands::Merge {
            base_flatfile, base_index, new_flatfile, new_index, outindex,
            create, small, gzip,
        } => {
            let outcome = run_merger(
                &base_flatfile,
                &base_index,
                &new_flatfile,
                &new_index,
                &outindex,
                &MergeOptions { create, small, gzip },
            )?;
            println!(
                "Merged: {} (+{} B), {} records → {}",
                outcome.flatfile.display(),
                outcome.appended,
                outcome.records,
                outcome.index.display()
            );
            if let Some(gz) = outcome.gzip_file {
                println!("Compressed: {}", gz.display());
            }
            Ok(0)
        }

        // ── Remove ───────────────────────────────────────────────────────────
        Commands::Remove {
            flatfile, index, ids, list, duplicates, zfound, threads, outfile, outindex,
        } => {
            let ids = gather_ids(ids, list)?;
            let outindex = outindex.unwrap_or_else(|| sibling(&outfile, ".idx"));
            let outcome = run_remover(
                &flatfile,
                &index,
                &ids,
                &outfile,
                &outindex,
                &RemoveOptions { policy: policy_from_flags(duplicates, zfound), threads },
            )?;
            println!(
                "Removed {} entries ({} B); {} records kept → {} / {}",
                outcome.removed_entries,
                outcome.removed_bytes,
                outcome.kept_records,
                outfile.display(),
                outindex.display()
            );
            for id in &outcome.missing {
                eprintln!("ffdb: not found: {id}");
            }
            Ok(outcome.exit_code())
        }
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn sibling(path: &std::path::Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Fresh random KDF salt recorded in the index header, so the same
/// passphrase yields distinct keys across databases.
fn random_salt() -> Vec<u8> {
    let mut salt = vec![0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

fn policy_from_flags(duplicates: bool, zfound: bool) -> Policy {
    match (duplicates, zfound) {
        (true, _) => Policy::All,
        (_, true) => Policy::Last,
        _         => Policy::First,
    }
}

/// Accept key sizes in bits (128/192/256) or bytes (16/24/32).
fn parse_keysize(v: u32) -> Result<KeySize> {
    KeySize::from_bits(v)
        .or_else(|| KeySize::from_bits(v * 8))
        .ok_or_else(|| FfdbError::Usage(format!("invalid key size {v} (use 128/192/256 bits or 16/24/32 bytes)")))
}

fn obtain_passphrase(flag: Option<String>) -> Result<String> {
    match flag {
        Some(p) => Ok(p),
        None => rpassword::prompt_password("Passphrase: ")
            .map_err(|e| FfdbError::Usage(format!("cannot read passphrase: {e}"))),
    }
}

/// Combine `-s` identifiers with the optional `-l` list file, in that order.
fn gather_ids(mut ids: Vec<String>, list: Option<PathBuf>) -> Result<Vec<String>> {
    if let Some(path) = list {
        let text = std::fs::read_to_string(&path)?;
        ids.extend(text.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from));
    }
    if ids.is_empty() {
        return Err(FfdbError::Usage("no identifiers given (use -s or -l)".into()));
    }
    Ok(ids)
}

/// Build the decode context from the index header, an optional legacy codec
/// override, and the passphrase flag (prompting when needed).
fn decode_context(
    header:   &IndexHeader,
    override_kind: Option<&str>,
    passphrase: Option<String>,
) -> Result<CodecContext> {
    let kind = match override_kind {
        Some(name) => CodecKind::from_name(name)
            .ok_or_else(|| FfdbError::UnsupportedCodec(format!("codec={name}")))?,
        None => header.codec,
    };
    if !kind.has_aes() {
        return CodecContext::new(kind, KeySize::Bits256, None, &[], header.iterations, DEFAULT_ZLIB_LEVEL);
    }
    let pass = obtain_passphrase(passphrase)?;
    let salt = header.salt.clone().unwrap_or_else(|| LEGACY_SALT.to_vec());
    CodecContext::new(
        kind,
        header.aes.unwrap_or(KeySize::Bits256),
        Some(&pass),
        &salt,
        header.iterations,
        DEFAULT_ZLIB_LEVEL,
    )
}

//! Byte sources: uniform random-access reads over local files, HTTP(S)/FTP
//! range requests, and whole-file gzip with a `.gzi` side index.
//!
//! The contract is deliberately small: `read_at(offset, length)` returns
//! exactly the requested bytes or fails, and is a pure function of its
//! arguments — concurrent reads are independent, so a single boxed source is
//! shared read-only across the worker pool.
//!
//! The concrete variant is selected by URL scheme and compression
//! declaration in [`open_source`]; callers never branch on transport.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FfdbError, Result};

pub mod ftp;
pub mod gzi;
pub mod http;
pub mod local;

pub use gzi::{GzIndex, GzipSource};

/// Uniform random-access read capability.  All implementations are safe for
/// concurrent calls from multiple workers.
pub trait ByteSource: Send + Sync {
    /// Read exactly `length` bytes starting at `offset`.
    fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>>;

    /// Total size of the (decoded, for gzip sources) byte stream.
    fn len(&self) -> Result<u64>;
}

/// Transport tuning shared by the remote sources.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Attempts per read, including the first (spec default: 3).
    pub retries: u32,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Keep a local cache of compressed gzip segments for remote sources.
    pub keep_cache: bool,
    /// Cache directory; defaults to the system temp dir.
    pub cache_dir: Option<PathBuf>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        SourceOptions {
            retries:    3,
            timeout:    Duration::from_secs(30),
            keep_cache: false,
            cache_dir:  None,
        }
    }
}

/// Where a flatfile lives, parsed from the CLI argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Http(String),
    Ftp(String),
}

impl Location {
    pub fn parse(spec: &str) -> Self {
        if spec.starts_with("http://") || spec.starts_with("https://") {
            Location::Http(spec.to_owned())
        } else if spec.starts_with("ftp://") {
            Location::Ftp(spec.to_owned())
        } else {
            Location::Local(PathBuf::from(spec))
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, Location::Local(_))
    }

    /// The sibling location of the `.gzi` side index.
    pub fn gzi_sibling(&self) -> Location {
        match self {
            Location::Local(p) => {
                let mut os = p.as_os_str().to_owned();
                os.push(".gzi");
                Location::Local(PathBuf::from(os))
            }
            Location::Http(u) => Location::Http(format!("{u}.gzi")),
            Location::Ftp(u)  => Location::Ftp(format!("{u}.gzi")),
        }
    }
}

/// Open the plain (non-gzip-aware) source for a location.
fn open_plain(location: &Location, opts: &SourceOptions) -> Result<Box<dyn ByteSource>> {
    match location {
        Location::Local(path) => Ok(Box::new(local::LocalSource::open(path)?)),
        Location::Http(url)   => Ok(Box::new(http::HttpSource::new(url.clone(), opts)?)),
        Location::Ftp(url)    => Ok(Box::new(ftp::FtpSource::new(url, opts)?)),
    }
}

/// Factory: select the byte-source implementation for `spec`.
///
/// With `gzip` set, the flatfile is whole-file gzip/bgzip compressed; the
/// side index is loaded from `<spec>.gzi` and the returned source reads
/// *decompressed* offsets.  For remote gzip, `opts.keep_cache` enables the
/// local compressed-segment cache.
pub fn open_source(spec: &str, gzip: bool, opts: &SourceOptions) -> Result<Box<dyn ByteSource>> {
    let location = Location::parse(spec);
    let inner = open_plain(&location, opts)?;
    if !gzip {
        return Ok(inner);
    }

    let gzi_loc = location.gzi_sibling();
    let gzi_src = open_plain(&gzi_loc, opts)?;
    let gzi_len = gzi_src.len()?;
    let gzi_bytes = gzi_src.read_at(0, gzi_len)?;
    let index = GzIndex::parse(&gzi_bytes)?;

    let cache = if location.is_remote() && opts.keep_cache {
        Some(gzi::SegmentCache::new(spec, opts.cache_dir.as_deref())?)
    } else {
        None
    };
    Ok(Box::new(GzipSource::new(inner, index, cache)))
}

/// Validate that a byte range lies inside the source.
pub(crate) fn check_range(offset: u64, length: u64, total: u64, what: &Path) -> Result<()> {
    if offset.checked_add(length).map_or(true, |end| end > total) {
        return Err(FfdbError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "range [{offset}, {}) exceeds size {total} of {}",
                offset.saturating_add(length),
                what.display()
            ),
        )));
    }
    Ok(())
}

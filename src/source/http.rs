//! HTTP(S) byte source: range requests over a shared connection-pooled agent.
//!
//! One `ureq::Agent` per source; the agent keeps connections alive across
//! calls and is safe to share across workers.  Transient failures (transport
//! errors, 5xx, 429) are retried with exponential backoff up to the
//! configured attempt count; a 200 answer to a ranged request means the
//! server ignores `Range` and is fatal ([`FfdbError::RangeUnsupported`]).

use std::io::Read;
use std::thread::sleep;
use std::time::Duration;

use log::{debug, warn};

use super::{ByteSource, SourceOptions};
use crate::error::{FfdbError, Result};

const BACKOFF_BASE: Duration = Duration::from_millis(250);

pub struct HttpSource {
    agent:   ureq::Agent,
    url:     String,
    retries: u32,
}

impl HttpSource {
    pub fn new(url: String, opts: &SourceOptions) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout(opts.timeout)
            .build();
        Ok(HttpSource { agent, url, retries: opts.retries.max(1) })
    }

    /// Issue one ranged GET.  `Ok(None)` signals a retryable failure.
    fn try_read(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let range = format!("bytes={}-{}", offset, offset + length - 1);
        let resp = match self.agent.get(&self.url).set("Range", &range).call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, _)) if code == 429 || code >= 500 => {
                warn!("{}: HTTP {code}, will retry", self.url);
                return Ok(None);
            }
            Err(ureq::Error::Status(code, _)) => {
                return Err(FfdbError::Network(format!("{}: HTTP {code}", self.url)));
            }
            Err(ureq::Error::Transport(t)) => {
                warn!("{}: {t}, will retry", self.url);
                return Ok(None);
            }
        };

        match resp.status() {
            206 => {}
            200 => return Err(FfdbError::RangeUnsupported { url: self.url.clone() }),
            code => return Err(FfdbError::Network(format!("{}: HTTP {code}", self.url))),
        }

        let mut body = Vec::with_capacity(length as usize);
        resp.into_reader()
            .take(length)
            .read_to_end(&mut body)
            .map_err(|e| FfdbError::Network(format!("{}: {e}", self.url)))?;
        if body.len() as u64 != length {
            return Err(FfdbError::Network(format!(
                "{}: short range response ({} of {length} bytes)",
                self.url,
                body.len()
            )));
        }
        Ok(Some(body))
    }
}

impl ByteSource for HttpSource {
    fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let mut backoff = BACKOFF_BASE;
        for attempt in 1..=self.retries {
            match self.try_read(offset, length)? {
                Some(body) => {
                    debug!("{}: read [{offset}, +{length}) on attempt {attempt}", self.url);
                    return Ok(body);
                }
                None if attempt < self.retries => {
                    sleep(backoff);
                    backoff *= 2;
                }
                None => break,
            }
        }
        Err(FfdbError::Network(format!(
            "{}: range read failed after {} attempts",
            self.url, self.retries
        )))
    }

    fn len(&self) -> Result<u64> {
        // HEAD first; fall back to a one-byte ranged GET and Content-Range.
        if let Ok(resp) = self.agent.head(&self.url).call() {
            if let Some(len) = resp.header("Content-Length").and_then(|v| v.parse().ok()) {
                return Ok(len);
            }
        }
        let resp = self
            .agent
            .get(&self.url)
            .set("Range", "bytes=0-0")
            .call()
            .map_err(|e| FfdbError::Network(format!("{}: {e}", self.url)))?;
        resp.header("Content-Range")
            .and_then(|v| v.rsplit('/').next())
            .and_then(|total| total.parse().ok())
            .ok_or_else(|| FfdbError::Network(format!("{}: size unavailable", self.url)))
    }
}

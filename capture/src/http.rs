//! Plain-HTTP stream sources: a probe that treats a 2xx response as "live"
//! and a pull engine that copies the response body to disk.
//!
//! Suitable for direct `.flv`/`.ts` URLs where no platform API lookup is
//! needed.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder};
use tracing::{debug, info, warn};

use crate::finalize::{self, provisional_path};
use crate::native::{EngineSegment, NativeEngine};
use crate::probe::{LiveStream, StreamProbe};
use crate::session::Session;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// 256 KB copy buffer.
const CHUNK: usize = 256 * 1024;

fn with_headers(mut request: RequestBuilder, headers: &[(String, String)]) -> RequestBuilder {
    for (key, value) in headers {
        request = request.header(key.as_str(), value.as_str());
    }
    request
}

/// Request headers for the pull engine, minus `Accept-Encoding`: the body
/// is written to disk undecoded.
fn pull_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(key, _)| !key.eq_ignore_ascii_case("accept-encoding"))
        .cloned()
        .collect()
}

// ── probe ────────────────────────────────────────────────────────────────

pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Cannot build HTTP client")?;
        Ok(HttpProbe { client })
    }
}

impl StreamProbe for HttpProbe {
    fn check_stream(&mut self, session: &Session) -> Result<Option<LiveStream>> {
        debug!("Probing {}", session.url);
        let response = with_headers(self.client.get(&session.url), &session.headers)
            .send()
            .with_context(|| format!("GET {}", session.url))?;

        let status = response.status();
        if !status.is_success() {
            info!("{} is not live (HTTP {})", session.name, status);
            return Ok(None);
        }

        // Dropping the response closes the connection without reading the
        // (possibly endless) body.
        Ok(Some(LiveStream {
            raw_url: response.url().to_string(),
            title: None,
        }))
    }
}

// ── pull engine ──────────────────────────────────────────────────────────

/// Copies the stream body to disk, rolling over by size or duration.
///
/// The first segment is written to `{output}.{suffix}.part` and left for
/// the session to finalize.  Later segments are named
/// `{output} part-NNN.{suffix}` and finalized here as they close.
pub struct HttpPullEngine {
    client: Client,
    shutdown: Arc<AtomicBool>,
}

impl HttpPullEngine {
    pub fn new(shutdown: Arc<AtomicBool>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None::<Duration>)
            .build()
            .context("Cannot build HTTP client")?;
        Ok(HttpPullEngine { client, shutdown })
    }
}

impl NativeEngine for HttpPullEngine {
    fn download(
        &mut self,
        url: &str,
        headers: &[(String, String)],
        output: &Path,
        suffix: &str,
        segment: &EngineSegment,
    ) -> Result<u64> {
        let mut response = with_headers(self.client.get(url), &pull_headers(headers))
            .send()
            .with_context(|| format!("GET {url}"))?;
        if !response.status().is_success() {
            anyhow::bail!("GET {} returned {}", url, response.status());
        }

        let mut writer = SegmentWriter::open(output, suffix, 0)?;
        let mut buf = vec![0u8; CHUNK];
        let mut total = 0u64;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested, stopping pull of {url}");
                break;
            }
            let n = match response.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("Stream read ended: {e}");
                    break;
                }
            };
            if writer.is_due(segment) {
                writer = writer.roll()?;
            }
            writer.write(&buf[..n])?;
            total += n as u64;
        }

        writer.finish()?;
        info!("Pulled {:.1} MB from {}", total as f64 / 1_048_576.0, url);
        Ok(total)
    }
}

struct SegmentWriter {
    output: PathBuf,
    base: PathBuf,
    suffix: String,
    index: u32,
    file: BufWriter<File>,
    written: u64,
    opened: Instant,
}

impl SegmentWriter {
    fn open(output: &Path, suffix: &str, index: u32) -> Result<Self> {
        let base = segment_base(output, index);
        let path = provisional_path(&base, suffix);
        let file = File::create(&path).with_context(|| format!("Cannot create {}", path.display()))?;
        debug!("Writing segment {index}: {}", path.display());
        Ok(SegmentWriter {
            output: output.to_path_buf(),
            base,
            suffix: suffix.to_string(),
            index,
            file: BufWriter::new(file),
            written: 0,
            opened: Instant::now(),
        })
    }

    fn is_due(&self, segment: &EngineSegment) -> bool {
        if self.written == 0 {
            return false;
        }
        let by_time = segment
            .time
            .is_some_and(|secs| self.opened.elapsed() >= Duration::from_secs(secs));
        let by_size = segment.size.is_some_and(|bytes| self.written >= bytes);
        by_time || by_size
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).context("Error writing segment")?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Close this segment, finalize it, and open the next one.
    fn roll(self) -> Result<Self> {
        let (output, suffix, next) = (self.output.clone(), self.suffix.clone(), self.index + 1);
        self.close(true)?;
        SegmentWriter::open(&output, &suffix, next)
    }

    /// Close the last segment.  Segment 0 stays provisional for the session
    /// to finalize.
    fn finish(self) -> Result<()> {
        let rolled = self.index > 0;
        self.close(rolled)
    }

    fn close(self, promote: bool) -> Result<()> {
        let SegmentWriter {
            base,
            suffix,
            mut file,
            ..
        } = self;
        file.flush().context("Error flushing segment")?;
        drop(file);
        if promote {
            finalize::finalize(&base, &suffix)
                .with_context(|| format!("Cannot finalize {}", base.display()))?;
        }
        Ok(())
    }
}

/// Segment 0 uses the output name itself; later ones get ` part-NNN`.
fn segment_base(output: &Path, index: u32) -> PathBuf {
    if index == 0 {
        output.to_path_buf()
    } else {
        let mut s = output.as_os_str().to_os_string();
        s.push(format!(" part-{index:03}"));
        PathBuf::from(s)
    }
}

//! Random access to remote packages over HTTP range requests.
//!
//! [`HttpSource`] behaves like a local file: it implements [`Read`] and [`Seek`],
//! so the zip reader can jump straight to the central directory at the end of a
//! multi-gigabyte package and only the bytes it asks for cross the network.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_RANGE, RANGE, USER_AGENT};
use tracing::trace;

use crate::error::{Error, Result};

/// Forward seeks up to this distance are served by discarding bytes from the
/// live response instead of issuing a new request.
const MAX_SKIP_IN_STREAM: u64 = 64 * 1024;

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// A seekable view of a remote package.
pub trait SeekableSource: Read + Seek + Send {
    /// Total size of the resource in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locator of the resource, used in diagnostics and passed to external tools.
    fn url(&self) -> &str;

    /// Release the underlying connection. Dropping the source has the same effect.
    fn close(self: Box<Self>) {}
}

/// Opens [`SeekableSource`]s by URL.
pub trait SourceProvider: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn SeekableSource>>;
}

/// Connection settings for [`HttpProvider`].
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub connect_timeout: Duration,
    /// Longest wait for response headers or for the next chunk of a body.
    pub read_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// [`SourceProvider`] backed by a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    user_agent: String,
}

impl HttpProvider {
    pub fn new(options: HttpOptions) -> Result<Self> {
        // The blocking client applies `timeout` to each wait, so a body can stream
        // for as long as it keeps making progress.
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.read_timeout)
            .build()
            .map_err(|e| Error::HttpClient(e.to_string()))?;
        Ok(Self {
            client,
            user_agent: options.user_agent,
        })
    }
}

impl SourceProvider for HttpProvider {
    fn open(&self, url: &str) -> Result<Box<dyn SeekableSource>> {
        let source = HttpSource::open(self.client.clone(), url, &self.user_agent)?;
        Ok(Box::new(source))
    }
}

/// A remote file read through `Range` requests.
pub struct HttpSource {
    client: Client,
    url: String,
    user_agent: String,
    len: u64,
    pos: u64,
    /// Open response body and the absolute offset of its next byte.
    stream: Option<(Response, u64)>,
}

impl fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSource")
            .field("url", &self.url)
            .field("len", &self.len)
            .field("pos", &self.pos)
            .field("streaming", &self.stream.as_ref().map(|(_, off)| *off))
            .finish()
    }
}

fn http_io_error(e: reqwest::Error) -> io::Error {
    if e.is_timeout() {
        io::Error::new(io::ErrorKind::TimedOut, e)
    } else {
        io::Error::other(e)
    }
}

/// `(start, total)` from a `Content-Range: bytes start-end/total` header.
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}

impl HttpSource {
    /// Probe `url` and return a source positioned at offset 0.
    ///
    /// The server must answer a one-byte range request with `206 Partial Content`
    /// and report the total size; anything else cannot be read at random.
    pub fn open(client: Client, url: &str, user_agent: &str) -> Result<Self> {
        let response = client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .header(USER_AGENT, user_agent)
            .send()
            .map_err(|e| Error::unavailable(url, e))?;

        let status = response.status();
        if status == StatusCode::OK {
            return Err(Error::unavailable(url, "server does not honour range requests"));
        }
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(Error::unavailable(url, format!("probe failed with status {status}")));
        }

        let len = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .and_then(|(_, total)| total)
            .ok_or_else(|| Error::unavailable(url, "missing or unsized Content-Range in probe"))?;

        trace!(url, len, "opened remote source");
        Ok(Self {
            client,
            url: url.to_string(),
            user_agent: user_agent.to_string(),
            len,
            pos: 0,
            stream: None,
        })
    }

    fn request_from(&self, offset: u64) -> io::Result<Response> {
        trace!(url = %self.url, offset, "range request");
        let response = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={offset}-"))
            .header(USER_AGENT, &self.user_agent)
            .send()
            .map_err(http_io_error)?;

        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(io::Error::other(format!(
                "range request at offset {offset} failed with status {}",
                response.status()
            )));
        }
        let start = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .map(|(start, _)| start);
        if start != Some(offset) {
            return Err(io::Error::other(format!(
                "server returned range starting at {start:?}, expected {offset}"
            )));
        }
        Ok(response)
    }

    /// Make sure the live response is positioned at `self.pos`.
    fn align_stream(&mut self) -> io::Result<()> {
        if let Some((response, offset)) = self.stream.as_mut() {
            if *offset == self.pos {
                return Ok(());
            }
            if *offset < self.pos && self.pos - *offset <= MAX_SKIP_IN_STREAM {
                let skip = self.pos - *offset;
                let skipped = io::copy(&mut response.by_ref().take(skip), &mut io::sink())?;
                *offset += skipped;
                if skipped == skip {
                    return Ok(());
                }
            }
        }
        self.stream = Some((self.request_from(self.pos)?, self.pos));
        Ok(())
    }
}

impl Read for HttpSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len {
            return Ok(0);
        }
        let want = usize::try_from(self.len - self.pos).map_or(buf.len(), |left| buf.len().min(left));
        // A body may end before the file does when the server caps range sizes;
        // ask again from the current position once before giving up.
        for _ in 0..2 {
            self.align_stream()?;
            let (response, offset) = self
                .stream
                .as_mut()
                .ok_or_else(|| io::Error::other("range stream not established"))?;
            let n = response.read(&mut buf[..want])?;
            if n > 0 {
                *offset += n as u64;
                self.pos += n as u64;
                return Ok(n);
            }
            trace!(url = %self.url, offset = self.pos, "range response ended early");
            self.stream = None;
        }
        Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("connection closed at offset {} of {}", self.pos, self.len),
        ))
    }
}

impl Seek for HttpSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(off) => Some(off),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of remote file")
        })?;
        self.pos = target;
        Ok(target)
    }
}

impl SeekableSource for HttpSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn close(self: Box<Self>) {
        trace!(url = %self.url, "closing remote source");
    }
}

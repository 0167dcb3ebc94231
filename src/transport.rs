//! Transport abstraction (component C6): local files and HTTP(S) behind a
//! single trait so the reader can treat both uniformly.

use crate::error::TransportError;
use regex::Regex;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Mutex;

/// A forward-only reader returned by [`Transport::stream_read`]. Each call
/// hands back an independent cursor so concurrent iterators over the same
/// transport never interfere with one another.
pub trait Stream: Read + Send {}
impl<T: Read + Send> Stream for T {}

pub trait Transport: Send + Sync {
    /// `true` for transports where long reads should be bounded up front
    /// (HTTP) rather than left to run to EOF (local files).
    fn remote(&self) -> bool;

    /// Exact byte size of the underlying data.
    fn length(&self) -> Result<u64, TransportError>;

    /// Reads exactly `length` bytes starting at `offset`, or fewer only if
    /// the read runs into EOF.
    fn chunk_read(&self, offset: u64, length: u64) -> Result<Vec<u8>, TransportError>;

    /// Returns an independent, forward-only stream starting at `offset`.
    /// `stop` is an exclusive upper bound the transport MAY honor (HTTP
    /// transports turn it into a bounded Range request; local transports
    /// ignore it and rely on the caller to stop reading).
    fn stream_read(&self, offset: u64, stop: Option<u64>) -> Result<Box<dyn Stream>, TransportError>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------
// FileTransport
// ---------------------------------------------------------------------

pub struct FileTransport {
    file: Mutex<File>,
    name: String,
}

impl FileTransport {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Ok(FileTransport {
            file: Mutex::new(file),
            name: path.display().to_string(),
        })
    }
}

impl Transport for FileTransport {
    fn remote(&self) -> bool {
        false
    }

    fn length(&self) -> Result<u64, TransportError> {
        let file = self.file.lock().unwrap();
        Ok(file.metadata()?.len())
    }

    fn chunk_read(&self, offset: u64, length: u64) -> Result<Vec<u8>, TransportError> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        let mut total = 0usize;
        loop {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
            if total == buf.len() {
                break;
            }
        }
        buf.truncate(total);
        Ok(buf)
    }

    fn stream_read(&self, offset: u64, _stop: Option<u64>) -> Result<Box<dyn Stream>, TransportError> {
        let file = self.file.lock().unwrap();
        let mut duped = file.try_clone()?;
        duped.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(duped))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------

pub struct HttpTransport {
    url: String,
    client: reqwest::blocking::Client,
    cached_length: Mutex<Option<u64>>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        HttpTransport {
            url: url.into(),
            client: reqwest::blocking::Client::new(),
            cached_length: Mutex::new(None),
        }
    }

    fn content_range_re() -> Regex {
        Regex::new(r"^bytes (\d+)-\d+/(\d+|\*)").unwrap()
    }

    /// Validates that the server actually honored the requested byte
    /// offset, and opportunistically caches the total length if the
    /// response discloses it.
    fn check_offset(&self, response: &reqwest::blocking::Response, desired_offset: u64) -> Result<(), TransportError> {
        let crange = response
            .headers()
            .get("Content-Range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let re = Self::content_range_re();
        let offset = match re.captures(crange) {
            Some(caps) => caps[1].parse::<u64>().unwrap_or(0),
            None => 0,
        };
        if offset != desired_offset {
            return Err(TransportError::RangeNotRespected);
        }
        if let Some(caps) = re.captures(crange) {
            if &caps[2] != "*" {
                if let Ok(total) = caps[2].parse::<u64>() {
                    *self.cached_length.lock().unwrap() = Some(total);
                }
            }
        }
        Ok(())
    }
}

impl Transport for HttpTransport {
    fn remote(&self) -> bool {
        true
    }

    fn length(&self) -> Result<u64, TransportError> {
        if let Some(len) = *self.cached_length.lock().unwrap() {
            return Ok(len);
        }
        let response = self
            .client
            .head(&self.url)
            .send()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let len = response
            .headers()
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(TransportError::MissingLength)?;
        *self.cached_length.lock().unwrap() = Some(len);
        Ok(len)
    }

    fn chunk_read(&self, offset: u64, length: u64) -> Result<Vec<u8>, TransportError> {
        let range = format!("bytes={}-{}", offset, offset + length - 1);
        let response = self
            .client
            .get(&self.url)
            .header("Range", range)
            .send()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let response = response
            .error_for_status()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        self.check_offset(&response, offset)?;
        Ok(response
            .bytes()
            .map_err(|e| TransportError::Http(e.to_string()))?
            .to_vec())
    }

    fn stream_read(&self, offset: u64, stop: Option<u64>) -> Result<Box<dyn Stream>, TransportError> {
        let range = match stop {
            None => format!("bytes={}-", offset),
            Some(stop_offset) => {
                if stop_offset == 0 || stop_offset - 1 < offset {
                    // The server would just answer 416; return an empty
                    // stream directly instead of round-tripping.
                    return Ok(Box::new(io::Cursor::new(Vec::new())));
                }
                format!("bytes={}-{}", offset, stop_offset - 1)
            }
        };
        let response = self
            .client
            .get(&self.url)
            .header("Range", range)
            .send()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let response = response
            .error_for_status()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        self.check_offset(&response, offset)?;
        Ok(Box::new(HttpReadStream { response }))
    }

    fn name(&self) -> &str {
        &self.url
    }
}

struct HttpReadStream {
    response: reqwest::blocking::Response,
}

impl Read for HttpReadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.response.read(buf)
    }
}

//! HTTP endpoints.
//!
//! Two implementations share the [`Http`] contract: [`Ml307Http`] drives
//! the ML307's built-in HTTP engine over AT commands, [`HttpClient`] is a
//! streaming HTTP/1.1 client layered on any [`crate::transport::Tcp`].

use std::time::Duration;

use crate::error::Error;

pub mod client;
pub mod ml307;

pub use client::HttpClient;
pub use ml307::Ml307Http;

pub(crate) const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub trait Http: Send {
    fn set_timeout(&mut self, timeout: Duration);
    fn set_header(&mut self, key: &str, value: &str);
    /// Preset a fixed request body. Without one, POST/PUT requests stream
    /// via [`write`](Self::write) using chunked transfer encoding.
    fn set_content(&mut self, content: Vec<u8>);
    fn open(&mut self, method: &str, url: &str) -> bool;
    fn close(&mut self);
    /// Blocking body read; bytes read, 0 on EOF, -1 on error/timeout.
    fn read(&mut self, buffer: &mut [u8]) -> isize;
    /// Upload body bytes; an empty buffer terminates a chunked upload.
    fn write(&mut self, buffer: &[u8]) -> isize;
    fn get_status_code(&mut self) -> i32;
    fn get_response_header(&self, key: &str) -> Option<String>;
    /// Content length of the response, 0 when chunked.
    fn get_body_length(&mut self) -> usize;
    fn read_all(&mut self) -> Vec<u8>;
}

/// Case-preserving header map with case-insensitive lookup, iterated in
/// insertion order.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<HeaderEntry>,
}

#[derive(Debug, Clone)]
struct HeaderEntry {
    lower: String,
    original: String,
    value: String,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Replacement keeps the entry's position but takes
    /// the new spelling of the key.
    pub fn set(&mut self, key: &str, value: &str) {
        let lower = key.to_ascii_lowercase();
        if let Some(entry) = self.entries.iter_mut().find(|e| e.lower == lower) {
            entry.original = key.to_string();
            entry.value = value.to_string();
        } else {
            self.entries.push(HeaderEntry {
                lower,
                original: key.to_string(),
                value: value.to_string(),
            });
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let lower = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|e| e.lower == lower)
            .map(|e| e.value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// `(original_key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|e| (e.original.as_str(), e.value.as_str()))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Split `scheme://host[:port][/path]`. The port defaults by scheme
/// (`https`/`wss` 443, anything else 80).
pub(crate) fn parse_url(url: &str) -> Result<ParsedUrl, Error> {
    let scheme_end = url.find("://").ok_or(Error::InvalidUrl)?;
    let scheme = url[..scheme_end].to_ascii_lowercase();
    let rest = &url[scheme_end + 3..];

    let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(Error::InvalidUrl);
    }

    let default_port = match scheme.as_str() {
        "https" | "wss" => 443,
        _ => 80,
    };
    let (host, port) = match authority.find(':') {
        Some(pos) => {
            let port = authority[pos + 1..]
                .parse::<u16>()
                .map_err(|_| Error::InvalidUrl)?;
            if port == 0 {
                return Err(Error::InvalidUrl);
            }
            (&authority[..pos], port)
        }
        None => (authority, default_port),
    };

    Ok(ParsedUrl {
        scheme,
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

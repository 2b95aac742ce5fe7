//! Streaming HTTP/1.1 client over any [`Tcp`] transport.
//!
//! The response is parsed as a byte-stream state machine fed by the
//! transport's stream callback. Body data moves through a bounded FIFO of
//! chunks: the network callback blocks once ~8 KiB is queued, which
//! backpressures the modem link until the reader catches up.

use core::fmt::Write as _;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{parse_url, HeaderMap, Http, DEFAULT_HTTP_TIMEOUT};
use crate::transport::{Tcp, TransportFactory};

const EVENT_HEADERS_RECEIVED: u32 = 1 << 0;
const EVENT_ERROR: u32 = 1 << 1;
const EVENT_COMPLETE: u32 = 1 << 2;

/// Soft cap on queued body bytes.
const MAX_BODY_BUFFER: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    StatusLine,
    Headers,
    Body,
    ChunkSize,
    ChunkData,
    ChunkTrailer,
    Complete,
}

struct ParseSide {
    state: ParseState,
    rx_buffer: Vec<u8>,
    status_code: i32,
    headers: HeaderMap,
    content_length: usize,
    total_body_received: usize,
    response_chunked: bool,
    chunk_size: usize,
    chunk_received: usize,
}

impl ParseSide {
    fn reset(&mut self) {
        self.state = ParseState::StatusLine;
        self.rx_buffer.clear();
        self.status_code = -1;
        self.headers.clear();
        self.content_length = 0;
        self.total_body_received = 0;
        self.response_chunked = false;
        self.chunk_size = 0;
        self.chunk_received = 0;
    }

    fn is_data_complete(&self) -> bool {
        if self.response_chunked {
            return self.state == ParseState::Complete;
        }
        if self.content_length > 0 {
            return self.total_body_received >= self.content_length;
        }
        // No length information: a remote close is a normal EOF.
        true
    }
}

struct BodyChunk {
    data: Vec<u8>,
    offset: usize,
}

impl BodyChunk {
    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

#[derive(Default)]
struct BodySide {
    chunks: VecDeque<BodyChunk>,
    queued: usize,
}

struct ClientShared {
    events: crate::event::EventGroup,
    connected: AtomicBool,
    connection_error: AtomicBool,
    eof: AtomicBool,
    headers_received: AtomicBool,
    /// Owned by the network callback; lock order is parse, then body.
    parse: Mutex<ParseSide>,
    /// Owned by readers; `data_cv` wakes them, `space_cv` wakes a writer
    /// blocked on the cap. The two mutexes are never both held across a
    /// condvar wait.
    body: Mutex<BodySide>,
    data_cv: Condvar,
    space_cv: Condvar,
}

impl ClientShared {
    fn new() -> Self {
        Self {
            events: crate::event::EventGroup::new(),
            connected: AtomicBool::new(false),
            connection_error: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            headers_received: AtomicBool::new(false),
            parse: Mutex::new(ParseSide {
                state: ParseState::StatusLine,
                rx_buffer: Vec::new(),
                status_code: -1,
                headers: HeaderMap::new(),
                content_length: 0,
                total_body_received: 0,
                response_chunked: false,
                chunk_size: 0,
                chunk_received: 0,
            }),
            body: Mutex::new(BodySide::default()),
            data_cv: Condvar::new(),
            space_cv: Condvar::new(),
        }
    }

    fn add_body_data(&self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let mut body = self.body.lock().unwrap();
        body.queued += data.len();
        body.chunks.push_back(BodyChunk { data, offset: 0 });
        drop(body);
        self.data_cv.notify_one();
    }

    fn on_tcp_data(&self, data: &[u8]) {
        // Backpressure: hold the producer until the queue has room or the
        // connection dies.
        {
            let mut body = self.body.lock().unwrap();
            while body.queued + data.len() >= MAX_BODY_BUFFER
                && self.connected.load(Ordering::Acquire)
            {
                body = self.space_cv.wait(body).unwrap();
            }
        }

        let mut parse = self.parse.lock().unwrap();
        parse.rx_buffer.extend_from_slice(data);
        self.process_received_data(&mut parse);
        drop(parse);
        self.data_cv.notify_one();
    }

    fn on_tcp_disconnected(&self) {
        self.connected.store(false, Ordering::Release);

        let parse = self.parse.lock().unwrap();
        if self.headers_received.load(Ordering::Acquire) && !parse.is_data_complete() {
            self.connection_error.store(true, Ordering::Release);
            error!(
                "Connection closed prematurely, expected {} bytes but only received {} bytes",
                parse.content_length, parse.total_body_received
            );
        } else {
            self.eof.store(true, Ordering::Release);
        }
        drop(parse);

        self.data_cv.notify_all();
        self.space_cv.notify_all();
    }

    fn set_error(&self) {
        error!("HTTP parse error");
        self.events.set(EVENT_ERROR);
    }

    fn process_received_data(&self, parse: &mut ParseSide) {
        while !parse.rx_buffer.is_empty() && parse.state != ParseState::Complete {
            match parse.state {
                ParseState::StatusLine => {
                    let Some(line) = next_line(&mut parse.rx_buffer) else {
                        return;
                    };
                    match parse_status_line(&line) {
                        Some(status) => {
                            parse.status_code = status;
                            parse.state = ParseState::Headers;
                        }
                        None => {
                            self.set_error();
                            return;
                        }
                    }
                }

                ParseState::Headers => {
                    let Some(line) = next_line(&mut parse.rx_buffer) else {
                        return;
                    };
                    if line.is_empty() {
                        let chunked = parse
                            .headers
                            .get("transfer-encoding")
                            .map(|v| v.contains("chunked"))
                            .unwrap_or(false);
                        if chunked {
                            parse.response_chunked = true;
                            parse.state = ParseState::ChunkSize;
                        } else {
                            parse.state = ParseState::Body;
                            if let Some(value) = parse.headers.get("content-length") {
                                match value.trim().parse::<usize>() {
                                    Ok(length) => parse.content_length = length,
                                    Err(_) => {
                                        error!("Invalid Content-Length: {}", value);
                                        parse.content_length = 0;
                                    }
                                }
                            }
                        }
                        self.headers_received.store(true, Ordering::Release);
                        self.events.set(EVENT_HEADERS_RECEIVED);
                    } else if !self.parse_header_line(parse, &line) {
                        self.set_error();
                        return;
                    }
                }

                ParseState::Body => {
                    let data = std::mem::take(&mut parse.rx_buffer);
                    parse.total_body_received += data.len();
                    self.add_body_data(data);
                }

                ParseState::ChunkSize => {
                    let Some(line) = next_line(&mut parse.rx_buffer) else {
                        return;
                    };
                    parse.chunk_size = parse_chunk_size(&line);
                    parse.chunk_received = 0;
                    parse.state = if parse.chunk_size == 0 {
                        ParseState::ChunkTrailer
                    } else {
                        ParseState::ChunkData
                    };
                }

                ParseState::ChunkData => {
                    let available = parse
                        .rx_buffer
                        .len()
                        .min(parse.chunk_size - parse.chunk_received);
                    if available == 0 {
                        return;
                    }
                    let data: Vec<u8> = parse.rx_buffer.drain(..available).collect();
                    parse.total_body_received += available;
                    parse.chunk_received += available;
                    self.add_body_data(data);

                    if parse.chunk_received == parse.chunk_size {
                        if parse.rx_buffer.starts_with(b"\r\n") {
                            parse.rx_buffer.drain(..2);
                        }
                        parse.state = ParseState::ChunkSize;
                    }
                }

                ParseState::ChunkTrailer => {
                    let Some(line) = next_line(&mut parse.rx_buffer) else {
                        return;
                    };
                    if line.is_empty() {
                        parse.state = ParseState::Complete;
                        self.eof.store(true, Ordering::Release);
                        self.events.set(EVENT_COMPLETE);
                    }
                    // Trailer headers are discarded.
                }

                ParseState::Complete => return,
            }
        }

        if parse.state == ParseState::Body
            && !parse.response_chunked
            && parse.content_length > 0
            && parse.total_body_received >= parse.content_length
        {
            parse.state = ParseState::Complete;
            self.eof.store(true, Ordering::Release);
            self.events.set(EVENT_COMPLETE);
            debug!(
                "HTTP response body received: {}/{} bytes",
                parse.total_body_received, parse.content_length
            );
        }
    }

    fn parse_header_line(&self, parse: &mut ParseSide, line: &str) -> bool {
        let Some(colon) = line.find(':') else {
            error!("Invalid header line: {}", line);
            return false;
        };
        let key = line[..colon].trim();
        let value = line[colon + 1..].trim();
        parse.headers.set(key, value);
        true
    }
}

fn next_line(buffer: &mut Vec<u8>) -> Option<String> {
    let pos = buffer.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..pos + 1).collect();
    line.pop(); // \n
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}

fn parse_status_line(line: &str) -> Option<i32> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        error!("Invalid status line: {}", line);
        return None;
    }
    let status: i32 = parts.next()?.parse().ok()?;
    if !(100..=999).contains(&status) {
        error!("Parse status code failed: {}", line);
        return None;
    }
    debug!("HTTP status code: {}", status);
    Some(status)
}

fn parse_chunk_size(line: &str) -> usize {
    // Hexadecimal size, extensions after ';' ignored.
    let size = line.split(';').next().unwrap_or("").trim();
    match usize::from_str_radix(size, 16) {
        Ok(size) => size,
        Err(_) => {
            error!("Parse chunk size failed: {}", line);
            0
        }
    }
}

pub struct HttpClient {
    factory: Arc<dyn TransportFactory>,
    connect_id: i32,
    timeout: Duration,
    request_headers: HeaderMap,
    content: Option<Vec<u8>>,
    request_chunked: bool,
    method: String,
    protocol: String,
    host: String,
    port: u16,
    path: String,
    tcp: Option<Box<dyn Tcp>>,
    shared: Arc<ClientShared>,
}

impl HttpClient {
    pub fn new(factory: Arc<dyn TransportFactory>, connect_id: i32) -> Self {
        Self {
            factory,
            connect_id,
            timeout: DEFAULT_HTTP_TIMEOUT,
            request_headers: HeaderMap::new(),
            content: None,
            request_chunked: false,
            method: String::new(),
            protocol: String::new(),
            host: String::new(),
            port: 0,
            path: String::new(),
            tcp: None,
            shared: Arc::new(ClientShared::new()),
        }
    }

    fn build_request(&self) -> Vec<u8> {
        let mut request = String::new();
        let _ = write!(request, "{} {} HTTP/1.1\r\n", self.method, self.path);

        let _ = write!(request, "Host: {}", self.host);
        let default_port = (self.protocol == "http" && self.port == 80)
            || (self.protocol == "https" && self.port == 443);
        if !default_port {
            let _ = write!(request, ":{}", self.port);
        }
        request.push_str("\r\n");

        for (key, value) in self.request_headers.iter() {
            let _ = write!(request, "{}: {}\r\n", key, value);
        }

        let user_set_content_length = self.request_headers.contains("content-length");
        let user_set_transfer_encoding = self.request_headers.contains("transfer-encoding");
        let has_content = self.content.as_ref().map(|c| !c.is_empty()).unwrap_or(false);
        if has_content && !user_set_content_length {
            let _ = write!(
                request,
                "Content-Length: {}\r\n",
                self.content.as_ref().unwrap().len()
            );
        } else if (self.method == "POST" || self.method == "PUT")
            && !user_set_content_length
            && !user_set_transfer_encoding
        {
            if self.request_chunked {
                request.push_str("Transfer-Encoding: chunked\r\n");
            } else {
                request.push_str("Content-Length: 0\r\n");
            }
        }

        if !self.request_headers.contains("connection") {
            request.push_str("Connection: close\r\n");
        }
        request.push_str("\r\n");
        debug!("HTTP request headers:\n{}", request);

        let mut bytes = request.into_bytes();
        if has_content {
            bytes.extend_from_slice(self.content.as_ref().unwrap());
        }
        bytes
    }

    /// Pull buffered body bytes; 0 when nothing is queued.
    fn drain_chunks(&self, body: &mut MutexGuard<'_, BodySide>, buffer: &mut [u8]) -> usize {
        let mut read = 0;
        while read < buffer.len() {
            let (n, empty) = {
                let Some(front) = body.chunks.front_mut() else {
                    break;
                };
                let n = front.remaining().min(buffer.len() - read);
                buffer[read..read + n]
                    .copy_from_slice(&front.data[front.offset..front.offset + n]);
                front.offset += n;
                (n, front.remaining() == 0)
            };
            read += n;
            body.queued -= n;
            if empty {
                body.chunks.pop_front();
            }
        }
        if read > 0 {
            self.shared.space_cv.notify_one();
        }
        read
    }
}

impl Http for HttpClient {
    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn set_header(&mut self, key: &str, value: &str) {
        self.request_headers.set(key, value);
    }

    fn set_content(&mut self, content: Vec<u8>) {
        self.content = Some(content);
    }

    fn open(&mut self, method: &str, url: &str) -> bool {
        self.method = method.to_ascii_uppercase();

        // Reset any state from a previous request.
        self.shared.parse.lock().unwrap().reset();
        {
            let mut body = self.shared.body.lock().unwrap();
            body.chunks.clear();
            body.queued = 0;
        }
        self.shared.connected.store(false, Ordering::Release);
        self.shared.connection_error.store(false, Ordering::Release);
        self.shared.eof.store(false, Ordering::Release);
        self.shared.headers_received.store(false, Ordering::Release);
        self.shared
            .events
            .clear(EVENT_HEADERS_RECEIVED | EVENT_ERROR | EVENT_COMPLETE);

        let Ok(parsed) = parse_url(url) else {
            error!("Invalid URL format: {}", url);
            return false;
        };
        self.protocol = parsed.scheme;
        self.host = parsed.host;
        self.port = parsed.port;
        self.path = parsed.path;

        let mut tcp = if self.protocol == "https" {
            self.factory.create_ssl(self.connect_id)
        } else {
            self.factory.create_tcp(self.connect_id)
        };

        let stream_shared = self.shared.clone();
        tcp.on_stream(Box::new(move |data| stream_shared.on_tcp_data(data)));
        let disconnect_shared = self.shared.clone();
        tcp.on_disconnected(Box::new(move || disconnect_shared.on_tcp_disconnected()));

        if !tcp.connect(&self.host, self.port) {
            error!("TCP connection failed");
            return false;
        }

        self.shared.connected.store(true, Ordering::Release);
        self.request_chunked =
            (self.method == "POST" || self.method == "PUT") && self.content.is_none();

        let request = self.build_request();
        if tcp.send(&request) <= 0 {
            error!("Send HTTP request failed");
            tcp.disconnect();
            self.shared.connected.store(false, Ordering::Release);
            return false;
        }

        self.tcp = Some(tcp);
        true
    }

    fn close(&mut self) {
        if !self.shared.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.space_cv.notify_all();
        if let Some(tcp) = self.tcp.as_mut() {
            tcp.disconnect();
        }
        self.shared.eof.store(true, Ordering::Release);
        self.shared.data_cv.notify_all();
        debug!("HTTP connection closed");
    }

    fn read(&mut self, buffer: &mut [u8]) -> isize {
        let deadline = Instant::now() + self.timeout;
        let mut body = self.shared.body.lock().unwrap();
        loop {
            // Drain buffered data before reporting any error so bytes that
            // arrived ahead of a failure are not lost.
            let read = self.drain_chunks(&mut body, buffer);
            if read > 0 {
                return read as isize;
            }
            if self.shared.connection_error.load(Ordering::Acquire) {
                return -1;
            }
            if self.shared.eof.load(Ordering::Acquire) {
                return 0;
            }
            if !self.shared.connected.load(Ordering::Acquire) {
                return 0;
            }

            let now = Instant::now();
            if now >= deadline {
                error!("Wait for HTTP content receive timeout");
                return -1;
            }
            let (guard, _) = self
                .shared
                .data_cv
                .wait_timeout(body, deadline - now)
                .unwrap();
            body = guard;
        }
    }

    fn write(&mut self, buffer: &[u8]) -> isize {
        if !self.shared.connected.load(Ordering::Acquire) {
            error!("Cannot write: connection closed");
            return -1;
        }
        let Some(tcp) = self.tcp.as_mut() else {
            return -1;
        };

        if self.request_chunked {
            if buffer.is_empty() {
                return tcp.send(b"0\r\n\r\n");
            }
            let mut frame = Vec::with_capacity(buffer.len() + 16);
            frame.extend_from_slice(format!("{:x}\r\n", buffer.len()).as_bytes());
            frame.extend_from_slice(buffer);
            frame.extend_from_slice(b"\r\n");
            tcp.send(&frame)
        } else {
            if buffer.is_empty() {
                return 0;
            }
            tcp.send(buffer)
        }
    }

    fn get_status_code(&mut self) -> i32 {
        if !self.shared.headers_received.load(Ordering::Acquire) {
            let bits = self.shared.events.wait(
                EVENT_HEADERS_RECEIVED | EVENT_ERROR,
                false,
                Some(self.timeout),
            );
            if bits & EVENT_ERROR != 0 {
                return -1;
            }
            if bits & EVENT_HEADERS_RECEIVED == 0 {
                error!("Wait for HTTP headers receive timeout");
                return -1;
            }
        }
        self.shared.parse.lock().unwrap().status_code
    }

    fn get_response_header(&self, key: &str) -> Option<String> {
        self.shared
            .parse
            .lock()
            .unwrap()
            .headers
            .get(key)
            .map(str::to_string)
    }

    fn get_body_length(&mut self) -> usize {
        if !self.shared.headers_received.load(Ordering::Acquire) {
            self.get_status_code();
        }
        let parse = self.shared.parse.lock().unwrap();
        if parse.response_chunked {
            return 0;
        }
        parse.content_length
    }

    fn read_all(&mut self) -> Vec<u8> {
        let deadline = Instant::now() + self.timeout;
        let mut body = self.shared.body.lock().unwrap();
        while !self.shared.eof.load(Ordering::Acquire)
            && !self.shared.connection_error.load(Ordering::Acquire)
        {
            let now = Instant::now();
            if now >= deadline {
                error!("Wait for HTTP content receive complete timeout");
                return Vec::new();
            }
            let (guard, _) = self
                .shared
                .data_cv
                .wait_timeout(body, deadline - now)
                .unwrap();
            body = guard;
        }

        if self.shared.connection_error.load(Ordering::Acquire) {
            error!("Cannot read all data: connection closed prematurely");
            return Vec::new();
        }

        let mut result = Vec::with_capacity(body.queued);
        while let Some(chunk) = body.chunks.pop_front() {
            result.extend_from_slice(&chunk.data[chunk.offset..]);
        }
        body.queued = 0;
        self.shared.space_cv.notify_all();
        result
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        self.close();
    }
}

//! HTTP over the ML307's built-in engine (`+MHTTP*` family).
//!
//! The module performs the TCP/TLS work itself and streams the response
//! back through `MHTTPURC` events; this side only rate-limits the reader,
//! the modem self-rates the producer.

use core::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{parse_url, HeaderMap, Http, DEFAULT_HTTP_TIMEOUT};
use crate::event::EventGroup;
use crate::hex;
use crate::types::ArgumentValue;
use crate::uart::{AtUart, UrcSubscription, DEFAULT_COMMAND_TIMEOUT, FIFO_OVERFLOW_URC};

const EVENT_INITIALIZED: u32 = 1 << 0;
const EVENT_HEADERS_RECEIVED: u32 = 1 << 1;
const EVENT_ERROR: u32 = 1 << 2;
const EVENT_IND: u32 = 1 << 3;

/// `"err"` URC codes; numbering is part of the module's contract.
fn error_code_to_string(error_code: i32) -> &'static str {
    match error_code {
        1 => "Domain name resolution failed",
        2 => "Connection to server failed",
        3 => "Connection to server timeout",
        4 => "SSL handshake failed",
        5 => "Connection abnormal disconnection",
        6 => "Request response timeout",
        7 => "Data reception parsing failed",
        8 => "Cache space insufficient",
        9 => "Data packet loss",
        10 => "File write failed",
        255 => "Unknown error",
        _ => "Undefined error",
    }
}

const METHODS: [&str; 5] = ["GET", "POST", "PUT", "DELETE", "HEAD"];

struct ResponseState {
    status_code: i32,
    headers: HeaderMap,
    body: Vec<u8>,
    body_offset: usize,
    response_chunked: bool,
    eof: bool,
}

struct HttpShared {
    events: EventGroup,
    state: Mutex<ResponseState>,
    cv: Condvar,
    http_id: AtomicI32,
    instance_active: AtomicBool,
    error_code: AtomicI32,
}

impl HttpShared {
    fn parse_response_headers(state: &mut ResponseState, raw: &[u8]) {
        for line in String::from_utf8_lossy(raw).lines() {
            let Some(colon) = line.find(':') else {
                continue;
            };
            let key = line[..colon].trim();
            let value = line[colon + 1..].trim();
            if key.is_empty() {
                continue;
            }
            state.headers.set(key, value);
            if key.eq_ignore_ascii_case("Transfer-Encoding") && value.contains("chunked") {
                state.response_chunked = true;
                info!("Found chunked transfer encoding");
            }
        }
    }

    fn handle_urc(&self, command: &str, arguments: &[ArgumentValue]) {
        match command {
            "MHTTPURC" if arguments.len() >= 2 => {
                if arguments[1].int_value() != self.http_id.load(Ordering::Acquire) {
                    return;
                }
                match arguments[0].string_value() {
                    "header" if arguments.len() >= 3 => {
                        let mut state = self.state.lock().unwrap();
                        state.eof = false;
                        state.body_offset = 0;
                        state.body.clear();
                        state.status_code = arguments[2].int_value();
                        if arguments.len() >= 5 {
                            let raw = hex::from_hex(arguments[4].string_value());
                            Self::parse_response_headers(&mut state, &raw);
                        } else {
                            // Header blob split across URCs; nothing usable.
                            error!("Missing header");
                        }
                        drop(state);
                        self.events.set(EVENT_HEADERS_RECEIVED);
                    }
                    "content" if arguments.len() >= 5 => {
                        // "content",<id>,<content_len>,<sum_len>,<cur_len>,<data>
                        let content_len = arguments[2].int_value() as usize;
                        let sum_len = arguments[3].int_value() as usize;
                        let current_len = arguments[4].int_value() as usize;

                        let mut decoded = Vec::new();
                        if arguments.len() >= 6 {
                            hex::from_hex_append(&mut decoded, arguments[5].string_value());
                        } else {
                            error!("Missing content");
                        }

                        let mut state = self.state.lock().unwrap();
                        state.body.extend_from_slice(&decoded);

                        if !state.eof {
                            state.eof = if state.response_chunked {
                                current_len == 0
                            } else {
                                sum_len >= content_len
                            };
                        }

                        state.body_offset += current_len;
                        if sum_len > state.body_offset {
                            // The stream skipped data; poison the transfer
                            // and let the caller tear the slot down.
                            error!(
                                "body offset {} behind reported total {}",
                                state.body_offset, sum_len
                            );
                            state.eof = true;
                            drop(state);
                            self.error_code.store(9, Ordering::Release);
                            self.events.set(EVENT_ERROR);
                            self.cv.notify_all();
                            return;
                        }
                        drop(state);
                        self.cv.notify_one();
                    }
                    "err" if arguments.len() >= 3 => {
                        self.error_code
                            .store(arguments[2].int_value(), Ordering::Release);
                        self.events.set(EVENT_ERROR);
                    }
                    "ind" => {
                        self.events.set(EVENT_IND);
                    }
                    other => {
                        error!("Unknown HTTP event: {}", other);
                    }
                }
            }
            "MHTTPCREATE" if !arguments.is_empty() => {
                self.http_id.store(arguments[0].int_value(), Ordering::Release);
                self.instance_active.store(true, Ordering::Release);
                self.events.set(EVENT_INITIALIZED);
            }
            FIFO_OVERFLOW_URC => {
                // Slot is lost; wake everyone and leave the MHTTPDEL to the
                // caller thread.
                let mut state = self.state.lock().unwrap();
                state.eof = true;
                drop(state);
                self.events.set(EVENT_ERROR);
                self.cv.notify_all();
            }
            _ => {}
        }
    }
}

pub struct Ml307Http {
    uart: Arc<AtUart>,
    shared: Arc<HttpShared>,
    subscription: UrcSubscription,
    timeout: Duration,
    request_headers: HeaderMap,
    content: Option<Vec<u8>>,
    request_chunked: bool,
    content_length: usize,
    protocol: String,
    host: String,
    path: String,
}

impl Ml307Http {
    pub fn new(uart: Arc<AtUart>) -> Self {
        let shared = Arc::new(HttpShared {
            events: EventGroup::new(),
            state: Mutex::new(ResponseState {
                status_code: -1,
                headers: HeaderMap::new(),
                body: Vec::new(),
                body_offset: 0,
                response_chunked: false,
                eof: false,
            }),
            cv: Condvar::new(),
            http_id: AtomicI32::new(-1),
            instance_active: AtomicBool::new(false),
            error_code: AtomicI32::new(0),
        });
        let urc_shared = shared.clone();
        let subscription = uart.register_urc_callback(move |command, arguments| {
            urc_shared.handle_urc(command, arguments);
        });
        Self {
            uart,
            shared,
            subscription,
            timeout: DEFAULT_HTTP_TIMEOUT,
            request_headers: HeaderMap::new(),
            content: None,
            request_chunked: false,
            content_length: 0,
            protocol: String::new(),
            host: String::new(),
            path: String::new(),
        }
    }

    fn http_id(&self) -> i32 {
        self.shared.http_id.load(Ordering::Acquire)
    }

    fn config(&self, item: &str, value: &str) -> bool {
        let command = format!("AT+MHTTPCFG=\"{}\",{},{}", item, self.http_id(), value);
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true)
    }

    fn fetch_headers(&self) -> bool {
        let bits = self.shared.events.wait(
            EVENT_HEADERS_RECEIVED | EVENT_ERROR,
            true,
            Some(self.timeout),
        );
        if bits & EVENT_ERROR != 0 {
            error!(
                "HTTP request error: {}",
                error_code_to_string(self.shared.error_code.load(Ordering::Acquire))
            );
            return false;
        }
        if bits & EVENT_HEADERS_RECEIVED == 0 {
            error!("Timeout waiting for HTTP headers to be received");
            return false;
        }
        true
    }
}

impl Http for Ml307Http {
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
        let method = method.to_ascii_uppercase();
        let Some(method_value) = METHODS.iter().position(|m| *m == method).map(|i| i + 1)
        else {
            error!("Unknown HTTP method: {}", method);
            return false;
        };
        let method_supports_content = method == "POST" || method == "PUT";

        let Ok(parsed) = parse_url(url) else {
            error!("Invalid URL format");
            return false;
        };
        self.protocol = parsed.scheme;
        self.host = parsed.host;
        self.path = parsed.path;

        let command = format!("AT+MHTTPCREATE=\"{}://{}\"", self.protocol, self.host);
        if !self.uart.send_command(&command, DEFAULT_COMMAND_TIMEOUT, true) {
            error!("Failed to create HTTP connection");
            return false;
        }
        if self
            .shared
            .events
            .wait(EVENT_INITIALIZED, true, Some(self.timeout))
            == 0
        {
            error!("Timeout waiting for HTTP connection to be created");
            return false;
        }
        self.request_chunked = method_supports_content && self.content.is_none();
        info!(
            "HTTP connection created, ID: {}, protocol: {}, host: {}",
            self.http_id(),
            self.protocol,
            self.host
        );

        if self.protocol == "https" {
            self.config("ssl", "1,0");
        }
        if self.request_chunked {
            self.config("chunked", "1");
        }
        // Headers and a preset body travel unencoded.
        self.config("encoding", "0,0");

        let header_count = self.request_headers.len();
        for (index, (key, value)) in self.request_headers.iter().enumerate() {
            let line = format!("{}: {}", key, value);
            let is_last = index + 1 == header_count;
            let command = format!(
                "AT+MHTTPHEADER={},{},{},\"{}\"",
                self.http_id(),
                if is_last { 0 } else { 1 },
                line.len(),
                line
            );
            self.uart
                .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
        }

        if method_supports_content {
            if let Some(content) = self.content.take() {
                let command =
                    format!("AT+MHTTPCONTENT={},0,{}", self.http_id(), content.len());
                self.uart
                    .send_command_with_data(&command, DEFAULT_COMMAND_TIMEOUT, true, &content);
            }
        }

        // Response payloads arrive HEX-encoded.
        self.config("encoding", "1,1");

        let mut command = format!("AT+MHTTPREQUEST={},{},0,", self.http_id(), method_value);
        hex::to_hex_append(&mut command, self.path.as_bytes());
        if !self.uart.send_command(&command, DEFAULT_COMMAND_TIMEOUT, true) {
            error!("Failed to send HTTP request");
            return false;
        }

        if self.request_chunked
            && self.shared.events.wait(EVENT_IND, true, Some(self.timeout)) == 0
        {
            error!("Timeout waiting for HTTP IND");
            return false;
        }
        true
    }

    fn close(&mut self) {
        if !self.shared.instance_active.load(Ordering::Acquire) {
            return;
        }
        let mut command: heapless::String<24> = heapless::String::new();
        let _ = write!(command, "AT+MHTTPDEL={}", self.http_id());
        self.uart
            .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);

        self.shared.instance_active.store(false, Ordering::Release);
        self.shared.state.lock().unwrap().eof = true;
        self.shared.cv.notify_all();
        info!("HTTP connection closed, ID: {}", self.http_id());
    }

    fn read(&mut self, buffer: &mut [u8]) -> isize {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.shared.state.lock().unwrap();

        if state.eof && state.body.is_empty() {
            return 0;
        }

        while state.body.is_empty() && !state.eof {
            let now = Instant::now();
            if now >= deadline {
                error!("Timeout waiting for HTTP content to be received");
                return -1;
            }
            let (guard, result) = self
                .shared
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
            if result.timed_out() && state.body.is_empty() && !state.eof {
                error!("Timeout waiting for HTTP content to be received");
                return -1;
            }
        }
        if !self.shared.instance_active.load(Ordering::Acquire) {
            return -1;
        }

        let n = state.body.len().min(buffer.len());
        buffer[..n].copy_from_slice(&state.body[..n]);
        state.body.drain(..n);
        n as isize
    }

    fn write(&mut self, buffer: &[u8]) -> isize {
        if buffer.is_empty() {
            // The module will not take an empty chunk; send a bare CRLF.
            let command = format!("AT+MHTTPCONTENT={},0,2,\"0D0A\"", self.http_id());
            self.uart
                .send_command(&command, DEFAULT_COMMAND_TIMEOUT, true);
            return 0;
        }

        // The module takes at most 4 KiB per content command.
        const MAX_CHUNK_SIZE: usize = 4096;
        let mut sent = 0;
        while sent < buffer.len() {
            let chunk = &buffer[sent..buffer.len().min(sent + MAX_CHUNK_SIZE)];
            let command = format!("AT+MHTTPCONTENT={},1,{}", self.http_id(), chunk.len());
            if !self
                .uart
                .send_command_with_data(&command, DEFAULT_COMMAND_TIMEOUT, true, chunk)
            {
                return sent as isize;
            }
            sent += chunk.len();
        }
        sent as isize
    }

    fn get_status_code(&mut self) -> i32 {
        let status = self.shared.state.lock().unwrap().status_code;
        if status == -1 {
            if !self.fetch_headers() {
                return -1;
            }
            let state = self.shared.state.lock().unwrap();
            if let Some(value) = state.headers.get("Content-Length") {
                self.content_length = value.parse().unwrap_or(0);
            }
            info!("HTTP request successful, status code: {}", state.status_code);
            return state.status_code;
        }
        status
    }

    fn get_response_header(&self, key: &str) -> Option<String> {
        self.shared
            .state
            .lock()
            .unwrap()
            .headers
            .get(key)
            .map(str::to_string)
    }

    fn get_body_length(&mut self) -> usize {
        if self.get_status_code() == -1 {
            return 0;
        }
        self.content_length
    }

    fn read_all(&mut self) -> Vec<u8> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.shared.state.lock().unwrap();
        while !state.eof {
            let now = Instant::now();
            if now >= deadline {
                error!("Timeout waiting for HTTP content to be received");
                return state.body.clone();
            }
            let (guard, result) = self
                .shared
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
            if result.timed_out() && !state.eof {
                error!("Timeout waiting for HTTP content to be received");
                return state.body.clone();
            }
        }
        std::mem::take(&mut state.body)
    }
}

impl Drop for Ml307Http {
    fn drop(&mut self) {
        if self.shared.instance_active.load(Ordering::Acquire) {
            self.close();
        }
        self.uart.unregister_urc_callback(self.subscription);
    }
}
